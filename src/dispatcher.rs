use std::collections::BTreeMap;

use serde::Deserialize;

use crate::types::job::JobOptions;

/// Default options per job name pattern.
///
/// Patterns are written with dashes and an optional trailing wildcard
/// (`app-mail-*`) and match job names by dotted prefix (`app.mail.Welcome`).
/// When several patterns match, the longest wins.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct Dispatcher {
    rules: BTreeMap<String, JobOptions>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, pattern: impl Into<String>, options: JobOptions) -> Self {
        self.rules.insert(pattern.into(), options);
        self
    }

    pub fn rules(&self) -> impl Iterator<Item = (&str, &JobOptions)> {
        self.rules.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Options of the longest pattern matching `job`, if any.
    pub fn matches(&self, job: &str) -> Option<&JobOptions> {
        let mut best: Option<(usize, &JobOptions)> = None;

        for (pattern, options) in &self.rules {
            let prefix = normalise(pattern);
            if prefix.is_empty() || !job.starts_with(&prefix) {
                continue;
            }
            if best.map_or(true, |(len, _)| prefix.len() > len) {
                best = Some((prefix.len(), options));
            }
        }

        best.map(|(_, options)| options)
    }
}

fn normalise(pattern: &str) -> String {
    pattern
        .trim_matches(|c| matches!(c, '-' | '.' | '*'))
        .replace('-', ".")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn to(pipeline: &str) -> JobOptions {
        JobOptions {
            pipeline: Some(pipeline.to_owned()),
            ..Default::default()
        }
    }

    #[test]
    fn test_normalise() {
        assert_eq!(normalise("app-mail-*"), "app.mail");
        assert_eq!(normalise("app.mail.*"), "app.mail");
        assert_eq!(normalise("-app-"), "app");
        assert_eq!(normalise("*"), "");
    }

    #[test]
    fn test_longest_prefix_wins() {
        let dispatcher = Dispatcher::new()
            .with_rule("app-*", to("default"))
            .with_rule("app-mail-*", to("emails"))
            .with_rule("*", to("never"));

        let pipeline = |job| {
            dispatcher
                .matches(job)
                .and_then(|o| o.pipeline.as_deref())
        };

        assert_eq!(pipeline("app.mail.Welcome"), Some("emails"));
        assert_eq!(pipeline("app.Report"), Some("default"));
        assert_eq!(pipeline("other.Job"), None);
    }

    #[test]
    fn test_from_yaml() {
        let dispatcher: Dispatcher = serde_yaml::from_str(
            "app-mail-*:\n  pipeline: emails\n  maxAttempts: 3\n  retryDelay: 5000\n",
        )
        .unwrap();

        let options = dispatcher.matches("app.mail.Welcome").unwrap();
        assert_eq!(options.max_attempts, 3);
        assert_eq!(options.retry_delay, Duration::from_secs(5));
    }
}
