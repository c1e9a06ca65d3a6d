//! YAML configuration of a [`Jobs`](crate::service::Jobs) service.
//!
//! ```yaml
//! beanstalk:
//!   addr: tcp://127.0.0.1:11300
//! pipelines:
//!   local:  { broker: ephemeral }
//!   emails: { broker: beanstalk, tube: emails, threads: 2 }
//! dispatch:
//!   app-mail-*: { pipeline: emails, maxAttempts: 3, retryDelay: 5000 }
//! consume: [local, emails]
//! workers: 4
//! ```
//!
//! Job option durations are milliseconds, as on the wire. Broker and pipeline
//! durations are seconds.
use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::beanstalk;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::types::pipeline::Pipeline;

pub const EPHEMERAL: &str = "ephemeral";
pub const BEANSTALK: &str = "beanstalk";

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Enables the beanstalk broker.
    #[serde(default)]
    pub beanstalk: Option<beanstalk::Config>,
    #[serde(default)]
    pub pipelines: BTreeMap<String, Pipeline>,
    #[serde(default)]
    pub dispatch: Dispatcher,
    /// Pipelines consumed when serving.
    #[serde(default)]
    pub consume: Vec<String>,
    /// Handlers shared by every consumed pipeline.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    4
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|error| Error::config(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|error| {
            Error::config(format!("reading {}: {error}", path.display()))
        })?;
        Self::from_yaml(&yaml)
    }

    /// Pipelines with their names filled in, and `listen` set on every
    /// consumed one.
    pub fn pipelines(&self) -> Vec<Pipeline> {
        self.pipelines
            .iter()
            .map(|(name, pipeline)| {
                let mut pipeline = pipeline.clone();
                pipeline.name = name.clone();
                pipeline.listen |= self.consume.contains(name);
                pipeline
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }

        if let Some(beanstalk) = &self.beanstalk {
            beanstalk.validate()?;
        }

        for (name, pipeline) in &self.pipelines {
            match pipeline.broker.as_str() {
                EPHEMERAL => {},
                BEANSTALK if self.beanstalk.is_some() => {},
                BEANSTALK => {
                    return Err(Error::config(format!(
                        "pipeline `{name}` uses beanstalk, which is not configured"
                    )))
                },
                other => {
                    return Err(Error::config(format!(
                        "pipeline `{name}`: unknown broker `{other}`"
                    )))
                },
            }
        }

        for name in &self.consume {
            if !self.pipelines.contains_key(name) {
                return Err(Error::UndefinedPipeline(name.clone()));
            }
        }

        for (pattern, options) in self.dispatch.rules() {
            if let Some(pipeline) = &options.pipeline {
                if !self.pipelines.contains_key(pipeline) {
                    return Err(Error::config(format!(
                        "dispatch `{pattern}`: undefined pipeline `{pipeline}`"
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = "
beanstalk:
  addr: tcp://127.0.0.1:11300
  connections: 2
pipelines:
  local:
    broker: ephemeral
  emails:
    broker: beanstalk
    tube: emails
    threads: 2
dispatch:
  app-mail-*:
    pipeline: emails
    maxAttempts: 3
consume: [local]
";

    #[test]
    fn test_parse() {
        let config = Config::from_yaml(YAML).unwrap();

        assert_eq!(config.workers, 4);
        assert_eq!(config.beanstalk.as_ref().unwrap().connections, 2);

        let pipelines = config.pipelines();
        assert_eq!(pipelines.len(), 2);

        let emails = &pipelines[0];
        assert_eq!((emails.name.as_str(), emails.listen), ("emails", false));
        assert_eq!(emails.string("tube", ""), "emails");
        assert_eq!(emails.threads(), 2);

        let local = &pipelines[1];
        assert_eq!((local.name.as_str(), local.listen), ("local", true));
    }

    #[test]
    fn test_rejects() {
        #[track_caller]
        fn bad(yaml: &str) {
            assert!(Config::from_yaml(yaml).is_err(), "{yaml}");
        }

        bad("unknown: 1\n");
        bad("workers: 0\n");
        bad("pipelines:\n  a: { broker: amqp }\n");
        bad("pipelines:\n  a: { broker: beanstalk, tube: a }\n");
        bad("consume: [missing]\n");
        bad("pipelines:\n  a: { broker: ephemeral }\ndispatch:\n  x-*: { pipeline: b }\n");
        bad("beanstalk: { addr: localhost }\n");
    }
}
