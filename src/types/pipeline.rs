use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde_yaml::Value;

/// A named queue routed to one broker, plus the broker-specific options it
/// was configured with.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct Pipeline {
    /// Filled from the configuration key when loaded from YAML.
    #[serde(default)]
    pub name: String,
    pub broker: String,
    /// Start consuming as soon as the broker is served.
    #[serde(default)]
    pub listen: bool,
    #[serde(flatten)]
    pub options: BTreeMap<String, Value>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, broker: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            broker: broker.into(),
            ..Default::default()
        }
    }

    pub fn listen(mut self, listen: bool) -> Self {
        self.listen = listen;
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn string(&self, key: &str, default: &str) -> String {
        self.options
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_owned()
    }

    pub fn integer(&self, key: &str, default: i64) -> i64 {
        self.options
            .get(key)
            .and_then(Value::as_i64)
            .unwrap_or(default)
    }

    pub fn bool(&self, key: &str, default: bool) -> bool {
        self.options
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    /// Reads a whole number of seconds.
    pub fn duration(&self, key: &str, default: Duration) -> Duration {
        self.options
            .get(key)
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    /// Number of consumer loops to run for this pipeline.
    pub fn threads(&self) -> i64 {
        self.integer("threads", 1)
    }
}
