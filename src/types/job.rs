use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Execution time granted to a job when none is configured.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// A single unit of work travelling through a pipeline.
///
/// `id` is assigned by the broker on push and `attempt` grows by one every
/// time the job is requeued after a failure; everything else is fixed once
/// the job is created.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub attempt: u32,
    /// Job name, used to route the job and to pick its handler.
    pub job: String,
    #[serde(default)]
    pub pipeline: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub options: JobOptions,
}

impl Job {
    pub fn new(job: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_pipeline(mut self, pipeline: impl Into<String>) -> Self {
        self.pipeline = pipeline.into();
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}

/// How a job is to be delivered and retried.
///
/// Durations travel as integer milliseconds.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Overrides the pipeline chosen by the dispatcher. Only meaningful before
    /// the job is pushed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    #[serde(default, with = "millis")]
    pub delay: Duration,
    #[serde(default, with = "millis")]
    pub timeout: Duration,
    /// Zero means unlimited.
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default, with = "millis")]
    pub retry_delay: Duration,
}

impl JobOptions {
    /// Whether a job that has failed `attempt` times may run again.
    pub fn can_retry(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }

    /// Fills every unset field from `from`.
    pub fn merge(&mut self, from: &JobOptions) {
        if self.pipeline.is_none() {
            self.pipeline = from.pipeline.clone();
        }
        if self.delay.is_zero() {
            self.delay = from.delay;
        }
        if self.timeout.is_zero() {
            self.timeout = from.timeout;
        }
        if self.max_attempts == 0 {
            self.max_attempts = from.max_attempts;
        }
        if self.retry_delay.is_zero() {
            self.retry_delay = from.retry_delay;
        }
    }

    /// Time a broker should grant the job before considering it abandoned.
    pub fn timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            self.timeout
        }
    }
}

/// Encodes a job into its wire envelope.
pub fn pack(job: &Job) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(job)?)
}

/// Decodes a wire envelope produced by [`pack`].
pub fn unpack(data: &[u8]) -> Result<Job> {
    Ok(serde_json::from_slice(data)?)
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
