//! Error types shared by the pool, queues and brokers.
//!
//! Only [`Error::Connection`] tells the connection pool that a socket is
//! unusable; every other variant leaves the connection in the free set.
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::types::protocol::BeanstalkResponse;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Marks the underlying transport as broken. Raised by backends only, never
/// for job-level failures.
#[derive(Debug, Error)]
#[error("connection error: {cause}")]
pub struct ConnectionError {
    #[source]
    pub cause: anyhow::Error,
}

impl ConnectionError {
    pub fn new(cause: impl Into<anyhow::Error>) -> Self {
        Self {
            cause: cause.into(),
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(value: io::Error) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to allocate connection (pool closed)")]
    PoolClosed,

    #[error("connection allocate timeout ({0:?})")]
    AllocateTimeout(Duration),

    #[error("connection pool is not started")]
    NotStarted,

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("undefined pipeline `{0}`")]
    UndefinedPipeline(String),

    #[error("pipeline `{0}` is already registered")]
    DuplicatePipeline(String),

    #[error("broker is not running")]
    NotServing,

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The beanstalk server rejected a command; the connection is fine.
    #[error("beanstalk: unexpected response {0:?}")]
    Beanstalk(BeanstalkResponse),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// True when the error means the leased connection must be recreated.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_))
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Connection(value.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let broken: Error =
            io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(broken.is_connection());

        assert!(!Error::Beanstalk(BeanstalkResponse::NotFound).is_connection());
        assert!(!Error::AllocateTimeout(Duration::from_secs(1)).is_connection());
        assert!(!Error::config("threads").is_connection());
    }

    #[test]
    fn test_connection_error_display() {
        let err = Error::from(ConnectionError::new(anyhow::anyhow!("EOF")));
        assert_eq!(err.to_string(), "connection error: EOF");
    }
}
