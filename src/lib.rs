//! A pluggable job queue.
//!
//! Jobs are pushed to named pipelines, each owned by a broker. A broker's
//! queues pull jobs from its backend and run them on a shared pool of
//! handlers, retrying or burying failures according to the job's options.
//! Two backends are provided: an in-memory [`ephemeral`] one and a
//! [`beanstalk`] one that speaks the beanstalkd protocol over a pooled set of
//! connections.
pub mod beanstalk;
pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod ephemeral;
pub mod error;
pub mod event;
pub mod line_reader;
pub mod parser;
pub mod pool;
pub mod queue;
pub mod service;
pub mod types;
pub mod util;

pub use crate::broker::{Backend, Broker, JobBroker};
pub use crate::error::{Error, Result};
pub use crate::pool::handler::{Handler, HandlerFn, HandlerPool};
pub use crate::service::Jobs;
pub use crate::types::job::{Job, JobOptions};
pub use crate::types::pipeline::Pipeline;
