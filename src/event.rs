//! Broker events and the sink they are delivered to.
//!
//! A sink is handed to each broker when it is built; there is no process-wide
//! listener registry.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::types::job::Job;

#[derive(Debug)]
pub enum Event<'a> {
    /// A job was accepted by a broker.
    JobAdded { id: &'a str, job: &'a Job },
    /// A job could not be pushed.
    PushError {
        job: &'a Job,
        error: &'a crate::Error,
    },
    /// A handler started executing a job.
    JobStart { job: &'a Job },
    /// A handler finished a job successfully.
    JobComplete { job: &'a Job, elapsed: Duration },
    /// A handler failed a job. `fatal` is set when the job was buried.
    JobError {
        job: &'a Job,
        error: &'a anyhow::Error,
        fatal: bool,
    },
    /// A pipeline started consuming.
    PipelineConsume { pipeline: &'a str },
    /// A pipeline stopped consuming and drained its jobs.
    PipelineStop { pipeline: &'a str },
    /// A pipeline failed to receive or acknowledge a job.
    PipelineError {
        pipeline: &'a str,
        error: &'a crate::Error,
    },
    /// A broker finished starting.
    BrokerReady { broker: &'a str },
}

/// Receives broker events. Called inline, so implementations must not block.
pub trait Listener: Send + Sync {
    fn on_event(&self, event: &Event<'_>);
}

impl<F> Listener for F
where
    F: Fn(&Event<'_>) + Send + Sync,
{
    fn on_event(&self, event: &Event<'_>) {
        self(event)
    }
}

/// Cheaply cloneable handle to the listeners of one broker.
#[derive(Clone, Default)]
pub struct Events {
    listeners: Vec<Arc<dyn Listener>>,
}

impl Events {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listener(mut self, listener: impl Listener + 'static) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    pub fn emit(&self, event: Event<'_>) {
        for l in &self.listeners {
            l.on_event(&event);
        }
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Events")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Writes every event to the `tracing` subscriber.
pub struct TracingListener;

impl Listener for TracingListener {
    fn on_event(&self, event: &Event<'_>) {
        use Event::*;

        match event {
            JobAdded { id, job } => {
                debug!(%id, job = %job.job, pipeline = %job.pipeline, "job added")
            },
            PushError { job, error } => {
                error!(job = %job.job, %error, "unable to push job")
            },
            JobStart { job } => {
                debug!(id = %job.id, job = %job.job, attempt = job.attempt, "job started")
            },
            JobComplete { job, elapsed } => {
                info!(id = %job.id, job = %job.job, ?elapsed, "job complete")
            },
            JobError { job, error, fatal } => {
                warn!(id = %job.id, job = %job.job, attempt = job.attempt, fatal, %error, "job failed")
            },
            PipelineConsume { pipeline } => {
                info!(%pipeline, "pipeline consuming")
            },
            PipelineStop { pipeline } => info!(%pipeline, "pipeline stopped"),
            PipelineError { pipeline, error } => {
                warn!(%pipeline, %error, "pipeline error")
            },
            BrokerReady { broker } => info!(%broker, "broker ready"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_emit_reaches_every_listener() {
        let seen = Arc::new(Mutex::new(Vec::new()));

        let events = {
            let a = seen.clone();
            let b = seen.clone();
            Events::new()
                .with_listener(move |e: &Event<'_>| {
                    a.lock().unwrap().push(format!("a:{e:?}"))
                })
                .with_listener(move |e: &Event<'_>| {
                    b.lock().unwrap().push(format!("b:{e:?}"))
                })
        };

        events.emit(Event::PipelineStop { pipeline: "default" });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].starts_with("a:PipelineStop"));
        assert!(seen[1].starts_with("b:PipelineStop"));
    }
}
