//! The consumer engine shared by every broker.
//!
//! A [`Queue`] owns one pipeline's consumer loops. Each loop receives from the
//! backend [`Transport`], borrows a handler from the [`HandlerPool`] and spawns
//! the job onto a tracked task, so that stopping can wait for every job it
//! started.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::event::{Event, Events};
use crate::pool::handler::{ErrorHandler, HandlerPool, HandlerToken};
use crate::types::job::Job;
use crate::types::pipeline::Pipeline;
use crate::types::stat::Stat;
use crate::types::states::QueueState;

/// A job received from a backend, plus whatever the backend needs to
/// acknowledge it later.
pub struct Delivery<R> {
    pub job: Job,
    pub receipt: R,
}

/// Backend operations on one pipeline.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Receipt: Send + 'static;

    /// Makes `job` visible to consumers once `delay` has passed, returning
    /// its backend id.
    async fn publish(&self, job: &Job, delay: Duration) -> Result<String>;

    /// Waits up to `timeout` for a job. `None` means nothing arrived.
    async fn receive(
        &self,
        timeout: Duration,
    ) -> Result<Option<Delivery<Self::Receipt>>>;

    /// Removes a completed job.
    async fn ack(&self, receipt: Self::Receipt) -> Result<()>;

    /// Publishes `job` again after `delay`, carrying its updated attempt
    /// count, and removes the delivered copy.
    async fn requeue(
        &self,
        job: &Job,
        receipt: Self::Receipt,
        delay: Duration,
    ) -> Result<()>;

    /// Moves a job out of normal delivery for good.
    async fn bury(&self, job: &Job, receipt: Self::Receipt) -> Result<()>;

    /// Fills the counters and internal name of a [`Stat`].
    async fn stat(&self) -> Result<Stat>;
}

struct Consumers {
    handlers: Option<HandlerPool>,
    on_error: Option<ErrorHandler>,
    run: Option<Run>,
}

struct Run {
    cancel: CancellationToken,
    loops: Vec<JoinHandle<()>>,
    tracker: TaskTracker,
}

struct Inner<T: Transport> {
    pipeline: Pipeline,
    broker: String,
    transport: Arc<T>,
    events: Events,
    reserve: Duration,
    threads: usize,
    consumers: Mutex<Consumers>,
    state: watch::Sender<QueueState>,
}

/// Consumer state machine of one pipeline.
pub struct Queue<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> Queue<T> {
    /// `threads` consumer loops are run while serving, each waiting at most
    /// `reserve` per receive.
    pub fn new(
        pipeline: Pipeline,
        broker: impl Into<String>,
        transport: T,
        events: Events,
        reserve: Duration,
        threads: usize,
    ) -> Self {
        let (state, _) = watch::channel(QueueState::Idle);

        Self {
            inner: Arc::new(Inner {
                pipeline,
                broker: broker.into(),
                transport: Arc::new(transport),
                events,
                reserve,
                threads,
                consumers: Mutex::new(Consumers {
                    handlers: None,
                    on_error: None,
                    run: None,
                }),
                state,
            }),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    pub fn threads(&self) -> usize {
        self.inner.threads
    }

    pub fn state(&self) -> QueueState {
        *self.inner.state.borrow()
    }

    /// Whether a handler pool is wired in.
    pub fn is_configured(&self) -> bool {
        self.inner.consumers().handlers.is_some()
    }

    pub fn handlers(&self) -> Option<HandlerPool> {
        self.inner.consumers().handlers.clone()
    }

    /// Wires the handler pool and the terminal failure callback. `None`
    /// handlers leave the pipeline registered but unable to consume.
    pub fn configure(
        &self,
        handlers: Option<HandlerPool>,
        on_error: Option<ErrorHandler>,
    ) -> Result<()> {
        let mut consumers = self.inner.consumers();
        if self.state() != QueueState::Idle {
            return Err(Error::InvalidState("queue must be idle to configure"));
        }
        consumers.handlers = handlers;
        consumers.on_error = on_error;
        Ok(())
    }

    /// Starts the consumer loops and returns immediately.
    pub fn serve(&self) -> Result<()> {
        let mut consumers = self.inner.consumers();
        if self.state() != QueueState::Idle {
            return Err(Error::InvalidState("queue is already consuming"));
        }
        let handlers = consumers
            .handlers
            .clone()
            .ok_or(Error::InvalidState("queue has no handler pool"))?;

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let loops = (0..self.inner.threads)
            .map(|_| {
                tokio::spawn(consume(
                    self.inner.clone(),
                    handlers.clone(),
                    consumers.on_error.clone(),
                    cancel.clone(),
                    tracker.clone(),
                ))
            })
            .collect();

        consumers.run = Some(Run {
            cancel,
            loops,
            tracker,
        });
        self.inner.state.send_replace(QueueState::Consuming);
        drop(consumers);

        self.inner.events.emit(Event::PipelineConsume {
            pipeline: &self.inner.pipeline.name,
        });
        Ok(())
    }

    /// Stops receiving and waits for every started job to finish. A no-op
    /// while idle; a concurrent caller waits for the first one's drain.
    pub async fn stop(&self) {
        let run = {
            let mut consumers = self.inner.consumers();
            match self.state() {
                QueueState::Idle => return,
                QueueState::Stopping => None,
                QueueState::Consuming => {
                    self.inner.state.send_replace(QueueState::Stopping);
                    consumers.run.take()
                },
            }
        };

        let Some(run) = run else {
            let mut state = self.inner.state.subscribe();
            // The sender lives as long as `self`.
            let _ = state.wait_for(|s| *s == QueueState::Idle).await;
            return;
        };

        run.cancel.cancel();
        for handle in run.loops {
            if let Err(error) = handle.await {
                warn!(pipeline = %self.inner.pipeline.name, %error, "consumer loop failed");
            }
        }

        run.tracker.close();
        debug!(pipeline = %self.inner.pipeline.name, in_flight = run.tracker.len(), "draining");
        run.tracker.wait().await;

        self.inner.state.send_replace(QueueState::Idle);
        self.inner.events.emit(Event::PipelineStop {
            pipeline: &self.inner.pipeline.name,
        });
    }

    /// Current counters, whether consuming or not.
    pub async fn stat(&self) -> Result<Stat> {
        let mut stat = self.inner.transport.stat().await?;
        stat.pipeline = self.inner.pipeline.name.clone();
        stat.broker = self.inner.broker.clone();
        stat.consuming = self.state() == QueueState::Consuming;
        Ok(stat)
    }
}

impl<T: Transport> Inner<T> {
    fn consumers(&self) -> MutexGuard<'_, Consumers> {
        self.consumers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pipeline_error(&self, error: &Error) {
        self.events.emit(Event::PipelineError {
            pipeline: &self.pipeline.name,
            error,
        });
    }

    /// Runs one job and settles it with the backend. The handler is held
    /// until the job is acked, requeued or buried.
    async fn execute(
        &self,
        handler: HandlerToken,
        delivery: Delivery<T::Receipt>,
        on_error: Option<ErrorHandler>,
    ) {
        let Delivery { mut job, receipt } = delivery;

        self.events.emit(Event::JobStart { job: &job });
        let started = Instant::now();

        let settled = match handler.handle(&job).await {
            Ok(()) => {
                let settled = self.transport.ack(receipt).await;
                if settled.is_ok() {
                    self.events.emit(Event::JobComplete {
                        job: &job,
                        elapsed: started.elapsed(),
                    });
                }
                settled
            },
            Err(error) => {
                job.attempt += 1;

                if job.options.can_retry(job.attempt) {
                    self.events.emit(Event::JobError {
                        job: &job,
                        error: &error,
                        fatal: false,
                    });
                    let delay = job.options.retry_delay;
                    self.transport.requeue(&job, receipt, delay).await
                } else {
                    self.events.emit(Event::JobError {
                        job: &job,
                        error: &error,
                        fatal: true,
                    });
                    let settled = self.transport.bury(&job, receipt).await;
                    if let Some(on_error) = &on_error {
                        on_error(&job, &error);
                    }
                    settled
                }
            },
        };

        drop(handler);

        if let Err(error) = settled {
            self.pipeline_error(&error);
        }
    }
}

/// One consumer loop. Stop is observed between receives, so a receive in
/// progress always completes and its job is dispatched.
async fn consume<T: Transport>(
    inner: Arc<Inner<T>>,
    handlers: HandlerPool,
    on_error: Option<ErrorHandler>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    while !cancel.is_cancelled() {
        let delivery = match inner.transport.receive(inner.reserve).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(error) => {
                inner.pipeline_error(&error);
                select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(inner.reserve) => continue,
                }
            },
        };

        let handler = match handlers.acquire().await {
            Ok(handler) => handler,
            Err(error) => {
                // Hand the job back untouched for another consumer.
                inner.pipeline_error(&error);
                let Delivery { job, receipt } = delivery;
                if let Err(error) =
                    inner.transport.requeue(&job, receipt, Duration::ZERO).await
                {
                    inner.pipeline_error(&error);
                }
                break;
            },
        };

        let inner = inner.clone();
        let on_error = on_error.clone();
        tracker.spawn(async move {
            inner.execute(handler, delivery, on_error).await
        });
    }
}
