//! The broker facade: one backend, one [`Queue`] per registered pipeline.
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::{Event, Events};
use crate::pool::handler::{ErrorHandler, HandlerPool};
use crate::queue::{Queue, Transport};
use crate::types::job::Job;
use crate::types::pipeline::Pipeline;
use crate::types::stat::Stat;
use crate::types::states::QueueState;

/// What a storage backend provides to a [`Broker`].
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Transport: Transport;

    fn name(&self) -> &str;

    /// Validates the backend options of `pipeline` and builds its transport.
    fn transport(&self, pipeline: &Pipeline) -> Result<Self::Transport>;

    /// How long a consumer waits per receive.
    fn reserve(&self) -> Duration;

    /// Opens backend resources. `leases` is how many receipts the consuming
    /// pipelines may hold at once.
    async fn start(&self, leases: usize) -> Result<()>;

    /// Called when a pipeline starts consuming on a running backend, with the
    /// new number of receipts that may be held at once.
    fn grow(&self, _leases: usize) -> Result<()> {
        Ok(())
    }

    /// Releases backend resources, waiting for any still in use.
    async fn stop(&self);
}

/// The operations every broker offers, whatever its backend.
#[async_trait]
pub trait JobBroker: Send + Sync {
    fn name(&self) -> &str;

    /// Adds pipelines. Either all of them are registered or none are.
    fn register(&self, pipelines: Vec<Pipeline>) -> Result<()>;

    /// Rewires the handlers of a pipeline, restarting it if the broker is
    /// serving. `None` handlers stop it from consuming.
    async fn consume(
        &self,
        pipeline: &str,
        handlers: Option<HandlerPool>,
        on_error: Option<ErrorHandler>,
    ) -> Result<()>;

    /// Stops one pipeline from consuming, draining its running jobs. Its
    /// handlers stay wired in for [`JobBroker::resume`].
    async fn pause(&self, pipeline: &str) -> Result<()>;

    /// Restarts a paused pipeline with the handlers it was configured with.
    /// Fails with [`Error::NotServing`] unless the broker is serving.
    async fn resume(&self, pipeline: &str) -> Result<()>;

    /// Publishes `job`, returning its backend id.
    async fn push(&self, pipeline: &str, job: Job) -> Result<String>;

    async fn stat(&self, pipeline: &str) -> Result<Stat>;

    /// Starts the backend and the listening pipelines, then waits for
    /// [`JobBroker::stop`].
    async fn serve(&self) -> Result<()>;

    /// Stops every pipeline, draining running jobs, then the backend.
    async fn stop(&self);
}

struct Inner<B: Backend> {
    backend: B,
    events: Events,
    queues: RwLock<BTreeMap<String, Queue<B::Transport>>>,
    /// Set while serving. Held across start and stop so that neither
    /// interleaves with a consume.
    serving: Mutex<Option<CancellationToken>>,
}

/// A [`JobBroker`] over any [`Backend`].
pub struct Broker<B: Backend> {
    inner: Arc<Inner<B>>,
}

impl<B: Backend> Clone for Broker<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Backend> Broker<B> {
    pub fn new(backend: B, events: Events) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                events,
                queues: Default::default(),
                serving: Mutex::new(None),
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn queue(&self, pipeline: &str) -> Result<Queue<B::Transport>> {
        self.inner
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pipeline)
            .cloned()
            .ok_or_else(|| Error::UndefinedPipeline(pipeline.to_owned()))
    }

    fn queues(&self) -> Vec<Queue<B::Transport>> {
        self.inner
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Receipts the configured queues may hold at once: one per consumer loop
    /// waiting for a handler, plus one per handler running a job. Handler
    /// pools shared between queues are counted once.
    fn leases(&self) -> usize {
        let mut pools: Vec<HandlerPool> = Vec::new();
        let mut leases = 0;
        for queue in self.queues() {
            let Some(handlers) = queue.handlers() else {
                continue;
            };
            leases += queue.threads();
            if !pools.iter().any(|p| p.same_as(&handlers)) {
                leases += handlers.size();
                pools.push(handlers);
            }
        }
        leases
    }

    async fn stop_queues(&self) {
        join_all(self.queues().iter().map(Queue::stop)).await;
    }
}

#[async_trait]
impl<B: Backend> JobBroker for Broker<B> {
    fn name(&self) -> &str {
        self.inner.backend.name()
    }

    fn register(&self, pipelines: Vec<Pipeline>) -> Result<()> {
        let mut queues = self
            .inner
            .queues
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let mut seen = HashSet::new();
        let mut added = Vec::with_capacity(pipelines.len());
        for pipeline in pipelines {
            if queues.contains_key(&pipeline.name) || !seen.insert(pipeline.name.clone())
            {
                return Err(Error::DuplicatePipeline(pipeline.name));
            }

            let threads = usize::try_from(pipeline.threads())
                .ok()
                .filter(|n| *n >= 1)
                .ok_or_else(|| {
                    Error::config(format!(
                        "pipeline `{}`: threads must be at least 1",
                        pipeline.name
                    ))
                })?;

            let transport = self.inner.backend.transport(&pipeline)?;
            let reserve = pipeline.duration("reserve", self.inner.backend.reserve());
            if reserve.is_zero() {
                return Err(Error::config(format!(
                    "pipeline `{}`: reserve must be at least 1 second",
                    pipeline.name
                )));
            }
            added.push(Queue::new(
                pipeline,
                self.inner.backend.name(),
                transport,
                self.inner.events.clone(),
                reserve,
                threads,
            ));
        }

        for queue in added {
            debug!(pipeline = %queue.pipeline().name, broker = self.name(), "pipeline registered");
            queues.insert(queue.pipeline().name.clone(), queue);
        }
        Ok(())
    }

    async fn consume(
        &self,
        pipeline: &str,
        handlers: Option<HandlerPool>,
        on_error: Option<ErrorHandler>,
    ) -> Result<()> {
        let queue = self.queue(pipeline)?;
        let serving = self.inner.serving.lock().await;

        queue.stop().await;
        let resume = handlers.is_some() && serving.is_some();
        queue.configure(handlers, on_error)?;

        if resume {
            self.inner.backend.grow(self.leases())?;
            queue.serve()?;
        }
        Ok(())
    }

    async fn pause(&self, pipeline: &str) -> Result<()> {
        let queue = self.queue(pipeline)?;
        let _serving = self.inner.serving.lock().await;

        queue.stop().await;
        Ok(())
    }

    async fn resume(&self, pipeline: &str) -> Result<()> {
        let queue = self.queue(pipeline)?;
        let serving = self.inner.serving.lock().await;
        if serving.is_none() {
            return Err(Error::NotServing);
        }
        if queue.state() != QueueState::Idle {
            return Ok(());
        }

        self.inner.backend.grow(self.leases())?;
        queue.serve()
    }

    async fn push(&self, pipeline: &str, mut job: Job) -> Result<String> {
        let queue = self.queue(pipeline)?;
        job.pipeline = pipeline.to_owned();

        match queue.transport().publish(&job, job.options.delay).await {
            Ok(id) => {
                self.inner.events.emit(Event::JobAdded { id: &id, job: &job });
                Ok(id)
            },
            Err(error) => {
                self.inner.events.emit(Event::PushError {
                    job: &job,
                    error: &error,
                });
                Err(error)
            },
        }
    }

    async fn stat(&self, pipeline: &str) -> Result<Stat> {
        self.queue(pipeline)?.stat().await
    }

    async fn serve(&self) -> Result<()> {
        let stopped = {
            let mut serving = self.inner.serving.lock().await;
            if serving.is_some() {
                return Err(Error::InvalidState("broker is already serving"));
            }

            let queues = self.queues();
            self.inner.backend.start(self.leases()).await?;

            for queue in queues.iter().filter(|q| q.pipeline().listen) {
                if !queue.is_configured() {
                    warn!(pipeline = %queue.pipeline().name, "listening pipeline has no handlers");
                    continue;
                }
                if let Err(error) = queue.serve() {
                    self.stop_queues().await;
                    self.inner.backend.stop().await;
                    return Err(error);
                }
            }

            let token = CancellationToken::new();
            *serving = Some(token.clone());
            token
        };

        self.inner.events.emit(Event::BrokerReady {
            broker: self.name(),
        });

        stopped.cancelled().await;
        info!(broker = self.name(), "broker stopped");
        Ok(())
    }

    async fn stop(&self) {
        let mut serving = self.inner.serving.lock().await;
        let Some(token) = serving.take() else {
            return;
        };

        self.stop_queues().await;
        self.inner.backend.stop().await;
        token.cancel();
    }
}
