//! Routes jobs across several brokers.
use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error};

use crate::beanstalk::Beanstalk;
use crate::broker::{Broker, JobBroker};
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::ephemeral::Ephemeral;
use crate::error::{Error, Result};
use crate::event::Events;
use crate::pool::handler::{ErrorHandler, HandlerPool};
use crate::types::job::{Job, JobOptions};
use crate::types::pipeline::Pipeline;
use crate::types::stat::Stat;

/// Every broker and pipeline of an application.
pub struct Jobs {
    brokers: BTreeMap<String, Arc<dyn JobBroker>>,
    pipelines: BTreeMap<String, Pipeline>,
    dispatcher: Dispatcher,
    consume: Vec<String>,
}

impl Jobs {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            brokers: BTreeMap::new(),
            pipelines: BTreeMap::new(),
            dispatcher,
            consume: Vec::new(),
        }
    }

    /// Builds the brokers a configuration asks for and registers its
    /// pipelines. Every broker reports to `events`.
    pub fn from_config(config: &Config, events: Events) -> Result<Self> {
        config.validate()?;

        let mut jobs = Self::new(config.dispatch.clone());
        jobs.add_broker(Arc::new(Broker::new(Ephemeral::default(), events.clone())));
        if let Some(beanstalk) = &config.beanstalk {
            jobs.add_broker(Arc::new(Broker::new(
                Beanstalk::new(beanstalk.clone())?,
                events,
            )));
        }

        jobs.register(config.pipelines())?;
        jobs.consume = config.consume.clone();
        Ok(jobs)
    }

    pub fn add_broker(&mut self, broker: Arc<dyn JobBroker>) {
        self.brokers.insert(broker.name().to_owned(), broker);
    }

    pub fn brokers(&self) -> impl Iterator<Item = &Arc<dyn JobBroker>> {
        self.brokers.values()
    }

    pub fn pipelines(&self) -> impl Iterator<Item = &Pipeline> {
        self.pipelines.values()
    }

    /// Adds pipelines to their brokers. Pipelines listening on registration
    /// are consumed by [`Jobs::consume`].
    pub fn register(&mut self, pipelines: Vec<Pipeline>) -> Result<()> {
        let mut by_broker: BTreeMap<String, Vec<Pipeline>> = BTreeMap::new();
        for pipeline in pipelines {
            if self.pipelines.contains_key(&pipeline.name) {
                return Err(Error::DuplicatePipeline(pipeline.name));
            }
            if !self.brokers.contains_key(&pipeline.broker) {
                return Err(Error::config(format!(
                    "pipeline `{}`: undefined broker `{}`",
                    pipeline.name, pipeline.broker
                )));
            }
            by_broker
                .entry(pipeline.broker.clone())
                .or_default()
                .push(pipeline);
        }

        for (broker, pipelines) in by_broker {
            self.broker(&broker)?.register(pipelines.clone())?;
            for pipeline in pipelines {
                if pipeline.listen && !self.consume.contains(&pipeline.name) {
                    self.consume.push(pipeline.name.clone());
                }
                self.pipelines.insert(pipeline.name.clone(), pipeline);
            }
        }
        Ok(())
    }

    fn broker(&self, name: &str) -> Result<&Arc<dyn JobBroker>> {
        self.brokers
            .get(name)
            .ok_or_else(|| Error::config(format!("undefined broker `{name}`")))
    }

    fn pipeline(&self, name: &str) -> Result<&Pipeline> {
        self.pipelines
            .get(name)
            .ok_or_else(|| Error::UndefinedPipeline(name.to_owned()))
    }

    /// Finds the pipeline of `job`: its own option first, then the
    /// dispatcher. Also returns the dispatcher defaults that apply.
    pub fn match_pipeline(&self, job: &Job) -> Result<(&Pipeline, Option<&JobOptions>)> {
        let defaults = self.dispatcher.matches(&job.job);

        let name = job
            .options
            .pipeline
            .as_deref()
            .filter(|p| !p.is_empty())
            .or_else(|| defaults.and_then(|d| d.pipeline.as_deref()))
            .ok_or_else(|| {
                Error::config(format!("unable to locate pipeline for `{}`", job.job))
            })?;

        Ok((self.pipeline(name)?, defaults))
    }

    /// Pushes `job` to its pipeline, filling unset options from the
    /// dispatcher.
    pub async fn push(&self, mut job: Job) -> Result<String> {
        let (pipeline, defaults) = self.match_pipeline(&job)?;
        if let Some(defaults) = defaults {
            job.options.merge(defaults);
        }

        debug!(job = %job.job, pipeline = %pipeline.name, "pushing");
        self.broker(&pipeline.broker)?
            .push(&pipeline.name, job)
            .await
    }

    pub async fn stat(&self, pipeline: &str) -> Result<Stat> {
        let pipeline = self.pipeline(pipeline)?;
        self.broker(&pipeline.broker)?.stat(&pipeline.name).await
    }

    /// Stats of every pipeline, in name order.
    pub async fn stats(&self) -> Result<Vec<Stat>> {
        let mut stats = Vec::with_capacity(self.pipelines.len());
        for name in self.pipelines.keys() {
            stats.push(self.stat(name).await?);
        }
        Ok(stats)
    }

    /// Hands `handlers` to every consumed pipeline.
    pub async fn consume(
        &self,
        handlers: HandlerPool,
        on_error: Option<ErrorHandler>,
    ) -> Result<()> {
        for name in &self.consume {
            let pipeline = self.pipeline(name)?;
            self.broker(&pipeline.broker)?
                .consume(name, Some(handlers.clone()), on_error.clone())
                .await?;
        }
        Ok(())
    }

    /// Stops consuming `pipeline`, waiting for its running jobs.
    pub async fn pause(&self, pipeline: &str) -> Result<()> {
        let pipeline = self.pipeline(pipeline)?;
        self.broker(&pipeline.broker)?.pause(&pipeline.name).await
    }

    /// Consumes `pipeline` again with the handlers given to
    /// [`Jobs::consume`].
    pub async fn resume(&self, pipeline: &str) -> Result<()> {
        let pipeline = self.pipeline(pipeline)?;
        self.broker(&pipeline.broker)?.resume(&pipeline.name).await
    }

    /// Pauses every consumed pipeline.
    pub async fn pause_all(&self) -> Result<()> {
        let paused = join_all(self.consume.iter().map(|name| self.pause(name))).await;
        paused.into_iter().collect::<Result<Vec<_>>>().map(drop)
    }

    pub async fn resume_all(&self) -> Result<()> {
        for name in &self.consume {
            self.resume(name).await?;
        }
        Ok(())
    }

    /// Serves every broker until [`Jobs::stop`]. If one fails, all are
    /// stopped and its error returned.
    pub async fn serve(&self) -> Result<()> {
        let results = join_all(self.brokers.values().map(|broker| async move {
            let result = broker.serve().await;
            if let Err(error) = &result {
                error!(broker = broker.name(), %error, "broker failed");
                self.stop().await;
            }
            result
        }))
        .await;

        results.into_iter().collect::<Result<Vec<_>>>().map(drop)
    }

    pub async fn stop(&self) {
        join_all(self.brokers.values().map(|broker| broker.stop())).await;
    }
}
