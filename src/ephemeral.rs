//! In-memory broker. Jobs live in a channel per pipeline and are lost when
//! the process exits.
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time;
use tracing::trace;
use uuid::Uuid;

use crate::broker::Backend;
use crate::config::EPHEMERAL;
use crate::error::{Error, Result};
use crate::queue::{Delivery, Transport};
use crate::types::job::Job;
use crate::types::pipeline::Pipeline;
use crate::types::stat::{Counters, Stat};

const DEFAULT_RESERVE: Duration = Duration::from_secs(1);

/// Backend handing out one [`Tube`] per pipeline.
#[derive(Clone, Debug)]
pub struct Ephemeral {
    reserve: Duration,
}

impl Default for Ephemeral {
    fn default() -> Self {
        Self {
            reserve: DEFAULT_RESERVE,
        }
    }
}

impl Ephemeral {
    /// Sets how long consumers wait per receive, which bounds how quickly
    /// a stop is noticed.
    pub fn with_reserve(mut self, reserve: Duration) -> Self {
        self.reserve = reserve;
        self
    }
}

#[async_trait]
impl Backend for Ephemeral {
    type Transport = Tube;

    fn name(&self) -> &str {
        EPHEMERAL
    }

    fn transport(&self, pipeline: &Pipeline) -> Result<Tube> {
        Ok(Tube::new(&pipeline.name))
    }

    fn reserve(&self) -> Duration {
        self.reserve
    }

    async fn start(&self, _leases: usize) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) {}
}

/// An unbounded in-memory queue.
pub struct Tube {
    name: String,
    tx: mpsc::UnboundedSender<Job>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>,
    counters: Arc<Counters>,
    buried: Mutex<Vec<Job>>,
}

impl Tube {
    pub fn new(name: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        Self {
            name: name.to_owned(),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            counters: Default::default(),
            buried: Default::default(),
        }
    }

    /// Jobs that ran out of attempts, oldest first.
    pub fn buried(&self) -> Vec<Job> {
        self.buried
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn enqueue(
    tx: &mpsc::UnboundedSender<Job>,
    counters: &Counters,
    job: Job,
) -> Result<()> {
    counters.inc_queue();
    tx.send(job).map_err(|_| {
        counters.dec_queue();
        Error::InvalidState("ephemeral tube closed")
    })
}

#[async_trait]
impl Transport for Tube {
    type Receipt = ();

    async fn publish(&self, job: &Job, delay: Duration) -> Result<String> {
        let mut job = job.clone();
        if job.id.is_empty() {
            job.id = Uuid::new_v4().to_string();
        }
        let id = job.id.clone();

        if delay.is_zero() {
            enqueue(&self.tx, &self.counters, job)?;
            return Ok(id);
        }

        self.counters.inc_delayed();
        let tx = self.tx.clone();
        let counters = self.counters.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            trace!(id = %job.id, "delay elapsed");
            // Counted under queue before leaving delayed, so the job is
            // never missing from both.
            let _ = enqueue(&tx, &counters, job);
            counters.dec_delayed();
        });

        Ok(id)
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery<()>>> {
        let job = time::timeout(timeout, async {
            self.rx.lock().await.recv().await
        })
        .await;

        match job {
            Ok(Some(job)) => {
                self.counters.inc_active();
                self.counters.dec_queue();
                Ok(Some(Delivery { job, receipt: () }))
            },
            Ok(None) | Err(_) => Ok(None),
        }
    }

    async fn ack(&self, _receipt: ()) -> Result<()> {
        self.counters.dec_active();
        Ok(())
    }

    async fn requeue(&self, job: &Job, _receipt: (), delay: Duration) -> Result<()> {
        let published = self.publish(job, delay).await;
        self.counters.dec_active();
        published.map(drop)
    }

    async fn bury(&self, job: &Job, _receipt: ()) -> Result<()> {
        self.buried
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(job.clone());
        self.counters.dec_active();
        Ok(())
    }

    async fn stat(&self) -> Result<Stat> {
        let mut stat = Stat {
            internal_name: self.name.clone(),
            ..Default::default()
        };
        self.counters.fill(&mut stat);
        Ok(stat)
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;

    const WAIT: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn test_counters_follow_job() {
        let tube = Tube::new("default");

        let id = tube.publish(&Job::new("a", "1"), Duration::ZERO).await.unwrap();
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(tube.stat().await.unwrap().queue, 1);

        let delivery = tube.receive(WAIT).await.unwrap().unwrap();
        assert_eq!(delivery.job.id, id);
        let stat = tube.stat().await.unwrap();
        assert_eq!((stat.queue, stat.active, stat.delayed), (0, 1, 0));
        assert_eq!(stat.internal_name, "default");

        tube.ack(delivery.receipt).await.unwrap();
        let stat = tube.stat().await.unwrap();
        assert_eq!((stat.queue, stat.active, stat.delayed), (0, 0, 0));

        assert!(tube.receive(WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delay_hides_job() {
        let tube = Tube::new("default");
        let delay = Duration::from_millis(200);
        let pushed = Instant::now();

        tube.publish(&Job::new("later", ""), delay).await.unwrap();

        let stat = tube.stat().await.unwrap();
        assert_eq!((stat.queue, stat.delayed), (0, 1));
        assert!(tube.receive(Duration::from_millis(100)).await.unwrap().is_none());
        assert_eq!(tube.stat().await.unwrap().delayed, 1);

        // Once due, the job moves from delayed to queue until received.
        time::sleep(delay).await;
        let stat = tube.stat().await.unwrap();
        assert_eq!((stat.queue, stat.delayed, stat.active), (1, 0, 0));

        let delivery = tube
            .receive(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert!(pushed.elapsed() >= delay);
        assert_eq!(delivery.job.job, "later");
        let stat = tube.stat().await.unwrap();
        assert_eq!((stat.queue, stat.delayed, stat.active), (0, 0, 1));
    }

    #[tokio::test]
    async fn test_requeue_keeps_id_and_attempt() {
        let tube = Tube::new("default");
        let id = tube.publish(&Job::new("a", ""), Duration::ZERO).await.unwrap();

        let mut delivery = tube.receive(WAIT).await.unwrap().unwrap();
        delivery.job.attempt = 1;
        tube.requeue(&delivery.job, delivery.receipt, Duration::ZERO)
            .await
            .unwrap();

        let again = tube.receive(WAIT).await.unwrap().unwrap();
        assert_eq!((again.job.id.as_str(), again.job.attempt), (id.as_str(), 1));
        assert_eq!(tube.stat().await.unwrap().active, 1);
    }

    #[tokio::test]
    async fn test_bury_retains_job() {
        let tube = Tube::new("default");
        tube.publish(&Job::new("a", "x"), Duration::ZERO).await.unwrap();

        let delivery = tube.receive(WAIT).await.unwrap().unwrap();
        tube.bury(&delivery.job, delivery.receipt).await.unwrap();

        assert_eq!(tube.buried(), [delivery.job]);
        assert!(tube.receive(WAIT).await.unwrap().is_none());
        assert_eq!(tube.stat().await.unwrap().active, 0);
    }
}
