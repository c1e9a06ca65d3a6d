//! A bounded set of job handlers shared by every consuming pipeline.
use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};
use crate::types::job::Job;

/// Executes jobs. An error fails the current attempt.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, job: &Job) -> anyhow::Result<()>;
}

/// Adapts an async closure taking an owned [`Job`] into a [`Handler`].
pub struct HandlerFn<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        (self.0)(job.clone()).await
    }
}

/// Called once for every job that exhausts its attempts and is buried.
pub type ErrorHandler = Arc<dyn Fn(&Job, &anyhow::Error) + Send + Sync>;

/// Hands out handlers, at most one job per handler at a time.
#[derive(Clone)]
pub struct HandlerPool {
    permits: Arc<Semaphore>,
    idle: Arc<Mutex<Vec<Arc<dyn Handler>>>>,
    size: usize,
}

/// Exclusive use of one handler; dropping it returns the handler to the pool.
pub struct HandlerToken {
    handler: Arc<dyn Handler>,
    idle: Arc<Mutex<Vec<Arc<dyn Handler>>>>,
    _permit: OwnedSemaphorePermit,
}

impl HandlerPool {
    pub fn new(handlers: Vec<Arc<dyn Handler>>) -> Result<Self> {
        if handlers.is_empty() {
            return Err(Error::config("handler pool needs at least one handler"));
        }

        Ok(Self {
            permits: Arc::new(Semaphore::new(handlers.len())),
            size: handlers.len(),
            idle: Arc::new(Mutex::new(handlers)),
        })
    }

    /// A pool of `n` slots all running the same stateless handler.
    pub fn replicate(handler: Arc<dyn Handler>, n: usize) -> Result<Self> {
        Self::new(vec![handler; n])
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Whether `other` hands out the same handlers as `self`.
    pub fn same_as(&self, other: &HandlerPool) -> bool {
        Arc::ptr_eq(&self.permits, &other.permits)
    }

    /// Waits for a free handler.
    pub async fn acquire(&self) -> Result<HandlerToken> {
        // The semaphore is never closed.
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::InvalidState("handler pool closed"))?;

        self.take(permit)
    }

    fn take(&self, permit: OwnedSemaphorePermit) -> Result<HandlerToken> {
        let handler = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .ok_or(Error::InvalidState("idle handler missing"))?;

        Ok(HandlerToken {
            handler,
            idle: self.idle.clone(),
            _permit: permit,
        })
    }
}

impl Deref for HandlerToken {
    type Target = dyn Handler;

    fn deref(&self) -> &Self::Target {
        self.handler.as_ref()
    }
}

impl Drop for HandlerToken {
    fn drop(&mut self) {
        // The permit field drops after this, so the handler is back in the
        // idle list before anyone can acquire it.
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(self.handler.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl Handler for Named {
        async fn handle(&self, _job: &Job) -> anyhow::Result<()> {
            anyhow::bail!("{}", self.0)
        }
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(matches!(HandlerPool::new(vec![]), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_release() {
        let pool = HandlerPool::new(vec![Arc::new(Named("only"))]).unwrap();

        let token = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move {
                let token = pool.acquire().await.unwrap();
                token.handle(&Job::new("x", "")).await.unwrap_err().to_string()
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(token);
        assert_eq!(waiter.await.unwrap(), "only");
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_handlers_are_distinct() {
        let pool =
            HandlerPool::new(vec![Arc::new(Named("a")), Arc::new(Named("b"))])
                .unwrap();

        let job = Job::new("x", "");
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();

        let mut names = vec![
            a.handle(&job).await.unwrap_err().to_string(),
            b.handle(&job).await.unwrap_err().to_string(),
        ];
        names.sort();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn test_same_as() {
        let pool = HandlerPool::replicate(Arc::new(Named("a")), 2).unwrap();
        let other = HandlerPool::replicate(Arc::new(Named("a")), 2).unwrap();

        assert!(pool.same_as(&pool.clone()));
        assert!(!pool.same_as(&other));
    }

    #[tokio::test]
    async fn test_handler_fn() {
        let handler = HandlerFn(|job: Job| async move {
            anyhow::ensure!(job.payload == "ok", "bad payload");
            Ok(())
        });

        assert!(handler.handle(&Job::new("x", "ok")).await.is_ok());
        assert!(handler.handle(&Job::new("x", "no")).await.is_err());
    }
}
