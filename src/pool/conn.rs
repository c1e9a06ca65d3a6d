//! A fixed-size pool of broker connections.
//!
//! Every connection is either free, leased to a caller, or dead. Callers
//! move connections between free and leased; a single reconnect task owns the
//! dead to free transition, so a failure noticed by many callers at once is
//! only repaired once, and a dead connection only costs the pool one slot of
//! capacity until it is replaced.
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::types::states::ConnState;

/// Opens and closes the physical connections held by a [`ConnPool`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Send + 'static;

    async fn connect(&self) -> Result<Self::Conn>;

    fn close(&self, conn: Self::Conn);
}

/// Counts of connections per [`ConnState`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PoolState {
    pub free: usize,
    pub leased: usize,
    pub dead: usize,
}

impl PoolState {
    pub fn count(&self, state: ConnState) -> usize {
        match state {
            ConnState::Free => self.free,
            ConnState::Leased => self.leased,
            ConnState::Dead => self.dead,
        }
    }

    pub fn total(&self) -> usize {
        self.free + self.leased + self.dead
    }
}

struct Slots<T> {
    size: usize,
    free: Vec<T>,
    leased: usize,
    dead: usize,
    started: bool,
    closed: bool,
}

struct Inner<C: Connector> {
    connector: C,
    reconnect: Duration,
    slots: Mutex<Slots<C::Conn>>,
    /// One permit per connection in `slots.free`.
    available: Semaphore,
    /// Signalled whenever the leased count drops to zero.
    drained: Notify,
    dead_tx: mpsc::UnboundedSender<()>,
    dead_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    destroying: AtomicBool,
    cancel: CancellationToken,
    reconnector: Mutex<Option<JoinHandle<()>>>,
}

/// Cheaply cloneable handle to a connection pool.
pub struct ConnPool<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ConnPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// A connection leased from a [`ConnPool`]. Dropping it returns the
/// connection to the pool as healthy; use [`Lease::release`] to report a
/// failure.
pub struct Lease<C: Connector> {
    conn: Option<C::Conn>,
    pool: Arc<Inner<C>>,
}

impl<C: Connector> std::fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").finish_non_exhaustive()
    }
}

impl<C: Connector> ConnPool<C> {
    pub fn new(connector: C, size: usize, reconnect: Duration) -> Self {
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(Inner {
                connector,
                reconnect,
                slots: Mutex::new(Slots {
                    size,
                    free: Vec::with_capacity(size),
                    leased: 0,
                    dead: 0,
                    started: false,
                    closed: false,
                }),
                available: Semaphore::new(0),
                drained: Notify::new(),
                dead_tx,
                dead_rx: Mutex::new(Some(dead_rx)),
                destroying: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                reconnector: Mutex::new(None),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.slots().size
    }

    /// Changes the number of connections opened by [`ConnPool::start`]. Once
    /// started the pool can only grow: the extra slots start out dead and are
    /// opened by the reconnect task.
    pub fn resize(&self, size: usize) -> Result<()> {
        let mut slots = self.inner.slots();
        if slots.closed {
            return Err(Error::PoolClosed);
        }
        if !slots.started {
            slots.size = size;
            return Ok(());
        }
        if size < slots.size {
            return Err(Error::InvalidState("a started connection pool cannot shrink"));
        }

        let added = size - slots.size;
        slots.size = size;
        slots.dead += added;
        drop(slots);

        if added > 0 {
            debug!(added, size, "growing connection pool");
        }
        for _ in 0..added {
            let _ = self.inner.dead_tx.send(());
        }
        Ok(())
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    pub fn state(&self) -> PoolState {
        let slots = self.inner.slots();
        PoolState {
            free: slots.free.len(),
            leased: slots.leased,
            dead: slots.dead,
        }
    }

    /// Opens every connection concurrently. Either all of them open, or the
    /// ones that did are closed again and the first error is returned.
    pub async fn start(&self) -> Result<()> {
        let size = {
            let slots = self.inner.slots();
            if slots.closed {
                return Err(Error::PoolClosed);
            }
            if slots.started {
                return Err(Error::InvalidState("connection pool already started"));
            }
            slots.size
        };

        if size == 0 {
            return Err(Error::config("connection pool size must be at least 1"));
        }

        let results =
            join_all((0..size).map(|_| self.inner.connector.connect())).await;

        let mut conns = Vec::with_capacity(size);
        let mut first_error = None;
        for result in results {
            match result {
                Ok(conn) => conns.push(conn),
                Err(error) => {
                    first_error.get_or_insert(error);
                },
            }
        }

        if let Some(error) = first_error {
            warn!(%error, opened = conns.len(), "unable to start connection pool");
            for conn in conns {
                self.inner.connector.close(conn);
            }
            return Err(error);
        }

        let dead_rx = self
            .inner
            .dead_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        // A concurrent start or destroy may have won while connecting.
        let mut slots = self.inner.slots();
        let dead_rx = match dead_rx {
            Some(dead_rx) if !slots.closed && !slots.started => dead_rx,
            _ => {
                let error = if slots.closed {
                    Error::PoolClosed
                } else {
                    Error::InvalidState("connection pool already started")
                };
                drop(slots);
                for conn in conns {
                    self.inner.connector.close(conn);
                }
                return Err(error);
            },
        };
        slots.free = conns;
        slots.started = true;
        drop(slots);
        self.inner.available.add_permits(size);

        let handle = tokio::spawn(reconnect_loop(self.inner.clone(), dead_rx));
        *self
            .inner
            .reconnector
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        debug!(size, "connection pool started");
        Ok(())
    }

    /// Waits up to `timeout` for a free connection.
    pub async fn allocate(&self, timeout: Duration) -> Result<Lease<C>> {
        {
            let slots = self.inner.slots();
            if slots.closed {
                return Err(Error::PoolClosed);
            }
            if !slots.started {
                return Err(Error::NotStarted);
            }
        }

        let permit = select! {
            biased;
            _ = self.inner.cancel.cancelled() => return Err(Error::PoolClosed),
            permit = time::timeout(timeout, self.inner.available.acquire()) => {
                match permit {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(Error::PoolClosed),
                    Err(_) => return Err(Error::AllocateTimeout(timeout)),
                }
            },
        };
        // The permit stands for the connection popped below; returning the
        // connection adds a fresh one.
        permit.forget();

        let mut slots = self.inner.slots();
        if slots.closed {
            return Err(Error::PoolClosed);
        }
        let conn = slots
            .free
            .pop()
            .ok_or(Error::InvalidState("free connection missing"))?;
        slots.leased += 1;

        Ok(Lease {
            conn: Some(conn),
            pool: self.inner.clone(),
        })
    }

    /// Returns a leased connection. A connection-class `err` retires the
    /// connection and schedules its replacement; any other error is ignored.
    pub fn release(&self, lease: Lease<C>, err: Option<&Error>) {
        lease.release(err)
    }

    /// Shuts the pool down: waits for every lease to come back, stops the
    /// reconnect task and closes every connection. Only the first call does
    /// anything.
    pub async fn destroy(&self) {
        if self.inner.destroying.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.slots().closed = true;
        self.inner.cancel.cancel();
        self.inner.available.close();

        loop {
            let drained = self.inner.drained.notified();
            if self.inner.slots().leased == 0 {
                break;
            }
            debug!("waiting for leased connections");
            drained.await;
        }

        let handle = self
            .inner
            .reconnector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                warn!(%error, "reconnect task failed");
            }
        }

        let free = std::mem::take(&mut self.inner.slots().free);
        let n = free.len();
        for conn in free {
            self.inner.connector.close(conn);
        }

        debug!(closed = n, "connection pool destroyed");
    }
}

impl<C: Connector> Inner<C> {
    fn slots(&self) -> MutexGuard<'_, Slots<C::Conn>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn put(&self, conn: C::Conn, broken: bool) {
        let mut slots = self.slots();
        slots.leased -= 1;
        let drained = slots.leased == 0;

        if broken {
            slots.dead += 1;
            drop(slots);

            self.connector.close(conn);
            // The reconnect task is gone once the pool is destroyed, and the
            // slot no longer matters.
            let _ = self.dead_tx.send(());
        } else {
            slots.free.push(conn);
            drop(slots);

            self.available.add_permits(1);
        }

        if drained {
            self.drained.notify_waiters();
        }
    }

    /// Makes one attempt to replace a dead connection.
    async fn revive(&self) -> bool {
        let result = select! {
            result = self.connector.connect() => result,
            _ = self.cancel.cancelled() => return false,
        };

        match result {
            Ok(conn) => {
                let mut slots = self.slots();
                if slots.closed {
                    drop(slots);
                    self.connector.close(conn);
                    return false;
                }
                slots.dead -= 1;
                slots.free.push(conn);
                drop(slots);

                self.available.add_permits(1);
                info!("connection restored");
                true
            },
            Err(error) => {
                warn!(%error, "unable to reconnect");
                false
            },
        }
    }
}

/// Owns every dead connection: tries to replace each one immediately, then
/// once per reconnect interval until it succeeds.
async fn reconnect_loop<C: Connector>(
    inner: Arc<Inner<C>>,
    mut dead_rx: mpsc::UnboundedReceiver<()>,
) {
    let mut retry = time::interval(inner.reconnect);
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pending = 0usize;

    loop {
        select! {
            _ = inner.cancel.cancelled() => return,
            Some(()) = dead_rx.recv() => {
                warn!("connection lost, reconnecting");
                if !inner.revive().await {
                    if pending == 0 {
                        retry.reset();
                    }
                    pending += 1;
                }
            },
            _ = retry.tick(), if pending > 0 => {
                while pending > 0 && inner.revive().await {
                    pending -= 1;
                }
            },
        }
    }
}

impl<C: Connector> Lease<C> {
    /// Returns the connection, retiring it if `err` is connection-class.
    pub fn release(mut self, err: Option<&Error>) {
        if let Some(conn) = self.conn.take() {
            self.pool.put(conn, err.is_some_and(Error::is_connection));
        }
    }
}

impl<C: Connector> Deref for Lease<C> {
    type Target = C::Conn;

    fn deref(&self) -> &Self::Target {
        // Only `release` and `drop` take the connection, and both consume the
        // lease.
        self.conn.as_ref().expect("lease already released")
    }
}

impl<C: Connector> DerefMut for Lease<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("lease already released")
    }
}

impl<C: Connector> Drop for Lease<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put(conn, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::error::ConnectionError;

    #[derive(Default)]
    struct FakeConnector {
        calls: AtomicUsize,
        closed: AtomicUsize,
        /// 1-based connect call that fails, if any.
        fail_call: Option<usize>,
        down: AtomicBool,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        type Conn = usize;

        async fn connect(&self) -> Result<usize> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if Some(n) == self.fail_call || self.down.load(Ordering::SeqCst) {
                return Err(ConnectionError::new(anyhow::anyhow!("refused")).into());
            }
            Ok(n)
        }

        fn close(&self, _conn: usize) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(size: usize) -> ConnPool<FakeConnector> {
        ConnPool::new(FakeConnector::default(), size, Duration::from_millis(50))
    }

    fn broken() -> Error {
        ConnectionError::new(anyhow::anyhow!("broken pipe")).into()
    }

    async fn wait_for(pool: &ConnPool<FakeConnector>, free: usize) {
        for _ in 0..100 {
            let state = pool.state();
            assert!(state.free <= pool.size());
            if state.free == free {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pool never reached {free} free connections: {:?}", pool.state());
    }

    #[tokio::test]
    async fn test_allocate_and_release() {
        let pool = pool(2);
        pool.start().await.unwrap();
        assert_eq!(pool.state(), PoolState { free: 2, leased: 0, dead: 0 });

        let a = pool.allocate(Duration::from_millis(10)).await.unwrap();
        let b = pool.allocate(Duration::from_millis(10)).await.unwrap();
        assert_eq!(pool.state().count(ConnState::Leased), 2);
        assert_ne!(*a, *b);

        let err = pool.allocate(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::AllocateTimeout(_)));

        let id = *a;
        pool.release(a, None);
        drop(b);
        assert_eq!(pool.state(), PoolState { free: 2, leased: 0, dead: 0 });

        let again = pool.allocate(Duration::from_millis(10)).await.unwrap();
        assert!(*again == id || pool.state().free == 1);

        drop(again);
        pool.destroy().await;
    }

    #[tokio::test]
    async fn test_allocate_before_start() {
        let pool = pool(1);
        let err = pool.allocate(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, Error::NotStarted));
    }

    #[tokio::test]
    async fn test_start_is_all_or_nothing() {
        let pool = ConnPool::new(
            FakeConnector {
                fail_call: Some(2),
                ..Default::default()
            },
            3,
            Duration::from_millis(50),
        );

        assert!(pool.start().await.is_err());

        let connector = pool.connector();
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.state().total(), 0);
    }

    #[tokio::test]
    async fn test_ordinary_error_keeps_connection() {
        let pool = pool(1);
        pool.start().await.unwrap();

        let lease = pool.allocate(Duration::from_millis(10)).await.unwrap();
        let id = *lease;
        pool.release(lease, Some(&Error::config("bad job")));

        let lease = pool.allocate(Duration::from_millis(10)).await.unwrap();
        assert_eq!(*lease, id);
        assert_eq!(pool.connector().closed.load(Ordering::SeqCst), 0);

        drop(lease);
        pool.destroy().await;
    }

    #[tokio::test]
    async fn test_connection_error_is_replaced() {
        let pool = pool(3);
        pool.start().await.unwrap();

        let lease = pool.allocate(Duration::from_millis(10)).await.unwrap();
        pool.release(lease, Some(&broken()));

        wait_for(&pool, 3).await;
        assert_eq!(pool.state(), PoolState { free: 3, leased: 0, dead: 0 });
        assert_eq!(pool.connector().closed.load(Ordering::SeqCst), 1);

        pool.destroy().await;
    }

    #[tokio::test]
    async fn test_reconnect_retries_until_success() {
        let pool = pool(2);
        pool.start().await.unwrap();
        pool.connector().down.store(true, Ordering::SeqCst);

        let lease = pool.allocate(Duration::from_millis(10)).await.unwrap();
        pool.release(lease, Some(&broken()));

        // Several reconnect intervals pass while the broker is down; the
        // pool keeps serving with one connection less.
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.state(), PoolState { free: 1, leased: 0, dead: 1 });
        let lease = pool.allocate(Duration::from_millis(10)).await.unwrap();
        drop(lease);

        pool.connector().down.store(false, Ordering::SeqCst);
        wait_for(&pool, 2).await;
        assert_eq!(pool.state().dead, 0);

        pool.destroy().await;
    }

    #[tokio::test]
    async fn test_grow_after_start() {
        let pool = pool(1);
        pool.resize(2).unwrap();
        pool.start().await.unwrap();
        assert_eq!(pool.state().free, 2);

        pool.resize(4).unwrap();
        wait_for(&pool, 4).await;
        assert_eq!(pool.state(), PoolState { free: 4, leased: 0, dead: 0 });

        assert!(pool.resize(3).is_err());
        assert_eq!(pool.size(), 4);

        pool.destroy().await;
        assert_eq!(pool.connector().closed.load(Ordering::SeqCst), 4);
        assert!(matches!(pool.resize(5), Err(Error::PoolClosed)));
    }

    #[tokio::test]
    async fn test_destroy_waits_for_leases() {
        let pool = pool(3);
        pool.start().await.unwrap();

        let a = pool.allocate(Duration::from_millis(10)).await.unwrap();
        let b = pool.allocate(Duration::from_millis(10)).await.unwrap();

        let destroy = tokio::spawn({
            let pool = pool.clone();
            async move { pool.destroy().await }
        });

        time::sleep(Duration::from_millis(50)).await;
        assert!(!destroy.is_finished());
        assert_eq!(pool.connector().closed.load(Ordering::SeqCst), 0);

        // New allocations are refused while draining.
        let err = pool.allocate(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, Error::PoolClosed));

        drop(a);
        time::sleep(Duration::from_millis(20)).await;
        assert!(!destroy.is_finished());

        pool.release(b, None);
        destroy.await.unwrap();
        assert_eq!(pool.connector().closed.load(Ordering::SeqCst), 3);

        // Second call is a no-op.
        pool.destroy().await;
        assert_eq!(pool.connector().closed.load(Ordering::SeqCst), 3);
    }
}
