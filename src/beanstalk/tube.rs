use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use super::BoxConn;
use crate::error::Result;
use crate::pool::conn::{ConnPool, Connector, Lease};
use crate::queue::{Delivery, Transport};
use crate::types::job::{pack, unpack, Job};
use crate::types::stat::Stat;
use crate::util::bytes_to_human_str;

/// One pipeline's tube on a shared connection pool.
pub struct Tube<C: Connector<Conn = BoxConn>> {
    pool: ConnPool<C>,
    name: Vec<u8>,
    /// Allocation timeout.
    timeout: Duration,
}

/// A reserved job. beanstalkd only lets the reserving connection delete or
/// bury a job, so the connection stays leased until the job is settled.
pub struct Receipt<C: Connector<Conn = BoxConn>> {
    lease: Lease<C>,
    id: u64,
}

impl<C: Connector<Conn = BoxConn>> Tube<C> {
    pub fn new(pool: ConnPool<C>, name: &str, timeout: Duration) -> Self {
        Self {
            pool,
            name: name.as_bytes().to_vec(),
            timeout,
        }
    }

    fn name(&self) -> String {
        bytes_to_human_str(&self.name)
    }

    async fn put(&self, lease: &mut Lease<C>, job: &Job, delay: Duration) -> Result<u64> {
        let data = Bytes::from(pack(job)?);
        lease.put(&self.name, delay, job.options.timeout(), data).await
    }
}

#[async_trait]
impl<C: Connector<Conn = BoxConn>> Transport for Tube<C> {
    type Receipt = Receipt<C>;

    async fn publish(&self, job: &Job, delay: Duration) -> Result<String> {
        let mut lease = self.pool.allocate(self.timeout).await?;
        let result = self.put(&mut lease, job, delay).await;
        lease.release(result.as_ref().err());

        result.map(|id| id.to_string())
    }

    async fn receive(
        &self,
        timeout: Duration,
    ) -> Result<Option<Delivery<Receipt<C>>>> {
        let mut lease = self.pool.allocate(self.timeout).await?;

        let (id, data) = match lease.reserve(&self.name, timeout).await {
            Ok(Some(reserved)) => reserved,
            Ok(None) => return Ok(None),
            Err(error) => {
                lease.release(Some(&error));
                return Err(error);
            },
        };

        match unpack(&data) {
            Ok(mut job) => {
                job.id = id.to_string();
                Ok(Some(Delivery {
                    job,
                    receipt: Receipt { lease, id },
                }))
            },
            Err(error) => {
                // Not a job this broker wrote; keep it out of delivery but
                // inspectable.
                warn!(tube = self.name(), id, %error, "burying undecodable job");
                let buried = lease.bury(id).await;
                lease.release(buried.as_ref().err());
                Err(error)
            },
        }
    }

    async fn ack(&self, receipt: Receipt<C>) -> Result<()> {
        let Receipt { mut lease, id } = receipt;
        let result = lease.delete(id).await;
        lease.release(result.as_ref().err());
        result
    }

    async fn requeue(
        &self,
        job: &Job,
        receipt: Receipt<C>,
        delay: Duration,
    ) -> Result<()> {
        let Receipt { mut lease, id } = receipt;

        // The body must change to carry the new attempt count, so the job is
        // put again and the reserved copy deleted.
        let mut result = self.put(&mut lease, job, delay).await.map(drop);
        if result.is_ok() {
            result = lease.delete(id).await;
        }
        lease.release(result.as_ref().err());
        result
    }

    async fn bury(&self, _job: &Job, receipt: Receipt<C>) -> Result<()> {
        let Receipt { mut lease, id } = receipt;
        let result = lease.bury(id).await;
        lease.release(result.as_ref().err());
        result
    }

    async fn stat(&self) -> Result<Stat> {
        let mut lease = self.pool.allocate(self.timeout).await?;
        let result = lease.stats_tube(&self.name).await;
        lease.release(result.as_ref().err());
        let stats = result?;

        let count = |n: u64| i64::try_from(n).unwrap_or(i64::MAX);
        Ok(Stat {
            internal_name: self.name(),
            queue: count(stats.current_jobs_ready),
            active: count(stats.current_jobs_reserved),
            delayed: count(stats.current_jobs_delayed),
            ..Default::default()
        })
    }
}
