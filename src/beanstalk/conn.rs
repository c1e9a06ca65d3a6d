//! A beanstalk client connection.
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{instrument, trace};

use crate::error::{ConnectionError, Error, Result};
use crate::line_reader::LineReader;
use crate::types::protocol::{BeanstalkCommand, BeanstalkResponse, TubeStats};
use crate::types::serialisable::BeanstalkSerialisable;
use crate::util::bytes_to_human_str;

const DEFAULT_TUBE: &[u8] = b"default";

/// One client connection. Remembers the `use`d and watched tube so that
/// repeated calls on the same tube cost a single round trip.
///
/// Anything that leaves the stream in an unknown state (I/O errors, EOF,
/// replies that don't parse) is returned as a connection error, and the
/// connection must not be used again.
pub struct Conn<S: AsyncRead> {
    reader: LineReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    used: Vec<u8>,
    watched: Vec<u8>,
}

impl<S: AsyncRead> std::fmt::Debug for Conn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn").finish_non_exhaustive()
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> Conn<S> {
    pub fn new(stream: S) -> Self {
        let (r, w) = io::split(stream);

        Self {
            reader: r.into(),
            writer: w,
            used: DEFAULT_TUBE.to_vec(),
            watched: DEFAULT_TUBE.to_vec(),
        }
    }

    async fn send(&mut self, cmd: BeanstalkCommand) -> Result<BeanstalkResponse> {
        let wire = cmd.serialise_beanstalk();
        trace!(command = bytes_to_human_str(&wire), "sending");

        self.writer.write_all(&wire).await?;
        self.writer.flush().await?;

        self.response().await
    }

    async fn response(&mut self) -> Result<BeanstalkResponse> {
        let line = self
            .reader
            .read_line()
            .await?
            .ok_or_else(|| ConnectionError::new(anyhow!("connection closed by server")))?;

        trace!(line = bytes_to_human_str(&line), "received");

        BeanstalkResponse::try_from(&line[..]).map_err(|error| {
            ConnectionError::new(
                anyhow::Error::new(error)
                    .context(format!("reading `{}`", bytes_to_human_str(&line))),
            )
            .into()
        })
    }

    async fn block(&mut self, n_bytes: u32) -> Result<Bytes> {
        // Infallible on every platform tokio supports.
        let n_bytes = usize::try_from(n_bytes)
            .map_err(ConnectionError::new)?;
        Ok(self.reader.read_block(n_bytes).await?)
    }

    /// Selects the tube that `put` writes to.
    pub async fn use_tube(&mut self, tube: &[u8]) -> Result<()> {
        if self.used == tube {
            return Ok(());
        }

        match self.send(BeanstalkCommand::Use { tube: tube.to_vec() }).await? {
            BeanstalkResponse::Using { tube } => {
                self.used = tube;
                Ok(())
            },
            other => Err(Error::Beanstalk(other)),
        }
    }

    /// Makes `tube` the only watched tube.
    pub async fn watch_only(&mut self, tube: &[u8]) -> Result<()> {
        if self.watched == tube {
            return Ok(());
        }

        match self.send(BeanstalkCommand::Watch { tube: tube.to_vec() }).await? {
            BeanstalkResponse::Watching { .. } => {},
            other => return Err(Error::Beanstalk(other)),
        }

        // Until the ignore succeeds both tubes are watched, and the next call
        // repeats both steps.
        let previous = self.watched.clone();
        match self.send(BeanstalkCommand::Ignore { tube: previous }).await? {
            BeanstalkResponse::Watching { .. } => {
                self.watched = tube.to_vec();
                Ok(())
            },
            other => Err(Error::Beanstalk(other)),
        }
    }

    /// Puts a job on `tube`, returning its id.
    #[instrument(level = "trace", skip_all, fields(tube = bytes_to_human_str(tube), len = data.len()))]
    pub async fn put(
        &mut self,
        tube: &[u8],
        delay: Duration,
        ttr: Duration,
        data: Bytes,
    ) -> Result<u64> {
        self.use_tube(tube).await?;

        let cmd = BeanstalkCommand::Put {
            pri: 0,
            delay: whole_seconds(delay),
            ttr: whole_seconds(ttr).max(1),
            data,
        };
        match self.send(cmd).await? {
            BeanstalkResponse::Inserted { id } => Ok(id),
            other => Err(Error::Beanstalk(other)),
        }
    }

    /// Reserves a job from `tube`, waiting up to `timeout`. Returns `None` if
    /// nothing arrived in time.
    pub async fn reserve(
        &mut self,
        tube: &[u8],
        timeout: Duration,
    ) -> Result<Option<(u64, Bytes)>> {
        self.watch_only(tube).await?;

        let cmd = BeanstalkCommand::ReserveWithTimeout {
            timeout: whole_seconds(timeout),
        };
        match self.send(cmd).await? {
            BeanstalkResponse::Reserved { id, n_bytes } => {
                let data = self.block(n_bytes).await?;
                Ok(Some((id, data)))
            },
            BeanstalkResponse::TimedOut | BeanstalkResponse::DeadlineSoon => {
                Ok(None)
            },
            other => Err(Error::Beanstalk(other)),
        }
    }

    /// Deletes a job reserved by this connection.
    pub async fn delete(&mut self, id: u64) -> Result<()> {
        match self.send(BeanstalkCommand::Delete { id }).await? {
            BeanstalkResponse::Deleted => Ok(()),
            other => Err(Error::Beanstalk(other)),
        }
    }

    /// Buries a job reserved by this connection.
    pub async fn bury(&mut self, id: u64) -> Result<()> {
        match self.send(BeanstalkCommand::Bury { id, pri: 0 }).await? {
            BeanstalkResponse::Buried => Ok(()),
            other => Err(Error::Beanstalk(other)),
        }
    }

    /// Reads the counters of `tube`. A tube that was never used reports
    /// zeroes.
    pub async fn stats_tube(&mut self, tube: &[u8]) -> Result<TubeStats> {
        match self.send(BeanstalkCommand::StatsTube { tube: tube.to_vec() }).await?
        {
            BeanstalkResponse::Ok { n_bytes } => {
                let yaml = self.block(n_bytes).await?;
                serde_yaml::from_slice(&yaml)
                    .map_err(|error| ConnectionError::new(error).into())
            },
            BeanstalkResponse::NotFound => Ok(TubeStats {
                name: String::from_utf8_lossy(tube).into_owned(),
                ..Default::default()
            }),
            other => Err(Error::Beanstalk(other)),
        }
    }
}

/// Rounds up to whole seconds, saturating at `u32::MAX`.
fn whole_seconds(d: Duration) -> u32 {
    let secs = d.as_secs().saturating_add(u64::from(d.subsec_nanos() > 0));
    u32::try_from(secs).unwrap_or(u32::MAX)
}
