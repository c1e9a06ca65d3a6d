//! Broker backed by a beanstalkd server.
pub mod conn;
pub mod tube;

use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, instrument};

use crate::broker::Backend;
use crate::config::BEANSTALK;
use crate::error::{ConnectionError, Error, Result};
use crate::pool::conn::{ConnPool, Connector};
use crate::types::pipeline::Pipeline;

pub use self::conn::Conn;
pub use self::tube::Tube;

/// Any byte stream a beanstalk connection can run over.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

pub type BoxConn = Conn<Box<dyn Stream>>;

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// `tcp://host:port`, or `unix://path` on unix.
    #[serde(default = "default_addr")]
    pub addr: String,
    /// Connections kept open. Grown if the registered pipelines need more.
    #[serde(default = "default_connections")]
    pub connections: usize,
    /// Seconds a consumer waits per reserve.
    #[serde(default = "default_reserve", deserialize_with = "seconds")]
    pub reserve: Duration,
    /// Seconds to wait for a free connection, and between reconnects.
    #[serde(default = "default_timeout", deserialize_with = "seconds")]
    pub timeout: Duration,
}

fn default_addr() -> String {
    "tcp://127.0.0.1:11300".to_owned()
}

fn default_connections() -> usize {
    6
}

fn default_reserve() -> Duration {
    Duration::from_secs(1)
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn seconds<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_secs)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            connections: default_connections(),
            reserve: default_reserve(),
            timeout: default_timeout(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        Dialer::new(self)?;
        if self.connections == 0 {
            return Err(Error::config("beanstalk: connections must be at least 1"));
        }
        if self.reserve.is_zero() || self.timeout.is_zero() {
            return Err(Error::config(
                "beanstalk: reserve and timeout must be at least 1 second",
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Endpoint {
    Tcp(String),
    #[cfg(unix)]
    Unix(std::path::PathBuf),
}

/// Opens connections to the configured address.
#[derive(Clone, Debug)]
pub struct Dialer {
    endpoint: Endpoint,
    timeout: Duration,
}

impl Dialer {
    pub fn new(config: &Config) -> Result<Self> {
        let endpoint = match config.addr.split_once("://") {
            Some(("tcp", addr)) if !addr.is_empty() => Endpoint::Tcp(addr.to_owned()),
            #[cfg(unix)]
            Some(("unix", path)) if !path.is_empty() => Endpoint::Unix(path.into()),
            _ => {
                return Err(Error::config(format!(
                    "beanstalk: invalid address `{}` (expected tcp://host:port or unix://path)",
                    config.addr
                )))
            },
        };

        Ok(Self {
            endpoint,
            timeout: config.timeout,
        })
    }

    async fn dial(&self) -> anyhow::Result<Box<dyn Stream>> {
        let stream: Box<dyn Stream> = match &self.endpoint {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true).context("setting NODELAY")?;
                Box::new(stream)
            },
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                Box::new(tokio::net::UnixStream::connect(path).await?)
            },
        };
        Ok(stream)
    }
}

#[async_trait]
impl Connector for Dialer {
    type Conn = BoxConn;

    #[instrument(name = "dial", skip_all, fields(endpoint = ?self.endpoint))]
    async fn connect(&self) -> Result<BoxConn> {
        let stream = time::timeout(self.timeout, self.dial())
            .await
            .map_err(|_| ConnectionError::new(anyhow!("connect timed out")))?
            .map_err(ConnectionError::new)?;

        debug!("connected");
        Ok(Conn::new(stream))
    }

    fn close(&self, conn: BoxConn) {
        debug!(endpoint = ?self.endpoint, "closing connection");
        drop(conn);
    }
}

/// The beanstalk [`Backend`]. Every pipeline maps onto the tube named by its
/// `tube` option, and all of them share one connection pool.
pub struct Beanstalk<C: Connector<Conn = BoxConn> = Dialer> {
    config: Config,
    pool: ConnPool<C>,
}

impl Beanstalk<Dialer> {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let dialer = Dialer::new(&config)?;
        Ok(Self::with_connector(dialer, config))
    }
}

impl<C: Connector<Conn = BoxConn>> Beanstalk<C> {
    pub fn with_connector(connector: C, config: Config) -> Self {
        Self {
            pool: ConnPool::new(connector, config.connections, config.timeout),
            config,
        }
    }

    pub fn pool(&self) -> &ConnPool<C> {
        &self.pool
    }

    /// A reserved job keeps its connection until it is settled, so every
    /// receipt may hold one while another stays free for pushes.
    fn pool_size(&self, leases: usize) -> usize {
        self.config.connections.max(leases + 1)
    }
}

#[async_trait]
impl<C: Connector<Conn = BoxConn>> Backend for Beanstalk<C> {
    type Transport = Tube<C>;

    fn name(&self) -> &str {
        BEANSTALK
    }

    fn transport(&self, pipeline: &Pipeline) -> Result<Tube<C>> {
        let tube = pipeline.string("tube", "");
        if tube.is_empty() || tube.contains(char::is_whitespace) {
            return Err(Error::config(format!(
                "pipeline `{}`: missing or invalid `tube` option",
                pipeline.name
            )));
        }

        Ok(Tube::new(self.pool.clone(), &tube, self.config.timeout))
    }

    fn reserve(&self) -> Duration {
        self.config.reserve
    }

    async fn start(&self, leases: usize) -> Result<()> {
        self.pool.resize(self.pool_size(leases))?;
        self.pool.start().await
    }

    fn grow(&self, leases: usize) -> Result<()> {
        let size = self.pool_size(leases);
        if size > self.pool.size() {
            self.pool.resize(size)?;
        }
        Ok(())
    }

    async fn stop(&self) {
        self.pool.destroy().await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::sync::Semaphore;

    use super::*;
    use crate::broker::{Broker, JobBroker};
    use crate::event::Events;
    use crate::line_reader::LineReader;
    use crate::pool::handler::{HandlerFn, HandlerPool};
    use crate::types::job::Job;

    /// In-process beanstalkd speaking just enough of the protocol for one
    /// tube. Every connection shares the same ready list.
    #[derive(Clone, Default)]
    struct FakeServer {
        state: Arc<Mutex<FakeState>>,
    }

    #[derive(Default)]
    struct FakeState {
        next: u64,
        ready: VecDeque<(u64, Vec<u8>)>,
        reserved: usize,
    }

    #[async_trait]
    impl Connector for FakeServer {
        type Conn = BoxConn;

        async fn connect(&self) -> Result<BoxConn> {
            let (client, server) = tokio::io::duplex(64 * 1024);
            tokio::spawn(run_fake(server, self.state.clone()));
            Ok(Conn::new(Box::new(client) as Box<dyn Stream>))
        }

        fn close(&self, conn: BoxConn) {
            drop(conn);
        }
    }

    async fn run_fake(stream: DuplexStream, state: Arc<Mutex<FakeState>>) {
        let (r, mut w) = tokio::io::split(stream);
        let mut r: LineReader<_> = r.into();

        while let Ok(Some(line)) = r.read_line().await {
            let line = String::from_utf8_lossy(&line).into_owned();
            let words: Vec<&str> = line.split_whitespace().collect();
            let reply = match words.as_slice() {
                ["use", tube] => format!("USING {tube}\r\n"),
                ["watch", _] => "WATCHING 2\r\n".to_owned(),
                ["ignore", _] => "WATCHING 1\r\n".to_owned(),
                ["put", _, _, _, n] => {
                    let Ok(body) = r.read_block(n.parse().unwrap()).await else {
                        return;
                    };
                    let mut state = state.lock().unwrap();
                    state.next += 1;
                    let id = state.next;
                    state.ready.push_back((id, body.to_vec()));
                    format!("INSERTED {id}\r\n")
                },
                ["reserve-with-timeout", _] => {
                    let job = {
                        let mut state = state.lock().unwrap();
                        let job = state.ready.pop_front();
                        state.reserved += job.is_some() as usize;
                        job
                    };
                    match job {
                        Some((id, body)) => format!(
                            "RESERVED {id} {}\r\n{}\r\n",
                            body.len(),
                            String::from_utf8(body).unwrap()
                        ),
                        None => {
                            time::sleep(Duration::from_millis(20)).await;
                            "TIMED_OUT\r\n".to_owned()
                        },
                    }
                },
                ["delete", _] => "DELETED\r\n".to_owned(),
                _ => "UNKNOWN_COMMAND\r\n".to_owned(),
            };
            if w.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    }

    #[test]
    fn test_config_defaults() {
        let config: Config = serde_yaml::from_str("addr: tcp://beans:11300\nreserve: 2\n").unwrap();
        assert_eq!(config.addr, "tcp://beans:11300");
        assert_eq!(config.connections, 6);
        assert_eq!(config.reserve, Duration::from_secs(2));
        assert_eq!(config.timeout, Duration::from_secs(10));
        config.validate().unwrap();

        assert!(serde_yaml::from_str::<Config>("host: x\n").is_err());
    }

    #[test]
    fn test_addresses() {
        let dial = |addr: &str| {
            Dialer::new(&Config {
                addr: addr.to_owned(),
                ..Default::default()
            })
            .map(|d| d.endpoint)
        };

        assert_eq!(dial("tcp://localhost:11300").unwrap(), Endpoint::Tcp("localhost:11300".to_owned()));
        #[cfg(unix)]
        assert_eq!(dial("unix:///run/beanstalk.sock").unwrap(), Endpoint::Unix("/run/beanstalk.sock".into()));
        assert!(dial("localhost:11300").is_err());
        assert!(dial("udp://localhost:11300").is_err());
        assert!(dial("tcp://").is_err());
    }

    #[test]
    fn test_pipeline_needs_tube() {
        let backend = Beanstalk::new(Config::default()).unwrap();

        assert!(backend.transport(&Pipeline::new("a", "beanstalk")).is_err());
        assert!(backend
            .transport(&Pipeline::new("a", "beanstalk").with("tube", "two words"))
            .is_err());
        assert!(backend
            .transport(&Pipeline::new("a", "beanstalk").with("tube", "emails"))
            .is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        // Bind then drop a listener to find a closed port.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = Dialer::new(&Config {
            addr: format!("tcp://{addr}"),
            timeout: Duration::from_secs(1),
            ..Default::default()
        })
        .unwrap();

        assert!(dialer.connect().await.unwrap_err().is_connection());
    }

    #[tokio::test]
    async fn test_busy_handlers_leave_a_connection_for_pushes() {
        let server = FakeServer::default();
        let backend = Beanstalk::with_connector(
            server.clone(),
            Config {
                connections: 1,
                timeout: Duration::from_secs(1),
                ..Default::default()
            },
        );
        let broker = Broker::new(backend, Events::new());
        broker
            .register(vec![Pipeline::new("emails", BEANSTALK)
                .with("tube", "emails")
                .listen(true)])
            .unwrap();

        // More handlers than consumer loops, each holding its job until
        // released.
        let release = Arc::new(Semaphore::new(0));
        let started = Arc::new(AtomicUsize::new(0));
        let handler = {
            let release = release.clone();
            let started = started.clone();
            HandlerFn(move |_job: Job| {
                let release = release.clone();
                let started = started.clone();
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    let _permit = release.acquire().await?;
                    Ok(())
                }
            })
        };
        broker
            .consume(
                "emails",
                Some(HandlerPool::replicate(Arc::new(handler), 3).unwrap()),
                None,
            )
            .await
            .unwrap();

        let serve = tokio::spawn({
            let broker = broker.clone();
            async move { broker.serve().await }
        });
        while broker.backend().pool().state().total() == 0 {
            time::sleep(Duration::from_millis(5)).await;
        }
        // One loop plus three handlers, and one for pushes.
        assert_eq!(broker.backend().pool().size(), 5);

        for n in 0..3 {
            broker.push("emails", Job::new("mail", n.to_string())).await.unwrap();
        }
        for _ in 0..200 {
            if started.load(Ordering::SeqCst) == 3 {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(started.load(Ordering::SeqCst), 3);

        // The loop reserves this one and waits for a handler while holding
        // its connection.
        broker.push("emails", Job::new("mail", "3")).await.unwrap();
        for _ in 0..200 {
            if server.state.lock().unwrap().reserved == 4 {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.state.lock().unwrap().reserved, 4);

        broker.push("emails", Job::new("mail", "4")).await.unwrap();

        release.add_permits(1);
        broker.stop().await;
        serve.await.unwrap().unwrap();
    }
}
