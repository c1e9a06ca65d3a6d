use bytes::Bytes;
use serde::Deserialize;

/// A command sent by the client to a beanstalk server. Only the commands a
/// job broker needs are modelled.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BeanstalkCommand {
    /// Places a job onto the currently `use`d tube. The body is sent on the
    /// following line.
    ///
    /// On the wire: `put <pri> <delay> <ttr> <bytes>`
    Put {
        pri: u32,
        delay: u32,
        ttr: u32,
        data: Bytes,
    },
    /// As `reserve`, but after `timeout` seconds pass, a `TIMED_OUT` response
    /// is sent instead.
    ///
    /// On the wire: `reserve-with-timeout <seconds>`
    ReserveWithTimeout { timeout: u32 },
    /// Deletes a job reserved by the same connection. Returns `DELETED` or
    /// `NOT_FOUND`.
    ///
    /// On the wire: `delete <id>`
    Delete { id: u64 },
    /// Buries a job reserved by the same connection. Returns `BURIED` or
    /// `NOT_FOUND`.
    ///
    /// On the wire: `bury <id> <pri>`
    Bury { id: u64, pri: u32 },
    /// Adds a tube to the watchlist. Replies `WATCHING <count>`.
    ///
    /// On the wire: `watch <tube>`
    Watch { tube: Vec<u8> },
    /// Removes a tube from the watchlist. Replies `WATCHING <count>` or
    /// `NOT_IGNORED` if it is the last watched tube.
    ///
    /// On the wire: `ignore <tube>`
    Ignore { tube: Vec<u8> },
    /// Replies with a YAML document describing the tube.
    ///
    /// On the wire: `stats-tube <tube>`
    StatsTube { tube: Vec<u8> },
    /// Selects the tube `put` writes to. Replies `USING <tube>`.
    ///
    /// On the wire: `use <tube>`
    Use { tube: Vec<u8> },
}

/// Responses a client can receive.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BeanstalkResponse {
    /// On the wire: `OUT_OF_MEMORY`.
    OutOfMemory,
    /// On the wire: `INTERNAL_ERROR`.
    InternalError,
    /// On the wire: `BAD_FORMAT`.
    BadFormat,
    /// On the wire: `UNKNOWN_COMMAND`.
    UnknownCommand,
    /// In response to a `put`, a job was created with the given ID.
    ///
    /// On the wire: `INSERTED <id>`.
    Inserted { id: u64 },
    /// In response to a `put`, the server ran out of memory growing its
    /// queue and buried the new job.
    ///
    /// On the wire: `BURIED <id>`.
    BuriedID { id: u64 },
    /// On the wire: `EXPECTED_CRLF`.
    ExpectedCRLF,
    /// On the wire: `JOB_TOO_BIG`.
    JobTooBig,
    /// On the wire: `DRAINING`.
    Draining,
    /// On the wire: `USING <tube>`.
    Using { tube: Vec<u8> },
    /// A job was reserved; `n_bytes` of body and a CRLF follow.
    ///
    /// On the wire: `RESERVED <id> <bytes>`.
    Reserved { id: u64, n_bytes: u32 },
    /// On the wire: `DEADLINE_SOON`.
    DeadlineSoon,
    /// On the wire: `TIMED_OUT`.
    TimedOut,
    /// On the wire: `DELETED`.
    Deleted,
    /// On the wire: `NOT_FOUND`.
    NotFound,
    /// On the wire: `BURIED`.
    Buried,
    /// On the wire: `WATCHING <count>`.
    Watching { count: u32 },
    /// On the wire: `NOT_IGNORED`.
    NotIgnored,
    /// `n_bytes` of YAML and a CRLF follow.
    ///
    /// On the wire: `OK <bytes>`.
    Ok { n_bytes: u32 },
}

/// The part of a `stats-tube` reply a broker reports.
#[derive(Debug, Default, Deserialize)]
pub struct TubeStats {
    /// tube name
    pub name: String,
    /// number of jobs in ready state
    #[serde(rename = "current-jobs-ready", default)]
    pub current_jobs_ready: u64,
    /// number of jobs reserved by clients
    #[serde(rename = "current-jobs-reserved", default)]
    pub current_jobs_reserved: u64,
    /// number of jobs in delayed state
    #[serde(rename = "current-jobs-delayed", default)]
    pub current_jobs_delayed: u64,
    /// number of jobs in buried state
    #[serde(rename = "current-jobs-buried", default)]
    pub current_jobs_buried: u64,
    /// total jobs created in this tube
    #[serde(rename = "total-jobs", default)]
    pub total_jobs: u64,
}
