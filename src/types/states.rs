/// Where a pooled connection currently is.
///
/// Callers move connections between `Free` and `Leased`; only the pool's
/// reconnect loop moves them out of `Dead`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ConnState {
    Free,
    Leased,
    /// Failed and waiting for the reconnect loop.
    Dead,
}

/// Lifecycle of a pipeline's consumer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueueState {
    Idle,
    Consuming,
    /// Stop requested, waiting for in-flight jobs.
    Stopping,
}

