//! Error types exposed by this crate.

use thiserror::Error;

/// Errors surfaced by the public `Replica` handle.
#[derive(Debug, Error)]
pub enum RaftError {
    /// The replica actor is shutting down, potentially for data safety
    /// reasons due to a storage error.
    #[error("raft replica is shutting down")]
    ShuttingDown,

    /// A fatal storage or state machine error; the replica has stopped.
    #[error("fatal storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Errors from the durable log and metadata stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The on-disk state is inconsistent and cannot be opened.
    #[error("store is corrupted: {0}")]
    Corrupted(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] serde_json::Error),
}

/// Errors from building a `Config`.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// The heartbeat period must be well below the minimum election timeout.
    #[error("heartbeat interval must be smaller than the election timeout")]
    HeartbeatTooSlow,

    /// The nominal round-trip estimate must be non-zero.
    #[error("net.rtt must be greater than 0")]
    InvalidRtt,
}
