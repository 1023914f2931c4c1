//! A replicated state machine built on Raft leader-based consensus.
//!
//! The crate provides:
//!
//! - the consensus engine: a per-replica actor running the Follower /
//!   Candidate / Leader role machine, with per-peer replication tasks and
//!   conflict-hint back-off ([`raft::Replica`]);
//! - durable local state surviving restarts: an append-only log and a typed
//!   metadata store ([`storage`]);
//! - exactly-once client semantics: a dedup cache keyed by request id on
//!   every replica, fed by monotonically indexed client requests
//!   ([`client::RsmClient`]);
//! - a leader-routing proxy that hides elections and redirects from clients
//!   ([`proxy::Proxy`]);
//! - the [`state_machine::StateMachine`] seam for plugging in an
//!   application's deterministic state machine.
//!
//! Transport is abstracted behind the [`network::RaftNetwork`] and
//! [`network::RsmNetwork`] traits, so a test harness can route frames
//! in-process, inject partitions and crash and restart replicas.

pub mod client;
pub mod command;
pub mod config;
mod core;
pub mod error;
pub mod metrics;
pub mod network;
pub mod proxy;
pub mod quorum;
pub mod raft;
mod replication;
pub mod state_machine;
pub mod storage;

pub use crate::client::RsmClient;
pub use crate::command::Command;
pub use crate::command::RequestId;
pub use crate::command::Response;
pub use crate::config::Config;
pub use crate::core::State;
pub use crate::error::ConfigError;
pub use crate::error::RaftError;
pub use crate::error::RaftResult;
pub use crate::error::StoreError;
pub use crate::metrics::ReplicaMetrics;
pub use crate::metrics::Wait;
pub use crate::network::RaftNetwork;
pub use crate::network::RsmNetwork;
pub use crate::proxy::Proxy;
pub use crate::raft::LogEntry;
pub use crate::raft::Replica;
pub use crate::state_machine::StateMachine;
pub use crate::storage::LogStore;
pub use crate::storage::MetaStore;
pub use crate::storage::ReplicaStore;

/// The unique, stable identity of a replica; recorded in `votedFor` and
/// carried in leader redirects.
pub type NodeId = u64;

/// A trait for rendering a compact log-friendly summary of a message.
pub trait MessageSummary {
    fn summary(&self) -> String;
}
