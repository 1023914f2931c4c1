//! The network interfaces of the cluster.

use anyhow::Result;
use async_trait::async_trait;

use crate::command::Command;
use crate::command::Response;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::NodeId;

/// The transport used by replicas for Raft-internal RPCs.
///
/// An `Err` from these methods is a transport error: the caller retries
/// later with unchanged state.
#[async_trait]
pub trait RaftNetwork: Send + Sync + 'static {
    /// Send an AppendEntries RPC to the target replica.
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse>;

    /// Send a RequestVote RPC to the target replica.
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse>;
}

/// The transport used by the proxy to reach replicas (`RSM.Execute`).
///
/// Sends are at-most-once from the proxy's perspective: an `Err` means the
/// command may or may not have reached the target.
#[async_trait]
pub trait RsmNetwork: Send + Sync + 'static {
    /// Submit a command to the target replica.
    async fn send_execute(&self, target: NodeId, cmd: Command) -> Result<Response>;
}
