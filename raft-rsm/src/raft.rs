//! Public replica interface and wire types.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::command::Command;
use crate::command::Response;
use crate::config::Config;
use crate::core::ReplicaCore;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::metrics::ReplicaMetrics;
use crate::metrics::Wait;
use crate::network::RaftNetwork;
use crate::storage::ReplicaStore;
use crate::MessageSummary;
use crate::NodeId;

struct ReplicaInner<N: RaftNetwork> {
    tx_api: mpsc::UnboundedSender<ReplicaMsg>,
    rx_metrics: watch::Receiver<ReplicaMetrics>,
    core_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
}

/// The handle to a running replica.
///
/// Spawns the replica actor task and communicates with it over a message
/// channel; cloning is cheap and clones address the same replica.
pub struct Replica<N: RaftNetwork> {
    inner: Arc<ReplicaInner<N>>,
}

impl<N: RaftNetwork> Replica<N> {
    /// Create and spawn a new replica task.
    ///
    /// `id` must be stable across restarts of this node (it is the identity
    /// recorded in `votedFor`). `members` is the static cluster membership,
    /// including this node. The stores in `store` must have been opened from
    /// this node's own directories.
    #[tracing::instrument(level="debug", skip(config, network, store), fields(cluster=%config.cluster_name))]
    pub fn spawn(
        id: NodeId,
        config: Arc<Config>,
        members: BTreeSet<NodeId>,
        network: Arc<N>,
        store: ReplicaStore,
    ) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(ReplicaMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let core_handle = ReplicaCore::spawn(id, config, members, network, store, rx_api, tx_metrics, rx_shutdown);
        let inner = ReplicaInner {
            tx_api,
            rx_metrics,
            core_handle: Mutex::new(Some(core_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_n: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Submit an AppendEntries RPC to this replica.
    ///
    /// Sent by the cluster leader to replicate log entries, and as
    /// heartbeats.
    #[tracing::instrument(level="debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(ReplicaMsg::AppendEntries { rpc, tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Submit a RequestVote RPC to this replica.
    ///
    /// Sent by candidates campaigning for leadership.
    #[tracing::instrument(level="debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(ReplicaMsg::Vote { rpc, tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Submit a client command (`RSM.Execute`).
    ///
    /// Resolves with `Response::Ack` once the command has been committed and
    /// applied, with the cached response if the command was already applied,
    /// or with a redirect/not-a-leader outcome for the caller to retry.
    #[tracing::instrument(level="debug", skip(self, cmd), fields(cmd=%cmd))]
    pub async fn execute(&self, cmd: Command) -> Result<Response, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(ReplicaMsg::Execute { cmd, tx })
            .map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown)
    }

    /// Get this replica's current idea of the cluster leader.
    pub fn current_leader(&self) -> Option<NodeId> {
        self.inner.rx_metrics.borrow().current_leader
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<ReplicaMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or_else(|| Duration::from_millis(500)),
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shut this replica down and await the actor's exit.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.core_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<N: RaftNetwork> Clone for Replica<N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// A message from the public handle to the replica actor.
pub(crate) enum ReplicaMsg {
    AppendEntries {
        rpc: AppendEntriesRequest,
        tx: oneshot::Sender<AppendEntriesResponse>,
    },
    Vote {
        rpc: VoteRequest,
        tx: oneshot::Sender<VoteResponse>,
    },
    Execute {
        cmd: Command,
        tx: ExecuteResponseTx,
    },
}

pub(crate) type ExecuteResponseTx = oneshot::Sender<Response>;

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An entry of the replicated log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The leader term under which the entry was created.
    pub term: u64,
    /// The client command carried by the entry.
    pub command: Command,
}

/// An RPC sent by the cluster leader to replicate log entries, and as a
/// heartbeat.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's id, recorded by followers for redirecting clients.
    pub leader: NodeId,
    /// The position of the entry immediately preceding the new ones.
    pub prev_log_index: u64,
    /// The term of the entry at `prev_log_index`; 0 when the position is 0.
    pub prev_log_term: u64,
    /// The new entries to store. Empty for heartbeats.
    pub entries: Vec<LogEntry>,
    /// The leader's commit index.
    pub leader_commit_index: u64,
}

impl MessageSummary for AppendEntriesRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader={}, prev=({}, {}), leader_commit={}, n={}",
            self.term,
            self.leader,
            self.prev_log_index,
            self.prev_log_term,
            self.leader_commit_index,
            self.entries.len()
        )
    }
}

/// The response to an `AppendEntriesRequest`.
///
/// `conflict_index`/`conflict_term` carry the conflict hint used by the
/// leader to back off `next_index` in one step; they are meaningful only
/// when `success` is false.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding replica's current term.
    pub term: u64,
    /// True if the follower's log matched `prev_log_index`/`prev_log_term`.
    pub success: bool,
    /// On a failed consistency check: the first position the leader should
    /// try next (never exceeds the follower's length + 1).
    pub conflict_index: u64,
    /// On a failed consistency check: the follower's term at
    /// `prev_log_index`, or 0 when its log is shorter than that.
    pub conflict_term: u64,
}

/// An RPC sent by candidates to gather votes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's id.
    pub candidate: NodeId,
    /// The position of the candidate's last log entry.
    pub last_log_index: u64,
    /// The term of the candidate's last log entry.
    pub last_log_term: u64,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

/// The response to a `VoteRequest`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The responding replica's current term, for the candidate to update
    /// itself.
    pub term: u64,
    /// True if the candidate received this replica's vote.
    pub vote_granted: bool,
}
