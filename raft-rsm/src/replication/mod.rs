//! Per-peer replication tasks.
//!
//! The leader spawns one task per peer. Each task privately owns the peer's
//! `next_index`, selects over {heartbeat tick, append trigger, terminate},
//! and publishes match-index updates back to the leader, which advances the
//! commit index.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Interval;
use tracing::Instrument;

use crate::config::Config;
use crate::network::RaftNetwork;
use crate::raft::AppendEntriesRequest;
use crate::storage::LogStore;
use crate::NodeId;

/// The public handle to a spawned replication task.
pub(crate) struct ReplicationStream {
    /// The channel used for communicating with the replication task.
    pub tx: mpsc::UnboundedSender<ReplicationEvent>,
}

/// An event from the leader to a replication task. Any event is a trigger to
/// attempt replication right away.
pub(crate) enum ReplicationEvent {
    /// A new entry was appended to the leader's log.
    Replicate { commit_index: u64 },
    /// The leader's commit index advanced.
    UpdateCommitIndex { commit_index: u64 },
    /// The leader lost its role; the task must stop.
    Terminate,
}

/// An event from a replication task to the leader.
pub(crate) enum PeerEvent {
    /// The target stores the log at least up to `match_index`.
    UpdateMatchIndex { target: NodeId, match_index: u64 },
    /// The target answered with a newer term; the leader must step down.
    RevertToFollower { target: NodeId, term: u64 },
}

impl ReplicationStream {
    /// Spawn a replication task for the target peer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn<N: RaftNetwork>(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        log: Arc<LogStore>,
        commit_index: u64,
        network: Arc<N>,
        core_tx: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let heartbeat_timeout = Duration::from_millis(config.heartbeat_interval);
        let this = ReplicationCore {
            id,
            target,
            term,
            network,
            log: log.clone(),
            core_tx,
            rx,
            next_index: log.len() + 1,
            match_index: 0,
            commit_index,
            heartbeat: interval(heartbeat_timeout),
            heartbeat_timeout,
            shutdown: false,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("replication", id, peer = target)));
        Self { tx }
    }
}

/// A task responsible for replicating the leader's log to one target peer.
struct ReplicationCore<N: RaftNetwork> {
    /// The id of the leader this task replicates for.
    id: NodeId,
    /// The id of the target peer.
    target: NodeId,
    /// The leader's term; never changes during the lifetime of this task.
    term: u64,

    network: Arc<N>,
    log: Arc<LogStore>,

    /// A channel for publishing events to the leader.
    core_tx: mpsc::UnboundedSender<PeerEvent>,
    /// A channel for receiving events from the leader.
    rx: mpsc::UnboundedReceiver<ReplicationEvent>,

    /// The position of the next entry to send to the target. Backed off via
    /// the conflict hint when the target rejects the consistency check;
    /// never drops below 1.
    next_index: u64,
    /// The last position known to be stored on the target.
    match_index: u64,
    /// The leader's commit index as last communicated to this task.
    commit_index: u64,

    heartbeat: Interval,
    heartbeat_timeout: Duration,
    shutdown: bool,
}

impl<N: RaftNetwork> ReplicationCore<N> {
    #[tracing::instrument(level="debug", skip(self), fields(id=self.id, peer=self.target, term=self.term))]
    async fn main(mut self) {
        // Assert leadership immediately.
        self.send_append_entries().await;

        loop {
            if self.shutdown {
                return;
            }

            tokio::select! {
                _ = self.heartbeat.tick() => self.send_append_entries().await,
                event = self.rx.recv() => match event {
                    Some(ReplicationEvent::Replicate { commit_index }) => {
                        self.commit_index = commit_index;
                        self.send_append_entries().await;
                    }
                    Some(ReplicationEvent::UpdateCommitIndex { commit_index }) => {
                        self.commit_index = commit_index;
                        self.send_append_entries().await;
                    }
                    Some(ReplicationEvent::Terminate) | None => return,
                }
            }
        }
    }

    /// Send one AppendEntries frame carrying everything from `next_index`
    /// to the end of the log (empty at idle), then handle the reply.
    ///
    /// Repeats immediately while the target's conflict hints make progress;
    /// a transport error leaves all state unchanged until the next trigger.
    async fn send_append_entries(&mut self) {
        loop {
            let ni = self.next_index;
            let prev_log_index = ni - 1;
            let len = self.log.len();
            if prev_log_index > len {
                // The log shrank under us: this task belongs to a deposed
                // leader and a Terminate event is on its way.
                return;
            }
            let prev_log_term = if prev_log_index == 0 {
                0
            } else {
                self.log.term(prev_log_index)
            };
            let entries = self.log.read_range(ni, len);
            let n_entries = entries.len() as u64;

            let rpc = AppendEntriesRequest {
                term: self.term,
                leader: self.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit_index: self.commit_index,
            };

            let res = match timeout(self.heartbeat_timeout, self.network.send_append_entries(self.target, rpc)).await
            {
                Ok(Ok(res)) => res,
                Ok(Err(err)) => {
                    tracing::debug!(peer = self.target, error=%err, "error sending AppendEntries RPC");
                    return;
                }
                Err(_) => {
                    tracing::debug!(peer = self.target, "timeout while sending AppendEntries RPC");
                    return;
                }
            };

            if res.term > self.term {
                tracing::debug!(peer = self.target, term = res.term, "peer is at a newer term");
                let _ = self.core_tx.send(PeerEvent::RevertToFollower {
                    target: self.target,
                    term: res.term,
                });
                self.shutdown = true;
                return;
            }

            if res.success {
                self.next_index = ni + n_entries;
                let match_index = self.next_index - 1;
                if match_index != self.match_index {
                    self.match_index = match_index;
                    tracing::debug!(peer = self.target, match_index, "replicated to peer");
                    let _ = self.core_tx.send(PeerEvent::UpdateMatchIndex {
                        target: self.target,
                        match_index,
                    });
                }
                return;
            }

            // The consistency check failed; back off next_index using the
            // conflict hint. If the hint names a term we also hold, jump
            // past our last entry of it.
            let hinted = if res.conflict_term > 0 {
                match self.log.last_index_of_term(res.conflict_term) {
                    Some(index) => index + 1,
                    None => res.conflict_index,
                }
            } else {
                res.conflict_index
            };
            let new_next = hinted.max(1).min(self.log.len() + 1);

            if new_next >= ni {
                tracing::warn!(
                    peer = self.target,
                    next_index = ni,
                    conflict_index = res.conflict_index,
                    conflict_term = res.conflict_term,
                    "conflict hint made no progress, waiting for next trigger"
                );
                return;
            }
            tracing::debug!(peer = self.target, next_index = new_next, "backing off after conflict");
            self.next_index = new_next;
        }
    }
}
