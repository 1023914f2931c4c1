//! The core logic of a replica.

mod append_entries;
mod execute;
mod vote;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::command::Command;
use crate::command::RequestId;
use crate::command::Response;
use crate::config::Config;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::metrics::ReplicaMetrics;
use crate::network::RaftNetwork;
use crate::quorum;
use crate::raft::ExecuteResponseTx;
use crate::raft::ReplicaMsg;
use crate::replication::PeerEvent;
use crate::replication::ReplicationEvent;
use crate::replication::ReplicationStream;
use crate::state_machine::StateMachine;
use crate::storage::LogStore;
use crate::storage::MetaStore;
use crate::storage::ReplicaStore;
use crate::storage::KEY_COMMIT_INDEX;
use crate::storage::KEY_CURRENT_TERM;
use crate::storage::KEY_VOTED_FOR;
use crate::NodeId;

/// The replica actor: exclusively owns all mutable Raft state.
///
/// All mutations of term, vote, log, commit index, role and the dedup cache
/// happen on this single task, so the commit -> apply -> resolve transition
/// is atomic with respect to every other state transition.
pub(crate) struct ReplicaCore<N: RaftNetwork> {
    /// This replica's id.
    id: NodeId,
    /// The runtime config.
    config: Arc<Config>,
    /// The static cluster membership, this replica included.
    members: BTreeSet<NodeId>,
    /// The transport for Raft-internal RPCs.
    network: Arc<N>,

    /// The durable replicated log.
    log: Arc<LogStore>,
    /// The durable metadata store.
    meta: Arc<MetaStore>,
    /// The application state machine.
    state_machine: Arc<std::sync::Mutex<dyn StateMachine>>,

    /// The state the main loop should transition into.
    target_state: State,

    /// The latest term this replica has observed.
    current_term: u64,
    /// The candidate this replica voted for in `current_term`.
    voted_for: Option<NodeId>,
    /// The replica's current idea of who the cluster leader is; set from
    /// AppendEntries RPCs.
    current_leader: Option<NodeId>,
    /// The highest log position known to be committed.
    commit_index: u64,
    /// The highest log position applied to the state machine.
    last_applied: u64,

    // Last values written to the metadata store, to skip redundant writes.
    persisted_term: u64,
    persisted_voted_for: Option<NodeId>,
    persisted_commit_index: u64,

    /// Responses of applied commands, keyed by request id. Never evicted.
    dedup: HashMap<RequestId, Vec<u8>>,

    /// The deadline of the running election timeout, if armed.
    next_election_timeout: Option<Instant>,

    rx_api: mpsc::UnboundedReceiver<ReplicaMsg>,
    tx_metrics: watch::Sender<ReplicaMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<N: RaftNetwork> ReplicaCore<N> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        members: BTreeSet<NodeId>,
        network: Arc<N>,
        store: ReplicaStore,
        rx_api: mpsc::UnboundedReceiver<ReplicaMsg>,
        tx_metrics: watch::Sender<ReplicaMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let this = Self {
            id,
            config,
            members,
            network,
            log: store.log,
            meta: store.meta,
            state_machine: store.state_machine,
            target_state: State::Follower,
            current_term: 0,
            voted_for: None,
            current_leader: None,
            commit_index: 0,
            last_applied: 0,
            persisted_term: 0,
            persisted_voted_for: None,
            persisted_commit_index: 0,
            dedup: HashMap::new(),
            next_election_timeout: None,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("replica")))
    }

    /// The main loop of the replica.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!("replica is initializing");

        self.current_term = self.meta.try_load::<u64>(KEY_CURRENT_TERM).unwrap_or(0);
        self.persisted_term = self.current_term;
        self.voted_for = self.meta.try_load::<Option<NodeId>>(KEY_VOTED_FOR).flatten();
        self.persisted_voted_for = self.voted_for;
        let stored_commit = self.meta.try_load::<u64>(KEY_COMMIT_INDEX).unwrap_or(0);
        self.persisted_commit_index = stored_commit;
        // The log is the authority on how far a recovered commit index may
        // reach.
        self.commit_index = stored_commit.min(self.log.len());

        {
            let mut sm = self.state_machine.lock().expect("state machine mutex poisoned");
            sm.reset();
        }
        let replayed = self.apply_committed_entries()?;
        tracing::info!(
            term = self.current_term,
            commit_index = self.commit_index,
            log_length = self.log.len(),
            replayed = replayed.len(),
            "recovered durable state"
        );

        self.target_state = State::Follower;
        self.update_next_election_timeout(false);
        self.report_metrics();

        loop {
            match &self.target_state {
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Candidate => CandidateState::new(&mut self).run().await?,
                State::Follower => FollowerState::new(&mut self).run().await?,
                State::Shutdown => {
                    tracing::info!("replica has shut down");
                    return Ok(());
                }
            }
        }
    }

    /// Publish a metrics payload if anything changed since the last one.
    fn report_metrics(&mut self) {
        let metrics = ReplicaMetrics {
            id: self.id,
            state: self.target_state,
            current_term: self.current_term,
            last_log_index: self.log.len(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            current_leader: self.current_leader,
        };
        if *self.tx_metrics.borrow() == metrics {
            return;
        }
        if let Err(err) = self.tx_metrics.send(metrics) {
            tracing::error!(error=%err, "error reporting metrics");
        }
    }

    /// Durably store `currentTerm`/`votedFor` if they changed.
    ///
    /// Must complete before any outgoing RequestVote, vote grant, or
    /// AppendEntries reply that depends on them.
    fn save_hard_state(&mut self) -> RaftResult<()> {
        if self.current_term != self.persisted_term {
            self.meta
                .store(KEY_CURRENT_TERM, &self.current_term)
                .map_err(|err| self.map_fatal_storage_error(err.into()))?;
            self.persisted_term = self.current_term;
        }
        if self.voted_for != self.persisted_voted_for {
            self.meta
                .store(KEY_VOTED_FOR, &self.voted_for)
                .map_err(|err| self.map_fatal_storage_error(err.into()))?;
            self.persisted_voted_for = self.voted_for;
        }
        Ok(())
    }

    /// Durably store the commit index if it changed.
    fn persist_commit_index(&mut self) -> RaftResult<()> {
        if self.commit_index != self.persisted_commit_index {
            self.meta
                .store(KEY_COMMIT_INDEX, &self.commit_index)
                .map_err(|err| self.map_fatal_storage_error(err.into()))?;
            self.persisted_commit_index = self.commit_index;
        }
        Ok(())
    }

    /// Update the target state of the main loop.
    fn set_target_state(&mut self, target_state: State) {
        if target_state != self.target_state {
            tracing::info!(from=?self.target_state, to=?target_state, term=self.current_term, "state transition");
        }
        self.target_state = target_state;
    }

    /// Get the next election deadline, arming a fresh timeout if none is
    /// set.
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let t = Duration::from_millis(self.config.new_rand_election_timeout());
                let inst = Instant::now() + t;
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Re-arm the election timeout with a freshly sampled value.
    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let t = Duration::from_millis(self.config.new_rand_election_timeout());
        if heartbeat {
            tracing::trace!(timeout=?t, "election timeout reset by leader contact");
        }
        self.next_election_timeout = Some(Instant::now() + t);
    }

    /// Update `current_term`, which resets `voted_for` when advancing.
    fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        match update {
            UpdateCurrentLeader::ThisNode => self.current_leader = Some(self.id),
            UpdateCurrentLeader::OtherNode(target) => self.current_leader = Some(target),
            UpdateCurrentLeader::Unknown => self.current_leader = None,
        }
    }

    /// Record a non-recoverable storage or state machine error and begin
    /// shutdown.
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!(id=self.id, error=?err, "fatal storage error, shutting down");
        self.set_target_state(State::Shutdown);
        RaftError::Storage(err)
    }

    /// Apply entries in `(last_applied, commit_index]` to the state machine,
    /// in log order, consulting the dedup cache for exactly-once semantics.
    ///
    /// Returns the `(request_id, response)` pair of every entry walked, so
    /// that a leader can resolve pending executions.
    fn apply_committed_entries(&mut self) -> RaftResult<Vec<(RequestId, Vec<u8>)>> {
        let mut applied = Vec::new();
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let entry = match self.log.read(index) {
                Some(entry) => entry,
                None => {
                    let err = anyhow::anyhow!("committed entry {} missing from log", index);
                    return Err(self.map_fatal_storage_error(err));
                }
            };
            let request_id = entry.command.request_id.clone();
            let response = match self.dedup.get(&request_id) {
                Some(cached) => cached.clone(),
                None => {
                    let response = self.apply_to_state_machine(&entry.command)?;
                    self.dedup.insert(request_id.clone(), response.clone());
                    response
                }
            };
            self.last_applied = index;
            tracing::debug!(index, request_id=%request_id, "applied committed entry");
            applied.push((request_id, response));
        }
        Ok(applied)
    }

    fn apply_to_state_machine(&mut self, command: &Command) -> RaftResult<Vec<u8>> {
        let res = {
            let mut sm = self.state_machine.lock().expect("state machine mutex poisoned");
            sm.apply(command)
        };
        res.map_err(|err| self.map_fatal_storage_error(err))
    }

    /// Answer an Execute received while not leader: from the dedup cache if
    /// the command was already applied, else with a redirect hint.
    fn handle_execute_not_leader(&mut self, cmd: Command, tx: ExecuteResponseTx) {
        if let Some(cached) = self.dedup.get(&cmd.request_id) {
            let _ = tx.send(Response::Ack {
                response: cached.clone(),
            });
            return;
        }
        let response = match self.current_leader {
            Some(leader) if leader != self.id => Response::RedirectToLeader { leader },
            _ => Response::NotALeader,
        };
        let _ = tx.send(response);
    }
}

/// An enum describing the way the current leader property is to be updated.
#[derive(Debug)]
pub(self) enum UpdateCurrentLeader {
    Unknown,
    OtherNode(NodeId),
    ThisNode,
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// All possible states of a replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// The replica is replicating logs from the leader.
    Follower,
    /// The replica is campaigning to become the cluster leader.
    Candidate,
    /// The replica is the cluster leader.
    Leader,
    /// The replica is shutting down.
    Shutdown,
}

impl State {
    /// Check if currently in follower state.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in candidate state.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in leader state.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the cluster leader.
pub(self) struct LeaderState<'a, N: RaftNetwork> {
    pub(super) core: &'a mut ReplicaCore<N>,
    /// Replication state per peer.
    pub(super) nodes: BTreeMap<NodeId, PeerReplication>,
    /// Executions awaiting commit, keyed by request id (not log index: a
    /// deposed leader may see its uncommitted slots overwritten).
    pub(super) pending: HashMap<RequestId, ExecuteResponseTx>,
    /// The stream of events coming from replication tasks.
    pub(super) replication_rx: mpsc::UnboundedReceiver<PeerEvent>,
    /// The cloneable sender for replication task events.
    pub(super) replication_tx: mpsc::UnboundedSender<PeerEvent>,
}

/// A peer's replication stream, from the leader's perspective.
pub(self) struct PeerReplication {
    /// The highest log position known to be stored on the peer.
    pub match_index: u64,
    /// The handle used to signal the peer's replication task.
    pub stream: ReplicationStream,
}

impl<'a, N: RaftNetwork> LeaderState<'a, N> {
    pub(self) fn new(core: &'a mut ReplicaCore<N>) -> Self {
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        Self {
            core,
            nodes: BTreeMap::new(),
            pending: HashMap::new(),
            replication_rx,
            replication_tx,
        }
    }

    /// Run the leader loop.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, raft_state="leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        let targets: Vec<_> = self.core.members.iter().copied().filter(|t| *t != self.core.id).collect();
        for target in targets {
            let stream = ReplicationStream::spawn(
                self.core.id,
                target,
                self.core.current_term,
                self.core.config.clone(),
                self.core.log.clone(),
                self.core.commit_index,
                self.core.network.clone(),
                self.replication_tx.clone(),
            );
            self.nodes.insert(target, PeerReplication {
                match_index: 0,
                stream,
            });
        }

        self.core.next_election_timeout = None;
        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        self.core.report_metrics();
        tracing::info!(term = self.core.current_term, "became leader");

        loop {
            if !self.core.target_state.is_leader() {
                for node in self.nodes.values() {
                    let _ = node.stream.tx.send(ReplicationEvent::Terminate);
                }
                self.fail_pending_not_leader();
                return Ok(());
            }

            tokio::select! {
                Some(msg) = self.core.rx_api.recv() => match msg {
                    ReplicaMsg::AppendEntries{rpc, tx} => {
                        let resp = self.core.handle_append_entries_request(rpc)?;
                        let _ = tx.send(resp);
                    }
                    ReplicaMsg::Vote{rpc, tx} => {
                        let resp = self.core.handle_vote_request(rpc)?;
                        let _ = tx.send(resp);
                    }
                    ReplicaMsg::Execute{cmd, tx} => self.handle_execute(cmd, tx)?,
                },
                Some(event) = self.replication_rx.recv() => self.handle_peer_event(event)?,
                _ = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }

    /// Handle an event published by one of the replication tasks.
    fn handle_peer_event(&mut self, event: PeerEvent) -> RaftResult<()> {
        match event {
            PeerEvent::UpdateMatchIndex { target, match_index } => {
                match self.nodes.get_mut(&target) {
                    Some(node) => node.match_index = match_index,
                    None => return Ok(()),
                }
                self.try_advance_commit()
            }
            PeerEvent::RevertToFollower { target, term } => {
                if term > self.core.current_term {
                    tracing::info!(peer = target, term, "newer term observed through replication, stepping down");
                    self.core.update_current_term(term, None);
                    self.core.save_hard_state()?;
                    self.core.update_current_leader(UpdateCurrentLeader::Unknown);
                    self.core.set_target_state(State::Follower);
                    self.core.report_metrics();
                }
                Ok(())
            }
        }
    }

    /// Advance the commit index over entries of the current term stored on a
    /// strict majority, then apply and resolve pending executions.
    ///
    /// Entries of earlier terms commit only indirectly, when an entry of the
    /// leader's own term at a later position commits.
    fn try_advance_commit(&mut self) -> RaftResult<()> {
        let len = self.core.log.len();
        let majority = quorum::majority_of(self.core.members.len());
        let mut new_commit = self.core.commit_index;
        for index in (self.core.commit_index + 1)..=len {
            if self.core.log.term(index) != self.core.current_term {
                continue;
            }
            let stored = 1 + self.nodes.values().filter(|n| n.match_index >= index).count();
            if stored >= majority {
                new_commit = index;
            }
        }
        if new_commit == self.core.commit_index {
            return Ok(());
        }

        self.core.commit_index = new_commit;
        self.core.persist_commit_index()?;
        tracing::debug!(commit_index = new_commit, "commit index advanced");
        for node in self.nodes.values() {
            let _ = node.stream.tx.send(ReplicationEvent::UpdateCommitIndex {
                commit_index: new_commit,
            });
        }

        let applied = self.core.apply_committed_entries()?;
        self.resolve_pending(applied);
        self.core.report_metrics();
        Ok(())
    }

    /// Resolve pending executions for the given applied entries.
    pub(super) fn resolve_pending(&mut self, applied: Vec<(RequestId, Vec<u8>)>) {
        for (request_id, response) in applied {
            if let Some(tx) = self.pending.remove(&request_id) {
                let _ = tx.send(Response::Ack { response });
            }
        }
    }

    /// Fail all pending executions after losing leadership; callers retry
    /// through the proxy.
    fn fail_pending_not_leader(&mut self) {
        for (request_id, tx) in self.pending.drain() {
            tracing::debug!(request_id=%request_id, "failing pending execution: no longer leader");
            let _ = tx.send(Response::NotALeader);
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a replica in candidate state.
pub(self) struct CandidateState<'a, N: RaftNetwork> {
    core: &'a mut ReplicaCore<N>,
    /// Votes received this term, our own included.
    votes_granted: usize,
    /// Votes needed for a strict majority.
    votes_needed: usize,
}

impl<'a, N: RaftNetwork> CandidateState<'a, N> {
    pub(self) fn new(core: &'a mut ReplicaCore<N>) -> Self {
        Self {
            core,
            votes_granted: 0,
            votes_needed: 0,
        }
    }

    /// Run the candidate loop. Each iteration of the outer loop represents a
    /// new term.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, raft_state="candidate"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            // Set up the new term: we always vote for ourselves.
            self.votes_granted = 1;
            self.votes_needed = quorum::majority_of(self.core.members.len());
            self.core.update_next_election_timeout(false);
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.save_hard_state()?;
            tracing::info!(term = self.core.current_term, "campaigning for leadership");
            self.core.report_metrics();

            if self.votes_granted >= self.votes_needed {
                // Single-replica cluster.
                self.core.set_target_state(State::Leader);
                return Ok(());
            }

            let mut pending_votes = self.spawn_parallel_vote_requests();

            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());

                tokio::select! {
                    // The election timed out; break to the outer loop, which
                    // starts a new term.
                    _ = timeout_fut => {
                        self.core.next_election_timeout = None;
                        break;
                    }
                    Some((res, peer)) = pending_votes.recv() => self.handle_vote_response(res, peer)?,
                    Some(msg) = self.core.rx_api.recv() => match msg {
                        ReplicaMsg::AppendEntries{rpc, tx} => {
                            let resp = self.core.handle_append_entries_request(rpc)?;
                            let _ = tx.send(resp);
                        }
                        ReplicaMsg::Vote{rpc, tx} => {
                            let resp = self.core.handle_vote_request(rpc)?;
                            let _ = tx.send(resp);
                        }
                        ReplicaMsg::Execute{cmd, tx} => self.core.handle_execute_not_leader(cmd, tx),
                    },
                    _ = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a replica in follower state.
pub(self) struct FollowerState<'a, N: RaftNetwork> {
    core: &'a mut ReplicaCore<N>,
}

impl<'a, N: RaftNetwork> FollowerState<'a, N> {
    pub(self) fn new(core: &'a mut ReplicaCore<N>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, raft_state="follower"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.report_metrics();
        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }
            // The deadline moves forward whenever a valid AppendEntries
            // arrives or a vote is granted.
            let election_timeout = sleep_until(self.core.get_next_election_timeout());

            tokio::select! {
                _ = election_timeout => {
                    self.core.next_election_timeout = None;
                    self.core.set_target_state(State::Candidate);
                }
                Some(msg) = self.core.rx_api.recv() => match msg {
                    ReplicaMsg::AppendEntries{rpc, tx} => {
                        let resp = self.core.handle_append_entries_request(rpc)?;
                        let _ = tx.send(resp);
                    }
                    ReplicaMsg::Vote{rpc, tx} => {
                        let resp = self.core.handle_vote_request(rpc)?;
                        let _ = tx.send(resp);
                    }
                    ReplicaMsg::Execute{cmd, tx} => self.core.handle_execute_not_leader(cmd, tx),
                },
                _ = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}
