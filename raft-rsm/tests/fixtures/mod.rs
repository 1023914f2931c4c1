//! Fixtures for testing the replicated state machine.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::Once;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use kvstore::CasRequest;
use kvstore::KvClient;
use kvstore::KvStateMachine;
use kvstore::SetRequest;
use raft_rsm::metrics::Wait;
use raft_rsm::raft::AppendEntriesRequest;
use raft_rsm::raft::AppendEntriesResponse;
use raft_rsm::raft::VoteRequest;
use raft_rsm::raft::VoteResponse;
use raft_rsm::Command;
use raft_rsm::Config;
use raft_rsm::LogEntry;
use raft_rsm::LogStore;
use raft_rsm::MetaStore;
use raft_rsm::NodeId;
use raft_rsm::Proxy;
use raft_rsm::RaftNetwork;
use raft_rsm::Replica;
use raft_rsm::ReplicaMetrics;
use raft_rsm::ReplicaStore;
use raft_rsm::RequestId;
use raft_rsm::Response;
use raft_rsm::RsmClient;
use raft_rsm::RsmNetwork;
use raft_rsm::State;
use raft_rsm::StateMachine;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tokio::time::Instant;

/// A concrete replica type used during testing.
pub type KvReplica = Replica<Router>;

static INIT_TRACING: Once = Once::new();

/// Initialize the tracing system. Idempotent, so every test can call it.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        use tracing_subscriber::prelude::*;
        let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
        let subscriber = tracing_subscriber::Registry::default()
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber).expect("error setting global tracing subscriber");
    });
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// One live replica as known to the router.
struct Node {
    replica: KvReplica,
    log: Arc<LogStore>,
    meta: Arc<MetaStore>,
    state_machine: Arc<StdMutex<KvStateMachine>>,
}

/// A type which emulates a network transport and implements the cluster's
/// network traits, routing frames between in-process replicas.
///
/// Nodes in the isolated set can neither send nor receive frames, which
/// emulates a network partition. Crashed nodes keep their on-disk state
/// under the router's workspace directory, so they can restart from it.
pub struct Router {
    /// The runtime config all replicas use.
    config: Arc<Config>,
    /// The static cluster membership.
    members: StdMutex<BTreeSet<NodeId>>,
    /// The table of live nodes known to this router.
    table: RwLock<BTreeMap<NodeId, Node>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: RwLock<HashSet<NodeId>>,
    /// Durable per-node state lives under here across crash/restart.
    workspace: tempfile::TempDir,
    /// Upper bound of the random delay added to each send, in milliseconds;
    /// 0 means no delay.
    send_delay: u64,
}

pub struct Builder {
    config: Arc<Config>,
    send_delay: u64,
}

impl Builder {
    pub fn send_delay(mut self, ms: u64) -> Self {
        self.send_delay = ms;
        self
    }

    pub fn build(self) -> Arc<Router> {
        Arc::new(Router {
            config: self.config,
            members: StdMutex::new(BTreeSet::new()),
            table: Default::default(),
            isolated_nodes: Default::default(),
            workspace: tempfile::tempdir().expect("failed to create router workspace"),
            send_delay: self.send_delay,
        })
    }
}

impl Router {
    pub fn builder(config: Arc<Config>) -> Builder {
        Builder { config, send_delay: 0 }
    }

    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Self::builder(config).build()
    }

    fn node_paths(&self, id: NodeId) -> (PathBuf, PathBuf) {
        let root = self.workspace.path().join(format!("node-{}", id));
        (root.join("log"), root.join("meta.db"))
    }

    async fn rand_send_delay(&self) {
        if self.send_delay == 0 {
            return;
        }
        let r = rand::random::<u64>() % self.send_delay;
        sleep(Duration::from_millis(r)).await;
    }

    /// Create a cluster of `n` replicas with ids `0..n`, all starting from
    /// pristine state.
    pub async fn new_cluster(self: &Arc<Self>, n: u64) -> BTreeSet<NodeId> {
        let members: BTreeSet<NodeId> = (0..n).collect();
        *self.members.lock().unwrap() = members.clone();
        for id in members.iter() {
            self.spawn_node(*id).await;
        }
        members
    }

    /// Spawn a single live replica configured with a larger member set, so
    /// that handler behavior can be driven directly with crafted RPCs.
    pub async fn new_lone_node(self: &Arc<Self>, id: NodeId, members: BTreeSet<NodeId>) {
        *self.members.lock().unwrap() = members;
        self.spawn_node(id).await;
    }

    /// Spawn a replica from whatever durable state exists under its paths.
    pub async fn spawn_node(self: &Arc<Self>, id: NodeId) {
        let members = self.members.lock().unwrap().clone();
        let (store_dir, db_path) = self.node_paths(id);
        let state_machine = Arc::new(StdMutex::new(KvStateMachine::new()));
        let dyn_sm: Arc<StdMutex<dyn StateMachine>> = state_machine.clone();
        let store = ReplicaStore::open(&store_dir, &db_path, dyn_sm).expect("failed to open replica store");
        let log = store.log.clone();
        let meta = store.meta.clone();
        let replica = Replica::spawn(id, self.config.clone(), members, self.clone(), store);
        let mut rt = self.table.write().await;
        rt.insert(id, Node {
            replica,
            log,
            meta,
            state_machine,
        });
    }

    /// Stop a replica, keeping its durable state for a later restart.
    pub async fn crash_node(&self, id: NodeId) {
        let node = self.table.write().await.remove(&id);
        match node {
            Some(node) => {
                let _ = node.replica.shutdown().await;
                tracing::info!(id, "crashed node");
            }
            None => panic!("node {} is not running", id),
        }
    }

    /// Restart a previously crashed replica from its durable state.
    pub async fn restart_node(self: &Arc<Self>, id: NodeId) {
        {
            let rt = self.table.read().await;
            assert!(!rt.contains_key(&id), "node {} is still running", id);
        }
        self.spawn_node(id).await;
        tracing::info!(id, "restarted node");
    }

    /// Isolate the network of the specified node.
    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.insert(id);
        tracing::info!(id, "isolated node");
    }

    /// Restore the network of the specified node.
    pub async fn restore_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.remove(&id);
        tracing::info!(id, "restored node");
    }

    /// Get a handle to a live replica.
    pub async fn replica(&self, id: NodeId) -> KvReplica {
        let rt = self.table.read().await;
        rt.get(&id).unwrap_or_else(|| panic!("node {} not found in routing table", id)).replica.clone()
    }

    /// Get a handle to the log of the target node.
    pub async fn log_of(&self, id: NodeId) -> Arc<LogStore> {
        let rt = self.table.read().await;
        rt.get(&id).unwrap_or_else(|| panic!("node {} not found in routing table", id)).log.clone()
    }

    /// Get a handle to the metadata store of the target node.
    pub async fn meta_of(&self, id: NodeId) -> Arc<MetaStore> {
        let rt = self.table.read().await;
        rt.get(&id).unwrap_or_else(|| panic!("node {} not found in routing table", id)).meta.clone()
    }

    /// Get a handle to the state machine of the target node.
    pub async fn state_machine_of(&self, id: NodeId) -> Arc<StdMutex<KvStateMachine>> {
        let rt = self.table.read().await;
        rt.get(&id)
            .unwrap_or_else(|| panic!("node {} not found in routing table", id))
            .state_machine
            .clone()
    }

    /// Get a payload of the latest metrics from each live node.
    pub async fn latest_metrics(&self) -> Vec<ReplicaMetrics> {
        let rt = self.table.read().await;
        rt.values().map(|node| node.replica.metrics().borrow().clone()).collect()
    }

    /// Get the id of the current leader, if a non-isolated one considers
    /// itself leader.
    pub async fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated_nodes.read().await;
        self.latest_metrics().await.into_iter().find_map(|m| {
            if m.state == State::Leader && !isolated.contains(&m.id) {
                Some(m.id)
            } else {
                None
            }
        })
    }

    /// Wait until a non-isolated node considers itself leader.
    pub async fn wait_for_leader(&self, timeout: Duration, msg: &str) -> Result<NodeId> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                return Ok(leader);
            }
            if Instant::now() >= deadline {
                return Err(anyhow!("timed out waiting for a leader: {}", msg));
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until a non-isolated node *other than* `not` considers itself
    /// leader.
    pub async fn wait_for_new_leader(&self, not: NodeId, timeout: Duration, msg: &str) -> Result<NodeId> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                if leader != not {
                    return Ok(leader);
                }
            }
            if Instant::now() >= deadline {
                return Err(anyhow!("timed out waiting for a new leader: {}", msg));
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// Get a condition-wait handle for the target node.
    pub async fn wait(&self, id: &NodeId, timeout: Option<Duration>) -> Result<Wait> {
        let rt = self.table.read().await;
        let node = rt.get(id).with_context(|| format!("node {} not found", id))?;
        Ok(node.replica.wait(timeout))
    }

    /// Wait for the given nodes to store logs up to `want_log` (inclusive).
    pub async fn wait_for_log(
        &self,
        node_ids: &BTreeSet<NodeId>,
        want_log: u64,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in node_ids.iter() {
            self.wait(id, timeout).await?.log(want_log, msg).await?;
        }
        Ok(())
    }

    /// Wait for the given nodes to apply entries up to `want` (inclusive).
    pub async fn wait_for_applied(
        &self,
        node_ids: &BTreeSet<NodeId>,
        want: u64,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in node_ids.iter() {
            self.wait(id, timeout).await?.applied(want, msg).await?;
        }
        Ok(())
    }

    /// Wait for the given nodes to enter the given role.
    pub async fn wait_for_state(
        &self,
        node_ids: &BTreeSet<NodeId>,
        want_state: State,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in node_ids.iter() {
            self.wait(id, timeout).await?.state(want_state, msg).await?;
        }
        Ok(())
    }

    /// Build a typed KV client routing through a fresh proxy over the full
    /// replica pool.
    pub fn kv_client(self: &Arc<Self>) -> KvClient<Router> {
        let replicas: Vec<NodeId> = self.members.lock().unwrap().iter().copied().collect();
        let proxy = Arc::new(Proxy::new(replicas, self.clone(), &self.config));
        KvClient::new(RsmClient::new(proxy))
    }

    //////////////////////////////////////////////////////////////////////////////////////////////

    /// Assert the election safety invariant: at most one live leader per
    /// term.
    pub async fn assert_at_most_one_leader_per_term(&self) {
        let metrics = self.latest_metrics().await;
        let mut by_term: BTreeMap<u64, NodeId> = BTreeMap::new();
        for m in metrics.iter().filter(|m| m.state == State::Leader) {
            if let Some(other) = by_term.insert(m.current_term, m.id) {
                panic!("two leaders in term {}: {} and {}", m.current_term, other, m.id);
            }
        }
    }

    /// Assert the log matching invariant across all live nodes: if two logs
    /// agree on the term at some index, they are identical up to it.
    pub async fn assert_log_matching(&self) {
        let logs = self.all_logs().await;
        for (a_id, a) in logs.iter() {
            for (b_id, b) in logs.iter() {
                if a_id >= b_id {
                    continue;
                }
                let common = a.len().min(b.len());
                for i in (0..common).rev() {
                    if a[i].term == b[i].term {
                        assert_eq!(
                            &a[..=i],
                            &b[..=i],
                            "log matching violated between nodes {} and {} up to index {}",
                            a_id,
                            b_id,
                            i + 1
                        );
                        break;
                    }
                }
            }
        }
    }

    /// Assert that any two live nodes agree on the committed prefix of the
    /// log.
    pub async fn assert_committed_prefix_agreement(&self) {
        let commits: BTreeMap<NodeId, u64> =
            self.latest_metrics().await.into_iter().map(|m| (m.id, m.commit_index)).collect();
        let logs = self.all_logs().await;
        for (a_id, a) in logs.iter() {
            for (b_id, b) in logs.iter() {
                if a_id >= b_id {
                    continue;
                }
                let common = commits[a_id].min(commits[b_id]) as usize;
                assert_eq!(
                    &a[..common],
                    &b[..common],
                    "committed prefixes diverge between nodes {} and {}",
                    a_id,
                    b_id
                );
            }
        }
    }

    /// Assert that the state machines of all nodes which applied the same
    /// prefix are byte-identical.
    pub async fn assert_state_machines_agree(&self) {
        let metrics = self.latest_metrics().await;
        let mut by_applied: BTreeMap<u64, (NodeId, Vec<u8>)> = BTreeMap::new();
        for m in metrics {
            let sm = self.state_machine_of(m.id).await;
            let before = self.replica(m.id).await.metrics().borrow().last_applied;
            let snapshot = {
                let sm = sm.lock().unwrap();
                sm.make_snapshot().expect("snapshot failed")
            };
            let applied = self.replica(m.id).await.metrics().borrow().last_applied;
            if applied != before {
                // An apply raced the snapshot; skip this node.
                continue;
            }
            if let Some((other, other_snapshot)) = by_applied.get(&applied) {
                assert_eq!(
                    other_snapshot, &snapshot,
                    "state machines diverge between nodes {} and {} at applied index {}",
                    other, m.id, applied
                );
            } else {
                by_applied.insert(applied, (m.id, snapshot));
            }
        }
    }

    async fn all_logs(&self) -> BTreeMap<NodeId, Vec<LogEntry>> {
        let rt = self.table.read().await;
        rt.iter().map(|(id, node)| (*id, node.log.entries())).collect()
    }
}

#[async_trait]
impl RaftNetwork for Router {
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.rand_send_delay().await;
        {
            let isolated = self.isolated_nodes.read().await;
            if isolated.contains(&target) || isolated.contains(&rpc.leader) {
                return Err(anyhow!("target or source node is isolated"));
            }
        }
        let replica = {
            let rt = self.table.read().await;
            rt.get(&target).ok_or_else(|| anyhow!("node {} is down", target))?.replica.clone()
        };
        Ok(replica.append_entries(rpc).await?)
    }

    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        self.rand_send_delay().await;
        {
            let isolated = self.isolated_nodes.read().await;
            if isolated.contains(&target) || isolated.contains(&rpc.candidate) {
                return Err(anyhow!("target or source node is isolated"));
            }
        }
        let replica = {
            let rt = self.table.read().await;
            rt.get(&target).ok_or_else(|| anyhow!("node {} is down", target))?.replica.clone()
        };
        Ok(replica.vote(rpc).await?)
    }
}

#[async_trait]
impl RsmNetwork for Router {
    async fn send_execute(&self, target: NodeId, cmd: Command) -> Result<Response> {
        self.rand_send_delay().await;
        if self.isolated_nodes.read().await.contains(&target) {
            return Err(anyhow!("target node is isolated"));
        }
        let replica = {
            let rt = self.table.read().await;
            rt.get(&target).ok_or_else(|| anyhow!("node {} is down", target))?.replica.clone()
        };
        Ok(replica.execute(cmd).await?)
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// Build a `Set` command with an explicit request id.
pub fn set_command(client: &str, serial: u64, key: &str, value: &str) -> Command {
    Command {
        op: "Set".into(),
        request: serde_json::to_vec(&SetRequest {
            key: key.into(),
            value: value.into(),
        })
        .unwrap(),
        request_id: RequestId {
            client_id: client.into(),
            index: serial,
        },
        readonly: false,
    }
}

/// Build a `Cas` command with an explicit request id.
pub fn cas_command(client: &str, serial: u64, key: &str, expected: &str, target: &str) -> Command {
    Command {
        op: "Cas".into(),
        request: serde_json::to_vec(&CasRequest {
            key: key.into(),
            expected_value: expected.into(),
            target_value: target.into(),
        })
        .unwrap(),
        request_id: RequestId {
            client_id: client.into(),
            index: serial,
        },
        readonly: false,
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A shared counter driven by CAS retry loops; the concurrent-clients test
/// checks it for lost updates.
pub struct AtomicCounter<'a> {
    client: &'a KvClient<Router>,
    key: String,
}

impl<'a> AtomicCounter<'a> {
    pub fn new(client: &'a KvClient<Router>, key: &str) -> Self {
        Self {
            client,
            key: key.to_string(),
        }
    }

    /// Add `delta` to the counter, returning the previous value.
    pub async fn fetch_add(&self, delta: u64) -> Result<u64> {
        loop {
            let current_raw = self.client.get(self.key.clone()).await?;
            let current = parse_counter(&current_raw)?;
            let target = (current + delta).to_string();
            let observed = self.client.cas(self.key.clone(), current_raw.clone(), target).await?;
            if observed == current_raw {
                return Ok(current);
            }
        }
    }

    /// Read the current value.
    pub async fn value(&self) -> Result<u64> {
        let raw = self.client.get(self.key.clone()).await?;
        parse_counter(&raw)
    }
}

fn parse_counter(raw: &str) -> Result<u64> {
    if raw.is_empty() {
        return Ok(0);
    }
    raw.parse().with_context(|| format!("malformed counter value: {:?}", raw))
}
