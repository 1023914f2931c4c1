//! The proxy router: a stateless-per-request forwarder from clients to the
//! current cluster leader.

use std::sync::Arc;

use rand::thread_rng;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio::time::Duration;

use crate::command::Command;
use crate::command::Response;
use crate::config::Config;
use crate::network::RsmNetwork;
use crate::NodeId;

/// Routes client commands to the cluster leader.
///
/// Keeps a cached leader guess; on a miss it probes a uniformly random
/// replica and follows redirects. Transport errors and `NotALeader`
/// responses are retried and never surface to the caller.
pub struct Proxy<N: RsmNetwork> {
    replicas: Vec<NodeId>,
    network: Arc<N>,
    /// The last known leader, if any.
    leader: Mutex<Option<NodeId>>,
    retry_backoff: Duration,
}

impl<N: RsmNetwork> Proxy<N> {
    /// Create a proxy over the given replica pool.
    pub fn new(replicas: Vec<NodeId>, network: Arc<N>, config: &Config) -> Self {
        assert!(!replicas.is_empty(), "proxy needs at least one replica");
        Self {
            replicas,
            network,
            leader: Mutex::new(None),
            retry_backoff: Duration::from_millis(config.proxy_retry_backoff),
        }
    }

    /// Drive a command to completion, returning the operation's response
    /// bytes.
    ///
    /// Retries until the cluster answers; callers bound the wait with their
    /// own timeout if needed.
    #[tracing::instrument(level="debug", skip(self, cmd), fields(cmd=%cmd))]
    pub async fn execute(&self, cmd: &Command) -> Vec<u8> {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let target = self.choose_replica().await;
            tracing::debug!(replica = target, attempt, "forwarding command");

            match self.network.send_execute(target, cmd.clone()).await {
                Err(err) => {
                    tracing::debug!(replica = target, error=%err, "transport error, retrying");
                    self.forget_leader().await;
                }
                Ok(Response::Ack { response }) => return response,
                Ok(Response::RedirectToLeader { leader }) => {
                    tracing::debug!(replica = target, leader, "redirected to leader");
                    self.cache_leader(leader).await;
                }
                Ok(Response::NotALeader) => {
                    tracing::debug!(replica = target, "target is not a leader, switching replica");
                    self.forget_leader().await;
                    sleep(self.retry_backoff).await;
                }
            }
        }
    }

    async fn choose_replica(&self) -> NodeId {
        if let Some(leader) = *self.leader.lock().await {
            return leader;
        }
        self.pick_random_replica()
    }

    fn pick_random_replica(&self) -> NodeId {
        let i = thread_rng().gen_range(0..self.replicas.len());
        self.replicas[i]
    }

    async fn cache_leader(&self, leader: NodeId) {
        *self.leader.lock().await = Some(leader);
    }

    async fn forget_leader(&self) {
        *self.leader.lock().await = None;
    }
}
