//! The RSM client library.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::command::Command;
use crate::command::RequestId;
use crate::network::RsmNetwork;
use crate::proxy::Proxy;

/// A client of the replicated state machine.
///
/// Generates a globally unique client id at construction and numbers its
/// requests monotonically from 1. Requests are driven through the proxy with
/// at-least-once semantics; the replicas' dedup cache turns that into an
/// exactly-once observable effect.
pub struct RsmClient<N: RsmNetwork> {
    proxy: Arc<Proxy<N>>,
    client_id: String,
    request_index: AtomicU64,
}

impl<N: RsmNetwork> RsmClient<N> {
    /// Create a new client routing through `proxy`.
    pub fn new(proxy: Arc<Proxy<N>>) -> Self {
        Self {
            proxy,
            client_id: generate_client_id(),
            request_index: AtomicU64::new(0),
        }
    }

    /// This client's unique id.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Execute an operation against the replicated state machine, returning
    /// the operation's serialized response.
    #[tracing::instrument(level="debug", skip(self, request), fields(client=%self.client_id))]
    pub async fn execute(&self, op: &str, request: Vec<u8>, readonly: bool) -> Vec<u8> {
        let cmd = Command {
            op: op.to_string(),
            request,
            request_id: self.next_request_id(),
            readonly,
        };
        self.proxy.execute(&cmd).await
    }

    fn next_request_id(&self) -> RequestId {
        RequestId {
            client_id: self.client_id.clone(),
            index: self.request_index.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }
}

fn generate_client_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}
