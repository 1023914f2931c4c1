//! Observable state of a running replica.
//!
//! Metrics are published on a `watch` channel whenever something
//! interesting changes: role transitions, term changes, log growth, commit
//! or apply advancement, leader discovery. The `Wait` helper turns the
//! channel into condition-based synchronization for tests and tooling.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep_until;
use tokio::time::Instant;

use crate::core::State;
use crate::NodeId;

/// A set of metrics describing the current state of a replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaMetrics {
    /// The replica's id.
    pub id: NodeId,
    /// The replica's current role.
    pub state: State,
    /// The replica's current term.
    pub current_term: u64,
    /// The position of the last entry in the replica's log.
    pub last_log_index: u64,
    /// The index of the highest entry known to be committed.
    pub commit_index: u64,
    /// The index of the last entry applied to the state machine.
    pub last_applied: u64,
    /// The replica's current idea of who the cluster leader is.
    pub current_leader: Option<NodeId>,
}

impl ReplicaMetrics {
    pub(crate) fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            last_log_index: 0,
            commit_index: 0,
            last_applied: 0,
            current_leader: None,
        }
    }
}

/// Error returned when a `Wait` condition was not met in time.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timeout after {0:?} when: {1}")]
    Timeout(Duration, String),

    #[error("replica is shutting down")]
    ShuttingDown,
}

/// A handle to wait on the metrics channel until a condition is satisfied.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<ReplicaMetrics>,
}

impl Wait {
    /// Wait until `func` returns true for the observed metrics, or timeout.
    #[tracing::instrument(level = "debug", skip(self, func), fields(msg=%msg))]
    pub async fn metrics<T>(&self, func: T, msg: &str) -> Result<ReplicaMetrics, WaitError>
    where T: Fn(&ReplicaMetrics) -> bool + Send {
        let deadline = Instant::now() + self.timeout;
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                tracing::debug!("wait condition satisfied: {}", msg);
                return Ok(latest);
            }

            tokio::select! {
                _ = sleep_until(deadline) => {
                    return Err(WaitError::Timeout(self.timeout, format!("{} latest: {:?}", msg, rx.borrow().clone())));
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(WaitError::ShuttingDown);
                    }
                }
            }
        }
    }

    /// Wait for `last_log_index` to reach `want_log`.
    pub async fn log(&self, want_log: u64, msg: &str) -> Result<ReplicaMetrics, WaitError> {
        self.metrics(
            |m| m.last_log_index >= want_log,
            &format!("{} last_log_index >= {}", msg, want_log),
        )
        .await
    }

    /// Wait for `last_applied` to reach `want`.
    pub async fn applied(&self, want: u64, msg: &str) -> Result<ReplicaMetrics, WaitError> {
        self.metrics(|m| m.last_applied >= want, &format!("{} last_applied >= {}", msg, want)).await
    }

    /// Wait for the replica to enter the given role.
    pub async fn state(&self, want: State, msg: &str) -> Result<ReplicaMetrics, WaitError> {
        self.metrics(|m| m.state == want, &format!("{} state == {:?}", msg, want)).await
    }

    /// Wait for the replica to learn the given leader.
    pub async fn current_leader(&self, leader: NodeId, msg: &str) -> Result<ReplicaMetrics, WaitError> {
        self.metrics(
            |m| m.current_leader == Some(leader),
            &format!("{} current_leader == {}", msg, leader),
        )
        .await
    }
}
