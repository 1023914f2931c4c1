//! Client command and response types.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::NodeId;

/// A globally unique identifier of a client request.
///
/// `index` is assigned by the client and is strictly increasing per
/// `client_id`, starting from 1. The replica's dedup cache is keyed by this
/// value to provide exactly-once observable effects under at-least-once
/// delivery.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId {
    pub client_id: String,
    pub index: u64,
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}-idx-{}", self.client_id, self.index)
    }
}

/// An application command carried through the replicated log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Command {
    /// The name of the state machine operation (e.g. `Set`).
    pub op: String,
    /// The serialized operation request.
    pub request: Vec<u8>,
    /// Unique request id, for exactly-once semantics.
    pub request_id: RequestId,
    /// Advisory flag; reads are still committed through the log.
    pub readonly: bool,
}

// Two commands are the same command iff their request ids are equal.
impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.request_id == other.request_id
    }
}

impl Eq for Command {}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}--{}", self.op, self.request_id)
    }
}

/// The outcome of submitting a command to a replica.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Response {
    /// The command was committed and applied; carries the operation's output.
    Ack { response: Vec<u8> },
    /// This replica is not the leader, but knows who is.
    RedirectToLeader { leader: NodeId },
    /// This replica is not the leader and has no leader hint.
    NotALeader,
}
