//! The state machine interface.

use crate::command::Command;

/// A deterministic applier over the committed log prefix.
///
/// The replica calls `apply` in strictly increasing log-index order, exactly
/// once per committed entry across all recoveries; the dedup cache together
/// with log durability upholds the exactly-once part.
///
/// Implementations are not required to be thread-safe; the replica serializes
/// all access.
pub trait StateMachine: Send {
    /// Move the state machine to its initial state.
    fn reset(&mut self);

    /// Apply a command, returning the serialized operation response.
    ///
    /// An error (e.g. an unknown operation name) is fatal to the replica.
    fn apply(&mut self, command: &Command) -> anyhow::Result<Vec<u8>>;

    /// Export the full state as an opaque snapshot.
    fn make_snapshot(&self) -> anyhow::Result<Vec<u8>>;

    /// Replace the full state from an opaque snapshot.
    fn install_snapshot(&mut self, snapshot: &[u8]) -> anyhow::Result<()>;
}
