//! The leader's Execute path: dedup short-circuit, durable append, pending
//! executions and their resolution at commit time.

use crate::core::LeaderState;
use crate::error::RaftResult;
use crate::network::RaftNetwork;
use crate::raft::ExecuteResponseTx;
use crate::raft::LogEntry;
use crate::replication::ReplicationEvent;
use crate::Command;
use crate::Response;

impl<'a, N: RaftNetwork> LeaderState<'a, N> {
    /// Handle a client Execute as leader.
    #[tracing::instrument(level="debug", skip(self, cmd, tx), fields(cmd=%cmd))]
    pub(super) fn handle_execute(&mut self, cmd: Command, tx: ExecuteResponseTx) -> RaftResult<()> {
        if let Some(cached) = self.core.dedup.get(&cmd.request_id) {
            tracing::debug!(request_id=%cmd.request_id, "serving repeated request from the dedup cache");
            let _ = tx.send(Response::Ack {
                response: cached.clone(),
            });
            return Ok(());
        }

        let request_id = cmd.request_id.clone();
        let entry = LogEntry {
            term: self.core.current_term,
            command: cmd,
        };
        self.core
            .log
            .append(&[entry])
            .map_err(|err| self.core.map_fatal_storage_error(err.into()))?;
        self.core.save_hard_state()?;
        tracing::info!(
            request_id=%request_id,
            index = self.core.log.len(),
            term = self.core.current_term,
            "appended client command"
        );

        // A retry of a still-uncommitted request supersedes the previous
        // waiter; the superseded channel closes and the proxy retries into
        // the dedup cache.
        self.pending.insert(request_id, tx);

        if self.nodes.is_empty() {
            // Single-replica cluster: the entry is committed by this replica
            // alone.
            self.core.commit_index = self.core.log.len();
            self.core.persist_commit_index()?;
            let applied = self.core.apply_committed_entries()?;
            self.resolve_pending(applied);
            self.core.report_metrics();
            return Ok(());
        }

        let commit_index = self.core.commit_index;
        for node in self.nodes.values() {
            let _ = node.stream.tx.send(ReplicationEvent::Replicate { commit_index });
        }
        self.core.report_metrics();
        Ok(())
    }
}
