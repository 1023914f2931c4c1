//! The AppendEntries handler: log consistency checking, conflict hints,
//! reconciliation and commit advancement on followers.

use crate::core::ReplicaCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::network::RaftNetwork;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::MessageSummary;

impl<N: RaftNetwork> ReplicaCore<N> {
    /// Handle an AppendEntries RPC.
    ///
    /// Never fails toward the peer: internal predicates become
    /// `success=false` with a conflict hint. Log writes are durable before
    /// `success=true` leaves this replica.
    #[tracing::instrument(level="debug", skip(self, req), fields(id=self.id, req=%req.summary()))]
    pub(super) fn handle_append_entries_request(
        &mut self,
        req: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        if req.term > self.current_term {
            tracing::debug!(term = req.term, "AppendEntries from a newer term");
            self.update_current_term(req.term, None);
            self.set_target_state(State::Follower);
        }

        let mut response = AppendEntriesResponse {
            term: self.current_term,
            success: false,
            conflict_index: 0,
            conflict_term: 0,
        };

        if req.term == self.current_term {
            // A current-term AppendEntries is proof of a live leader.
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader));
            if !self.target_state.is_follower() {
                self.set_target_state(State::Follower);
            }
            self.update_next_election_timeout(true);

            let len = self.log.len();
            let consistent = req.prev_log_index == 0
                || (req.prev_log_index <= len && self.log.term(req.prev_log_index) == req.prev_log_term);

            if consistent {
                response.success = true;
                self.reconcile_log(&req)?;

                let new_commit = req.leader_commit_index.min(self.log.len());
                if new_commit > self.commit_index {
                    self.commit_index = new_commit;
                    self.persist_commit_index()?;
                    self.apply_committed_entries()?;
                }
            } else if req.prev_log_index > len {
                // Our log is too short to even check the previous entry.
                response.conflict_index = len + 1;
                response.conflict_term = 0;
            } else {
                // The previous entry exists but its term disagrees; hint the
                // first position of the conflicting term so the leader can
                // skip the whole run of it.
                let conflict_term = self.log.term(req.prev_log_index);
                let mut conflict_index = req.prev_log_index;
                while conflict_index > 1 && self.log.term(conflict_index - 1) == conflict_term {
                    conflict_index -= 1;
                }
                response.conflict_term = conflict_term;
                response.conflict_index = conflict_index;
                tracing::debug!(
                    prev_log_index = req.prev_log_index,
                    conflict_term,
                    conflict_index,
                    "log consistency check failed"
                );
            }
        }

        self.save_hard_state()?;
        response.term = self.current_term;
        self.report_metrics();
        Ok(response)
    }

    /// Walk the incoming entries against the local log starting right after
    /// `prev_log_index`: skip the prefix that already matches by term,
    /// truncate at the first divergence, then append the remainder.
    fn reconcile_log(&mut self, req: &AppendEntriesRequest) -> RaftResult<()> {
        let mut insert_index = req.prev_log_index + 1;
        let mut offset = 0usize;
        while insert_index <= self.log.len()
            && offset < req.entries.len()
            && self.log.term(insert_index) == req.entries[offset].term
        {
            insert_index += 1;
            offset += 1;
        }

        if offset >= req.entries.len() {
            // Everything already present.
            return Ok(());
        }

        if self.log.len() >= insert_index {
            tracing::info!(from = insert_index, "truncating conflicting log suffix");
            self.log
                .truncate_suffix(insert_index)
                .map_err(|err| self.map_fatal_storage_error(err.into()))?;
        }
        self.log
            .append_from(&req.entries, offset)
            .map_err(|err| self.map_fatal_storage_error(err.into()))?;
        tracing::debug!(
            appended = req.entries.len() - offset,
            last_log_index = self.log.len(),
            "appended entries from leader"
        );
        Ok(())
    }
}
