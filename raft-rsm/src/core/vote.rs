//! Leader election: the RequestVote handler and the candidate's vote
//! fan-out.

use tokio::sync::mpsc;
use tracing::Instrument;

use crate::core::CandidateState;
use crate::core::ReplicaCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::network::RaftNetwork;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::MessageSummary;
use crate::NodeId;

impl<N: RaftNetwork> ReplicaCore<N> {
    /// Handle a RequestVote RPC.
    ///
    /// Grants the vote iff the request is for our current term, we have not
    /// yet voted for anyone else in it, and the candidate's log is at least
    /// as up-to-date as ours. Hard state is durable before the reply leaves.
    #[tracing::instrument(level="debug", skip(self, req), fields(id=self.id, req=%req.summary()))]
    pub(super) fn handle_vote_request(&mut self, req: VoteRequest) -> RaftResult<VoteResponse> {
        if req.term > self.current_term {
            tracing::debug!(term = req.term, "RequestVote from a newer term");
            self.update_current_term(req.term, None);
            self.update_current_leader(UpdateCurrentLeader::Unknown);
            self.set_target_state(State::Follower);
        }

        let last_log_index = self.log.len();
        let last_log_term = self.log.last_log_term();
        let candidate_log_up_to_date = req.last_log_term > last_log_term
            || (req.last_log_term == last_log_term && req.last_log_index >= last_log_index);

        let mut vote_granted = false;
        if req.term == self.current_term
            && (self.voted_for.is_none() || self.voted_for == Some(req.candidate))
            && candidate_log_up_to_date
        {
            vote_granted = true;
            self.voted_for = Some(req.candidate);
            self.update_next_election_timeout(false);
            tracing::info!(candidate = req.candidate, term = self.current_term, "vote granted");
        }

        self.save_hard_state()?;
        self.report_metrics();
        Ok(VoteResponse {
            term: self.current_term,
            vote_granted,
        })
    }
}

impl<'a, N: RaftNetwork> CandidateState<'a, N> {
    /// Spawn one task per peer to request its vote for the current term,
    /// streaming responses back to the candidate loop.
    pub(super) fn spawn_parallel_vote_requests(&self) -> mpsc::Receiver<(VoteResponse, NodeId)> {
        let peers: Vec<_> = self.core.members.iter().copied().filter(|m| *m != self.core.id).collect();
        let (tx, rx) = mpsc::channel(self.core.members.len().max(1));

        let rpc = VoteRequest {
            term: self.core.current_term,
            candidate: self.core.id,
            last_log_index: self.core.log.len(),
            last_log_term: self.core.log.last_log_term(),
        };

        for peer in peers {
            let rpc = rpc.clone();
            let tx = tx.clone();
            let network = self.core.network.clone();
            tokio::spawn(
                async move {
                    match network.send_vote(peer, rpc).await {
                        Ok(res) => {
                            let _ = tx.send((res, peer)).await;
                        }
                        Err(err) => tracing::warn!(peer, error=%err, "error sending RequestVote RPC"),
                    }
                }
                .instrument(tracing::debug_span!("request-vote", peer)),
            );
        }
        rx
    }

    /// Handle a vote response from a peer.
    pub(super) fn handle_vote_response(&mut self, res: VoteResponse, peer: NodeId) -> RaftResult<()> {
        if res.term > self.core.current_term {
            tracing::debug!(peer, term = res.term, "newer term observed in vote response, reverting to follower");
            self.core.update_current_term(res.term, None);
            self.core.save_hard_state()?;
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
            return Ok(());
        }

        if res.vote_granted && res.term == self.core.current_term {
            self.votes_granted += 1;
            tracing::debug!(
                peer,
                granted = self.votes_granted,
                needed = self.votes_needed,
                "vote received"
            );
            if self.votes_granted >= self.votes_needed {
                tracing::info!(term = self.core.current_term, "won election");
                self.core.set_target_state(State::Leader);
            }
        }
        Ok(())
    }
}
