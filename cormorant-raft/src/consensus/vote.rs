use crate::consensus::{Consensus, ConsensusState, VoteState};
use crate::error::RaftResult;
use crate::protocol::{VoteReply, VoteRequest};

impl Consensus {
    /// Vote RPC, recipient side. Runs under the operation lock.
    ///
    /// A vote is granted iff this node has not voted for anyone else this
    /// term and the candidate's log is at least as up-to-date as ours. The
    /// grant is durable before the reply leaves: a restarted node must not
    /// hand a second vote to a different candidate in the same term.
    pub(super) async fn do_vote(&self, state: &mut ConsensusState, request: VoteRequest) -> RaftResult<VoteReply> {
        let log_ok = request.prev_log_term > state.prev_log_term
            || (request.prev_log_term == state.prev_log_term && request.prev_log_offset >= state.prev_log_offset);

        if request.term < state.current_term {
            tracing::trace!(
                group = %self.group,
                candidate = %request.node_id,
                current_term = state.current_term,
                rpc_term = request.term,
                "vote request term is less than current term"
            );
            return Ok(VoteReply {
                group: self.group,
                term: state.current_term,
                granted: false,
                log_ok,
            });
        }

        let mut dirty = false;
        if request.term > state.current_term {
            let was_leader = state.vstate.is_leader();
            state.current_term = request.term;
            state.voted_for = None;
            state.vstate = VoteState::Follower;
            state.current_leader = None;
            state.followers.clear();
            dirty = true;
            if was_leader {
                tracing::info!(group = %self.group, term = request.term, "leader stepping down, higher term in vote request");
                self.emit_leadership(request.term, None);
            }
        }

        let granted = log_ok && (state.voted_for.is_none() || state.voted_for == Some(request.node_id));
        if granted && state.voted_for != Some(request.node_id) {
            state.voted_for = Some(request.node_id);
            dirty = true;
        }
        if dirty {
            self.persist_vote(state.current_term, state.voted_for).await?;
            self.report_metrics(state);
        }
        if granted {
            self.reset_election_timer();
            tracing::debug!(group = %self.group, candidate = %request.node_id, term = request.term, "voted for candidate");
        }

        Ok(VoteReply {
            group: self.group,
            term: state.current_term,
            granted,
            log_ok,
        })
    }
}
