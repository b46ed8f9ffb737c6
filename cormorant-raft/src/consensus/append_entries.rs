use crate::consensus::{Consensus, ConsensusState};
use crate::error::{RaftError, RaftResult};
use crate::protocol::{AppendEntriesReply, AppendEntriesRequest};

impl Consensus {
    /// AppendEntries RPC, recipient side. Runs under the operation lock.
    ///
    /// A request at or above our term establishes its sender as the leader
    /// and resets the election timer. The reply's `last_log_offset` doubles
    /// as the backoff hint when the consistency check fails.
    pub(super) async fn do_append_entries(
        &self,
        state: &mut ConsensusState,
        request: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesReply> {
        if request.meta.term < state.current_term {
            tracing::trace!(
                group = %self.group,
                leader = %request.node_id,
                current_term = state.current_term,
                rpc_term = request.meta.term,
                "append entries term is less than current term"
            );
            return Ok(self.append_reply(state, false));
        }

        if request.meta.term > state.current_term {
            self.adopt_term(state, request.meta.term).await?;
        } else if !state.vstate.is_follower() {
            // A live leader at our own term ends any candidacy.
            self.step_down(state);
        }
        if state.current_leader != Some(request.node_id) {
            state.current_leader = Some(request.node_id);
            self.report_metrics(state);
            self.emit_leadership(state.current_term, Some(request.node_id));
        }
        self.reset_election_timer();
        self.record_heartbeat();

        // Consistency check: our log must contain the entry the batch hangs off.
        let prev_ok = request.meta.prev_log_offset == 0
            || self.log.term_at(request.meta.prev_log_offset) == Some(request.meta.prev_log_term);
        if !prev_ok {
            tracing::debug!(
                group = %self.group,
                prev_log_offset = request.meta.prev_log_offset,
                prev_log_term = request.meta.prev_log_term,
                local_last = state.prev_log_offset,
                "log inconsistent with leader, hinting our tail"
            );
            return Ok(self.append_reply(state, false));
        }

        if !request.entries.is_empty() {
            let mut entries = request.entries;

            // Walk the batch against the local log: skip what we already
            // hold, truncate at the first term conflict. The truncation must
            // land before this request is acknowledged.
            let mut already_present = 0;
            for entry in &entries {
                match self.log.term_at(entry.offset) {
                    Some(term) if term == entry.term => already_present += 1,
                    Some(_) => {
                        tracing::info!(
                            group = %self.group,
                            offset = entry.offset,
                            "divergent suffix detected, truncating local log"
                        );
                        self.log.truncate_suffix(entry.offset).await.map_err(RaftError::DiskIo)?;
                        state.prev_log_offset = entry.offset - 1;
                        state.prev_log_term = if state.prev_log_offset == 0 {
                            0
                        } else {
                            self.log.term_at(state.prev_log_offset).unwrap_or(0)
                        };
                        break;
                    }
                    None => break,
                }
            }
            entries.drain(..already_present);

            if !entries.is_empty() {
                match self.disk_append(state, entries).await {
                    Ok(_) => {}
                    Err(err @ RaftError::DiskTimeout { .. }) => {
                        // Retriable from the leader's point of view.
                        tracing::warn!(group = %self.group, error = %err, "disk append timed out on follower");
                        return Ok(self.append_reply(state, false));
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        let new_commit = request.meta.commit_offset.min(state.prev_log_offset);
        self.advance_commit(state, new_commit);
        self.report_metrics(state);

        Ok(self.append_reply(state, true))
    }

    fn append_reply(&self, state: &ConsensusState, success: bool) -> AppendEntriesReply {
        AppendEntriesReply {
            group: self.group,
            node_id: self.self_id,
            term: state.current_term,
            success,
            last_log_offset: state.prev_log_offset,
        }
    }
}
