use std::sync::Arc;

use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::consensus::{Consensus, ConsensusState, ReplicateResult};
use crate::error::RaftResult;
use crate::protocol::{AppendEntriesReply, AppendEntriesRequest, LogEntry, ProtocolMetadata};
use crate::{LogOffset, NodeId, Term};

impl Consensus {
    /// Leader-side local append: stamp terms and offsets, write to disk,
    /// fan out to followers. Runs under the operation lock.
    pub(super) async fn leader_append(
        self: &Arc<Self>,
        state: &mut ConsensusState,
        mut entries: Vec<LogEntry>,
    ) -> RaftResult<ReplicateResult> {
        let term = state.current_term;
        let mut offset = state.prev_log_offset;
        for entry in &mut entries {
            offset += 1;
            entry.term = term;
            entry.offset = offset;
        }

        if let Err(err) = self.disk_append(state, entries).await {
            // A leader that cannot write its own log gives up leadership.
            tracing::error!(group = %self.group, error = %err, "disk append failed at leader, stepping down");
            self.step_down(state);
            return Err(err);
        }

        // A single-node group commits on its own quorum.
        self.maybe_advance_commit(state);
        self.dispatch_replication(state);
        self.report_metrics(state);
        Ok(ReplicateResult {
            last_offset: state.prev_log_offset,
            term,
        })
    }

    /// Kick replication to every follower that has pending entries and no
    /// batch in flight.
    pub(super) fn dispatch_replication(self: &Arc<Self>, state: &mut ConsensusState) {
        let term = state.current_term;
        let commit = state.commit_offset;
        let last = state.prev_log_offset;
        let due: Vec<(NodeId, LogOffset)> = state
            .followers
            .iter_mut()
            .filter(|(_, progress)| !progress.in_flight && progress.next_offset <= last)
            .map(|(id, progress)| {
                progress.in_flight = true;
                (*id, progress.next_offset)
            })
            .collect();
        for (target, next_offset) in due {
            self.spawn_replicate_once(target, next_offset, term, commit, false);
        }
    }

    pub(super) fn spawn_replicate_once(
        self: &Arc<Self>,
        target: NodeId,
        next_offset: LogOffset,
        term: Term,
        commit: LogOffset,
        heartbeat_only: bool,
    ) {
        let this = self.clone();
        let span = tracing::trace_span!("replicate", group = %self.group, target = %target);
        tokio::spawn(
            async move {
                this.replicate_once(target, next_offset, term, commit, heartbeat_only).await;
            }
            .instrument(span),
        );
    }

    /// Build one batch for `target` starting at `next_offset`, send it, and
    /// feed the reply back into the shared progress state. Transient
    /// transport errors are swallowed; the next trigger retries.
    async fn replicate_once(
        self: Arc<Self>,
        target: NodeId,
        next_offset: LogOffset,
        term: Term,
        commit: LogOffset,
        heartbeat_only: bool,
    ) {
        let request = match self.build_batch(next_offset, term, commit, heartbeat_only).await {
            Some(request) => request,
            None => {
                self.clear_in_flight(target).await;
                return;
            }
        };
        let sent_last = request.entries.last().map(|entry| entry.offset);

        let rpc_timeout = self.config.election_timeout();
        match tokio::time::timeout(rpc_timeout, self.clients.append_entries(target, request)).await {
            Ok(Ok(reply)) => self.handle_append_reply(target, sent_last, reply).await,
            Ok(Err(err)) => {
                tracing::debug!(target = %target, error = %err, "transient error replicating to peer");
                self.clear_in_flight(target).await;
            }
            Err(_) => {
                tracing::debug!(target = %target, "append entries to peer timed out");
                self.clear_in_flight(target).await;
            }
        }
    }

    /// Assemble an `AppendEntriesRequest` from the local log, bounded by the
    /// configured byte budget. `None` if the log refuses us the data.
    pub(super) async fn build_batch(
        &self,
        next_offset: LogOffset,
        term: Term,
        commit: LogOffset,
        heartbeat_only: bool,
    ) -> Option<AppendEntriesRequest> {
        let prev_log_offset = next_offset - 1;
        let prev_log_term = if prev_log_offset == 0 {
            0
        } else {
            match self.log.term_at(prev_log_offset) {
                Some(term) => term,
                None => {
                    tracing::error!(
                        group = %self.group,
                        offset = prev_log_offset,
                        "log no longer holds the follower's next offset"
                    );
                    return None;
                }
            }
        };
        let entries = if heartbeat_only || next_offset > self.log.last_offset() {
            Vec::new()
        } else {
            match self.log.read(next_offset, self.config.replicate_batch_max_bytes).await {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!(group = %self.group, error = %err, "failed to read replication batch");
                    return None;
                }
            }
        };
        Some(AppendEntriesRequest {
            node_id: self.self_id,
            meta: ProtocolMetadata {
                group: self.group,
                term,
                prev_log_offset,
                prev_log_term,
                commit_offset: commit,
            },
            entries,
        })
    }

    pub(crate) async fn clear_in_flight(&self, target: NodeId) {
        let mut state = self.state.lock().await;
        if let Some(progress) = state.followers.get_mut(&target) {
            progress.in_flight = false;
        }
    }

    /// Process the reply to a non-empty batch (or any failed one): update
    /// match/next offsets, back off on inconsistency hints, advance the
    /// commit offset on quorum, step down on a higher term.
    pub(crate) async fn handle_append_reply(
        self: &Arc<Self>,
        target: NodeId,
        sent_last: Option<LogOffset>,
        reply: AppendEntriesReply,
    ) {
        if self.is_stopped() {
            return;
        }
        let mut state = self.state.lock().await;

        if reply.term > state.current_term {
            if let Err(err) = self.adopt_term(&mut state, reply.term).await {
                tracing::warn!(group = %self.group, error = %err, "failed to persist term adoption");
            }
            return;
        }
        if !state.vstate.is_leader() {
            return;
        }
        let progress = match state.followers.get_mut(&target) {
            Some(progress) => progress,
            None => return,
        };
        progress.in_flight = false;
        progress.last_contact = Instant::now();

        if reply.success {
            if let Some(last) = sent_last {
                progress.match_offset = progress.match_offset.max(last);
                progress.next_offset = last + 1;
            }
            let next_offset = progress.next_offset;
            self.maybe_advance_commit(&mut state);
            self.report_metrics(&state);
            // More entries arrived while this batch was on the wire.
            if next_offset <= state.prev_log_offset {
                if let Some(progress) = state.followers.get_mut(&target) {
                    progress.in_flight = true;
                }
                let (term, commit) = (state.current_term, state.commit_offset);
                self.spawn_replicate_once(target, next_offset, term, commit, false);
            }
        } else {
            // Decrement-with-hint backoff; the hint is the follower's tail.
            let hint = reply.last_log_offset;
            let backed = progress.next_offset.saturating_sub(1).min(hint + 1).max(1);
            tracing::debug!(
                group = %self.group,
                target = %target,
                hint,
                next_offset = backed,
                "follower log inconsistent, backing off"
            );
            progress.next_offset = backed;
            progress.in_flight = true;
            let (term, commit) = (state.current_term, state.commit_offset);
            self.spawn_replicate_once(target, backed, term, commit, false);
        }
    }

    /// Advance the commit offset to the highest offset a quorum holds, if
    /// that offset is from the leader's own term. Prior-term entries commit
    /// only transitively through it.
    pub(super) fn maybe_advance_commit(&self, state: &mut ConsensusState) {
        let mut offsets: Vec<LogOffset> = state.followers.values().map(|p| p.match_offset).collect();
        offsets.push(state.prev_log_offset);
        let candidate = quorum_match_offset(offsets, self.conf.majority());
        if candidate <= state.commit_offset {
            return;
        }
        if self.log.term_at(candidate) != Some(state.current_term) {
            return;
        }
        self.advance_commit(state, candidate);
    }

    /// Collect one heartbeat batch per idle follower, marking each in
    /// flight. Followers with pending entries get them piggybacked; the rest
    /// get an empty batch. Called by the heartbeat manager on its tick.
    pub(crate) async fn heartbeat_requests(&self) -> Vec<(NodeId, AppendEntriesRequest)> {
        if self.is_stopped() {
            return Vec::new();
        }
        let mut state = self.state.lock().await;
        if !state.vstate.is_leader() {
            return Vec::new();
        }
        let term = state.current_term;
        let commit = state.commit_offset;
        let due: Vec<(NodeId, LogOffset)> = state
            .followers
            .iter_mut()
            .filter(|(_, progress)| !progress.in_flight)
            .map(|(id, progress)| {
                progress.in_flight = true;
                (*id, progress.next_offset)
            })
            .collect();
        drop(state);

        let mut requests = Vec::with_capacity(due.len());
        for (target, next_offset) in due {
            match self.build_batch(next_offset, term, commit, false).await {
                Some(request) => requests.push((target, request)),
                None => self.clear_in_flight(target).await,
            }
        }
        requests
    }
}

/// The greatest offset present on at least `majority` of the given logs.
fn quorum_match_offset(mut offsets: Vec<LogOffset>, majority: usize) -> LogOffset {
    if majority == 0 || offsets.len() < majority {
        return 0;
    }
    offsets.sort_unstable();
    offsets[offsets.len() - majority]
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////
