use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::consensus::{Consensus, ConsensusState, FollowerProgress, VoteState};
use crate::error::RaftResult;
use crate::protocol::{EntryKind, LogEntry, VoteReply, VoteRequest};
use crate::NodeId;

impl Consensus {
    /// Drive the election timer until the instance stops.
    ///
    /// The deadline lives in a watch channel; vote grants and accepted
    /// heartbeats push fresh jittered values, which re-arms the sleep
    /// without waking anything else up.
    pub(super) fn spawn_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let mut rx = self.rx_deadline.clone();
        let span = tracing::debug_span!("election-timer", group = %self.group, id = %self.self_id);
        tokio::spawn(
            async move {
                loop {
                    let deadline = *rx.borrow();
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {
                            if this.stopped.load(Ordering::SeqCst) {
                                return;
                            }
                            this.handle_election_timeout().await;
                        }
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            .instrument(span),
        )
    }

    /// The election timer fired: no valid heartbeat arrived inside the
    /// timeout window, so campaign for leadership.
    async fn handle_election_timeout(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        // The timer may have been re-armed while this fire waited on the
        // operation lock; only a still-expired deadline counts.
        if Instant::now() < *self.rx_deadline.borrow() {
            return;
        }
        if state.vstate.is_leader() {
            self.reset_election_timer();
            return;
        }
        self.reset_election_timer();
        if let Err(err) = self.dispatch_election(&mut state).await {
            tracing::warn!(group = %self.group, error = %err, "election dispatch failed");
        }
    }

    /// Start a new term as candidate and collect votes. Runs under the
    /// operation lock; the vote RPCs carry deadlines derived from the
    /// election timeout so a dead peer cannot wedge the candidate.
    async fn dispatch_election(self: &Arc<Self>, state: &mut ConsensusState) -> RaftResult<()> {
        state.current_term += 1;
        state.vstate = VoteState::Candidate;
        state.voted_for = Some(self.self_id);
        state.current_leader = None;
        let term = state.current_term;
        self.persist_vote(term, Some(self.self_id)).await?;
        self.report_metrics(state);
        tracing::debug!(group = %self.group, term, "campaigning for leadership");

        let majority = self.conf.majority();
        let mut granted = 1; // the self-vote

        if granted >= majority {
            return self.become_leader(state).await;
        }

        let request = VoteRequest {
            group: self.group,
            node_id: self.self_id,
            term,
            prev_log_offset: state.prev_log_offset,
            prev_log_term: state.prev_log_term,
        };
        let mut pending = self.spawn_parallel_vote_requests(request);

        let window = Instant::now() + self.config.election_timeout();
        loop {
            let (peer, reply) = tokio::select! {
                reply = pending.recv() => match reply {
                    Some(reply) => reply,
                    None => break,
                },
                _ = tokio::time::sleep_until(window) => break,
            };
            if reply.term > state.current_term {
                tracing::debug!(group = %self.group, peer = %peer, term = reply.term, "higher term in vote reply");
                return self.adopt_term(state, reply.term).await;
            }
            if reply.granted && reply.term == term {
                granted += 1;
                if granted >= majority {
                    return self.become_leader(state).await;
                }
            }
        }

        // Not elected this round; the timer re-fires into a new term.
        tracing::debug!(group = %self.group, term, granted, "election round ended without a majority");
        Ok(())
    }

    /// Fan a vote request out to every peer, funneling replies into a channel.
    fn spawn_parallel_vote_requests(&self, request: VoteRequest) -> mpsc::Receiver<(NodeId, VoteReply)> {
        let peers: Vec<_> = self.conf.peers(self.self_id).collect();
        let (tx, rx) = mpsc::channel(peers.len().max(1));
        let rpc_timeout = self.config.election_timeout();
        for peer in peers {
            let clients = self.clients.clone();
            let tx = tx.clone();
            let span = tracing::trace_span!("vote-request", target = %peer);
            tokio::spawn(
                async move {
                    match tokio::time::timeout(rpc_timeout, clients.vote(peer, request)).await {
                        Ok(Ok(reply)) => {
                            let _ = tx.send((peer, reply)).await;
                        }
                        Ok(Err(err)) => {
                            tracing::debug!(peer = %peer, error = %err, "error requesting vote from peer")
                        }
                        Err(_) => tracing::debug!(peer = %peer, "vote request timed out"),
                    }
                }
                .instrument(span),
            );
        }
        rx
    }

    /// A majority granted this term: take leadership and immediately append
    /// a no-op entry so the commit offset can advance in the new term.
    async fn become_leader(self: &Arc<Self>, state: &mut ConsensusState) -> RaftResult<()> {
        state.vstate = VoteState::Leader;
        state.current_leader = Some(self.self_id);
        let now = Instant::now();
        let next_offset = state.prev_log_offset + 1;
        state.followers = self
            .conf
            .peers(self.self_id)
            .map(|peer| {
                (peer, FollowerProgress {
                    match_offset: 0,
                    next_offset,
                    in_flight: false,
                    last_contact: now,
                })
            })
            .collect();
        tracing::info!(group = %self.group, term = state.current_term, "elected leader");
        self.emit_leadership(state.current_term, Some(self.self_id));

        let noop = LogEntry {
            term: state.current_term,
            offset: 0,
            kind: EntryKind::Data,
            payload: Vec::new(),
        };
        self.leader_append(state, vec![noop]).await?;
        self.report_metrics(state);
        Ok(())
    }
}
