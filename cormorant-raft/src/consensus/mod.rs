//! The core logic of one replication group.

mod append_entries;
mod election;
mod replication;
mod vote;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::Config;
use crate::error::{RaftError, RaftResult};
use crate::hook::CommitHook;
use crate::jitter::TimeoutJitter;
use crate::log::{AppendResult, IoPriority, Log};
use crate::metrics::{ConsensusMetrics, Wait};
use crate::network::ConnectionCache;
use crate::protocol::{
    AppendEntriesReply, AppendEntriesRequest, GroupConfiguration, LeadershipStatus, LogEntry, ProtocolMetadata,
    VoteReply, VoteRequest,
};
use crate::voted_for::{self, VotedForRecord};
use crate::{GroupId, LogOffset, NodeId, Ntp, Term};

/// Invoked under the operation lock whenever the group's leadership changes;
/// implementations must not block and must not call back into the instance.
pub type LeadershipCallback = Arc<dyn Fn(LeadershipStatus) + Send + Sync>;

/// The vote state of a consensus instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteState {
    /// Replicating entries from a leader, timing out into candidacy.
    Follower,
    /// Campaigning for leadership of the group.
    Candidate,
    /// The group's leader.
    Leader,
}

impl VoteState {
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

/// Leader-side replication progress for one peer.
#[derive(Debug, Clone)]
pub(crate) struct FollowerProgress {
    /// The greatest offset confirmed present on the peer.
    pub match_offset: LogOffset,
    /// The offset the next batch starts at; always `>= match_offset + 1`.
    pub next_offset: LogOffset,
    /// True while a batch to this peer is awaiting its reply; batches are
    /// never stacked, out-of-order delivery would corrupt the backoff.
    pub in_flight: bool,
    /// When the peer last answered anything.
    pub last_contact: Instant,
}

/// The outcome of a leader-side `replicate` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicateResult {
    /// The offset of the last appended entry.
    pub last_offset: LogOffset,
    /// The term the entries were appended under.
    pub term: Term,
}

/// Mutable protocol state, guarded by the operation lock.
pub(crate) struct ConsensusState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub vstate: VoteState,
    pub current_leader: Option<NodeId>,
    /// The greatest offset in the local log.
    pub prev_log_offset: LogOffset,
    /// The term of the entry at `prev_log_offset`.
    pub prev_log_term: Term,
    pub commit_offset: LogOffset,
    /// Leader-only; empty in any other state.
    pub followers: HashMap<NodeId, FollowerProgress>,
}

/// Consensus for one raft group.
///
/// All mutating operations are serialized under a single-permit operation
/// lock; that exclusivity across suspension points (disk appends, RPC
/// awaits) is what makes each transition atomic. Accessors read the latest
/// published metrics snapshot and never contend with the lock.
pub struct Consensus {
    self_id: NodeId,
    group: GroupId,
    conf: GroupConfiguration,
    config: Arc<Config>,
    jitter: TimeoutJitter,
    log: Arc<dyn Log>,
    clients: Arc<dyn ConnectionCache>,
    leader_cb: LeadershipCallback,

    /// The operation lock.
    state: Mutex<ConsensusState>,
    hooks: StdMutex<Vec<Arc<dyn CommitHook>>>,
    /// When a valid heartbeat was last accepted; useful when not the leader.
    hbeat: StdMutex<Option<Instant>>,

    tx_metrics: watch::Sender<ConsensusMetrics>,
    rx_metrics: watch::Receiver<ConsensusMetrics>,
    /// The election timer deadline; pushing a new value re-arms the timer.
    tx_deadline: watch::Sender<Instant>,
    rx_deadline: watch::Receiver<Instant>,

    started: AtomicBool,
    stopped: AtomicBool,
    timer: StdMutex<Option<JoinHandle<()>>>,
}

impl Consensus {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: NodeId,
        group: GroupId,
        conf: GroupConfiguration,
        jitter: TimeoutJitter,
        config: Arc<Config>,
        log: Arc<dyn Log>,
        clients: Arc<dyn ConnectionCache>,
        leader_cb: LeadershipCallback,
    ) -> Arc<Self> {
        let (tx_metrics, rx_metrics) = watch::channel(ConsensusMetrics::new_initial(group, self_id));
        let (tx_deadline, rx_deadline) = watch::channel(Instant::now() + jitter.base());
        Arc::new(Self {
            self_id,
            group,
            conf,
            config,
            jitter,
            log,
            clients,
            leader_cb,
            state: Mutex::new(ConsensusState {
                current_term: 0,
                voted_for: None,
                vstate: VoteState::Follower,
                current_leader: None,
                prev_log_offset: 0,
                prev_log_term: 0,
                commit_offset: 0,
                followers: HashMap::new(),
            }),
            hooks: StdMutex::new(Vec::new()),
            hbeat: StdMutex::new(None),
            tx_metrics,
            rx_metrics,
            tx_deadline,
            rx_deadline,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            timer: StdMutex::new(None),
        })
    }

    /// Recover durable state and begin participating as a follower.
    #[tracing::instrument(level = "debug", skip(self), fields(group = %self.group, id = %self.self_id))]
    pub async fn start(self: &Arc<Self>) -> RaftResult<()> {
        let mut state = self.state.lock().await;

        let path = voted_for::voted_for_path(&self.log.base_directory());
        let record = voted_for::load(&path)
            .await
            .map_err(|err| RaftError::Recovery(format!("voted_for record: {:#}", err)))?
            .unwrap_or_default();

        let prev_log_offset = self.log.last_offset();
        let prev_log_term = if prev_log_offset == 0 {
            0
        } else {
            self.log.term_at(prev_log_offset).ok_or_else(|| {
                RaftError::Recovery(format!("log reports tail offset {} but no term for it", prev_log_offset))
            })?
        };
        if prev_log_term > record.term {
            return Err(RaftError::Recovery(format!(
                "log tail term {} exceeds recovered term {}",
                prev_log_term, record.term
            )));
        }

        state.current_term = record.term;
        state.voted_for = record.voted_for;
        state.vstate = VoteState::Follower;
        state.current_leader = None;
        state.prev_log_offset = prev_log_offset;
        state.prev_log_term = prev_log_term;
        // The commit offset is only ever re-learned from a live quorum.
        state.commit_offset = 0;
        self.report_metrics(&state);
        drop(state);

        self.reset_election_timer();
        *self.timer.lock().unwrap() = Some(self.spawn_timer());
        self.started.store(true, Ordering::SeqCst);
        tracing::info!(
            group = %self.group,
            term = record.term,
            last_offset = prev_log_offset,
            "consensus instance started"
        );
        Ok(())
    }

    /// Stop all communications. Idempotent.
    ///
    /// Cancels the election timer, closes the gate against new operations,
    /// awaits the operation lock to drain in-flight ones, and deregisters
    /// the commit hooks.
    #[tracing::instrument(level = "debug", skip(self), fields(group = %self.group, id = %self.self_id))]
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(timer) = self.timer.lock().unwrap().take() {
            timer.abort();
        }
        let _guard = self.state.lock().await;
        self.hooks.lock().unwrap().clear();
        tracing::info!(group = %self.group, "consensus instance stopped");
    }

    /// An RPC invoked by candidates to gather votes.
    #[tracing::instrument(level = "trace", skip(self, request), fields(group = %self.group, id = %self.self_id))]
    pub async fn vote(&self, request: VoteRequest) -> RaftResult<VoteReply> {
        self.check_gate()?;
        let mut state = self.state.lock().await;
        self.do_vote(&mut state, request).await
    }

    /// An RPC invoked by the group's leader to replicate entries; an empty
    /// batch is a heartbeat.
    #[tracing::instrument(level = "trace", skip(self, request), fields(group = %self.group, id = %self.self_id))]
    pub async fn append_entries(&self, request: AppendEntriesRequest) -> RaftResult<AppendEntriesReply> {
        self.check_gate()?;
        let mut state = self.state.lock().await;
        self.do_append_entries(&mut state, request).await
    }

    /// Append client entries at the leader and fan them out to followers.
    ///
    /// Terms and offsets on the given entries are stamped here; callers fill
    /// in only kind and payload.
    #[tracing::instrument(level = "debug", skip(self, entries), fields(group = %self.group, id = %self.self_id))]
    pub async fn replicate(self: &Arc<Self>, entries: Vec<LogEntry>) -> RaftResult<ReplicateResult> {
        self.check_gate()?;
        let mut state = self.state.lock().await;
        if !state.vstate.is_leader() {
            return Err(RaftError::NotLeader {
                group: self.group,
                leader_hint: state.current_leader,
            });
        }
        self.leader_append(&mut state, entries).await
    }

    /// Called by the heartbeat manager with the reply to an empty batch.
    ///
    /// Informational only: refreshes the peer's `last_contact` and releases
    /// its in-flight slot. Match offsets advance solely on replies to
    /// non-empty batches. A higher term still forces a step-down.
    pub async fn process_heartbeat(&self, reply: AppendEntriesReply) {
        if self.stopped.load(Ordering::SeqCst) {
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
        if let Some(progress) = state.followers.get_mut(&reply.node_id) {
            progress.in_flight = false;
            progress.last_contact = Instant::now();
        }
    }

    /// Attach a commit observer; hooks fire under the operation lock in
    /// registration order and are deregistered at `stop`.
    pub fn register_hook(&self, hook: Arc<dyn CommitHook>) {
        self.hooks.lock().unwrap().push(hook);
    }

    pub fn is_leader(&self) -> bool {
        self.rx_metrics.borrow().state.is_leader()
    }

    /// The latest published protocol position.
    pub fn meta(&self) -> ProtocolMetadata {
        self.rx_metrics.borrow().meta()
    }

    pub fn config(&self) -> &GroupConfiguration {
        &self.conf
    }

    pub fn group_id(&self) -> GroupId {
        self.group
    }

    pub fn ntp(&self) -> Ntp {
        self.log.ntp().clone()
    }

    /// When a valid heartbeat was last accepted from a leader.
    pub fn last_heartbeat(&self) -> Option<Instant> {
        *self.hbeat.lock().unwrap()
    }

    /// A handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<ConsensusMetrics> {
        self.rx_metrics.clone()
    }

    /// A handle to wait for the metrics to satisfy some condition.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or_else(|| self.config.election_timeout() * 10),
            rx: self.rx_metrics.clone(),
        }
    }

    fn check_gate(&self) -> RaftResult<()> {
        if self.stopped.load(Ordering::SeqCst) || !self.started.load(Ordering::SeqCst) {
            return Err(RaftError::Stopped);
        }
        Ok(())
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Re-arm the election timer with fresh jitter.
    pub(crate) fn reset_election_timer(&self) {
        let _ = self.tx_deadline.send(self.jitter.next_deadline());
    }

    pub(crate) fn report_metrics(&self, state: &ConsensusState) {
        let _ = self.tx_metrics.send(ConsensusMetrics {
            group: self.group,
            node_id: self.self_id,
            state: state.vstate,
            current_term: state.current_term,
            prev_log_offset: state.prev_log_offset,
            prev_log_term: state.prev_log_term,
            commit_offset: state.commit_offset,
            current_leader: state.current_leader,
        });
    }

    pub(crate) fn emit_leadership(&self, term: Term, current_leader: Option<NodeId>) {
        (self.leader_cb)(LeadershipStatus {
            group: self.group,
            term,
            current_leader,
        });
    }

    pub(crate) async fn persist_vote(&self, term: Term, voted_for: Option<NodeId>) -> RaftResult<()> {
        let path = voted_for::voted_for_path(&self.log.base_directory());
        voted_for::store(&path, VotedForRecord { term, voted_for })
            .await
            .map_err(RaftError::DiskIo)
    }

    /// Adopt a higher term observed in a request or reply: clear the vote,
    /// persist, fall back to follower.
    pub(crate) async fn adopt_term(&self, state: &mut ConsensusState, term: Term) -> RaftResult<()> {
        debug_assert!(term > state.current_term);
        let was_leader = state.vstate.is_leader();
        state.current_term = term;
        state.voted_for = None;
        state.vstate = VoteState::Follower;
        state.current_leader = None;
        state.followers.clear();
        self.persist_vote(term, None).await?;
        self.reset_election_timer();
        self.report_metrics(state);
        if was_leader {
            tracing::info!(group = %self.group, term, "leader stepping down, higher term observed");
            self.emit_leadership(term, None);
        }
        Ok(())
    }

    /// Demote to follower within the current term; no durable state changes.
    pub(crate) fn step_down(&self, state: &mut ConsensusState) {
        let was_leader = state.vstate.is_leader();
        state.vstate = VoteState::Follower;
        state.current_leader = None;
        state.followers.clear();
        self.reset_election_timer();
        self.report_metrics(state);
        if was_leader {
            tracing::info!(group = %self.group, term = state.current_term, "leader stepping down");
            self.emit_leadership(state.current_term, None);
        }
    }

    /// Write entries at the log tail under the operation lock.
    ///
    /// Pre-commit hooks fire before the append is issued and abort hooks if
    /// it fails; on success the local protocol position moves to the last
    /// appended entry.
    pub(crate) async fn disk_append(
        &self,
        state: &mut ConsensusState,
        entries: Vec<LogEntry>,
    ) -> RaftResult<Vec<AppendResult>> {
        let begin = state.prev_log_offset + 1;
        {
            let hooks = self.hooks.lock().unwrap();
            for hook in hooks.iter() {
                hook.pre_commit(begin, &entries);
            }
        }
        let timeout = self.config.disk_timeout();
        let append = self.log.append(entries, self.config.fsync_mode, IoPriority::Replication, timeout);
        let results = match tokio::time::timeout(timeout, append).await {
            Ok(Ok(results)) => results,
            Ok(Err(err)) => {
                self.abort_hooks(begin);
                return Err(RaftError::DiskIo(err));
            }
            Err(_) => {
                self.abort_hooks(begin);
                return Err(RaftError::DiskTimeout { timeout });
            }
        };
        if let Some(last) = results.last() {
            state.prev_log_offset = last.offset;
            state.prev_log_term = last.term;
        }
        Ok(results)
    }

    fn abort_hooks(&self, begin: LogOffset) {
        let hooks = self.hooks.lock().unwrap();
        for hook in hooks.iter() {
            hook.abort(begin);
        }
    }

    /// Raise the commit offset and fire commit hooks for the newly covered
    /// range. Monotonic; a lower value is a no-op.
    pub(crate) fn advance_commit(&self, state: &mut ConsensusState, new_commit: LogOffset) {
        if new_commit <= state.commit_offset {
            return;
        }
        let begin = state.commit_offset + 1;
        state.commit_offset = new_commit;
        tracing::trace!(group = %self.group, begin, new_commit, "commit offset advanced");
        let hooks = self.hooks.lock().unwrap();
        for hook in hooks.iter() {
            hook.commit(begin, new_commit);
        }
    }

    pub(crate) fn record_heartbeat(&self) {
        *self.hbeat.lock().unwrap() = Some(Instant::now());
    }
}
