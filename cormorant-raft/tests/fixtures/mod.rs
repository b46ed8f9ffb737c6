//! Fixtures for testing the consensus core.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use cormorant_raft::jitter::TimeoutJitter;
use cormorant_raft::metrics::ConsensusMetrics;
use cormorant_raft::protocol::{
    AppendEntriesReply, AppendEntriesRequest, GroupConfiguration, LogEntry, VoteReply, VoteRequest,
};
use cormorant_raft::{
    CommitHook, Config, ConnectionCache, Consensus, GroupId, GroupManager, LogOffset, NodeId, Ntp, VoteState,
};
use memlog::MemLog;
use tempfile::TempDir;
use tokio::sync::RwLock;

/// Initialize the tracing system.
pub fn init_tracing() {
    use tracing_subscriber::prelude::*;
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

pub fn test_ntp(partition: u32) -> Ntp {
    Ntp {
        namespace: "kafka".into(),
        topic: "events".into(),
        partition,
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A type which emulates the sharded connection cache and routes peer RPCs
/// between in-process consensus instances.
pub struct RaftRouter {
    /// The table of all instances currently known to this router.
    table: RwLock<BTreeMap<NodeId, Arc<Consensus>>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated: RwLock<HashSet<NodeId>>,
}

impl RaftRouter {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(BTreeMap::new()),
            isolated: RwLock::new(HashSet::new()),
        }
    }

    pub async fn register(&self, id: NodeId, consensus: Arc<Consensus>) {
        self.table.write().await.insert(id, consensus);
    }

    /// Isolate the network of the specified node.
    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated.write().await.insert(id);
    }

    /// Restore the network of the specified node.
    pub async fn restore_node(&self, id: NodeId) {
        self.isolated.write().await.remove(&id);
    }

    async fn check_route(&self, source: NodeId, target: NodeId) -> Result<Arc<Consensus>> {
        let isolated = self.isolated.read().await;
        if isolated.contains(&source) || isolated.contains(&target) {
            return Err(anyhow!("route from {} to {} is partitioned", source, target));
        }
        drop(isolated);
        self.table
            .read()
            .await
            .get(&target)
            .cloned()
            .ok_or_else(|| anyhow!("node {} not found in routing table", target))
    }
}

#[async_trait]
impl ConnectionCache for RaftRouter {
    async fn vote(&self, target: NodeId, request: VoteRequest) -> Result<VoteReply> {
        let node = self.check_route(request.node_id, target).await?;
        node.vote(request).await.map_err(|err| anyhow!(err))
    }

    async fn append_entries(&self, target: NodeId, request: AppendEntriesRequest) -> Result<AppendEntriesReply> {
        let node = self.check_route(request.node_id, target).await?;
        node.append_entries(request).await.map_err(|err| anyhow!(err))
    }
}

/// A connection cache with no peers behind it; every send fails.
pub struct NullNetwork;

#[async_trait]
impl ConnectionCache for NullNetwork {
    async fn vote(&self, target: NodeId, _request: VoteRequest) -> Result<VoteReply> {
        Err(anyhow!("no route to {}", target))
    }

    async fn append_entries(&self, target: NodeId, _request: AppendEntriesRequest) -> Result<AppendEntriesReply> {
        Err(anyhow!("no route to {}", target))
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// One node of a test cluster: its group manager, its consensus handle, and
/// the tempdir holding the durable `voted_for` sidecar.
pub struct TestNode {
    pub id: NodeId,
    pub manager: Arc<GroupManager>,
    pub consensus: Arc<Consensus>,
    pub log: Arc<MemLog>,
    pub dir: TempDir,
}

/// A single-group cluster of in-process nodes joined through a `RaftRouter`.
pub struct TestCluster {
    pub group: GroupId,
    pub config: Arc<Config>,
    pub router: Arc<RaftRouter>,
    pub nodes: BTreeMap<NodeId, TestNode>,
}

impl TestCluster {
    /// Bring up a group with the given members, heartbeating from the start.
    pub async fn new(config: Arc<Config>, ids: &[u64]) -> Result<Self> {
        let group = GroupId(1);
        let router = Arc::new(RaftRouter::new());
        let members: Vec<NodeId> = ids.iter().copied().map(NodeId).collect();
        let mut nodes = BTreeMap::new();
        for &id in &members {
            let dir = tempfile::tempdir()?;
            let log = Arc::new(MemLog::new(test_ntp(1), dir.path()));
            let manager = Arc::new(GroupManager::new(id, config.clone(), router.clone()));
            manager.start();
            let consensus = manager.start_group(group, members.clone(), log.clone(), None).await?;
            router.register(id, consensus.clone()).await;
            nodes.insert(id, TestNode {
                id,
                manager,
                consensus,
                log,
                dir,
            });
        }
        Ok(Self {
            group,
            config,
            router,
            nodes,
        })
    }

    pub fn node(&self, id: u64) -> &TestNode {
        self.nodes.get(&NodeId(id)).unwrap_or_else(|| panic!("node {} does not exist in the cluster", id))
    }

    /// Get a payload of the latest metrics from each node in the cluster.
    pub fn latest_metrics(&self) -> Vec<ConsensusMetrics> {
        self.nodes.values().map(|node| node.consensus.metrics().borrow().clone()).collect()
    }

    /// The ID of the current leader among non-isolated nodes, if any node
    /// currently claims leadership.
    pub async fn leader(&self) -> Option<NodeId> {
        let isolated = self.router.isolated.read().await;
        self.latest_metrics()
            .into_iter()
            .find(|m| m.state == VoteState::Leader && !isolated.contains(&m.node_id))
            .map(|m| m.node_id)
    }

    /// Poll until a non-isolated node claims leadership.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                return Ok(leader);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("no leader emerged within {:?}", timeout));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll until every non-isolated node reports the given commit offset.
    pub async fn wait_for_commit(&self, offset: LogOffset, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let isolated = self.router.isolated.read().await.clone();
            let done = self
                .latest_metrics()
                .iter()
                .filter(|m| !isolated.contains(&m.node_id))
                .all(|m| m.commit_offset >= offset);
            if done {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("commit offset {} not reached within {:?}", offset, timeout));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// Build a consensus instance directly, outside any group manager, with an
/// election timeout long enough that no election fires during the test. The
/// test drives the RPC surface by hand.
pub struct StandaloneNode {
    pub consensus: Arc<Consensus>,
    pub log: Arc<MemLog>,
    pub dir: TempDir,
    pub statuses: Arc<Mutex<Vec<(GroupId, u64, Option<NodeId>)>>>,
}

impl std::fmt::Debug for StandaloneNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StandaloneNode").finish_non_exhaustive()
    }
}

pub async fn standalone_node(id: u64, member_ids: &[u64], seed: Vec<LogEntry>) -> Result<StandaloneNode> {
    let dir = tempfile::tempdir()?;
    standalone_node_in(id, member_ids, seed, dir).await
}

/// Like `standalone_node`, reusing an existing directory so restarts see the
/// previous durable state.
pub async fn standalone_node_in(id: u64, member_ids: &[u64], seed: Vec<LogEntry>, dir: TempDir) -> Result<StandaloneNode> {
    let config = Arc::new(
        Config::build()
            .election_timeout_ms(60_000)
            .heartbeat_interval_ms(1_000)
            .validate()
            .unwrap(),
    );
    let log = Arc::new(MemLog::with_entries(test_ntp(1), dir.path(), seed));
    let statuses: Arc<Mutex<Vec<(GroupId, u64, Option<NodeId>)>>> = Arc::new(Mutex::new(Vec::new()));
    let statuses_cb = statuses.clone();
    let consensus = Consensus::new(
        NodeId(id),
        GroupId(1),
        GroupConfiguration::new(member_ids.iter().copied().map(NodeId).collect()),
        TimeoutJitter::new(config.election_timeout()),
        config,
        log.clone(),
        Arc::new(NullNetwork),
        Arc::new(move |status| {
            statuses_cb.lock().unwrap().push((status.group, status.term, status.current_leader));
        }),
    );
    consensus.start().await?;
    Ok(StandaloneNode {
        consensus,
        log,
        dir,
        statuses,
    })
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// What a hook observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    PreCommit { begin: LogOffset, count: usize },
    Abort { begin: LogOffset },
    Commit { begin: LogOffset, committed: LogOffset },
}

/// A commit hook recording every callback for later assertions.
#[derive(Default)]
pub struct RecordingHook {
    pub events: Mutex<Vec<HookEvent>>,
}

impl RecordingHook {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl CommitHook for RecordingHook {
    fn pre_commit(&self, begin: LogOffset, entries: &[LogEntry]) {
        self.events.lock().unwrap().push(HookEvent::PreCommit {
            begin,
            count: entries.len(),
        });
    }

    fn abort(&self, begin: LogOffset) {
        self.events.lock().unwrap().push(HookEvent::Abort { begin });
    }

    fn commit(&self, begin: LogOffset, committed: LogOffset) {
        self.events.lock().unwrap().push(HookEvent::Commit { begin, committed });
    }
}
