//! The process-wide heartbeat multiplexer.
//!
//! One tick loop drives the periodic `append_entries` of every leader group
//! on the shard, bounding timer wake-ups to O(peers) regardless of how many
//! groups are hosted. Each tick collects one batch per idle follower from
//! every leader group, then issues the sends grouped by peer; a follower
//! with pending entries gets them piggybacked on its heartbeat, so commit
//! advancement and backoff share the ordinary replication path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::consensus::Consensus;
use crate::network::ConnectionCache;
use crate::protocol::AppendEntriesRequest;
use crate::{GroupId, NodeId};

type GroupRegistry = Arc<Mutex<HashMap<GroupId, Weak<Consensus>>>>;

/// Batches periodic heartbeats across all registered groups.
///
/// Holds only weak references: the group manager owns the instances, and a
/// group that is stopped between registration and a tick simply drops out.
pub struct HeartbeatManager {
    interval: Duration,
    rpc_timeout: Duration,
    clients: Arc<dyn ConnectionCache>,
    groups: GroupRegistry,
    tick_task: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
}

impl HeartbeatManager {
    pub fn new(config: &Config, clients: Arc<dyn ConnectionCache>) -> Self {
        Self {
            interval: config.heartbeat_interval(),
            rpc_timeout: config.election_timeout(),
            clients,
            groups: Arc::new(Mutex::new(HashMap::new())),
            tick_task: Mutex::new(None),
        }
    }

    /// Start the tick loop.
    pub fn start(&self) {
        let mut task = self.tick_task.lock().unwrap();
        if task.is_some() {
            return;
        }
        let (tx_shutdown, mut rx_shutdown) = oneshot::channel();
        let groups = self.groups.clone();
        let clients = self.clients.clone();
        let rpc_timeout = self.rpc_timeout;
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let handle = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = &mut rx_shutdown => return,
                        _ = interval.tick() => {
                            Self::tick(&groups, &clients, rpc_timeout).await;
                        }
                    }
                }
            }
            .instrument(tracing::debug_span!("heartbeat-manager")),
        );
        *task = Some((tx_shutdown, handle));
    }

    /// Stop the tick loop; registered groups are left untouched.
    pub async fn stop(&self) {
        let task = self.tick_task.lock().unwrap().take();
        if let Some((tx_shutdown, handle)) = task {
            let _ = tx_shutdown.send(());
            let _ = handle.await;
        }
    }

    /// Add a group to the heartbeat rotation.
    pub fn register_group(&self, consensus: &Arc<Consensus>) {
        self.groups.lock().unwrap().insert(consensus.group_id(), Arc::downgrade(consensus));
    }

    /// Remove a group from the rotation.
    pub fn deregister_group(&self, group: GroupId) {
        self.groups.lock().unwrap().remove(&group);
    }

    async fn tick(groups: &GroupRegistry, clients: &Arc<dyn ConnectionCache>, rpc_timeout: Duration) {
        let live: Vec<Arc<Consensus>> = {
            let mut registry = groups.lock().unwrap();
            registry.retain(|_, weak| weak.strong_count() > 0);
            registry.values().filter_map(Weak::upgrade).collect()
        };

        // One send task per peer per tick, carrying that peer's batches for
        // every group led from this shard.
        let mut per_peer: HashMap<NodeId, Vec<(Arc<Consensus>, AppendEntriesRequest)>> = HashMap::new();
        for consensus in live {
            for (target, request) in consensus.heartbeat_requests().await {
                per_peer.entry(target).or_default().push((consensus.clone(), request));
            }
        }

        for (target, batch) in per_peer {
            let clients = clients.clone();
            let span = tracing::trace_span!("heartbeat", target = %target);
            tokio::spawn(
                async move {
                    for (consensus, request) in batch {
                        let empty = request.entries.is_empty();
                        let sent_last = request.entries.last().map(|entry| entry.offset);
                        match tokio::time::timeout(rpc_timeout, clients.append_entries(target, request)).await {
                            Ok(Ok(reply)) if empty => consensus.process_heartbeat(reply).await,
                            Ok(Ok(reply)) => consensus.handle_append_reply(target, sent_last, reply).await,
                            Ok(Err(err)) => {
                                tracing::debug!(target = %target, error = %err, "heartbeat send failed");
                                consensus.clear_in_flight(target).await;
                            }
                            Err(_) => {
                                tracing::debug!(target = %target, "heartbeat timed out");
                                consensus.clear_in_flight(target).await;
                            }
                        }
                    }
                }
                .instrument(span),
            );
        }
    }
}
