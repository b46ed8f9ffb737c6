//! Lifecycle owner of the consensus instances on a shard.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;

use crate::config::Config;
use crate::consensus::{Consensus, LeadershipCallback};
use crate::error::RaftResult;
use crate::heartbeat::HeartbeatManager;
use crate::hook::CommitHook;
use crate::jitter::TimeoutJitter;
use crate::log::Log;
use crate::network::ConnectionCache;
use crate::protocol::GroupConfiguration;
use crate::{GroupId, NodeId, Term};

/// A handle for unregistering a leadership notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationId(u64);

type LeadershipNotification = Box<dyn Fn(GroupId, Term, Option<NodeId>) + Send + Sync>;
type NotificationRegistry = Arc<Mutex<Vec<(NotificationId, LeadershipNotification)>>>;

/// Creates, starts, and stops the consensus instances of one shard, wiring
/// each to the shared heartbeat manager and connection cache.
pub struct GroupManager {
    self_id: NodeId,
    config: Arc<Config>,
    clients: Arc<dyn ConnectionCache>,
    heartbeats: HeartbeatManager,
    groups: Mutex<HashMap<GroupId, Arc<Consensus>>>,
    notifications: NotificationRegistry,
    next_notification: AtomicU64,
}

impl GroupManager {
    pub fn new(self_id: NodeId, config: Arc<Config>, clients: Arc<dyn ConnectionCache>) -> Self {
        let heartbeats = HeartbeatManager::new(&config, clients.clone());
        Self {
            self_id,
            config,
            clients,
            heartbeats,
            groups: Mutex::new(HashMap::new()),
            notifications: Arc::new(Mutex::new(Vec::new())),
            next_notification: AtomicU64::new(0),
        }
    }

    /// Begin heartbeating; groups can be started before or after.
    pub fn start(&self) {
        self.heartbeats.start();
    }

    /// Stop heartbeating and every managed group.
    #[tracing::instrument(level = "debug", skip(self), fields(id = %self.self_id))]
    pub async fn stop(&self) {
        self.heartbeats.stop().await;
        let groups: Vec<Arc<Consensus>> = self.groups.lock().unwrap().drain().map(|(_, c)| c).collect();
        join_all(groups.iter().map(|consensus| consensus.stop())).await;
    }

    /// Construct and start a consensus instance for `group`, register it
    /// with the heartbeat manager, and take ownership of it.
    ///
    /// The instance gets a freshly jittered election timeout and reports
    /// its leadership changes through the notification registry. An optional
    /// hook observes the group's commits from the very first entry.
    #[tracing::instrument(level = "debug", skip(self, log, hook), fields(id = %self.self_id, group = %group))]
    pub async fn start_group(
        &self,
        group: GroupId,
        nodes: Vec<NodeId>,
        log: Arc<dyn Log>,
        hook: Option<Arc<dyn CommitHook>>,
    ) -> RaftResult<Arc<Consensus>> {
        let notifications = self.notifications.clone();
        let leader_cb: LeadershipCallback = Arc::new(move |status| {
            for (_, callback) in notifications.lock().unwrap().iter() {
                callback(status.group, status.term, status.current_leader);
            }
        });
        let consensus = Consensus::new(
            self.self_id,
            group,
            GroupConfiguration::new(nodes),
            TimeoutJitter::new(self.config.election_timeout()),
            self.config.clone(),
            log,
            self.clients.clone(),
            leader_cb,
        );
        if let Some(hook) = hook {
            consensus.register_hook(hook);
        }
        consensus.start().await?;
        self.heartbeats.register_group(&consensus);
        self.groups.lock().unwrap().insert(group, consensus.clone());
        Ok(consensus)
    }

    /// Stop a managed instance: stop, deregister from heartbeats, erase.
    /// The erase happens regardless of how the earlier steps fare.
    #[tracing::instrument(level = "debug", skip(self, consensus), fields(id = %self.self_id, group = %consensus.group_id()))]
    pub async fn stop_group(&self, consensus: Arc<Consensus>) {
        let group = consensus.group_id();
        consensus.stop().await;
        self.heartbeats.deregister_group(group);
        self.groups.lock().unwrap().remove(&group);
    }

    /// Register a callback for leadership changes of any managed group.
    /// Callbacks run in registration order and must not block: they execute
    /// under the emitting group's operation lock.
    pub fn register_leadership_notification<F>(&self, callback: F) -> NotificationId
    where F: Fn(GroupId, Term, Option<NodeId>) + Send + Sync + 'static {
        let id = NotificationId(self.next_notification.fetch_add(1, Ordering::Relaxed));
        self.notifications.lock().unwrap().push((id, Box::new(callback)));
        id
    }

    pub fn unregister_leadership_notification(&self, id: NotificationId) {
        self.notifications.lock().unwrap().retain(|(existing, _)| *existing != id);
    }
}
