#![cfg_attr(feature = "docinclude", feature(external_doc))]
#![cfg_attr(feature = "docinclude", doc(include = "../README.md"))]

pub mod config;
mod consensus;
pub mod error;
pub mod group_manager;
mod heartbeat;
pub mod hook;
pub mod jitter;
pub mod log;
pub mod metrics;
pub mod network;
pub mod protocol;
mod voted_for;

pub use async_trait;
use serde::Deserialize;
use serde::Serialize;

pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::config::FsyncMode;
pub use crate::consensus::Consensus;
pub use crate::consensus::LeadershipCallback;
pub use crate::consensus::ReplicateResult;
pub use crate::consensus::VoteState;
pub use crate::error::ConfigError;
pub use crate::error::RaftError;
pub use crate::group_manager::GroupManager;
pub use crate::hook::CommitHook;
pub use crate::log::Log;
pub use crate::metrics::ConsensusMetrics;
pub use crate::network::ConnectionCache;

/// A replication group's ID, unique process-wide.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u64);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The ID of a node participating in one or more replication groups.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A monotonically non-decreasing leadership epoch.
///
/// Once a node has observed term `T` it never participates in any term below `T`.
pub type Term = u64;

/// An index into the replicated log.
///
/// Offset `0` is the empty-log sentinel; the first entry lives at offset `1`.
pub type LogOffset = u64;

/// The namespaced topic partition a replication group materializes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ntp {
    pub namespace: String,
    pub topic: String,
    pub partition: u32,
}

impl std::fmt::Display for Ntp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.topic, self.partition)
    }
}
