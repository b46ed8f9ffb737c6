//! Error types exposed by this crate.

use std::time::Duration;

use crate::{GroupId, NodeId};

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internals of the consensus core.
///
/// Stale terms and log inconsistencies are deliberately absent: both are
/// ordinary reply states (`granted = false` / `success = false`) on the wire,
/// not errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RaftError {
    /// A disk append did not complete within the configured deadline.
    ///
    /// A leader observing this steps down; a follower surfaces it to the
    /// requesting leader as a retriable failure.
    #[error("disk append timed out after {timeout:?}")]
    DiskTimeout { timeout: Duration },

    /// An error which has come from the log layer.
    #[error("disk I/O error: {0}")]
    DiskIo(#[source] anyhow::Error),

    /// Durable state could not be recovered at startup; the instance does
    /// not start.
    #[error("recovery failed: {0}")]
    Recovery(String),

    /// A client-initiated operation was sent to a node which is not the
    /// group's leader.
    #[error("node is not the leader of group {group}")]
    NotLeader {
        group: GroupId,
        /// The current leader, if known, so the client can redirect.
        leader_hint: Option<NodeId>,
    },

    /// An operation was attempted after `stop`.
    #[error("consensus instance is stopped")]
    Stopped,
}

/// Error variants related to configuration.
#[derive(Debug, thiserror::Error, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// A heartbeat interval at or above the election timeout starves
    /// followers into endless elections.
    #[error("heartbeat_interval_ms must be < election_timeout_ms")]
    HeartbeatGteElectionTimeout,

    /// The given value for replicate_batch_max_bytes is too small, must be > 0.
    #[error("the given value for replicate_batch_max_bytes is too small, must be > 0")]
    BatchMaxBytesTooSmall,

    /// The given value for disk_timeout_ms is too small, must be > 0.
    #[error("the given value for disk_timeout_ms is too small, must be > 0")]
    DiskTimeoutTooSmall,
}
