//! Runtime configuration for the consensus core.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default base election timeout, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MS: u64 = 150;
/// Default heartbeat interval, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 50;
/// Default disk append deadline, in milliseconds.
pub const DEFAULT_DISK_TIMEOUT_MS: u64 = 1_000;
/// Default replication batch cap, in bytes.
pub const DEFAULT_REPLICATE_BATCH_MAX_BYTES: u64 = 1024 * 1024;

/// When appends to the log are made durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsyncMode {
    /// Every append is flushed before it is acknowledged.
    Always,
    /// Appends are flushed when the commit offset crosses them.
    OnCommit,
    /// Flushing is left to the log's own policy.
    Never,
}

impl Default for FsyncMode {
    fn default() -> Self {
        FsyncMode::Always
    }
}

/// The runtime configuration shared by every group on a shard.
///
/// Keep the inequality from the Raft paper in mind when tuning:
/// `broadcastTime ≪ electionTimeout ≪ MTBF`. The heartbeat interval must
/// leave a leader enough slack to reach every follower well inside the
/// election timeout, or the cluster will churn through elections.
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// The base election timeout in milliseconds.
    ///
    /// Every group rolls its own jittered timeout in
    /// `[base, 2 * base)` to desynchronize elections.
    pub election_timeout_ms: u64,
    /// The interval in milliseconds at which leaders send heartbeats to followers.
    pub heartbeat_interval_ms: u64,
    /// The deadline for a single disk append. A leader exceeding it steps
    /// down; a follower surfaces a retriable failure.
    pub disk_timeout_ms: u64,
    /// The maximum number of bytes per replication batch.
    pub replicate_batch_max_bytes: u64,
    /// When appended entries are flushed to stable storage.
    pub fsync_mode: FsyncMode,
}

impl Config {
    /// Start the builder process for a new `Config` instance. Call `validate` when done.
    pub fn build() -> ConfigBuilder {
        ConfigBuilder {
            election_timeout_ms: None,
            heartbeat_interval_ms: None,
            disk_timeout_ms: None,
            replicate_batch_max_bytes: None,
            fsync_mode: None,
        }
    }

    /// The base election timeout as a `Duration`.
    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    /// The heartbeat interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// The disk append deadline as a `Duration`.
    pub fn disk_timeout(&self) -> Duration {
        Duration::from_millis(self.disk_timeout_ms)
    }
}

/// A configuration builder to ensure that the runtime config is valid.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigBuilder {
    /// The base election timeout, in milliseconds.
    pub election_timeout_ms: Option<u64>,
    /// The heartbeat interval, in milliseconds.
    pub heartbeat_interval_ms: Option<u64>,
    /// The disk append deadline, in milliseconds.
    pub disk_timeout_ms: Option<u64>,
    /// The maximum number of bytes per replication batch.
    pub replicate_batch_max_bytes: Option<u64>,
    /// When appended entries are flushed to stable storage.
    pub fsync_mode: Option<FsyncMode>,
}

impl ConfigBuilder {
    /// Set the desired value for `election_timeout_ms`.
    pub fn election_timeout_ms(mut self, val: u64) -> Self {
        self.election_timeout_ms = Some(val);
        self
    }

    /// Set the desired value for `heartbeat_interval_ms`.
    pub fn heartbeat_interval_ms(mut self, val: u64) -> Self {
        self.heartbeat_interval_ms = Some(val);
        self
    }

    /// Set the desired value for `disk_timeout_ms`.
    pub fn disk_timeout_ms(mut self, val: u64) -> Self {
        self.disk_timeout_ms = Some(val);
        self
    }

    /// Set the desired value for `replicate_batch_max_bytes`.
    pub fn replicate_batch_max_bytes(mut self, val: u64) -> Self {
        self.replicate_batch_max_bytes = Some(val);
        self
    }

    /// Set the desired value for `fsync_mode`.
    pub fn fsync_mode(mut self, val: FsyncMode) -> Self {
        self.fsync_mode = Some(val);
        self
    }

    /// Validate the state of this builder and produce a new `Config` instance if valid.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout_ms = self.election_timeout_ms.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MS);
        let heartbeat_interval_ms = self.heartbeat_interval_ms.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS);
        if heartbeat_interval_ms >= election_timeout_ms {
            return Err(ConfigError::HeartbeatGteElectionTimeout);
        }
        let disk_timeout_ms = self.disk_timeout_ms.unwrap_or(DEFAULT_DISK_TIMEOUT_MS);
        if disk_timeout_ms == 0 {
            return Err(ConfigError::DiskTimeoutTooSmall);
        }
        let replicate_batch_max_bytes = self.replicate_batch_max_bytes.unwrap_or(DEFAULT_REPLICATE_BATCH_MAX_BYTES);
        if replicate_batch_max_bytes == 0 {
            return Err(ConfigError::BatchMaxBytesTooSmall);
        }
        let fsync_mode = self.fsync_mode.unwrap_or_default();
        Ok(Config {
            election_timeout_ms,
            heartbeat_interval_ms,
            disk_timeout_ms,
            replicate_batch_max_bytes,
            fsync_mode,
        })
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////
