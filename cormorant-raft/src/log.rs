//! The log interface consumed by the consensus core.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::FsyncMode;
use crate::protocol::LogEntry;
use crate::{LogOffset, Ntp, Term};

/// The I/O class a log operation is issued under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoPriority {
    Default,
    /// Replication traffic; scheduled ahead of background work.
    Replication,
}

/// The outcome of appending a single entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    pub offset: LogOffset,
    pub term: Term,
}

/// An append-only, fsync-capable, offset-addressable record log.
///
/// One log is owned by exactly one consensus instance; the instance is the
/// only writer. The first entry lives at offset 1 and `last_offset` is 0 for
/// an empty log. Segment layout, caching, and indexing are the storage
/// engine's business; only this contract is consumed here.
///
/// Errors returned from any of these methods surface as `RaftError::DiskIo`
/// and, on the leader's append path, force a step-down.
#[async_trait]
pub trait Log: Send + Sync + 'static {
    /// Append the given entries at the tail, returning one result per entry
    /// in order. Must not complete until the entries are durable per `fsync`.
    async fn append(
        &self,
        entries: Vec<LogEntry>,
        fsync: FsyncMode,
        priority: IoPriority,
        timeout: Duration,
    ) -> Result<Vec<AppendResult>>;

    /// Read entries starting at `from_offset`, bounded by `max_bytes` of
    /// wire size. Always returns at least one entry when `from_offset` is
    /// within the log, regardless of the byte budget.
    async fn read(&self, from_offset: LogOffset, max_bytes: u64) -> Result<Vec<LogEntry>>;

    /// Drop every entry at `from_offset` and beyond.
    async fn truncate_suffix(&self, from_offset: LogOffset) -> Result<()>;

    /// The greatest offset in the log, 0 when empty.
    fn last_offset(&self) -> LogOffset;

    /// The term of the entry at `offset`, if the log contains it.
    fn term_at(&self, offset: LogOffset) -> Option<Term>;

    /// The directory holding this log's segments and sidecar state.
    fn base_directory(&self) -> PathBuf;

    /// The partition this log materializes.
    fn ntp(&self) -> &Ntp;
}
