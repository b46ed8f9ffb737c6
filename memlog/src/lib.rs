//! An in-memory implementation of the `cormorant-raft` log contract.
//!
//! Backs the integration test suite: entries live in a `Vec` behind an
//! `RwLock`, while the `voted_for` sidecar written by the consensus instance
//! lands in the real base directory, so crash-restart tests exercise the
//! durable path.

use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use cormorant_raft::config::FsyncMode;
use cormorant_raft::log::{AppendResult, IoPriority, Log};
use cormorant_raft::protocol::LogEntry;
use cormorant_raft::{LogOffset, Ntp, Term};

/// An in-memory log. Offsets are 1-based; index `i` of the inner vec holds
/// offset `i + 1`.
pub struct MemLog {
    ntp: Ntp,
    base_directory: PathBuf,
    entries: RwLock<Vec<LogEntry>>,
    /// When set, appends sleep this long first; lets tests trip the disk
    /// timeout.
    append_delay: RwLock<Option<Duration>>,
}

impl MemLog {
    /// An empty log whose sidecar state lives under `base_directory`.
    pub fn new(ntp: Ntp, base_directory: impl Into<PathBuf>) -> Self {
        Self {
            ntp,
            base_directory: base_directory.into(),
            entries: RwLock::new(Vec::new()),
            append_delay: RwLock::new(None),
        }
    }

    /// A log pre-seeded with the given entries; offsets must already be
    /// contiguous from 1.
    pub fn with_entries(ntp: Ntp, base_directory: impl Into<PathBuf>, entries: Vec<LogEntry>) -> Self {
        for (idx, entry) in entries.iter().enumerate() {
            assert_eq!(entry.offset, idx as u64 + 1, "seed entries must be contiguous from offset 1");
        }
        Self {
            ntp,
            base_directory: base_directory.into(),
            entries: RwLock::new(entries),
            append_delay: RwLock::new(None),
        }
    }

    /// Delay every subsequent append, simulating a stalled disk.
    pub fn set_append_delay(&self, delay: Option<Duration>) {
        *self.append_delay.write().unwrap() = delay;
    }

    /// A snapshot of the whole log.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.read().unwrap().clone()
    }
}

#[async_trait]
impl Log for MemLog {
    async fn append(
        &self,
        entries: Vec<LogEntry>,
        _fsync: FsyncMode,
        _priority: IoPriority,
        _timeout: Duration,
    ) -> Result<Vec<AppendResult>> {
        let delay = *self.append_delay.read().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut log = self.entries.write().unwrap();
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let expected = log.len() as u64 + 1;
            if entry.offset != expected {
                return Err(anyhow!("append at offset {} but the tail is {}", entry.offset, expected - 1));
            }
            results.push(AppendResult {
                offset: entry.offset,
                term: entry.term,
            });
            log.push(entry);
        }
        Ok(results)
    }

    async fn read(&self, from_offset: LogOffset, max_bytes: u64) -> Result<Vec<LogEntry>> {
        let log = self.entries.read().unwrap();
        if from_offset == 0 || from_offset > log.len() as u64 {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut budget = 0u64;
        for entry in log[(from_offset - 1) as usize..].iter() {
            budget += entry.wire_size() as u64;
            if !out.is_empty() && budget > max_bytes {
                break;
            }
            out.push(entry.clone());
        }
        Ok(out)
    }

    async fn truncate_suffix(&self, from_offset: LogOffset) -> Result<()> {
        let mut log = self.entries.write().unwrap();
        if from_offset == 0 {
            log.clear();
        } else {
            log.truncate((from_offset - 1) as usize);
        }
        Ok(())
    }

    fn last_offset(&self) -> LogOffset {
        self.entries.read().unwrap().len() as u64
    }

    fn term_at(&self, offset: LogOffset) -> Option<Term> {
        if offset == 0 {
            return None;
        }
        self.entries.read().unwrap().get((offset - 1) as usize).map(|entry| entry.term)
    }

    fn base_directory(&self) -> PathBuf {
        self.base_directory.clone()
    }

    fn ntp(&self) -> &Ntp {
        &self.ntp
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////
