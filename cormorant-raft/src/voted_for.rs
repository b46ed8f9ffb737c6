//! The durable `voted_for` record, one file per group.
//!
//! Layout: `term (u64 LE), voted_for_present (u8), voted_for_id (u64 LE)`.
//! Writes go to a temp file, are fsynced, then renamed over the live file so
//! a crash mid-write leaves the previous record intact.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use tokio::io::AsyncWriteExt;

use crate::{NodeId, Term};

const VOTED_FOR_FILENAME: &str = "voted_for";
const RECORD_LEN: usize = 8 + 1 + 8;

/// The vote a node has durably cast for a term.
///
/// At most one candidate is ever voted for per term; the record must be
/// flushed before the vote reply leaves the node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct VotedForRecord {
    pub term: Term,
    pub voted_for: Option<NodeId>,
}

pub(crate) fn voted_for_path(base_directory: &Path) -> PathBuf {
    base_directory.join(VOTED_FOR_FILENAME)
}

fn encode(record: &VotedForRecord) -> [u8; RECORD_LEN] {
    let mut buf = [0u8; RECORD_LEN];
    buf[0..8].copy_from_slice(&record.term.to_le_bytes());
    buf[8] = record.voted_for.is_some() as u8;
    buf[9..17].copy_from_slice(&record.voted_for.map(|id| id.0).unwrap_or(0).to_le_bytes());
    buf
}

fn decode(data: &[u8]) -> Result<VotedForRecord> {
    if data.len() != RECORD_LEN {
        bail!("voted_for record has {} bytes, expected {}", data.len(), RECORD_LEN);
    }
    let mut cur = Cursor::new(data);
    let term = cur.read_u64::<LittleEndian>()?;
    let present = cur.read_u8()?;
    let id = cur.read_u64::<LittleEndian>()?;
    let voted_for = match present {
        0 => None,
        1 => Some(NodeId(id)),
        other => bail!("voted_for record has invalid presence byte {}", other),
    };
    Ok(VotedForRecord { term, voted_for })
}

/// Load the record, `None` if the group has never voted.
pub(crate) async fn load(path: &Path) -> Result<Option<VotedForRecord>> {
    match tokio::fs::read(path).await {
        Ok(data) => {
            let record = decode(&data).with_context(|| format!("reading {}", path.display()))?;
            Ok(Some(record))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

/// Persist the record with fsync, atomically replacing any previous one.
pub(crate) async fn store(path: &Path, record: VotedForRecord) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp).await.with_context(|| format!("creating {}", tmp.display()))?;
    file.write_all(&encode(&record)).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await.with_context(|| format!("renaming into {}", path.display()))?;
    if let Some(dir) = path.parent() {
        // Make the rename itself durable.
        let dir = std::fs::File::open(dir)?;
        dir.sync_all()?;
    }
    Ok(())
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////
