//! Peer RPC types, the replicated entry model, and their binary codec.
//!
//! The wire layout is fixed little-endian:
//!
//! ```text
//! entry      := term (u64) offset (u64) kind (u8) payload_len (u32) payload
//! vote req   := group (u64) node_id (u64) term (u64) prev_log_offset (u64) prev_log_term (u64)
//! vote reply := group (u64) term (u64) granted (u8) log_ok (u8)
//! append req := group (u64) node_id (u64) term (u64) prev_log_offset (u64)
//!               prev_log_term (u64) commit_offset (u64) entry_count (u32) entry*
//! append rpl := group (u64) node_id (u64) term (u64) success (u8) last_log_offset (u64)
//! ```

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};

use crate::{GroupId, LogOffset, NodeId, Term};

/// An error decoding a frame off the wire.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("truncated frame: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown entry kind: {0}")]
    UnknownEntryKind(u8),

    #[error("unknown boolean encoding: {0}")]
    UnknownBool(u8),
}

/// What a replicated entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// An opaque data record from the partition front-end.
    Data,
    /// A group configuration record.
    Configuration,
    /// A checkpoint marker; a hook point for log compaction, nothing in the
    /// core consumes it.
    Checkpoint,
}

impl EntryKind {
    fn to_wire(self) -> u8 {
        match self {
            EntryKind::Data => 0,
            EntryKind::Configuration => 1,
            EntryKind::Checkpoint => 2,
        }
    }

    fn from_wire(val: u8) -> Result<Self, WireError> {
        match val {
            0 => Ok(EntryKind::Data),
            1 => Ok(EntryKind::Configuration),
            2 => Ok(EntryKind::Checkpoint),
            other => Err(WireError::UnknownEntryKind(other)),
        }
    }
}

/// A single replicated log entry.
///
/// Entries are appended by the leader, never mutated in place, and truncated
/// only when a leader proves divergence to a follower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub offset: LogOffset,
    pub kind: EntryKind,
    pub payload: Vec<u8>,
}

impl LogEntry {
    /// A data entry with the term and offset left for the leader to stamp.
    pub fn data(payload: Vec<u8>) -> Self {
        Self {
            term: 0,
            offset: 0,
            kind: EntryKind::Data,
            payload,
        }
    }

    /// The number of bytes this entry occupies on the wire.
    pub fn wire_size(&self) -> usize {
        8 + 8 + 1 + 4 + self.payload.len()
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.push(self.kind.to_wire());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
    }

    pub fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, WireError> {
        let term = cur.read_u64::<LittleEndian>()?;
        let offset = cur.read_u64::<LittleEndian>()?;
        let kind = EntryKind::from_wire(cur.read_u8()?)?;
        let payload_len = cur.read_u32::<LittleEndian>()? as usize;
        let mut payload = vec![0u8; payload_len];
        std::io::Read::read_exact(cur, &mut payload)?;
        Ok(Self {
            term,
            offset,
            kind,
            payload,
        })
    }
}

/// The ordered set of voting members of a group.
///
/// Static for the lifetime of the group; joint-consensus membership changes
/// are an extension point, not implemented here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfiguration {
    nodes: Vec<NodeId>,
}

impl GroupConfiguration {
    pub fn new(nodes: Vec<NodeId>) -> Self {
        Self { nodes }
    }

    /// All voting members, in configuration order.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// The strict majority of the configuration.
    pub fn majority(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains(&id)
    }

    /// Every member other than `this`.
    pub fn peers(&self, this: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().copied().filter(move |id| *id != this)
    }
}

/// The volatile protocol position of one group on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMetadata {
    pub group: GroupId,
    /// The current term of this node.
    pub term: Term,
    /// The greatest offset in the local log.
    pub prev_log_offset: LogOffset,
    /// The term of the entry at `prev_log_offset`.
    pub prev_log_term: Term,
    /// The greatest offset known durable on a quorum. Never exceeds
    /// `prev_log_offset` and never decreases.
    pub commit_offset: LogOffset,
}

/// An RPC sent by candidates to gather votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub group: GroupId,
    /// The candidate's ID.
    pub node_id: NodeId,
    /// The candidate's current term.
    pub term: Term,
    pub prev_log_offset: LogOffset,
    pub prev_log_term: Term,
}

impl VoteRequest {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.group.0.to_le_bytes());
        buf.extend_from_slice(&self.node_id.0.to_le_bytes());
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf.extend_from_slice(&self.prev_log_offset.to_le_bytes());
        buf.extend_from_slice(&self.prev_log_term.to_le_bytes());
    }

    pub fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, WireError> {
        Ok(Self {
            group: GroupId(cur.read_u64::<LittleEndian>()?),
            node_id: NodeId(cur.read_u64::<LittleEndian>()?),
            term: cur.read_u64::<LittleEndian>()?,
            prev_log_offset: cur.read_u64::<LittleEndian>()?,
            prev_log_term: cur.read_u64::<LittleEndian>()?,
        })
    }
}

/// The response to a `VoteRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteReply {
    pub group: GroupId,
    /// The current term of the responding node, for the candidate to update itself.
    pub term: Term,
    /// True if the candidate received this node's vote.
    pub granted: bool,
    /// True if the candidate's log was at least as up-to-date as this node's.
    pub log_ok: bool,
}

impl VoteReply {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.group.0.to_le_bytes());
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf.push(self.granted as u8);
        buf.push(self.log_ok as u8);
    }

    pub fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, WireError> {
        Ok(Self {
            group: GroupId(cur.read_u64::<LittleEndian>()?),
            term: cur.read_u64::<LittleEndian>()?,
            granted: read_bool(cur)?,
            log_ok: read_bool(cur)?,
        })
    }
}

/// An RPC sent by the leader to replicate log entries; an empty entries batch
/// doubles as a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// The leader's ID.
    pub node_id: NodeId,
    /// The leader's protocol position; `meta.prev_log_offset` and
    /// `meta.prev_log_term` name the entry immediately preceding `entries`.
    pub meta: ProtocolMetadata,
    pub entries: Vec<LogEntry>,
}

impl AppendEntriesRequest {
    pub fn group(&self) -> GroupId {
        self.meta.group
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.meta.group.0.to_le_bytes());
        buf.extend_from_slice(&self.node_id.0.to_le_bytes());
        buf.extend_from_slice(&self.meta.term.to_le_bytes());
        buf.extend_from_slice(&self.meta.prev_log_offset.to_le_bytes());
        buf.extend_from_slice(&self.meta.prev_log_term.to_le_bytes());
        buf.extend_from_slice(&self.meta.commit_offset.to_le_bytes());
        buf.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            entry.encode(buf);
        }
    }

    pub fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, WireError> {
        let group = GroupId(cur.read_u64::<LittleEndian>()?);
        let node_id = NodeId(cur.read_u64::<LittleEndian>()?);
        let term = cur.read_u64::<LittleEndian>()?;
        let prev_log_offset = cur.read_u64::<LittleEndian>()?;
        let prev_log_term = cur.read_u64::<LittleEndian>()?;
        let commit_offset = cur.read_u64::<LittleEndian>()?;
        let count = cur.read_u32::<LittleEndian>()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(LogEntry::decode(cur)?);
        }
        Ok(Self {
            node_id,
            meta: ProtocolMetadata {
                group,
                term,
                prev_log_offset,
                prev_log_term,
                commit_offset,
            },
            entries,
        })
    }
}

/// The response to an `AppendEntriesRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub group: GroupId,
    /// The responding node's ID.
    pub node_id: NodeId,
    /// The responding node's current term, for the leader to update itself.
    pub term: Term,
    /// True if the follower contained the entry matching `prev_log_offset`
    /// and `prev_log_term` and appended the batch.
    pub success: bool,
    /// The greatest offset in the responder's log. On failure this doubles
    /// as the backoff hint for the leader.
    pub last_log_offset: LogOffset,
}

impl AppendEntriesReply {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.group.0.to_le_bytes());
        buf.extend_from_slice(&self.node_id.0.to_le_bytes());
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf.push(self.success as u8);
        buf.extend_from_slice(&self.last_log_offset.to_le_bytes());
    }

    pub fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, WireError> {
        Ok(Self {
            group: GroupId(cur.read_u64::<LittleEndian>()?),
            node_id: NodeId(cur.read_u64::<LittleEndian>()?),
            term: cur.read_u64::<LittleEndian>()?,
            success: read_bool(cur)?,
            last_log_offset: cur.read_u64::<LittleEndian>()?,
        })
    }
}

/// A leadership transition, broadcast to group-manager subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadershipStatus {
    pub group: GroupId,
    pub term: Term,
    /// `None` while leadership is unknown, e.g. after a step-down.
    pub current_leader: Option<NodeId>,
}

fn read_bool(cur: &mut Cursor<&[u8]>) -> Result<bool, WireError> {
    match cur.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(WireError::UnknownBool(other)),
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> Vec<LogEntry> {
        vec![
            LogEntry {
                term: 3,
                offset: 7,
                kind: EntryKind::Data,
                payload: b"hello".to_vec(),
            },
            LogEntry {
                term: 3,
                offset: 8,
                kind: EntryKind::Configuration,
                payload: vec![],
            },
            LogEntry {
                term: 4,
                offset: 9,
                kind: EntryKind::Checkpoint,
                payload: vec![0xff; 32],
            },
        ]
    }

    #[test]
    fn entry_roundtrip_is_identity() {
        for entry in sample_entries() {
            let mut buf = Vec::new();
            entry.encode(&mut buf);
            assert_eq!(buf.len(), entry.wire_size());
            let decoded = LogEntry::decode(&mut Cursor::new(buf.as_slice())).unwrap();
            assert_eq!(decoded, entry);
        }
    }

    #[test]
    fn entry_rejects_unknown_kind() {
        let mut buf = Vec::new();
        LogEntry {
            term: 1,
            offset: 1,
            kind: EntryKind::Data,
            payload: vec![],
        }
        .encode(&mut buf);
        buf[16] = 9;
        let err = LogEntry::decode(&mut Cursor::new(buf.as_slice())).unwrap_err();
        assert!(matches!(err, WireError::UnknownEntryKind(9)));
    }

    #[test]
    fn vote_request_roundtrip_is_identity() {
        let req = VoteRequest {
            group: GroupId(11),
            node_id: NodeId(2),
            term: 5,
            prev_log_offset: 42,
            prev_log_term: 4,
        };
        let mut buf = Vec::new();
        req.encode(&mut buf);
        assert_eq!(VoteRequest::decode(&mut Cursor::new(buf.as_slice())).unwrap(), req);
    }

    #[test]
    fn vote_reply_roundtrip_is_identity() {
        let reply = VoteReply {
            group: GroupId(11),
            term: 5,
            granted: true,
            log_ok: false,
        };
        let mut buf = Vec::new();
        reply.encode(&mut buf);
        assert_eq!(VoteReply::decode(&mut Cursor::new(buf.as_slice())).unwrap(), reply);
    }

    #[test]
    fn append_entries_roundtrip_is_identity() {
        let req = AppendEntriesRequest {
            node_id: NodeId(1),
            meta: ProtocolMetadata {
                group: GroupId(11),
                term: 4,
                prev_log_offset: 6,
                prev_log_term: 3,
                commit_offset: 5,
            },
            entries: sample_entries(),
        };
        let mut buf = Vec::new();
        req.encode(&mut buf);
        assert_eq!(AppendEntriesRequest::decode(&mut Cursor::new(buf.as_slice())).unwrap(), req);

        let reply = AppendEntriesReply {
            group: GroupId(11),
            node_id: NodeId(3),
            term: 4,
            success: true,
            last_log_offset: 9,
        };
        let mut buf = Vec::new();
        reply.encode(&mut buf);
        assert_eq!(AppendEntriesReply::decode(&mut Cursor::new(buf.as_slice())).unwrap(), reply);
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let req = VoteRequest {
            group: GroupId(1),
            node_id: NodeId(1),
            term: 1,
            prev_log_offset: 1,
            prev_log_term: 1,
        };
        let mut buf = Vec::new();
        req.encode(&mut buf);
        buf.truncate(buf.len() - 1);
        assert!(VoteRequest::decode(&mut Cursor::new(buf.as_slice())).is_err());
    }

    #[test]
    fn majority_is_a_strict_majority() {
        let conf = GroupConfiguration::new(vec![NodeId(1)]);
        assert_eq!(conf.majority(), 1);
        let conf = GroupConfiguration::new(vec![NodeId(1), NodeId(2), NodeId(3)]);
        assert_eq!(conf.majority(), 2);
        let conf = GroupConfiguration::new((1..=4).map(NodeId).collect());
        assert_eq!(conf.majority(), 3);
        let conf = GroupConfiguration::new((1..=5).map(NodeId).collect());
        assert_eq!(conf.majority(), 3);
    }

    #[test]
    fn peers_excludes_self() {
        let conf = GroupConfiguration::new(vec![NodeId(1), NodeId(2), NodeId(3)]);
        let peers: Vec<_> = conf.peers(NodeId(2)).collect();
        assert_eq!(peers, vec![NodeId(1), NodeId(3)]);
    }
}
