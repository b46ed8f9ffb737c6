//! The peer RPC interface consumed by the consensus core.

use anyhow::Result;
use async_trait::async_trait;

use crate::protocol::{AppendEntriesReply, AppendEntriesRequest, VoteReply, VoteRequest};
use crate::NodeId;

/// A sharded pool of authenticated RPC channels to peer nodes.
///
/// Shared read-mostly across every group on a shard; injected as a
/// capability so tests can substitute a mock to simulate partitions and
/// reorderings. Callers bound each call with a deadline derived from the
/// election timeout.
#[async_trait]
pub trait ConnectionCache: Send + Sync + 'static {
    /// Send a vote request to the target node.
    async fn vote(&self, target: NodeId, request: VoteRequest) -> Result<VoteReply>;

    /// Send an append-entries request (possibly an empty heartbeat) to the
    /// target node.
    async fn append_entries(&self, target: NodeId, request: AppendEntriesRequest) -> Result<AppendEntriesReply>;
}
