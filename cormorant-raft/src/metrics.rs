//! Observability for a running consensus instance.
//!
//! Every instance publishes a `ConsensusMetrics` snapshot on a watch channel
//! whenever its protocol state changes. Applications can expose the data to
//! a collection system, or use `Wait` to block until the instance reaches a
//! given state. The integration tests observe elections and commits the
//! same way instead of polling internals.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::consensus::VoteState;
use crate::protocol::ProtocolMetadata;
use crate::{GroupId, LogOffset, NodeId, Term};

/// A snapshot of the observable state of one group on one node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusMetrics {
    pub group: GroupId,
    pub node_id: NodeId,
    pub state: VoteState,
    pub current_term: Term,
    pub prev_log_offset: LogOffset,
    pub prev_log_term: Term,
    pub commit_offset: LogOffset,
    pub current_leader: Option<NodeId>,
}

impl ConsensusMetrics {
    pub(crate) fn new_initial(group: GroupId, node_id: NodeId) -> Self {
        Self {
            group,
            node_id,
            state: VoteState::Follower,
            current_term: 0,
            prev_log_offset: 0,
            prev_log_term: 0,
            commit_offset: 0,
            current_leader: None,
        }
    }

    /// The protocol position carried by these metrics.
    pub fn meta(&self) -> ProtocolMetadata {
        ProtocolMetadata {
            group: self.group,
            term: self.current_term,
            prev_log_offset: self.prev_log_offset,
            prev_log_term: self.prev_log_term,
            commit_offset: self.commit_offset,
        }
    }
}

/// An error while waiting on a metrics condition.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(Duration, String),

    #[error("the consensus instance is shut down")]
    Shutdown,
}

/// Blocks until a metrics snapshot satisfies a condition.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<ConsensusMetrics>,
}

impl Wait {
    /// Wait until `func` returns true for a published snapshot, returning
    /// that snapshot.
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<ConsensusMetrics, WaitError>
    where T: Fn(&ConsensusMetrics) -> bool {
        let timeout_at = tokio::time::Instant::now() + self.timeout;
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                return Ok(latest);
            }
            let changed = tokio::time::timeout_at(timeout_at, rx.changed()).await;
            match changed {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(WaitError::Shutdown),
                Err(_) => return Err(WaitError::Timeout(self.timeout, msg.to_string())),
            }
        }
    }

    /// Wait for the instance to report the given vote state.
    pub async fn state(&self, want: VoteState, msg: impl ToString) -> Result<ConsensusMetrics, WaitError> {
        self.metrics(|m| m.state == want, msg).await
    }

    /// Wait for the instance to report the given current leader.
    pub async fn current_leader(&self, leader: NodeId, msg: impl ToString) -> Result<ConsensusMetrics, WaitError> {
        self.metrics(|m| m.current_leader == Some(leader), msg).await
    }

    /// Wait for the term to reach at least `term`.
    pub async fn term(&self, term: Term, msg: impl ToString) -> Result<ConsensusMetrics, WaitError> {
        self.metrics(|m| m.current_term >= term, msg).await
    }

    /// Wait for the commit offset to reach at least `offset`.
    pub async fn commit(&self, offset: LogOffset, msg: impl ToString) -> Result<ConsensusMetrics, WaitError> {
        self.metrics(|m| m.commit_offset >= offset, msg).await
    }
}
