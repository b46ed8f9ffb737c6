//! Commit observers registered on a consensus instance.

use crate::protocol::LogEntry;
use crate::LogOffset;

/// An observer of a group's append and commit transitions.
///
/// Hooks are invoked synchronously under the instance's operation lock, in
/// registration order:
///
/// - `pre_commit` before the disk append of the covered entries acknowledges;
/// - `abort` if that append fails;
/// - `commit` once the commit offset crosses the covered range.
///
/// A hook must not call back into the consensus instance it is registered
/// on: the operation lock is held for the duration of the callback and the
/// reentrant call would deadlock. Hooks are deregistered when the instance
/// stops.
pub trait CommitHook: Send + Sync + 'static {
    fn pre_commit(&self, begin: LogOffset, entries: &[LogEntry]);

    fn abort(&self, begin: LogOffset);

    fn commit(&self, begin: LogOffset, committed: LogOffset);
}
