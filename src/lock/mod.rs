//! Pessimistic node locking.
//!
//! One [`LockManager`] per cache instance hands out per-node read/write
//! locks owned either by a global transaction or by a single invocation.
//! Waits are bounded by a timeout; there is no deadlock detection.

mod manager;
mod node_lock;

pub use manager::{LockManager, LockScope};
pub use node_lock::NodeLock;

use crate::tx::GlobalTransaction;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Read,
    Write,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Read => f.write_str("read"),
            LockMode::Write => f.write_str("write"),
        }
    }
}

/// Transaction isolation level for the pessimistic scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum IsolationLevel {
    /// No locks at all.
    None,
    /// Writes lock, reads never do.
    ReadUncommitted,
    /// Reads hold a read lock for the duration of the call only.
    ReadCommitted,
    /// Reads hold read locks (on the node and its ancestors) until the
    /// transaction completes.
    #[default]
    RepeatableRead,
    /// Reads take write locks.
    Serializable,
}

impl IsolationLevel {
    pub fn acquires_locks(&self) -> bool {
        *self != IsolationLevel::None
    }

    pub fn locks_reads(&self) -> bool {
        *self >= IsolationLevel::ReadCommitted
    }

    /// Whether read locks on ancestors are taken when traversing to a node.
    pub fn locks_ancestors(&self) -> bool {
        *self >= IsolationLevel::RepeatableRead
    }

    /// Whether read locks outlive the call that took them.
    pub fn holds_read_locks(&self) -> bool {
        *self >= IsolationLevel::RepeatableRead
    }
}

/// Who holds a lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockOwner {
    Transaction(GlobalTransaction),
    /// A non-transactional invocation, identified by its context id.
    Invocation(u64),
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockOwner::Transaction(gtx) => write!(f, "{}", gtx),
            LockOwner::Invocation(id) => write!(f, "invocation-{}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_ordering() {
        assert!(!IsolationLevel::None.acquires_locks());
        assert!(!IsolationLevel::ReadUncommitted.locks_reads());
        assert!(IsolationLevel::ReadCommitted.locks_reads());
        assert!(!IsolationLevel::ReadCommitted.locks_ancestors());
        assert!(IsolationLevel::Serializable.locks_ancestors());
        assert_eq!(IsolationLevel::default(), IsolationLevel::RepeatableRead);
    }

    #[test]
    fn test_owner_display() {
        let owner = LockOwner::Transaction(GlobalTransaction::new(3, 9));
        assert_eq!(owner.to_string(), "GlobalTransaction:3:9");
        assert_eq!(LockOwner::Invocation(4).to_string(), "invocation-4");
    }
}
