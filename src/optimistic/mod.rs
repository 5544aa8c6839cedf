//! Optimistic and MVCC concurrency control.
//!
//! Transactions under these schemes never hold node locks while they run.
//! Their reads and writes go through a [`TransactionWorkspace`]; at prepare
//! the workspace is validated against the tree's data versions and, if
//! nothing moved on, installed at commit.

mod workspace;

pub use workspace::{TransactionWorkspace, WorkspaceNode};
