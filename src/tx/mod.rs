//! Transactions.
//!
//! A local [`Transaction`] comes from a [`TransactionManager`]. The first
//! cache operation inside it registers a [`GlobalTransaction`] in the
//! [`TransactionTable`]; the table entry carries everything the cache
//! keeps per transaction (modifications, locks, undo log, workspace) and
//! moves through the [`TxState`] state machine.

mod manager;
mod table;

pub use manager::{
    LocalTransactionManager, Synchronization, Transaction, TransactionManager, TransactionStatus,
};
pub use table::{TransactionEntry, TransactionTable};

use crate::types::MemberId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Cluster-unique transaction identifier: originating member plus a
/// per-member counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalTransaction {
    pub origin: MemberId,
    pub id: u64,
}

impl GlobalTransaction {
    pub fn new(origin: MemberId, id: u64) -> Self {
        Self { origin, id }
    }

    pub fn is_local_to(&self, member: MemberId) -> bool {
        self.origin == member
    }
}

impl fmt::Display for GlobalTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalTransaction:{}:{}", self.origin, self.id)
    }
}

/// Cache-side state of a global transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxState {
    Active,
    Preparing,
    Prepared,
    Committing,
    RollingBack,
    Completed,
}

impl TxState {
    /// Legal moves. `Active -> Committing` is the one-phase path.
    pub fn can_transition_to(self, next: TxState) -> bool {
        use TxState::*;
        matches!(
            (self, next),
            (Active, Preparing)
                | (Active, Committing)
                | (Active, RollingBack)
                | (Preparing, Prepared)
                | (Preparing, RollingBack)
                | (Prepared, Committing)
                | (Prepared, RollingBack)
                | (Committing, Completed)
                | (RollingBack, Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == TxState::Completed
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxState::Active => "active",
            TxState::Preparing => "preparing",
            TxState::Prepared => "prepared",
            TxState::Committing => "committing",
            TxState::RollingBack => "rolling back",
            TxState::Completed => "completed",
        };
        f.write_str(s)
    }
}
