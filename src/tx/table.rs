//! Transaction table: local transactions to global ids, and per-transaction
//! cache state.

use super::{GlobalTransaction, Transaction, TxState};
use crate::command::Command;
use crate::error::{Error, Result, TransactionError};
use crate::fqn::Fqn;
use crate::optimistic::TransactionWorkspace;
use crate::tree::UndoRecord;
use crate::types::MemberId;
use crate::version::DataVersion;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Everything the cache tracks for one global transaction.
#[derive(Debug)]
pub struct TransactionEntry {
    gtx: GlobalTransaction,
    /// The local transaction, absent for transactions started by a peer.
    transaction: Option<Transaction>,
    state: Mutex<TxState>,
    /// Writes to propagate, in call order.
    modifications: Mutex<Vec<Command>>,
    /// Writes issued with `cache_mode_local`: applied and persisted, never
    /// replicated.
    local_modifications: Mutex<Vec<Command>>,
    locks: Mutex<BTreeSet<Fqn>>,
    undo: Mutex<Vec<UndoRecord>>,
    workspace: Mutex<TransactionWorkspace>,
    /// Versions assigned at prepare, shipped with the modifications.
    prepared_versions: Mutex<Vec<(Fqn, DataVersion)>>,
    prepare_replicated: AtomicBool,
    rollback_only: AtomicBool,
}

impl TransactionEntry {
    fn new(gtx: GlobalTransaction, transaction: Option<Transaction>) -> Self {
        Self {
            gtx,
            transaction,
            state: Mutex::new(TxState::Active),
            modifications: Mutex::new(Vec::new()),
            local_modifications: Mutex::new(Vec::new()),
            locks: Mutex::new(BTreeSet::new()),
            undo: Mutex::new(Vec::new()),
            workspace: Mutex::new(TransactionWorkspace::default()),
            prepared_versions: Mutex::new(Vec::new()),
            prepare_replicated: AtomicBool::new(false),
            rollback_only: AtomicBool::new(false),
        }
    }

    pub fn gtx(&self) -> &GlobalTransaction {
        &self.gtx
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    /// Whether a peer started this transaction.
    pub fn is_remote(&self) -> bool {
        self.transaction.is_none()
    }

    pub fn state(&self) -> TxState {
        *self.state.lock()
    }

    /// Move from `from` to `to`, failing if the entry is elsewhere or the
    /// move is not legal.
    pub fn transition(&self, from: TxState, to: TxState) -> Result<()> {
        let mut state = self.state.lock();
        if *state != from || !from.can_transition_to(to) {
            return Err(Error::Transaction(TransactionError::InvalidState {
                tx: self.gtx.to_string(),
                state: state.to_string(),
                action: "transition",
            }));
        }
        trace!(gtx = %self.gtx, %from, %to, "Transaction state change");
        *state = to;
        Ok(())
    }

    /// Move to `to` from whatever the current state is, if legal. Returns
    /// the previous state.
    pub fn advance(&self, to: TxState) -> Result<TxState> {
        let mut state = self.state.lock();
        let from = *state;
        if !from.can_transition_to(to) {
            return Err(Error::Transaction(TransactionError::InvalidState {
                tx: self.gtx.to_string(),
                state: from.to_string(),
                action: "advance",
            }));
        }
        trace!(gtx = %self.gtx, %from, %to, "Transaction state change");
        *state = to;
        Ok(from)
    }

    pub fn add_modification(&self, command: Command, local_only: bool) {
        if local_only {
            self.local_modifications.lock().push(command);
        } else {
            self.modifications.lock().push(command);
        }
    }

    /// Replicable modifications, in call order.
    pub fn modifications(&self) -> Vec<Command> {
        self.modifications.lock().clone()
    }

    /// Every modification, replicable or not.
    pub fn all_modifications(&self) -> Vec<Command> {
        let mut all = self.modifications.lock().clone();
        all.extend(self.local_modifications.lock().iter().cloned());
        all
    }

    pub fn has_modifications(&self) -> bool {
        !self.modifications.lock().is_empty() || !self.local_modifications.lock().is_empty()
    }

    pub fn add_lock(&self, fqn: Fqn) {
        self.locks.lock().insert(fqn);
    }

    pub fn locks(&self) -> Vec<Fqn> {
        self.locks.lock().iter().cloned().collect()
    }

    pub fn take_locks(&self) -> Vec<Fqn> {
        std::mem::take(&mut *self.locks.lock()).into_iter().collect()
    }

    /// Run `f` against the undo log.
    pub fn with_undo<R>(&self, f: impl FnOnce(&mut Vec<UndoRecord>) -> R) -> R {
        f(&mut self.undo.lock())
    }

    pub fn take_undo(&self) -> Vec<UndoRecord> {
        std::mem::take(&mut *self.undo.lock())
    }

    /// Run `f` against the optimistic workspace.
    pub fn with_workspace<R>(&self, f: impl FnOnce(&mut TransactionWorkspace) -> R) -> R {
        f(&mut self.workspace.lock())
    }

    pub fn set_prepared_versions(&self, versions: Vec<(Fqn, DataVersion)>) {
        *self.prepared_versions.lock() = versions;
    }

    pub fn prepared_versions(&self) -> Vec<(Fqn, DataVersion)> {
        self.prepared_versions.lock().clone()
    }

    pub fn set_prepare_replicated(&self) {
        self.prepare_replicated.store(true, Ordering::SeqCst);
    }

    pub fn is_prepare_replicated(&self) -> bool {
        self.prepare_replicated.load(Ordering::SeqCst)
    }

    pub fn set_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::SeqCst);
        if let Some(tx) = &self.transaction {
            tx.set_rollback_only();
        }
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }
}

/// Maps local transactions to global ones and holds their entries.
#[derive(Debug)]
pub struct TransactionTable {
    local_member: MemberId,
    next_id: AtomicU64,
    by_local: DashMap<u64, GlobalTransaction>,
    entries: DashMap<GlobalTransaction, Arc<TransactionEntry>>,
}

impl TransactionTable {
    pub fn new(local_member: MemberId) -> Self {
        Self {
            local_member,
            next_id: AtomicU64::new(0),
            by_local: DashMap::new(),
            entries: DashMap::new(),
        }
    }

    /// The global transaction for `tx`, creating and registering it on
    /// first use. The flag is true if it was just created.
    pub fn get_or_create_global(&self, tx: &Transaction) -> (Arc<TransactionEntry>, bool) {
        let gtx = self
            .by_local
            .entry(tx.id())
            .or_insert_with(|| {
                GlobalTransaction::new(
                    self.local_member,
                    self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
                )
            })
            .clone();

        let mut created = false;
        let entry = self
            .entries
            .entry(gtx.clone())
            .or_insert_with(|| {
                created = true;
                Arc::new(TransactionEntry::new(gtx.clone(), Some(tx.clone())))
            })
            .clone();
        if created {
            debug!(gtx = %gtx, tx = tx.id(), "Registered global transaction");
        }
        (entry, created)
    }

    /// Entry for a transaction started by a peer.
    pub fn get_or_create_remote(&self, gtx: &GlobalTransaction) -> Arc<TransactionEntry> {
        self.entries
            .entry(gtx.clone())
            .or_insert_with(|| {
                debug!(gtx = %gtx, "Registered remote transaction");
                Arc::new(TransactionEntry::new(gtx.clone(), None))
            })
            .clone()
    }

    pub fn get(&self, gtx: &GlobalTransaction) -> Option<Arc<TransactionEntry>> {
        self.entries.get(gtx).map(|e| e.value().clone())
    }

    /// Entry for a local transaction, if it has touched the cache.
    pub fn entry_for(&self, tx: &Transaction) -> Option<Arc<TransactionEntry>> {
        let gtx = self.local_for(tx)?;
        self.get(&gtx)
    }

    pub fn local_for(&self, tx: &Transaction) -> Option<GlobalTransaction> {
        self.by_local.get(&tx.id()).map(|g| g.value().clone())
    }

    pub fn remove(&self, gtx: &GlobalTransaction) -> Option<Arc<TransactionEntry>> {
        let (_, entry) = self.entries.remove(gtx)?;
        if let Some(tx) = entry.transaction() {
            self.by_local.remove(&tx.id());
        }
        trace!(gtx = %gtx, "Removed transaction entry");
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Transactions started by `member` that are still open here.
    pub fn remote_from(&self, member: MemberId) -> Vec<GlobalTransaction> {
        self.entries
            .iter()
            .filter(|e| e.key().origin == member && e.value().is_remote())
            .map(|e| e.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_global_per_local_transaction() {
        let table = TransactionTable::new(1);
        let tx = Transaction::new(10);

        let (first, created) = table.get_or_create_global(&tx);
        assert!(created);
        let (second, created_again) = table.get_or_create_global(&tx);
        assert!(!created_again);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.local_for(&tx), Some(first.gtx().clone()));
        assert_eq!(table.len(), 1);

        let other = Transaction::new(11);
        let (third, _) = table.get_or_create_global(&other);
        assert_ne!(third.gtx(), first.gtx());

        table.remove(first.gtx());
        assert!(table.local_for(&tx).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_transition_enforces_state_machine() {
        let table = TransactionTable::new(1);
        let entry = table.get_or_create_remote(&GlobalTransaction::new(2, 1));
        assert!(entry.is_remote());

        entry.transition(TxState::Active, TxState::Preparing).unwrap();
        assert!(entry
            .transition(TxState::Active, TxState::Preparing)
            .is_err());
        entry.transition(TxState::Preparing, TxState::Prepared).unwrap();
        assert!(entry.advance(TxState::Completed).is_err());
        assert_eq!(entry.advance(TxState::Committing).unwrap(), TxState::Prepared);
        entry.advance(TxState::Completed).unwrap();
        assert!(entry.state().is_terminal());
    }

    #[test]
    fn test_remote_from_member() {
        let table = TransactionTable::new(1);
        table.get_or_create_remote(&GlobalTransaction::new(2, 1));
        table.get_or_create_remote(&GlobalTransaction::new(3, 1));
        table.get_or_create_global(&Transaction::new(1));
        assert_eq!(table.remote_from(2), vec![GlobalTransaction::new(2, 1)]);
    }
}
