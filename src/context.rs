//! Per-invocation state passed explicitly through the interceptor chain.

use crate::fqn::Fqn;
use crate::lock::{LockManager, LockOwner, LockScope};
use crate::notifications::CacheEvent;
use crate::tree::UndoRecord;
use crate::tx::{GlobalTransaction, Transaction, TransactionEntry};
use crate::types::MemberId;
use crate::version::DataVersion;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

static NEXT_INVOCATION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-call overrides of the cache's configured behaviour.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvocationOptions {
    /// Apply locally only; never propagate to peers.
    pub cache_mode_local: bool,
    /// Replicate synchronously regardless of the cache mode.
    pub force_synchronous: bool,
    /// Replicate asynchronously regardless of the cache mode.
    pub force_asynchronous: bool,
    /// Turn failures into a no-op instead of failing the call or
    /// aborting the enclosing transaction.
    pub fail_silently: bool,
    /// Take no locks.
    pub suppress_locking: bool,
    /// Take write locks even for reads.
    pub force_write_lock: bool,
    /// Explicit version for the node written by this call.
    pub data_version: Option<DataVersion>,
    /// Override of the configured lock acquisition timeout.
    pub lock_acquisition_timeout: Option<Duration>,
    /// Don't consult the cache loader.
    pub skip_cache_loading: bool,
    /// Don't gravitate on a miss.
    pub skip_data_gravitation: bool,
    /// Gravitate on a miss even without auto gravitation.
    pub force_data_gravitation: bool,
}

impl InvocationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_mode_local(mut self) -> Self {
        self.cache_mode_local = true;
        self
    }

    pub fn force_synchronous(mut self) -> Self {
        self.force_synchronous = true;
        self.force_asynchronous = false;
        self
    }

    pub fn force_asynchronous(mut self) -> Self {
        self.force_asynchronous = true;
        self.force_synchronous = false;
        self
    }

    pub fn fail_silently(mut self) -> Self {
        self.fail_silently = true;
        self
    }

    pub fn suppress_locking(mut self) -> Self {
        self.suppress_locking = true;
        self
    }

    pub fn force_write_lock(mut self) -> Self {
        self.force_write_lock = true;
        self
    }

    pub fn with_data_version(mut self, version: DataVersion) -> Self {
        self.data_version = Some(version);
        self
    }

    pub fn with_lock_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.lock_acquisition_timeout = Some(timeout);
        self
    }

    pub fn skip_cache_loading(mut self) -> Self {
        self.skip_cache_loading = true;
        self
    }

    pub fn skip_data_gravitation(mut self) -> Self {
        self.skip_data_gravitation = true;
        self
    }

    pub fn force_data_gravitation(mut self) -> Self {
        self.force_data_gravitation = true;
        self
    }
}

/// State of one top-level call, created at entry and dropped at exit.
///
/// Nested commands issued by a stage (gravitation installs, implicit
/// transactions) reuse the same context. Locks taken outside a
/// transaction live in the context's [`LockScope`] and are released when
/// the context is dropped.
#[derive(Debug)]
pub struct InvocationContext {
    id: u64,
    pub options: InvocationOptions,
    transaction: Option<Transaction>,
    entry: Option<Arc<TransactionEntry>>,
    origin: Option<MemberId>,
    lock_scope: Option<LockScope>,
    /// Inverse of writes applied outside a transaction while their
    /// synchronous propagation is pending.
    call_undo: Option<Vec<UndoRecord>>,
    /// Nodes this call brought into the tree, parents first.
    created: Vec<Fqn>,
}

impl InvocationContext {
    /// Context for a call made by a local caller.
    pub fn local(options: InvocationOptions, transaction: Option<Transaction>) -> Self {
        Self {
            id: NEXT_INVOCATION_ID.fetch_add(1, Ordering::Relaxed),
            options,
            transaction,
            entry: None,
            origin: None,
            lock_scope: None,
            call_undo: None,
            created: Vec::new(),
        }
    }

    /// Context for a command received from `origin`. Remote commands never
    /// propagate further.
    pub fn remote(origin: MemberId) -> Self {
        let mut ctx = Self::local(InvocationOptions::new().cache_mode_local(), None);
        ctx.origin = Some(origin);
        ctx
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_origin_local(&self) -> bool {
        self.origin.is_none()
    }

    /// The member that sent this command, for remote calls.
    pub fn origin(&self) -> Option<MemberId> {
        self.origin
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    pub fn set_transaction(&mut self, transaction: Option<Transaction>) {
        self.transaction = transaction;
    }

    pub fn entry(&self) -> Option<&Arc<TransactionEntry>> {
        self.entry.as_ref()
    }

    pub fn set_entry(&mut self, entry: Option<Arc<TransactionEntry>>) {
        self.entry = entry;
    }

    pub fn gtx(&self) -> Option<&GlobalTransaction> {
        self.entry.as_ref().map(|e| e.gtx())
    }

    /// Whether this call runs inside a (local or remote) transaction.
    pub fn in_transaction(&self) -> bool {
        self.entry.is_some()
    }

    /// Who owns locks taken by this call.
    pub fn lock_owner(&self) -> LockOwner {
        match &self.entry {
            Some(entry) => LockOwner::Transaction(entry.gtx().clone()),
            None => LockOwner::Invocation(self.id),
        }
    }

    /// Remember a lock so it is released at the right time: at
    /// transaction completion, or when this call ends.
    pub fn record_lock(&mut self, fqn: Fqn, manager: &Arc<LockManager>) {
        match &self.entry {
            Some(entry) => entry.add_lock(fqn),
            None => self.record_call_lock(fqn, manager),
        }
    }

    /// Record a lock that belongs to this call only, even inside a
    /// transaction.
    pub fn record_call_lock(&mut self, fqn: Fqn, manager: &Arc<LockManager>) {
        let owner = self.lock_owner();
        self.lock_scope
            .get_or_insert_with(|| LockScope::new(manager.clone()))
            .record(fqn, owner);
    }

    /// Locks this call holds outside any transaction.
    pub fn call_locks(&self) -> Vec<Fqn> {
        self.lock_scope
            .as_ref()
            .map(|s| s.held())
            .unwrap_or_default()
    }

    /// Start recording undo records for writes applied outside a
    /// transaction. Returns false if an enclosing command already records
    /// them, in which case that command owns the log.
    pub fn begin_call_undo(&mut self) -> bool {
        if self.call_undo.is_some() {
            return false;
        }
        self.call_undo = Some(Vec::new());
        true
    }

    /// The undo log started by [`begin_call_undo`](Self::begin_call_undo).
    pub fn call_undo_mut(&mut self) -> Option<&mut Vec<UndoRecord>> {
        self.call_undo.as_mut()
    }

    /// Stop recording and hand back what was recorded.
    pub fn end_call_undo(&mut self) -> Vec<UndoRecord> {
        self.call_undo.take().unwrap_or_default()
    }

    /// Remember the nodes created by an applied command.
    pub fn note_created(&mut self, events: &[CacheEvent]) {
        self.created.extend(events.iter().filter_map(|e| match e {
            CacheEvent::NodeCreated(fqn) => Some(fqn.clone()),
            _ => None,
        }));
    }

    /// Nodes created since the last call, parents first.
    pub fn take_created(&mut self) -> Vec<Fqn> {
        std::mem::take(&mut self.created)
    }

    /// Release the call-scoped locks now.
    pub fn release_call_locks(&mut self) {
        if let Some(scope) = self.lock_scope.as_mut() {
            scope.release_all();
        }
    }
}
