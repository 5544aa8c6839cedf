//! Local transactions and the transaction-manager capability.

use crate::error::{Error, Result, TransactionError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Status of a local transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    Active,
    MarkedRollback,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl TransactionStatus {
    /// Whether operations may still join the transaction.
    pub fn is_open(self) -> bool {
        matches!(self, TransactionStatus::Active | TransactionStatus::MarkedRollback)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionStatus::Active => "active",
            TransactionStatus::MarkedRollback => "marked rollback",
            TransactionStatus::Committing => "committing",
            TransactionStatus::Committed => "committed",
            TransactionStatus::RollingBack => "rolling back",
            TransactionStatus::RolledBack => "rolled back",
        };
        f.write_str(s)
    }
}

/// Completion callbacks registered with a transaction.
///
/// `before_completion` runs before commit; an error there rolls the
/// transaction back. `after_completion` runs once the outcome is known.
#[async_trait]
pub trait Synchronization: Send + Sync {
    async fn before_completion(&self, tx: &Transaction) -> Result<()>;

    async fn after_completion(&self, tx: &Transaction, status: TransactionStatus) -> Result<()>;
}

struct TransactionInner {
    id: u64,
    status: Mutex<TransactionStatus>,
    synchronizations: Mutex<Vec<Arc<dyn Synchronization>>>,
}

/// Handle to a local transaction. Cheap to clone.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Transaction {}

impl Transaction {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                id,
                status: Mutex::new(TransactionStatus::Active),
                synchronizations: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn status(&self) -> TransactionStatus {
        *self.inner.status.lock()
    }

    fn set_status(&self, status: TransactionStatus) {
        *self.inner.status.lock() = status;
    }

    fn invalid_state(&self, action: &'static str) -> Error {
        Error::Transaction(TransactionError::InvalidState {
            tx: format!("tx-{}", self.id()),
            state: self.status().to_string(),
            action,
        })
    }

    pub fn register_synchronization(&self, sync: Arc<dyn Synchronization>) -> Result<()> {
        if !self.status().is_open() {
            return Err(self.invalid_state("register a synchronization"));
        }
        self.inner.synchronizations.lock().push(sync);
        Ok(())
    }

    /// Mark the transaction so that it can only roll back.
    pub fn set_rollback_only(&self) {
        let mut status = self.inner.status.lock();
        if *status == TransactionStatus::Active {
            *status = TransactionStatus::MarkedRollback;
        }
    }

    pub fn is_rollback_only(&self) -> bool {
        self.status() == TransactionStatus::MarkedRollback
    }

    fn synchronizations(&self) -> Vec<Arc<dyn Synchronization>> {
        self.inner.synchronizations.lock().clone()
    }

    /// Commit: run every before-completion callback, then the
    /// after-completion callbacks with the outcome.
    ///
    /// A before-completion failure (or a rollback-only mark) rolls the
    /// transaction back and returns [`TransactionError::RolledBack`].
    pub async fn commit(&self) -> Result<()> {
        {
            let mut status = self.inner.status.lock();
            match *status {
                TransactionStatus::Active => *status = TransactionStatus::Committing,
                TransactionStatus::MarkedRollback => {}
                _ => {
                    drop(status);
                    return Err(self.invalid_state("commit"));
                }
            }
        }
        if self.is_rollback_only() {
            self.rollback().await?;
            return Err(Error::Transaction(TransactionError::RollbackOnly(format!(
                "tx-{}",
                self.id()
            ))));
        }

        let synchronizations = self.synchronizations();
        let mut failure = None;
        for sync in &synchronizations {
            if let Err(e) = sync.before_completion(self).await {
                failure = Some(e);
                break;
            }
        }

        if let Some(cause) = failure {
            debug!(tx = self.id(), error = %cause, "Commit failed in before-completion, rolling back");
            self.complete(&synchronizations, TransactionStatus::RolledBack)
                .await;
            return Err(Error::Transaction(TransactionError::RolledBack {
                tx: format!("tx-{}", self.id()),
                cause: Box::new(cause),
            }));
        }

        match self
            .complete(&synchronizations, TransactionStatus::Committed)
            .await
        {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Roll back: run the after-completion callbacks with `RolledBack`.
    pub async fn rollback(&self) -> Result<()> {
        {
            let mut status = self.inner.status.lock();
            if !status.is_open() {
                drop(status);
                return Err(self.invalid_state("roll back"));
            }
            *status = TransactionStatus::RollingBack;
        }
        let synchronizations = self.synchronizations();
        self.complete(&synchronizations, TransactionStatus::RolledBack)
            .await;
        Ok(())
    }

    /// Run after-completion callbacks and set the final status. Returns
    /// the first callback error, if any; every callback runs regardless.
    async fn complete(
        &self,
        synchronizations: &[Arc<dyn Synchronization>],
        outcome: TransactionStatus,
    ) -> Option<Error> {
        if outcome == TransactionStatus::RolledBack {
            self.set_status(TransactionStatus::RollingBack);
        }
        let mut first_error = None;
        for sync in synchronizations {
            if let Err(e) = sync.after_completion(self, outcome).await {
                warn!(tx = self.id(), %outcome, error = %e, "After-completion callback failed");
                first_error.get_or_insert(e);
            }
        }
        self.set_status(outcome);
        first_error
    }
}

/// Transaction-manager capability.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Start a new transaction.
    fn begin(&self) -> Transaction;

    async fn commit(&self, tx: &Transaction) -> Result<()> {
        tx.commit().await
    }

    async fn rollback(&self, tx: &Transaction) -> Result<()> {
        tx.rollback().await
    }

    fn set_rollback_only(&self, tx: &Transaction) {
        tx.set_rollback_only()
    }

    fn status(&self, tx: &Transaction) -> TransactionStatus {
        tx.status()
    }

    fn register_synchronization(
        &self,
        tx: &Transaction,
        sync: Arc<dyn Synchronization>,
    ) -> Result<()> {
        tx.register_synchronization(sync)
    }
}

/// In-process transaction manager handing out sequential ids.
#[derive(Debug, Default)]
pub struct LocalTransactionManager {
    next_id: AtomicU64,
}

impl LocalTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionManager for LocalTransactionManager {
    fn begin(&self) -> Transaction {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(tx = id, "Transaction started");
        Transaction::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingSync {
        fail_before: bool,
        before: AtomicUsize,
        outcomes: Mutex<Vec<TransactionStatus>>,
    }

    #[async_trait]
    impl Synchronization for RecordingSync {
        async fn before_completion(&self, _tx: &Transaction) -> Result<()> {
            self.before.fetch_add(1, Ordering::SeqCst);
            if self.fail_before {
                return Err(Error::Internal("validation failed".to_string()));
            }
            Ok(())
        }

        async fn after_completion(&self, _tx: &Transaction, status: TransactionStatus) -> Result<()> {
            self.outcomes.lock().push(status);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_commit_runs_synchronizations() {
        let tm = LocalTransactionManager::new();
        let tx = tm.begin();
        let sync = Arc::new(RecordingSync::default());
        tm.register_synchronization(&tx, sync.clone()).unwrap();

        tm.commit(&tx).await.unwrap();
        assert_eq!(sync.before.load(Ordering::SeqCst), 1);
        assert_eq!(*sync.outcomes.lock(), vec![TransactionStatus::Committed]);
        assert_eq!(tx.status(), TransactionStatus::Committed);
    }

    #[tokio::test]
    async fn test_before_completion_failure_rolls_back() {
        let tm = LocalTransactionManager::new();
        let tx = tm.begin();
        let sync = Arc::new(RecordingSync {
            fail_before: true,
            ..Default::default()
        });
        tx.register_synchronization(sync.clone()).unwrap();

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Transaction(TransactionError::RolledBack { .. })
        ));
        assert_eq!(*sync.outcomes.lock(), vec![TransactionStatus::RolledBack]);
        assert_eq!(tx.status(), TransactionStatus::RolledBack);
    }

    #[tokio::test]
    async fn test_rollback_only_refuses_commit() {
        let tm = LocalTransactionManager::new();
        let tx = tm.begin();
        let sync = Arc::new(RecordingSync::default());
        tx.register_synchronization(sync.clone()).unwrap();
        tm.set_rollback_only(&tx);

        assert!(tx.commit().await.is_err());
        assert_eq!(sync.before.load(Ordering::SeqCst), 0);
        assert_eq!(tx.status(), TransactionStatus::RolledBack);
        assert!(tx.rollback().await.is_err());
    }

    #[test]
    fn test_ids_are_sequential() {
        let tm = LocalTransactionManager::new();
        assert_eq!(tm.begin().id(), 1);
        assert_eq!(tm.begin().id(), 2);
    }
}
