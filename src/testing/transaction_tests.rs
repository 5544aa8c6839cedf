//! Transactions under pessimistic locking.

#[cfg(test)]
mod tests {
    use crate::cache::TreeCache;
    use crate::config::{CacheConfig, LockingConfig};
    use crate::context::InvocationOptions;
    use crate::error::{Error, TransactionError};
    use crate::notifications::CacheEvent;
    use crate::testing::RecordingListener;
    use crate::tx::TransactionStatus;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_commit_applies_writes() {
        let cache = TreeCache::start(CacheConfig::default()).await.unwrap();
        let listener = Arc::new(RecordingListener::new());
        cache.add_listener(listener.clone());

        let tx = cache.begin();
        let call = cache.with_transaction(&tx);
        call.put("/accounts/1", "balance", "100").await.unwrap();
        call.put("/accounts/2", "balance", "50").await.unwrap();
        assert_eq!(
            call.get("/accounts/1", "balance").await.unwrap(),
            Some(Bytes::from("100"))
        );
        assert_eq!(cache.stats().active_transactions, 1);

        tx.commit().await.unwrap();
        assert_eq!(tx.status(), TransactionStatus::Committed);
        assert_eq!(
            cache.get("/accounts/2", "balance").await.unwrap(),
            Some(Bytes::from("50"))
        );

        let stats = cache.stats();
        assert_eq!(stats.active_transactions, 0);
        assert_eq!(stats.locks_held, 0);
        assert_eq!(stats.prepares, 1);
        assert_eq!(stats.commits, 1);
        assert_eq!(
            listener.count(|e| matches!(
                e,
                CacheEvent::TransactionCompleted {
                    committed: true,
                    ..
                }
            )),
            1
        );
    }

    #[tokio::test]
    async fn test_rollback_restores_previous_state() {
        let cache = TreeCache::start(CacheConfig::default()).await.unwrap();
        cache.put("/keep", "k", "original").await.unwrap();
        cache.put("/doomed/child", "k", "v").await.unwrap();

        let tx = cache.begin();
        let call = cache.with_transaction(&tx);
        call.put("/keep", "k", "changed").await.unwrap();
        call.put("/new/node", "k", "v").await.unwrap();
        call.remove_node("/doomed").await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(
            cache.get("/keep", "k").await.unwrap(),
            Some(Bytes::from("original"))
        );
        assert!(!cache.exists("/new").await.unwrap());
        assert_eq!(
            cache.get("/doomed/child", "k").await.unwrap(),
            Some(Bytes::from("v"))
        );
        let stats = cache.stats();
        assert_eq!(stats.rollbacks, 1);
        assert_eq!(stats.locks_held, 0);
    }

    #[tokio::test]
    async fn test_write_lock_blocks_other_writers() {
        let cache = TreeCache::start(CacheConfig::default()).await.unwrap();
        cache.put("/contended", "k", "v0").await.unwrap();

        let tx = cache.begin();
        cache
            .with_transaction(&tx)
            .put("/contended", "k", "v1")
            .await
            .unwrap();
        assert!(cache.stats().locks_held > 0);

        let impatient =
            InvocationOptions::new().with_lock_acquisition_timeout(Duration::from_millis(50));
        let err = cache
            .with_options(impatient.clone())
            .put("/contended", "k", "v2")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
        assert!(err.is_retriable());

        tx.commit().await.unwrap();
        cache
            .with_options(impatient)
            .put("/contended", "k", "v2")
            .await
            .unwrap();
        assert_eq!(
            cache.get("/contended", "k").await.unwrap(),
            Some(Bytes::from("v2"))
        );
    }

    #[tokio::test]
    async fn test_waiting_writer_proceeds_after_commit() {
        let cache = TreeCache::start(CacheConfig::default()).await.unwrap();
        cache.put("/queue", "k", "v0").await.unwrap();

        let tx = cache.begin();
        cache
            .with_transaction(&tx)
            .put("/queue", "k", "v1")
            .await
            .unwrap();

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.put("/queue", "k", "v2").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        tx.commit().await.unwrap();
        waiter.await.unwrap().unwrap();
        assert_eq!(cache.get("/queue", "k").await.unwrap(), Some(Bytes::from("v2")));
    }

    #[tokio::test]
    async fn test_rollback_only_transaction_cannot_commit() {
        let cache = TreeCache::start(CacheConfig::default()).await.unwrap();
        let tx = cache.begin();
        cache.with_transaction(&tx).put("/a", "k", "v").await.unwrap();
        tx.set_rollback_only();

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Transaction(TransactionError::RollbackOnly(_))
        ));
        assert_eq!(tx.status(), TransactionStatus::RolledBack);
        assert!(!cache.exists("/a").await.unwrap());
    }

    #[tokio::test]
    async fn test_completed_transaction_cannot_be_joined() {
        let cache = TreeCache::start(CacheConfig::default()).await.unwrap();
        let tx = cache.begin();
        tx.commit().await.unwrap();

        let err = cache
            .with_transaction(&tx)
            .put("/a", "k", "v")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transaction(TransactionError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_reads_in_transaction_see_own_writes_only() {
        let cache = TreeCache::start(CacheConfig::default()).await.unwrap();
        let tx = cache.begin();
        cache
            .with_transaction(&tx)
            .put("/private", "k", "v")
            .await
            .unwrap();

        let outside = InvocationOptions::new().with_lock_acquisition_timeout(Duration::ZERO);
        let err = cache
            .with_options(outside)
            .get("/private", "k")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));

        tx.commit().await.unwrap();
        assert_eq!(cache.get("/private", "k").await.unwrap(), Some(Bytes::from("v")));
    }

    #[tokio::test]
    async fn test_silent_failure_leaves_transaction_committable() {
        let cache = TreeCache::start(CacheConfig::default()).await.unwrap();
        let blocker = cache.begin();
        cache
            .with_transaction(&blocker)
            .put("/held", "k", "blocker")
            .await
            .unwrap();

        let tx = cache.begin();
        cache.with_transaction(&tx).put("/mine", "k", "v").await.unwrap();
        let silent = InvocationOptions::new()
            .fail_silently()
            .with_lock_acquisition_timeout(Duration::ZERO);
        let previous = cache
            .with_transaction(&tx)
            .options(silent)
            .put("/held", "k", "dropped")
            .await
            .unwrap();
        assert_eq!(previous, None);

        tx.commit().await.unwrap();
        assert_eq!(tx.status(), TransactionStatus::Committed);
        blocker.commit().await.unwrap();
        assert_eq!(cache.get("/mine", "k").await.unwrap(), Some(Bytes::from("v")));
        assert_eq!(
            cache.get("/held", "k").await.unwrap(),
            Some(Bytes::from("blocker"))
        );
    }

    #[tokio::test]
    async fn test_child_insert_write_locks_parent_when_configured() {
        let impatient =
            InvocationOptions::new().with_lock_acquisition_timeout(Duration::from_millis(50));
        for lock_parent in [false, true] {
            let mut config = CacheConfig::default();
            config.locking = LockingConfig::default().with_lock_parent_for_child_insert_remove(lock_parent);
            let cache = TreeCache::start(config).await.unwrap();
            cache.put("/p", "k", "v").await.unwrap();

            let tx = cache.begin();
            cache.with_transaction(&tx).put("/p/c", "k", "v").await.unwrap();
            let sibling = cache
                .with_options(impatient.clone())
                .put("/p/d", "k", "v")
                .await;
            if lock_parent {
                assert!(matches!(sibling, Err(Error::LockTimeout { .. })));
            } else {
                sibling.unwrap();
            }
            tx.commit().await.unwrap();
            assert!(cache.exists("/p/c").await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_forced_write_lock_on_read_excludes_readers() {
        let cache = TreeCache::start(CacheConfig::default()).await.unwrap();
        cache.put("/shared", "k", "v").await.unwrap();
        let impatient =
            InvocationOptions::new().with_lock_acquisition_timeout(Duration::from_millis(50));

        let reader = cache.begin();
        cache.with_transaction(&reader).get("/shared", "k").await.unwrap();
        cache
            .with_options(impatient.clone())
            .get("/shared", "k")
            .await
            .unwrap();
        reader.commit().await.unwrap();

        let exclusive = cache.begin();
        cache
            .with_transaction(&exclusive)
            .options(InvocationOptions::new().force_write_lock())
            .get("/shared", "k")
            .await
            .unwrap();
        let err = cache
            .with_options(impatient)
            .get("/shared", "k")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));
        exclusive.commit().await.unwrap();
        assert_eq!(cache.stats().locks_held, 0);
    }
}
