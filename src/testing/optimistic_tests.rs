//! Optimistic and MVCC schemes: workspaces, validation at prepare and
//! implicit transactions.

#[cfg(test)]
mod tests {
    use crate::cache::TreeCache;
    use crate::config::{CacheConfig, NodeLockingScheme};
    use crate::context::InvocationOptions;
    use crate::error::{Error, TransactionError};
    use crate::notifications::CacheEvent;
    use crate::testing::RecordingListener;
    use crate::version::DataVersion;
    use bytes::Bytes;
    use std::sync::Arc;

    async fn start(scheme: NodeLockingScheme) -> TreeCache {
        TreeCache::start(CacheConfig::default().with_locking_scheme(scheme))
            .await
            .unwrap()
    }

    fn is_version_conflict(err: &Error) -> bool {
        match err {
            Error::Transaction(TransactionError::RolledBack { cause, .. }) => {
                matches!(**cause, Error::VersionConflict { .. })
            }
            _ => false,
        }
    }

    #[tokio::test]
    async fn test_writes_stay_private_until_commit() {
        let cache = start(NodeLockingScheme::Optimistic).await;
        let tx = cache.begin();
        let call = cache.with_transaction(&tx);
        call.put("/a/b", "k", "v").await.unwrap();

        assert_eq!(call.get("/a/b", "k").await.unwrap(), Some(Bytes::from("v")));
        assert!(call.exists("/a").await.unwrap());
        assert!(!cache.exists("/a").await.unwrap());
        assert_eq!(cache.stats().locks_held, 0);

        tx.commit().await.unwrap();
        assert_eq!(cache.get("/a/b", "k").await.unwrap(), Some(Bytes::from("v")));
    }

    #[tokio::test]
    async fn test_rollback_discards_workspace() {
        let cache = start(NodeLockingScheme::Optimistic).await;
        cache.put("/a", "k", "v1").await.unwrap();

        let tx = cache.begin();
        let call = cache.with_transaction(&tx);
        call.put("/a", "k", "v2").await.unwrap();
        call.remove_node("/a").await.unwrap();
        assert!(!call.exists("/a").await.unwrap());
        tx.rollback().await.unwrap();

        assert_eq!(cache.get("/a", "k").await.unwrap(), Some(Bytes::from("v1")));
    }

    #[tokio::test]
    async fn test_stale_read_fails_validation() {
        let cache = start(NodeLockingScheme::Optimistic).await;
        cache.put("/a", "k", "v0").await.unwrap();

        let tx = cache.begin();
        let call = cache.with_transaction(&tx);
        assert_eq!(call.get("/a", "k").await.unwrap(), Some(Bytes::from("v0")));

        // Commits at once in its own implicit transaction.
        cache.put("/a", "k", "other").await.unwrap();

        call.put("/a", "k", "mine").await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(is_version_conflict(&err), "unexpected error: {err}");
        assert!(err.is_retriable());
        assert_eq!(cache.get("/a", "k").await.unwrap(), Some(Bytes::from("other")));
        assert_eq!(cache.stats().active_transactions, 0);
        assert_eq!(cache.stats().locks_held, 0);
    }

    #[tokio::test]
    async fn test_sibling_inserts_conflict_on_parent() {
        let cache = start(NodeLockingScheme::Optimistic).await;
        let first = cache.begin();
        let second = cache.begin();
        cache.with_transaction(&first).put("/x", "k", "1").await.unwrap();
        cache.with_transaction(&second).put("/y", "k", "2").await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(is_version_conflict(&err));
        assert!(cache.exists("/x").await.unwrap());
        assert!(!cache.exists("/y").await.unwrap());
    }

    #[tokio::test]
    async fn test_mvcc_allows_sibling_inserts() {
        let cache = start(NodeLockingScheme::Mvcc).await;
        let first = cache.begin();
        let second = cache.begin();
        cache.with_transaction(&first).put("/x", "k", "1").await.unwrap();
        cache.with_transaction(&second).put("/y", "k", "2").await.unwrap();

        first.commit().await.unwrap();
        second.commit().await.unwrap();
        assert_eq!(cache.get("/x", "k").await.unwrap(), Some(Bytes::from("1")));
        assert_eq!(cache.get("/y", "k").await.unwrap(), Some(Bytes::from("2")));
    }

    #[tokio::test]
    async fn test_mvcc_detects_concurrent_write() {
        let cache = start(NodeLockingScheme::Mvcc).await;
        cache.put("/a", "k", "v0").await.unwrap();

        let tx = cache.begin();
        cache.with_transaction(&tx).put("/a", "k", "mine").await.unwrap();
        cache.put("/a", "k", "other").await.unwrap();

        let err = tx.commit().await.unwrap_err();
        assert!(is_version_conflict(&err));
        assert_eq!(cache.get("/a", "k").await.unwrap(), Some(Bytes::from("other")));
    }

    #[tokio::test]
    async fn test_mvcc_write_after_stale_read_is_rejected() {
        let cache = start(NodeLockingScheme::Mvcc).await;
        cache.put("/y", "k", "v1").await.unwrap();

        let tx = cache.begin();
        let call = cache.with_transaction(&tx);
        assert_eq!(call.get("/y", "k").await.unwrap(), Some(Bytes::from("v1")));

        cache.put("/y", "k", "other").await.unwrap();
        // Repeat reads keep seeing the value first read.
        assert_eq!(call.get("/y", "k").await.unwrap(), Some(Bytes::from("v1")));

        call.put("/y", "k", "mine").await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(is_version_conflict(&err), "unexpected error: {err}");
        assert_eq!(cache.get("/y", "k").await.unwrap(), Some(Bytes::from("other")));
    }

    #[tokio::test]
    async fn test_mvcc_read_only_transaction_commits() {
        let cache = start(NodeLockingScheme::Mvcc).await;
        cache.put("/y", "k", "v1").await.unwrap();

        let tx = cache.begin();
        let call = cache.with_transaction(&tx);
        assert_eq!(call.get("/y", "k").await.unwrap(), Some(Bytes::from("v1")));
        cache.put("/y", "k", "other").await.unwrap();

        tx.commit().await.unwrap();
        assert_eq!(cache.get("/y", "k").await.unwrap(), Some(Bytes::from("other")));
    }

    #[tokio::test]
    async fn test_explicit_version_of_wrong_kind_is_rejected() {
        let cache = start(NodeLockingScheme::Optimistic).await;
        cache.put("/a", "k", "v0").await.unwrap();

        let err = cache
            .with_options(InvocationOptions::new().with_data_version(DataVersion::custom("ts", 1)))
            .put("/a", "k", "v1")
            .await
            .unwrap_err();
        assert!(
            matches!(err.root_cause(), Error::VersionTypeMismatch { .. }),
            "unexpected error: {err}"
        );
        assert_eq!(cache.get("/a", "k").await.unwrap(), Some(Bytes::from("v0")));
    }

    #[tokio::test]
    async fn test_implicit_transaction_applies_immediately() {
        let cache = start(NodeLockingScheme::Optimistic).await;
        let listener = Arc::new(RecordingListener::new());
        cache.add_listener(listener.clone());

        assert_eq!(cache.put("/a", "k", "v").await.unwrap(), None);
        assert_eq!(cache.get("/a", "k").await.unwrap(), Some(Bytes::from("v")));
        assert_eq!(cache.stats().commits, 1);
        assert_eq!(
            listener.count(|e| matches!(e, CacheEvent::TransactionCompleted { committed: true, .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_mvcc_rejects_parent_locking() {
        let mut config = CacheConfig::default().with_locking_scheme(NodeLockingScheme::Mvcc);
        config.locking = config.locking.with_lock_parent_for_child_insert_remove(true);
        let err = TreeCache::start(config).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedConfiguration(_)));
    }
}
