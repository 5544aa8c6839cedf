//! Local cache operations: the tree API, events, statistics and
//! per-call options.

#[cfg(test)]
mod tests {
    use crate::cache::TreeCache;
    use crate::config::CacheConfig;
    use crate::error::Error;
    use crate::fqn::Fqn;
    use crate::notifications::{CacheEvent, CacheListener};
    use crate::testing::RecordingListener;
    use crate::types::AttributeMap;
    use bytes::Bytes;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_put_and_read_back() {
        let cache = TreeCache::start(CacheConfig::default()).await.unwrap();

        assert_eq!(cache.put("/a/b", "k1", "v1").await.unwrap(), None);
        assert_eq!(
            cache.put("/a/b", "k1", "v2").await.unwrap(),
            Some(Bytes::from("v1"))
        );
        cache.put("/a/c", "k", "v").await.unwrap();

        assert_eq!(
            cache.get("/a/b", "k1").await.unwrap(),
            Some(Bytes::from("v2"))
        );
        assert_eq!(cache.get("/a/b", "missing").await.unwrap(), None);
        assert_eq!(cache.get("/nowhere", "k").await.unwrap(), None);
        assert!(cache.exists("/a").await.unwrap());

        let invocation = cache.invocation();
        assert_eq!(
            invocation.get_children_names("/a").await.unwrap(),
            Some(names(&["b", "c"]))
        );
        assert_eq!(
            invocation.get_keys("/a/b").await.unwrap(),
            Some(names(&["k1"]))
        );
        assert_eq!(invocation.get_keys("/nowhere").await.unwrap(), None);

        let data = cache.get_data("/a/b").await.unwrap().unwrap();
        assert_eq!(data.get("k1"), Some(&Bytes::from("v2")));
    }

    #[tokio::test]
    async fn test_put_all_and_replace_all() {
        let cache = TreeCache::start(CacheConfig::default()).await.unwrap();
        cache.put("/n", "old", "1").await.unwrap();

        let data = AttributeMap::from([("new".to_string(), Bytes::from("2"))]);
        cache.put_all("/n", data.clone()).await.unwrap();
        assert_eq!(
            cache.invocation().get_keys("/n").await.unwrap(),
            Some(names(&["new", "old"]))
        );

        cache.invocation().replace_all("/n", data).await.unwrap();
        assert_eq!(
            cache.invocation().get_keys("/n").await.unwrap(),
            Some(names(&["new"]))
        );

        cache.invocation().clear_data("/n").await.unwrap();
        assert_eq!(cache.get_data("/n").await.unwrap(), Some(AttributeMap::new()));
        assert!(cache.exists("/n").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_key_and_node() {
        let cache = TreeCache::start(CacheConfig::default()).await.unwrap();
        cache.put("/a/b/c", "k", "v").await.unwrap();
        cache.put("/a/b", "k", "v").await.unwrap();

        assert_eq!(cache.remove("/a/b", "k").await.unwrap(), Some(Bytes::from("v")));
        assert_eq!(cache.remove("/a/b", "k").await.unwrap(), None);

        assert!(cache.remove_node("/a/b").await.unwrap());
        assert!(!cache.exists("/a/b/c").await.unwrap());
        assert!(cache.exists("/a").await.unwrap());
        assert!(!cache.remove_node("/a/b").await.unwrap());
    }

    #[tokio::test]
    async fn test_move_subtree() {
        let cache = TreeCache::start(CacheConfig::default()).await.unwrap();
        cache.put("/src/item/child", "k", "v").await.unwrap();
        cache.put("/dst", "k", "v").await.unwrap();

        cache.move_node("/src/item", "/dst").await.unwrap();
        assert!(!cache.exists("/src/item").await.unwrap());
        assert_eq!(
            cache.get("/dst/item/child", "k").await.unwrap(),
            Some(Bytes::from("v"))
        );

        let err = cache.move_node("/dst/item", "/missing").await.unwrap_err();
        assert!(matches!(err, Error::NodeNotExists(_)));
    }

    #[tokio::test]
    async fn test_evict_local_node() {
        let cache = TreeCache::start(CacheConfig::default()).await.unwrap();
        cache.put("/parent", "k", "v").await.unwrap();
        cache.put("/parent/leaf", "k", "v").await.unwrap();

        assert!(cache.evict("/parent/leaf", false).await.unwrap());
        assert!(!cache.exists("/parent/leaf").await.unwrap());

        cache.put("/parent/leaf", "k", "v").await.unwrap();
        assert!(cache.evict("/parent", true).await.unwrap());
        assert!(!cache.exists("/parent/leaf").await.unwrap());
        assert!(!cache.evict("/parent/leaf", false).await.unwrap());
        assert_eq!(cache.stats().evictions, 3);
    }

    #[tokio::test]
    async fn test_put_for_external_read_never_overwrites() {
        let cache = TreeCache::start(CacheConfig::default()).await.unwrap();
        cache.put_for_external_read("/ext", "k", "first").await.unwrap();
        cache.put_for_external_read("/ext", "k", "second").await.unwrap();
        assert_eq!(cache.get("/ext", "k").await.unwrap(), Some(Bytes::from("first")));

        // Not part of the caller's transaction: survives its rollback.
        let tx = cache.begin();
        cache
            .with_transaction(&tx)
            .put_for_external_read("/ext2", "k", "v")
            .await
            .unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(cache.get("/ext2", "k").await.unwrap(), Some(Bytes::from("v")));
    }

    #[tokio::test]
    async fn test_listener_events() {
        let cache = TreeCache::start(CacheConfig::default()).await.unwrap();
        let listener = Arc::new(RecordingListener::new());
        cache.add_listener(listener.clone());

        cache.put("/a/b", "k", "v").await.unwrap();
        cache.remove_node("/a").await.unwrap();
        assert_eq!(
            listener.events(),
            vec![
                CacheEvent::NodeCreated(Fqn::parse("/a")),
                CacheEvent::NodeCreated(Fqn::parse("/a/b")),
                CacheEvent::NodeModified(Fqn::parse("/a/b")),
                CacheEvent::NodeRemoved(Fqn::parse("/a")),
            ]
        );
        assert!(listener.remote_events().is_empty());

        let as_listener: Arc<dyn CacheListener> = listener.clone();
        cache.remove_listener(&as_listener);
        listener.clear();
        cache.put("/c", "k", "v").await.unwrap();
        assert!(listener.events().is_empty());
    }

    #[tokio::test]
    async fn test_statistics() {
        let cache = TreeCache::start(CacheConfig::default()).await.unwrap();
        cache.put("/a", "k", "v").await.unwrap();
        cache.get("/a", "k").await.unwrap();
        cache.get("/a", "other").await.unwrap();
        cache.remove("/a", "k").await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.stores, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.removes, 1);
        assert_eq!(stats.hit_ratio(), 0.5);
        assert_eq!(stats.locks_held, 0);
        assert_eq!(stats.node_count, 2);

        cache.reset_statistics();
        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.stores, 0);
        assert_eq!(stats.node_count, 2);
    }

    #[tokio::test]
    async fn test_statistics_can_be_disabled() {
        let cache = TreeCache::start(CacheConfig::default().with_statistics(false))
            .await
            .unwrap();
        cache.put("/a", "k", "v").await.unwrap();
        cache.get("/a", "k").await.unwrap();
        assert_eq!(cache.stats().stores, 0);
        assert_eq!(cache.stats().hits, 0);
    }
}
