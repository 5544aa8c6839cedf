//! Buddy replication and data gravitation.

#[cfg(test)]
mod tests {
    use crate::buddy::BuddyManager;
    use crate::config::{BuddyReplicationConfig, CacheConfig, CacheMode};
    use crate::context::InvocationOptions;
    use crate::fqn::Fqn;
    use crate::notifications::CacheEvent;
    use crate::testing::{wait_until, RecordingListener, TestCluster};
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn config() -> CacheConfig {
        with_buddies(BuddyReplicationConfig::enabled(1))
    }

    fn with_buddies(buddies: BuddyReplicationConfig) -> CacheConfig {
        CacheConfig::new(CacheMode::ReplSync)
            .with_buddy_replication(buddies.with_auto_data_gravitation(true))
    }

    fn no_gravitation() -> InvocationOptions {
        InvocationOptions::new().skip_data_gravitation()
    }

    /// Start three members and wait for the ring 0 -> 1 -> 2 -> 0.
    async fn ring() -> TestCluster {
        settled(TestCluster::start(3, config()).await.unwrap()).await
    }

    async fn settled(cluster: TestCluster) -> TestCluster {
        for index in 0..3 {
            let cache = cluster.cache(index).clone();
            let expected = vec![cluster.member((index + 1) % 3)];
            assert!(
                wait_until(
                    || {
                        let settled = cache.buddies() == expected;
                        async move { settled }
                    },
                    WAIT
                )
                .await
            );
        }
        cluster
    }

    async fn holds(cluster: &TestCluster, index: usize, fqn: &Fqn) -> bool {
        cluster
            .cache(index)
            .with_options(no_gravitation())
            .exists(fqn.clone())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_writes_are_backed_up_on_buddy_only() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .try_init();

        let cluster = ring().await;
        cluster.cache(0).put("/data", "k", "v").await.unwrap();

        let backup = BuddyManager::backup_fqn_for(cluster.member(0), &Fqn::parse("/data"));
        assert!(holds(&cluster, 1, &backup).await);
        assert_eq!(
            cluster
                .cache(1)
                .with_options(no_gravitation())
                .get(backup, "k")
                .await
                .unwrap(),
            Some(Bytes::from("v"))
        );
        assert!(!holds(&cluster, 1, &Fqn::parse("/data")).await);
        assert!(!holds(&cluster, 2, &Fqn::parse("/data")).await);
        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_read_miss_gravitates_data() {
        let cluster = ring().await;
        cluster.cache(0).put("/data/item", "k", "v").await.unwrap();

        assert_eq!(
            cluster.cache(2).get("/data/item", "k").await.unwrap(),
            Some(Bytes::from("v"))
        );
        assert!(cluster.cache(2).stats().gravitations >= 1);

        // The old owner and its buddy drop their copies; the new owner's
        // buddy now holds the backup.
        let data = Fqn::parse("/data/item");
        assert!(!holds(&cluster, 0, &data).await);
        let old_backup = BuddyManager::backup_fqn_for(cluster.member(0), &data);
        assert!(!holds(&cluster, 1, &old_backup).await);
        let new_backup = BuddyManager::backup_fqn_for(cluster.member(2), &data);
        assert!(holds(&cluster, 0, &new_backup).await);
        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_skip_option_prevents_gravitation() {
        let cluster = ring().await;
        cluster.cache(0).put("/data", "k", "v").await.unwrap();

        assert_eq!(
            cluster
                .cache(2)
                .with_options(no_gravitation())
                .get("/data", "k")
                .await
                .unwrap(),
            None
        );
        assert!(holds(&cluster, 0, &Fqn::parse("/data")).await);
        assert_eq!(cluster.cache(2).stats().gravitations, 0);
        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_data_survives_owner_failure() {
        let cluster = ring().await;
        cluster.cache(0).put("/data", "k", "v").await.unwrap();

        cluster.kill(0).await;
        let survivor = cluster.cache(2).clone();
        let expected = vec![cluster.member(1)];
        assert!(
            wait_until(
                || {
                    let settled = survivor.buddies() == expected;
                    async move { settled }
                },
                WAIT
            )
            .await
        );

        assert_eq!(
            cluster.cache(2).get("/data", "k").await.unwrap(),
            Some(Bytes::from("v"))
        );
        let old_backup = BuddyManager::backup_fqn_for(cluster.member(0), &Fqn::parse("/data"));
        assert!(!holds(&cluster, 1, &old_backup).await);
        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_new_buddy_receives_state() {
        let mut cluster = TestCluster::start(1, config()).await.unwrap();
        cluster.cache(0).put("/early", "k", "v").await.unwrap();

        let joined = cluster.add_member().await.unwrap().clone();
        let owner = cluster.member(0);
        let backup = BuddyManager::backup_fqn_for(owner, &Fqn::parse("/early"));
        assert!(
            wait_until(
                || {
                    let joined = joined.clone();
                    let backup = backup.clone();
                    async move {
                        joined
                            .with_options(InvocationOptions::new().skip_data_gravitation())
                            .exists(backup)
                            .await
                            .unwrap_or(false)
                    }
                },
                WAIT
            )
            .await
        );
        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_owner_evicts_instead_of_removing_when_configured() {
        let listener = Arc::new(RecordingListener::new());
        let owner_listener = listener.clone();
        let cluster = TestCluster::start_with(
            3,
            with_buddies(BuddyReplicationConfig::enabled(1).with_remove_on_find(false)),
            move |index, builder| {
                if index == 0 {
                    builder.with_listener(owner_listener.clone())
                } else {
                    builder
                }
            },
        )
        .await
        .unwrap();
        let cluster = settled(cluster).await;
        cluster.cache(0).put("/data/item", "k", "v").await.unwrap();

        assert_eq!(
            cluster.cache(2).get("/data/item", "k").await.unwrap(),
            Some(Bytes::from("v"))
        );
        let data = Fqn::parse("/data/item");
        assert!(
            wait_until(
                || {
                    let evicted = listener.count(|e| *e == CacheEvent::NodeEvicted(data.clone()));
                    async move { evicted == 1 }
                },
                WAIT
            )
            .await
        );
        assert_eq!(listener.count(|e| *e == CacheEvent::NodeRemoved(data.clone())), 0);
        assert!(!holds(&cluster, 0, &data).await);
        assert!(cluster.cache(0).stats().evictions >= 1);
        cluster.stop().await;
    }
}
