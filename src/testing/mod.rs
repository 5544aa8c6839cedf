//! Testing utilities for the tree cache.
//!
//! - [`TestCluster`] starts several caches over one in-process
//!   [`LocalCluster`] and can kill or partition members.
//! - [`RecordingListener`] keeps every event it receives.
//! - [`InMemoryCacheLoader`] is a loader backed by a map.
//!
//! # Example
//!
//! ```rust,no_run
//! use arbor::testing::TestCluster;
//! use arbor::{CacheConfig, CacheMode};
//!
//! # async fn example() -> arbor::Result<()> {
//! let cluster = TestCluster::start(3, CacheConfig::new(CacheMode::ReplSync)).await?;
//! cluster.cache(0).put("/a", "k", "v").await?;
//! assert!(cluster.cache(2).get("/a", "k").await?.is_some());
//! cluster.stop().await;
//! # Ok(())
//! # }
//! ```

mod basic_tests;
mod buddy_tests;
mod optimistic_tests;
mod transaction_tests;

pub use crate::loader::InMemoryCacheLoader;

use crate::cache::{TreeCache, TreeCacheBuilder};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::notifications::{CacheEvent, CacheListener};
use crate::transport::LocalCluster;
use crate::types::MemberId;
use parking_lot::Mutex;
use std::future::Future;
use std::time::{Duration, Instant};

/// Listener that records every event along with its origin flag.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<(CacheEvent, bool)>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.lock().iter().map(|(e, _)| e.clone()).collect()
    }

    /// Events triggered by peers.
    pub fn remote_events(&self) -> Vec<CacheEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(_, local)| !local)
            .map(|(e, _)| e.clone())
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&CacheEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|(e, _)| predicate(e)).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl CacheListener for RecordingListener {
    fn on_event(&self, event: &CacheEvent, origin_local: bool) {
        self.events.lock().push((event.clone(), origin_local));
    }
}

/// Several caches sharing one [`LocalCluster`].
pub struct TestCluster {
    cluster: LocalCluster,
    config: CacheConfig,
    caches: Vec<TreeCache>,
}

impl TestCluster {
    /// Start `size` members with the same configuration.
    pub async fn start(size: usize, config: CacheConfig) -> Result<Self> {
        Self::start_with(size, config, |_, builder| builder).await
    }

    /// Start `size` members, letting `customize` add capabilities to each
    /// member's builder. The closure gets the member's index.
    pub async fn start_with<F>(size: usize, config: CacheConfig, customize: F) -> Result<Self>
    where
        F: Fn(usize, TreeCacheBuilder) -> TreeCacheBuilder,
    {
        let mut test_cluster = Self {
            cluster: LocalCluster::new(),
            config,
            caches: Vec::with_capacity(size),
        };
        for index in 0..size {
            let builder = TreeCache::builder(test_cluster.config.clone())
                .with_transport(test_cluster.cluster.join());
            let cache = customize(index, builder).start().await?;
            test_cluster.caches.push(cache);
        }
        Ok(test_cluster)
    }

    /// Start one more member.
    pub async fn add_member(&mut self) -> Result<&TreeCache> {
        let cache = TreeCache::builder(self.config.clone())
            .with_transport(self.cluster.join())
            .start()
            .await?;
        self.caches.push(cache);
        Ok(&self.caches[self.caches.len() - 1])
    }

    pub fn cache(&self, index: usize) -> &TreeCache {
        &self.caches[index]
    }

    pub fn caches(&self) -> &[TreeCache] {
        &self.caches
    }

    pub fn member(&self, index: usize) -> MemberId {
        self.caches[index].local_member()
    }

    pub fn cluster(&self) -> &LocalCluster {
        &self.cluster
    }

    /// Stop a member and remove it from the view. The cache stays in the
    /// list so indexes don't shift.
    pub async fn kill(&self, index: usize) {
        let cache = &self.caches[index];
        cache.stop().await;
        self.cluster.leave(cache.local_member());
    }

    /// Cut (or restore) traffic to and from a member without changing
    /// the view.
    pub fn set_reachable(&self, index: usize, reachable: bool) {
        self.cluster
            .set_reachable(self.caches[index].local_member(), reachable);
    }

    pub async fn stop(&self) {
        for cache in &self.caches {
            cache.stop().await;
        }
    }
}

/// Poll `check` until it returns true or `timeout` passes. Returns the
/// last answer.
pub async fn wait_until<F, Fut>(mut check: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    loop {
        if check().await {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
