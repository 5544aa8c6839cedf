//! The tree cache.
//!
//! A [`TreeCache`] is built from a [`CacheConfig`] plus optional
//! capabilities (transport, loader, eviction policy, transaction
//! manager). Starting it assembles the interceptor chain, spawns the
//! background loops (replication queue flushing, eviction, membership),
//! and attaches to the transport.
//!
//! ```rust,no_run
//! use arbor::{CacheConfig, TreeCache};
//!
//! # async fn example() -> arbor::Result<()> {
//! let cache = TreeCache::start(CacheConfig::default()).await?;
//! cache.put("/users/alice", "email", "alice@example.com").await?;
//!
//! let tx = cache.begin();
//! cache.with_transaction(&tx).put("/users/bob", "email", "bob@example.com").await?;
//! tx.commit().await?;
//!
//! assert!(cache.exists("/users/bob").await?);
//! cache.stop().await;
//! # Ok(())
//! # }
//! ```

mod components;
mod invocation;
mod membership;

pub use components::CacheComponents;
pub use invocation::Invocation;

use crate::buddy::BuddyManager;
use crate::command::{Command, CommandResult};
use crate::config::CacheConfig;
use crate::context::{InvocationContext, InvocationOptions};
use crate::error::{Error, Result};
use crate::eviction::{self, EvictionPolicy};
use crate::fqn::Fqn;
use crate::interceptors::InterceptorChain;
use crate::loader::CacheLoader;
use crate::notifications::CacheListener;
use crate::replication::{ReplicationQueue, RpcDispatcher, RpcManager};
use crate::transport::Transport;
use crate::tx::{LocalTransactionManager, Transaction, TransactionManager};
use crate::types::{AttributeMap, CacheStats, CacheStatus, MemberId};
use bytes::Bytes;
use membership::MembershipListener;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Builder for a [`TreeCache`].
pub struct TreeCacheBuilder {
    config: CacheConfig,
    transport: Option<Arc<dyn Transport>>,
    loader: Option<Arc<dyn CacheLoader>>,
    eviction: Option<Arc<dyn EvictionPolicy>>,
    listeners: Vec<Arc<dyn CacheListener>>,
    tx_manager: Option<Arc<dyn TransactionManager>>,
}

impl TreeCacheBuilder {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            transport: None,
            loader: None,
            eviction: None,
            listeners: Vec::new(),
            tx_manager: None,
        }
    }

    /// Group communication for clustered modes. Ignored by local caches.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn CacheLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_eviction_policy(mut self, policy: Arc<dyn EvictionPolicy>) -> Self {
        self.eviction = Some(policy);
        self
    }

    /// Listener registered before the cache starts, so it sees the
    /// initial view.
    pub fn with_listener(mut self, listener: Arc<dyn CacheListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Defaults to a [`LocalTransactionManager`].
    pub fn with_transaction_manager(mut self, manager: Arc<dyn TransactionManager>) -> Self {
        self.tx_manager = Some(manager);
        self
    }

    /// Validate the configuration, assemble the pipeline and start the
    /// cache.
    pub async fn start(self) -> Result<TreeCache> {
        let config = self.config;
        config.validate()?;
        if config.loader.passivation && self.loader.is_none() {
            return Err(Error::Config(
                "passivation requires a cache loader".to_string(),
            ));
        }
        let transport = match (config.cache_mode.is_clustered(), self.transport) {
            (true, None) => {
                return Err(Error::Config(format!(
                    "cache mode {:?} requires a transport",
                    config.cache_mode
                )))
            }
            (true, transport) => transport,
            (false, _) => None,
        };

        let local_member = transport.as_ref().map_or(0, |t| t.local_member());
        let buddy = config
            .buddy_replication
            .enabled
            .then(|| Arc::new(BuddyManager::new(local_member, &config.buddy_replication)));
        let rpc = transport
            .as_ref()
            .map(|t| Arc::new(RpcManager::new(t.clone(), buddy.clone())));
        let repl_queue = match &rpc {
            Some(rpc) if config.replication.use_repl_queue => Some(Arc::new(ReplicationQueue::new(
                rpc.clone(),
                config.replication.repl_queue_max_elements,
                config.replication.sync_repl_timeout,
            ))),
            _ => None,
        };
        let tx_manager = self
            .tx_manager
            .unwrap_or_else(|| Arc::new(LocalTransactionManager::new()));

        let components = Arc::new(CacheComponents::new(
            config,
            local_member,
            tx_manager,
            rpc,
            repl_queue,
            buddy,
            self.loader,
            self.eviction,
        ));
        for listener in self.listeners {
            components.notifier.add_listener(listener);
        }
        components.set_status(CacheStatus::Starting);

        let chain = Arc::new(InterceptorChain::build(&components));
        components.set_chain(&chain);
        info!(
            member = local_member,
            mode = ?components.config.cache_mode,
            scheme = ?components.scheme(),
            chain = ?chain,
            "Starting tree cache"
        );

        let mut background = Vec::new();
        if let Some(queue) = &components.repl_queue {
            let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
            let interval = components.config.replication.repl_queue_interval;
            let handle = tokio::spawn(queue.clone().run_flush_loop(interval, shutdown_rx));
            background.push(BackgroundTask::new("replication-queue", shutdown_tx, handle));
        }
        if let Some(policy) = &components.eviction {
            let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
            let handle = tokio::spawn(eviction::run_eviction_loop(
                Arc::downgrade(&components),
                policy.clone(),
                components.config.eviction.wakeup_interval,
                shutdown_rx,
            ));
            background.push(BackgroundTask::new("eviction", shutdown_tx, handle));
        }

        components.set_status(CacheStatus::Running);

        if let Some(transport) = &transport {
            transport.set_handler(Arc::new(RpcDispatcher::new(&components)));
            let views = transport.subscribe();
            let mut listener = MembershipListener::new(&components);
            listener.on_view(transport.members()).await;

            let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
            let handle = tokio::spawn(listener.run(views, shutdown_rx));
            background.push(BackgroundTask::new("membership", shutdown_tx, handle));
        }

        info!(member = local_member, "Tree cache started");
        Ok(TreeCache {
            inner: Arc::new(CacheInner {
                components,
                chain,
                transport,
                background: Mutex::new(background),
            }),
        })
    }
}

struct BackgroundTask {
    name: &'static str,
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    fn new(name: &'static str, shutdown_tx: mpsc::Sender<()>, handle: JoinHandle<()>) -> Self {
        Self {
            name,
            shutdown_tx,
            handle,
        }
    }
}

struct CacheInner {
    components: Arc<CacheComponents>,
    // Owns the pipeline; stages only hold it weakly.
    chain: Arc<InterceptorChain>,
    transport: Option<Arc<dyn Transport>>,
    background: Mutex<Vec<BackgroundTask>>,
}

/// A tree-structured, transactional, optionally replicated cache.
///
/// Cheap to clone; clones share the same cache.
#[derive(Clone)]
pub struct TreeCache {
    inner: Arc<CacheInner>,
}

impl TreeCache {
    pub fn builder(config: CacheConfig) -> TreeCacheBuilder {
        TreeCacheBuilder::new(config)
    }

    /// Start a cache with no plugged-in capabilities.
    pub async fn start(config: CacheConfig) -> Result<TreeCache> {
        TreeCacheBuilder::new(config).start().await
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.components.config
    }

    pub fn status(&self) -> CacheStatus {
        self.inner.components.status()
    }

    pub fn local_member(&self) -> MemberId {
        self.inner.components.local_member
    }

    /// Current view, this member included.
    pub fn members(&self) -> Vec<MemberId> {
        match &self.inner.transport {
            Some(transport) => transport.members(),
            None => vec![self.local_member()],
        }
    }

    /// This member's buddies, under buddy replication.
    pub fn buddies(&self) -> Vec<MemberId> {
        self.inner
            .components
            .buddy
            .as_ref()
            .map(|b| b.buddies())
            .unwrap_or_default()
    }

    /// Handle for calls with default options outside any transaction.
    pub fn invocation(&self) -> Invocation<'_> {
        Invocation::new(self)
    }

    /// Handle for calls with per-call overrides.
    pub fn with_options(&self, options: InvocationOptions) -> Invocation<'_> {
        Invocation::new(self).options(options)
    }

    /// Handle for calls that join `tx`.
    pub fn with_transaction(&self, tx: &Transaction) -> Invocation<'_> {
        Invocation::new(self).transaction(tx)
    }

    /// Begin a transaction with the cache's transaction manager.
    pub fn begin(&self) -> Transaction {
        self.inner.components.tx_manager.begin()
    }

    pub fn transaction_manager(&self) -> Arc<dyn TransactionManager> {
        self.inner.components.tx_manager.clone()
    }

    /// Run one command through the pipeline.
    pub async fn invoke(
        &self,
        command: &Command,
        options: InvocationOptions,
        transaction: Option<Transaction>,
    ) -> Result<CommandResult> {
        let status = self.status();
        if !status.allows_invocations() {
            return Err(Error::CacheNotRunning(status));
        }
        let mut ctx = InvocationContext::local(options, transaction);
        self.inner.chain.invoke(&mut ctx, command).await
    }

    /// Start a batch: calls made with the returned transaction are
    /// applied together by [`TreeCache::end_batch`].
    pub fn start_batch(&self) -> Transaction {
        let tx = self.begin();
        debug!(tx = tx.id(), "Batch started");
        tx
    }

    /// Apply (`success`) or discard a batch.
    pub async fn end_batch(&self, batch: &Transaction, success: bool) -> Result<()> {
        if success {
            self.inner.components.tx_manager.commit(batch).await
        } else {
            self.inner.components.tx_manager.rollback(batch).await
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn CacheListener>) {
        self.inner.components.notifier.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn CacheListener>) {
        self.inner.components.notifier.remove_listener(listener);
    }

    pub fn stats(&self) -> CacheStats {
        let components = &self.inner.components;
        components.metrics.snapshot(
            components.container.node_count(),
            components.lock_manager.lock_count(),
            components.tx_table.len(),
        )
    }

    pub fn reset_statistics(&self) {
        self.inner.components.metrics.reset();
    }

    /// Send everything waiting in the replication queue now.
    pub async fn flush_replication_queue(&self) -> Result<usize> {
        match &self.inner.components.repl_queue {
            Some(queue) => queue.flush().await,
            None => Ok(0),
        }
    }

    /// Stop the cache: drain the replication queue, stop background
    /// loops and detach from the transport. Later calls fail with
    /// [`Error::CacheNotRunning`].
    pub async fn stop(&self) {
        let components = &self.inner.components;
        if matches!(
            components.status(),
            CacheStatus::Stopping | CacheStatus::Stopped
        ) {
            return;
        }
        info!(member = components.local_member, "Stopping tree cache");
        components.set_status(CacheStatus::Stopping);

        let tasks: Vec<BackgroundTask> = std::mem::take(&mut *self.inner.background.lock());
        for task in tasks {
            let _ = task.shutdown_tx.send(()).await;
            if let Err(e) = task.handle.await {
                warn!(task = task.name, error = %e, "Background task failed");
            }
        }
        if let Some(transport) = &self.inner.transport {
            transport.clear_handler();
        }

        components.set_status(CacheStatus::Stopped);
        info!(member = components.local_member, "Tree cache stopped");
    }

    // Shortcuts for calls without options or transaction.

    pub async fn put(
        &self,
        fqn: impl Into<Fqn>,
        key: impl Into<String>,
        value: impl Into<Bytes>,
    ) -> Result<Option<Bytes>> {
        self.invocation().put(fqn, key, value).await
    }

    pub async fn put_all(&self, fqn: impl Into<Fqn>, data: AttributeMap) -> Result<()> {
        self.invocation().put_all(fqn, data).await
    }

    pub async fn get(&self, fqn: impl Into<Fqn>, key: impl Into<String>) -> Result<Option<Bytes>> {
        self.invocation().get(fqn, key).await
    }

    pub async fn get_data(&self, fqn: impl Into<Fqn>) -> Result<Option<AttributeMap>> {
        self.invocation().get_data(fqn).await
    }

    pub async fn exists(&self, fqn: impl Into<Fqn>) -> Result<bool> {
        self.invocation().exists(fqn).await
    }

    pub async fn remove(&self, fqn: impl Into<Fqn>, key: impl Into<String>) -> Result<Option<Bytes>> {
        self.invocation().remove(fqn, key).await
    }

    pub async fn remove_node(&self, fqn: impl Into<Fqn>) -> Result<bool> {
        self.invocation().remove_node(fqn).await
    }

    pub async fn move_node(&self, from: impl Into<Fqn>, to_parent: impl Into<Fqn>) -> Result<()> {
        self.invocation().move_node(from, to_parent).await
    }

    pub async fn evict(&self, fqn: impl Into<Fqn>, recursive: bool) -> Result<bool> {
        self.invocation().evict(fqn, recursive).await
    }

    pub async fn put_for_external_read(
        &self,
        fqn: impl Into<Fqn>,
        key: impl Into<String>,
        value: impl Into<Bytes>,
    ) -> Result<()> {
        self.invocation().put_for_external_read(fqn, key, value).await
    }
}

impl fmt::Debug for TreeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let components = &self.inner.components;
        f.debug_struct("TreeCache")
            .field("member", &components.local_member)
            .field("status", &components.status())
            .field("mode", &components.config.cache_mode)
            .field("nodes", &components.container.node_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheMode, LoaderConfig};
    use crate::loader::InMemoryCacheLoader;

    #[tokio::test]
    async fn test_start_and_stop() {
        let cache = TreeCache::start(CacheConfig::default()).await.unwrap();
        assert_eq!(cache.status(), CacheStatus::Running);
        assert_eq!(cache.members(), vec![0]);

        cache.put("/a", "k", "v").await.unwrap();
        cache.stop().await;
        assert_eq!(cache.status(), CacheStatus::Stopped);

        let err = cache.get("/a", "k").await.unwrap_err();
        assert!(matches!(err, Error::CacheNotRunning(CacheStatus::Stopped)));
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_clustered_mode_requires_transport() {
        let err = TreeCache::start(CacheConfig::new(CacheMode::ReplSync))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_passivation_requires_loader() {
        let config = CacheConfig::default().with_loader(LoaderConfig::default().with_passivation(true));
        let err = TreeCache::start(config.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let cache = TreeCache::builder(config)
            .with_loader(Arc::new(InMemoryCacheLoader::new()))
            .start()
            .await
            .unwrap();
        assert_eq!(cache.status(), CacheStatus::Running);
    }

    #[tokio::test]
    async fn test_batch_applies_together() {
        let cache = TreeCache::start(CacheConfig::default()).await.unwrap();
        let batch = cache.start_batch();
        cache.with_transaction(&batch).put("/a", "k", "1").await.unwrap();
        cache.with_transaction(&batch).put("/b", "k", "2").await.unwrap();
        cache.end_batch(&batch, false).await.unwrap();
        assert!(!cache.exists("/a").await.unwrap());

        let batch = cache.start_batch();
        cache.with_transaction(&batch).put("/a", "k", "1").await.unwrap();
        cache.end_batch(&batch, true).await.unwrap();
        assert_eq!(cache.get("/a", "k").await.unwrap(), Some(Bytes::from("1")));
        assert_eq!(cache.stats().active_transactions, 0);
    }
}
