//! Per-cache shared state handed to every pipeline stage.

use crate::buddy::BuddyManager;
use crate::command::{Command, CommandResult};
use crate::config::{CacheConfig, NodeLockingScheme};
use crate::context::InvocationContext;
use crate::error::{Error, Result};
use crate::eviction::EvictionPolicy;
use crate::interceptors::InterceptorChain;
use crate::loader::CacheLoader;
use crate::lock::LockManager;
use crate::metrics::CacheMetrics;
use crate::notifications::Notifier;
use crate::replication::{ReplicationQueue, RpcManager};
use crate::tree::DataContainer;
use crate::tx::{TransactionManager, TransactionTable};
use crate::types::{CacheStatus, MemberId};
use parking_lot::RwLock;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

/// Everything a cache instance owns. Stages hold an `Arc` to it; the
/// chain is referenced weakly so stages and the chain don't keep each
/// other alive.
pub struct CacheComponents {
    pub config: CacheConfig,
    pub local_member: MemberId,
    pub container: DataContainer,
    pub lock_manager: Arc<LockManager>,
    pub tx_table: TransactionTable,
    pub tx_manager: Arc<dyn TransactionManager>,
    pub notifier: Notifier,
    pub metrics: CacheMetrics,
    pub rpc: Option<Arc<RpcManager>>,
    pub repl_queue: Option<Arc<ReplicationQueue>>,
    pub buddy: Option<Arc<BuddyManager>>,
    pub loader: Option<Arc<dyn CacheLoader>>,
    pub eviction: Option<Arc<dyn EvictionPolicy>>,
    status: RwLock<CacheStatus>,
    chain: OnceLock<Weak<InterceptorChain>>,
}

impl CacheComponents {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: CacheConfig,
        local_member: MemberId,
        tx_manager: Arc<dyn TransactionManager>,
        rpc: Option<Arc<RpcManager>>,
        repl_queue: Option<Arc<ReplicationQueue>>,
        buddy: Option<Arc<BuddyManager>>,
        loader: Option<Arc<dyn CacheLoader>>,
        eviction: Option<Arc<dyn EvictionPolicy>>,
    ) -> Self {
        let metrics = CacheMetrics::new(config.statistics_enabled);
        Self {
            config,
            local_member,
            container: DataContainer::new(),
            lock_manager: Arc::new(LockManager::new()),
            tx_table: TransactionTable::new(local_member),
            tx_manager,
            notifier: Notifier::new(),
            metrics,
            rpc,
            repl_queue,
            buddy,
            loader,
            eviction,
            status: RwLock::new(CacheStatus::Instantiated),
            chain: OnceLock::new(),
        }
    }

    pub(crate) fn set_chain(&self, chain: &Arc<InterceptorChain>) {
        let _ = self.chain.set(Arc::downgrade(chain));
    }

    /// The pipeline, as long as the cache is alive.
    pub fn chain(&self) -> Result<Arc<InterceptorChain>> {
        self.chain
            .get()
            .and_then(Weak::upgrade)
            .ok_or(Error::CacheNotRunning(CacheStatus::Stopped))
    }

    /// Run `command` through the whole pipeline with `ctx`.
    pub async fn invoke(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
    ) -> Result<CommandResult> {
        let chain = self.chain()?;
        chain.invoke(ctx, command).await
    }

    pub fn status(&self) -> CacheStatus {
        *self.status.read()
    }

    pub(crate) fn set_status(&self, status: CacheStatus) {
        *self.status.write() = status;
    }

    pub fn scheme(&self) -> NodeLockingScheme {
        self.config.locking.scheme
    }

    /// Lock wait for this call: the per-call override or the configured
    /// default.
    pub fn lock_timeout(&self, ctx: &InvocationContext) -> Duration {
        ctx.options
            .lock_acquisition_timeout
            .unwrap_or(self.config.locking.lock_acquisition_timeout)
    }

    /// Whether a call replicates synchronously, after per-call overrides.
    pub fn is_synchronous(&self, ctx: &InvocationContext) -> bool {
        if ctx.options.force_asynchronous {
            return false;
        }
        ctx.options.force_synchronous || self.config.cache_mode.is_synchronous()
    }

    pub fn sync_timeout(&self) -> Duration {
        self.config.replication.sync_repl_timeout
    }
}
