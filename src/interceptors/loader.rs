//! Read-through, write-through and passivation against the cache loader.

use super::{Interceptor, Next};
use crate::buddy::BuddyManager;
use crate::cache::CacheComponents;
use crate::command::{Command, CommandResult};
use crate::context::InvocationContext;
use crate::error::Result;
use crate::fqn::Fqn;
use crate::loader::CacheLoader;
use crate::notifications::CacheEvent;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace};

/// Loads node data from the loader when a command needs a node that is
/// missing, tombstoned, or was evicted.
pub struct CacheLoaderInterceptor {
    components: Arc<CacheComponents>,
    loader: Arc<dyn CacheLoader>,
}

impl CacheLoaderInterceptor {
    pub fn new(components: Arc<CacheComponents>, loader: Arc<dyn CacheLoader>) -> Self {
        Self { components, loader }
    }

    fn passivation(&self) -> bool {
        self.components.config.loader.passivation
    }

    /// The path whose data must be in memory before `command` runs.
    fn load_target(command: &Command) -> Option<&Fqn> {
        match command {
            Command::GetKeyValue { fqn, .. }
            | Command::GetData { fqn }
            | Command::GetKeys { fqn }
            | Command::GetChildrenNames { fqn }
            | Command::Exists { fqn }
            | Command::PutKeyValue { fqn, .. }
            | Command::RemoveKey { fqn, .. }
            | Command::PutDataMap {
                fqn,
                erase_contents: false,
                ..
            } => Some(fqn),
            Command::Move { from, .. } => Some(from),
            _ => None,
        }
    }

    async fn load_if_needed(&self, ctx: &InvocationContext, fqn: &Fqn) -> Result<()> {
        let container = &self.components.container;
        let existing = container.peek(fqn);
        let needs_load = match &existing {
            Some(node) => !node.is_valid() || !node.is_data_loaded(),
            None => true,
        };
        if !needs_load || BuddyManager::is_backup_fqn(fqn) {
            return Ok(());
        }
        if let Some(entry) = ctx.entry() {
            if entry.with_workspace(|w| w.node(fqn).is_some()) {
                return Ok(());
            }
        }

        let Some(data) = self.loader.load(fqn).await? else {
            if let Some(node) = existing.filter(|n| n.is_valid()) {
                node.set_data_loaded(true);
            }
            return Ok(());
        };

        let (node, _) = container.get_or_create(fqn);
        node.set_valid(true);
        node.put_all_absent(&data);
        node.set_data_loaded(true);
        trace!(fqn = %fqn, keys = data.len(), "Loaded node");

        let mut events = vec![CacheEvent::NodeLoaded(fqn.clone())];
        if self.passivation() {
            self.loader.remove(fqn).await?;
            events.push(CacheEvent::NodeActivated(fqn.clone()));
        }
        self.components
            .notifier
            .notify_all(&events, ctx.is_origin_local());
        Ok(())
    }
}

#[async_trait]
impl Interceptor for CacheLoaderInterceptor {
    fn name(&self) -> &'static str {
        "cache-loader"
    }

    async fn invoke(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        if !ctx.options.skip_cache_loading {
            if let Some(fqn) = Self::load_target(command) {
                self.load_if_needed(ctx, fqn).await?;
            }
        }
        next.invoke(ctx, command).await
    }
}

/// Persists completed writes. Without passivation every write goes to
/// the loader once the call (or its transaction) completes; with
/// passivation only evictions store and removals delete.
pub struct CacheStoreInterceptor {
    components: Arc<CacheComponents>,
    loader: Arc<dyn CacheLoader>,
}

impl CacheStoreInterceptor {
    pub fn new(components: Arc<CacheComponents>, loader: Arc<dyn CacheLoader>) -> Self {
        Self { components, loader }
    }

    fn passivation(&self) -> bool {
        self.components.config.loader.passivation
    }

    /// A shared store is written by the member that made the change only.
    fn should_store(&self, ctx: &InvocationContext) -> bool {
        ctx.is_origin_local() || !self.components.config.loader.shared
    }

    async fn persist(&self, command: &Command) -> Result<()> {
        let container = &self.components.container;
        match command {
            Command::RemoveNode { fqn } => self.loader.remove(fqn).await,
            Command::Move { from, to_parent } => {
                self.loader.remove(from).await?;
                if self.passivation() {
                    return Ok(());
                }
                if let Some(name) = from.last_element() {
                    for snapshot in container.snapshot_subtree(&to_parent.child(name)) {
                        self.loader.store(&snapshot.fqn, &snapshot.attributes).await?;
                    }
                }
                Ok(())
            }
            _ if self.passivation() => Ok(()),
            Command::PutKeyValue { fqn, .. }
            | Command::PutDataMap { fqn, .. }
            | Command::RemoveKey { fqn, .. }
            | Command::ClearData { fqn } => match container.peek_valid(fqn) {
                Some(node) => self.loader.store(fqn, &node.data()).await,
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }

    async fn passivate(&self, ctx: &InvocationContext, fqn: &Fqn, recursive: bool) -> Result<()> {
        let container = &self.components.container;
        let targets = if recursive {
            container.subtree_fqns(fqn)
        } else {
            vec![fqn.clone()]
        };
        let mut events = Vec::new();
        for target in targets {
            if target.is_root() || BuddyManager::is_backup_fqn(&target) {
                continue;
            }
            let Some(node) = container.peek_valid(&target) else {
                continue;
            };
            if !node.is_data_loaded() {
                continue;
            }
            self.loader.store(&target, &node.data()).await?;
            events.push(CacheEvent::NodePassivated(target));
        }
        self.components
            .notifier
            .notify_all(&events, ctx.is_origin_local());
        Ok(())
    }
}

#[async_trait]
impl Interceptor for CacheStoreInterceptor {
    fn name(&self) -> &'static str {
        if self.passivation() {
            "passivation"
        } else {
            "cache-store"
        }
    }

    async fn invoke(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        match command {
            Command::Evict { fqn, recursive } if self.passivation() => {
                self.passivate(ctx, fqn, *recursive).await?;
                next.invoke(ctx, command).await
            }
            Command::Commit { .. } => {
                let entry = ctx.entry().cloned();
                let result = next.invoke(ctx, command).await?;
                if let Some(entry) = entry.filter(|_| self.should_store(ctx)) {
                    let modifications = entry.all_modifications();
                    debug!(gtx = %entry.gtx(), count = modifications.len(), "Persisting transaction writes");
                    for modification in &modifications {
                        self.persist(modification).await?;
                    }
                }
                Ok(result)
            }
            c if c.is_write() => {
                let result = next.invoke(ctx, command).await?;
                if !ctx.in_transaction() && self.should_store(ctx) {
                    self.persist(command).await?;
                }
                Ok(result)
            }
            _ => next.invoke(ctx, command).await,
        }
    }
}
