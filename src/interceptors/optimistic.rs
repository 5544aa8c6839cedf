//! Stages for the optimistic and MVCC schemes.

use super::{Interceptor, Next};
use crate::cache::CacheComponents;
use crate::command::{Command, CommandResult};
use crate::config::NodeLockingScheme;
use crate::context::InvocationContext;
use crate::error::Result;
use crate::fqn::Fqn;
use crate::lock::{LockMode, LockOwner};
use crate::tx::TransactionEntry;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace};

/// Validates workspaces at prepare under short write locks, applies them
/// at commit and discards them at rollback.
pub struct OptimisticValidatorInterceptor {
    components: Arc<CacheComponents>,
}

impl OptimisticValidatorInterceptor {
    pub fn new(components: Arc<CacheComponents>) -> Self {
        Self { components }
    }

    async fn prepare(&self, ctx: &mut InvocationContext, entry: &TransactionEntry) -> Result<()> {
        let container = &self.components.container;
        let owner = ctx.lock_owner();
        let timeout = self.components.lock_timeout(ctx);
        for fqn in entry.with_workspace(|w| w.lock_set()) {
            self.components
                .lock_manager
                .acquire(&fqn, &owner, LockMode::Write, timeout)
                .await?;
            entry.add_lock(fqn);
        }

        entry.with_workspace(|w| {
            w.validate(container)?;
            w.compute_versions(container)
        })?;
        let versions = entry.with_workspace(|w| w.new_versions());
        debug!(gtx = %entry.gtx(), nodes = versions.len(), "Workspace validated");
        entry.set_prepared_versions(versions);
        Ok(())
    }

    fn release(&self, entry: &TransactionEntry) {
        let locks = entry.take_locks();
        self.components
            .lock_manager
            .release_all(locks.iter(), &LockOwner::Transaction(entry.gtx().clone()));
    }

    /// Maintenance commands outside a transaction still exclude
    /// concurrent commits of the same nodes.
    async fn lock_for_maintenance(
        &self,
        ctx: &mut InvocationContext,
        fqn: &Fqn,
        subtree: bool,
    ) -> Result<()> {
        let targets = if subtree {
            self.components.container.subtree_fqns(fqn)
        } else {
            vec![fqn.clone()]
        };
        let owner = ctx.lock_owner();
        let timeout = self.components.lock_timeout(ctx);
        for target in targets {
            self.components
                .lock_manager
                .acquire(&target, &owner, LockMode::Write, timeout)
                .await?;
            ctx.record_call_lock(target, &self.components.lock_manager);
        }
        Ok(())
    }
}

#[async_trait]
impl Interceptor for OptimisticValidatorInterceptor {
    fn name(&self) -> &'static str {
        "optimistic-validator"
    }

    async fn invoke(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        let entry = ctx.entry().cloned();
        match (command, entry) {
            (Command::Prepare { .. }, Some(entry)) => {
                self.prepare(ctx, &entry).await?;
                next.invoke(ctx, command).await
            }
            (Command::Commit { .. }, Some(entry)) => {
                let events = entry.with_workspace(|w| w.commit(&self.components.container));
                trace!(gtx = %entry.gtx(), events = events.len(), "Workspace committed");
                ctx.note_created(&events);
                self.components
                    .notifier
                    .notify_all(&events, ctx.is_origin_local());
                let result = next.invoke(ctx, command).await;
                self.release(&entry);
                result
            }
            (Command::Rollback { .. }, Some(entry)) => {
                entry.with_workspace(|w| w.clear());
                let result = next.invoke(ctx, command).await;
                self.release(&entry);
                result
            }
            (Command::Evict { fqn, recursive }, None) if !ctx.options.suppress_locking => {
                self.lock_for_maintenance(ctx, fqn, *recursive).await?;
                next.invoke(ctx, command).await
            }
            (Command::Invalidate { fqn, .. }, None) if !ctx.options.suppress_locking => {
                self.lock_for_maintenance(ctx, fqn, true).await?;
                next.invoke(ctx, command).await
            }
            _ => next.invoke(ctx, command).await,
        }
    }
}

/// Answers reads and absorbs writes from the transaction's workspace, so
/// nothing reaches the tree before commit.
pub struct OptimisticNodeInterceptor {
    components: Arc<CacheComponents>,
}

impl OptimisticNodeInterceptor {
    pub fn new(components: Arc<CacheComponents>) -> Self {
        Self { components }
    }
}

#[async_trait]
impl Interceptor for OptimisticNodeInterceptor {
    fn name(&self) -> &'static str {
        "optimistic-node"
    }

    async fn invoke(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        let Some(entry) = ctx.entry().cloned() else {
            return next.invoke(ctx, command).await;
        };
        if !command.is_write() && !command.is_read() {
            return next.invoke(ctx, command).await;
        }

        let container = &self.components.container;
        let mvcc = self.components.scheme() == NodeLockingScheme::Mvcc;
        let explicit_version = ctx.options.data_version.clone();
        entry.with_workspace(|w| {
            w.set_mvcc(mvcc);
            Ok(match command {
                Command::GetKeyValue { fqn, key } => CommandResult::Value(w.get(container, fqn, key)),
                Command::GetData { fqn } => CommandResult::Data(w.get_data(container, fqn)),
                Command::GetKeys { fqn } => CommandResult::Names(w.get_keys(container, fqn)),
                Command::GetChildrenNames { fqn } => {
                    CommandResult::Names(w.children_names(container, fqn))
                }
                Command::Exists { fqn } => CommandResult::Bool(w.exists(container, fqn)),
                write => return w.apply_write(container, write, explicit_version.as_ref()),
            })
        })
    }
}
