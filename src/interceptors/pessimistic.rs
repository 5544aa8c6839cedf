//! Node locking for the pessimistic scheme.

use super::{Interceptor, Next};
use crate::cache::CacheComponents;
use crate::command::{Command, CommandResult};
use crate::context::InvocationContext;
use crate::error::Result;
use crate::fqn::Fqn;
use crate::lock::{IsolationLevel, LockMode, LockOwner};
use crate::tree::undo::undo_all;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::trace;

/// How long an acquired lock is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    /// Until the transaction completes (or the call ends, outside one).
    Owner,
    /// Until the call ends, even inside a transaction.
    Call,
}

/// Acquires node locks before the command reaches the tree, and releases
/// or rolls back at transaction completion.
pub struct PessimisticLockInterceptor {
    components: Arc<CacheComponents>,
}

impl PessimisticLockInterceptor {
    pub fn new(components: Arc<CacheComponents>) -> Self {
        Self { components }
    }

    fn isolation(&self) -> IsolationLevel {
        self.components.config.locking.isolation_level
    }

    fn lock_parent(&self) -> bool {
        self.components
            .config
            .locking
            .lock_parent_for_child_insert_remove
    }

    async fn acquire(
        &self,
        ctx: &mut InvocationContext,
        fqn: &Fqn,
        mode: LockMode,
        hold: Hold,
    ) -> Result<()> {
        let manager = &self.components.lock_manager;
        let owner = ctx.lock_owner();
        let already_held = manager.holds_lock(fqn, &owner);
        manager
            .acquire(fqn, &owner, mode, self.components.lock_timeout(ctx))
            .await?;
        match hold {
            Hold::Owner => ctx.record_lock(fqn.clone(), manager),
            Hold::Call if !already_held => ctx.record_call_lock(fqn.clone(), manager),
            Hold::Call => {}
        }
        Ok(())
    }

    /// Read locks on every ancestor of `fqn`, with `parent_mode` for the
    /// immediate parent.
    async fn lock_ancestors(
        &self,
        ctx: &mut InvocationContext,
        fqn: &Fqn,
        parent_mode: LockMode,
        hold: Hold,
    ) -> Result<()> {
        if fqn.is_root() {
            return Ok(());
        }
        let parent = fqn.parent();
        for ancestor in fqn.ancestors() {
            let mode = if ancestor == parent {
                parent_mode
            } else {
                LockMode::Read
            };
            self.acquire(ctx, &ancestor, mode, hold).await?;
        }
        Ok(())
    }

    async fn lock_for_read(&self, ctx: &mut InvocationContext, fqn: &Fqn) -> Result<()> {
        let isolation = self.isolation();
        let mode = if ctx.options.force_write_lock || isolation == IsolationLevel::Serializable {
            LockMode::Write
        } else if isolation.locks_reads() {
            LockMode::Read
        } else {
            return Ok(());
        };
        let hold = if mode == LockMode::Write || isolation.holds_read_locks() {
            Hold::Owner
        } else {
            Hold::Call
        };
        if isolation.locks_ancestors() {
            self.lock_ancestors(ctx, fqn, LockMode::Read, hold).await?;
        }
        self.acquire(ctx, fqn, mode, hold).await
    }

    /// Write-lock `fqn` (and its subtree if asked), read-locking the path
    /// down to it. The parent is write-locked instead when configured and
    /// the command inserts or removes a child.
    async fn lock_for_write(
        &self,
        ctx: &mut InvocationContext,
        fqn: &Fqn,
        subtree: bool,
        changes_structure: bool,
    ) -> Result<()> {
        let parent_mode = if changes_structure && self.lock_parent() {
            LockMode::Write
        } else {
            LockMode::Read
        };
        self.lock_ancestors(ctx, fqn, parent_mode, Hold::Owner)
            .await?;
        self.acquire(ctx, fqn, LockMode::Write, Hold::Owner).await?;
        if subtree {
            for descendant in self.components.container.subtree_fqns(fqn).iter().skip(1) {
                self.acquire(ctx, descendant, LockMode::Write, Hold::Owner)
                    .await?;
            }
        }
        Ok(())
    }

    async fn lock_subtree(&self, ctx: &mut InvocationContext, fqn: &Fqn) -> Result<()> {
        for target in self.components.container.subtree_fqns(fqn) {
            self.acquire(ctx, &target, LockMode::Write, Hold::Owner)
                .await?;
        }
        Ok(())
    }

    async fn acquire_for(&self, ctx: &mut InvocationContext, command: &Command) -> Result<()> {
        let container = &self.components.container;
        match command {
            Command::GetKeyValue { fqn, .. }
            | Command::GetData { fqn }
            | Command::GetKeys { fqn }
            | Command::GetChildrenNames { fqn }
            | Command::Exists { fqn } => self.lock_for_read(ctx, fqn).await,

            Command::PutKeyValue { fqn, .. }
            | Command::PutDataMap { fqn, .. }
            | Command::RemoveKey { fqn, .. }
            | Command::ClearData { fqn } => {
                let creates = !container.exists(fqn);
                self.lock_for_write(ctx, fqn, false, creates).await
            }

            Command::RemoveNode { fqn } => self.lock_for_write(ctx, fqn, true, true).await,

            Command::Move { from, to_parent } => {
                self.lock_for_write(ctx, from, true, true).await?;
                self.lock_for_write(ctx, to_parent, false, false).await?;
                if let Some(name) = from.last_element() {
                    self.lock_subtree(ctx, &to_parent.child(name)).await?;
                }
                Ok(())
            }

            Command::Evict { fqn, recursive } => {
                if *recursive {
                    self.lock_subtree(ctx, fqn).await
                } else {
                    self.acquire(ctx, fqn, LockMode::Write, Hold::Owner).await
                }
            }

            Command::Invalidate { fqn, .. } => self.lock_subtree(ctx, fqn).await,

            // Gravitation reads snapshots and cleanup issues its own
            // commands; boundaries are handled in `invoke`.
            Command::GravitateData { .. }
            | Command::DataGravitationCleanup { .. }
            | Command::Prepare { .. }
            | Command::Commit { .. }
            | Command::Rollback { .. } => Ok(()),
        }
    }

    fn release_transaction_locks(&self, ctx: &InvocationContext) {
        let Some(entry) = ctx.entry() else {
            return;
        };
        let locks = entry.take_locks();
        trace!(gtx = %entry.gtx(), count = locks.len(), "Releasing transaction locks");
        self.components
            .lock_manager
            .release_all(locks.iter(), &LockOwner::Transaction(entry.gtx().clone()));
    }
}

#[async_trait]
impl Interceptor for PessimisticLockInterceptor {
    fn name(&self) -> &'static str {
        "pessimistic-lock"
    }

    async fn invoke(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        match command {
            Command::Commit { .. } => {
                let result = next.invoke(ctx, command).await;
                self.release_transaction_locks(ctx);
                return result;
            }
            Command::Rollback { .. } => {
                if let Some(entry) = ctx.entry() {
                    undo_all(entry.take_undo(), &self.components.container);
                }
                let result = next.invoke(ctx, command).await;
                self.release_transaction_locks(ctx);
                return result;
            }
            _ => {}
        }

        if !ctx.options.suppress_locking && self.isolation().acquires_locks() {
            self.acquire_for(ctx, command).await?;
        }
        next.invoke(ctx, command).await
    }
}
