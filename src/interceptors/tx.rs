//! Transaction association and completion.

use super::{Interceptor, Next};
use crate::cache::CacheComponents;
use crate::command::{Command, CommandResult};
use crate::context::{InvocationContext, InvocationOptions};
use crate::error::{Error, Result, TransactionError};
use crate::fqn::Fqn;
use crate::notifications::CacheEvent;
use crate::tx::{
    GlobalTransaction, Synchronization, Transaction, TransactionEntry, TransactionStatus, TxState,
};
use crate::version::DataVersion;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Binds calls to their global transaction, records modifications, and
/// drives the prepare/commit/rollback state machine for local and remote
/// transactions alike.
pub struct TxInterceptor {
    components: Arc<CacheComponents>,
}

impl TxInterceptor {
    pub fn new(components: Arc<CacheComponents>) -> Self {
        Self { components }
    }

    /// Register `tx` with the cache on first use and attach its entry to
    /// the context.
    fn associate(&self, ctx: &mut InvocationContext, tx: &Transaction) -> Result<()> {
        if !tx.status().is_open() {
            return Err(Error::Transaction(TransactionError::InvalidState {
                tx: format!("tx-{}", tx.id()),
                state: tx.status().to_string(),
                action: "join",
            }));
        }
        let (entry, created) = self.components.tx_table.get_or_create_global(tx);
        if created {
            tx.register_synchronization(Arc::new(CacheSynchronization {
                components: self.components.clone(),
                gtx: entry.gtx().clone(),
            }))?;
        }
        ctx.set_entry(Some(entry));
        Ok(())
    }

    async fn invoke_in_transaction(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        let Some(entry) = ctx.entry().cloned() else {
            return next.invoke(ctx, command).await;
        };
        match next.invoke(ctx, command).await {
            Ok(result) => {
                if command.is_write() && ctx.is_origin_local() {
                    entry.add_modification(command.clone(), ctx.options.cache_mode_local);
                }
                Ok(result)
            }
            Err(e) if ctx.options.fail_silently => {
                warn!(gtx = %entry.gtx(), command = %command, error = %e, "Failing silently");
                Ok(CommandResult::None)
            }
            Err(e) => {
                if e.forces_rollback() {
                    debug!(gtx = %entry.gtx(), error = %e, "Marking transaction rollback-only");
                    entry.set_rollback_only();
                }
                Err(e)
            }
        }
    }

    /// A write under a workspace scheme with no transaction runs in a
    /// transaction of its own, completed before the call returns.
    async fn invoke_implicit(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        let tx = self.components.tx_manager.begin();
        trace!(tx = tx.id(), command = %command, "Running write in an implicit transaction");
        ctx.set_transaction(Some(tx.clone()));
        let result = match self.associate(ctx, &tx) {
            Ok(()) => self.invoke_in_transaction(ctx, command, next).await,
            Err(e) => Err(e),
        };
        ctx.set_entry(None);
        ctx.set_transaction(None);

        match result {
            Ok(result) => match tx.commit().await {
                Ok(()) => Ok(result),
                Err(e) if ctx.options.fail_silently => {
                    warn!(command = %command, error = %e, "Failing silently");
                    Ok(CommandResult::None)
                }
                Err(e) => Err(e),
            },
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(tx = tx.id(), error = %rollback, "Implicit transaction rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Run one boundary command for `entry`, moving it through the state
    /// machine.
    async fn run_phase(
        &self,
        entry: &Arc<TransactionEntry>,
        ctx: &mut InvocationContext,
        command: &Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        let metrics = &self.components.metrics;
        match command {
            Command::Prepare { .. } => {
                entry.transition(TxState::Active, TxState::Preparing)?;
                metrics.count(&metrics.prepares);
                let result = next.invoke(ctx, command).await?;
                entry.transition(TxState::Preparing, TxState::Prepared)?;
                Ok(result)
            }
            Command::Commit { .. } => {
                entry.advance(TxState::Committing)?;
                let result = next.invoke(ctx, command).await;
                entry.advance(TxState::Completed)?;
                metrics.count(&metrics.commits);
                result
            }
            Command::Rollback { .. } => {
                if entry.state().is_terminal() {
                    return Ok(CommandResult::None);
                }
                entry.advance(TxState::RollingBack)?;
                let result = next.invoke(ctx, command).await;
                entry.advance(TxState::Completed)?;
                metrics.count(&metrics.rollbacks);
                result
            }
            _ => next.invoke(ctx, command).await,
        }
    }

    fn finish(&self, entry: &TransactionEntry, committed: bool, origin_local: bool) {
        self.components.tx_table.remove(entry.gtx());
        self.components.notifier.notify(
            &CacheEvent::TransactionCompleted {
                gtx: entry.gtx().clone(),
                committed,
            },
            origin_local,
        );
    }

    /// Prepare, commit or rollback sent by the transaction's originator.
    async fn remote_boundary(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        match command {
            Command::Prepare {
                gtx,
                modifications,
                versions,
                one_phase,
            } => {
                let entry = self.components.tx_table.get_or_create_remote(gtx);
                ctx.set_entry(Some(entry.clone()));

                let prepared = self
                    .replay_prepare(&entry, ctx, command, modifications, versions, next)
                    .await;
                if let Err(e) = prepared {
                    debug!(gtx = %gtx, error = %e, "Remote prepare failed, rolling back");
                    let rollback = Command::Rollback { gtx: gtx.clone() };
                    if let Err(rollback_err) = self.run_phase(&entry, ctx, &rollback, next).await {
                        warn!(gtx = %gtx, error = %rollback_err, "Rollback after failed prepare failed");
                    }
                    self.finish(&entry, false, false);
                    return Err(e);
                }

                if *one_phase {
                    let commit = Command::Commit { gtx: gtx.clone() };
                    let committed = self.run_phase(&entry, ctx, &commit, next).await;
                    self.finish(&entry, committed.is_ok(), false);
                    committed?;
                }
                Ok(CommandResult::None)
            }
            Command::Commit { gtx } | Command::Rollback { gtx } => {
                let Some(entry) = self.components.tx_table.get(gtx) else {
                    debug!(gtx = %gtx, command = %command, "No such transaction here, ignoring");
                    return Ok(CommandResult::None);
                };
                ctx.set_entry(Some(entry.clone()));
                let result = self.run_phase(&entry, ctx, command, next).await;
                let committed = matches!(command, Command::Commit { .. }) && result.is_ok();
                self.finish(&entry, committed, false);
                result
            }
            _ => next.invoke(ctx, command).await,
        }
    }

    /// Re-execute the originator's writes against the remote entry, then
    /// prepare it.
    async fn replay_prepare(
        &self,
        entry: &Arc<TransactionEntry>,
        ctx: &mut InvocationContext,
        prepare: &Command,
        modifications: &[Command],
        versions: &[(Fqn, DataVersion)],
        next: Next<'_>,
    ) -> Result<CommandResult> {
        for modification in modifications {
            next.invoke(ctx, modification).await?;
            entry.add_modification(modification.clone(), false);
        }
        entry.with_workspace(|workspace| {
            for (fqn, version) in versions {
                workspace.set_explicit_version(fqn, version.clone());
            }
        });
        self.run_phase(entry, ctx, prepare, next).await
    }
}

#[async_trait]
impl Interceptor for TxInterceptor {
    fn name(&self) -> &'static str {
        "tx"
    }

    async fn invoke(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        if command.is_transaction_boundary() {
            if !ctx.is_origin_local() {
                return self.remote_boundary(ctx, command, next).await;
            }
            return match ctx.entry().cloned() {
                Some(entry) => self.run_phase(&entry, ctx, command, next).await,
                None => next.invoke(ctx, command).await,
            };
        }

        if ctx.in_transaction() {
            return self.invoke_in_transaction(ctx, command, next).await;
        }

        if let Some(tx) = ctx.transaction().cloned() {
            self.associate(ctx, &tx)?;
            return self.invoke_in_transaction(ctx, command, next).await;
        }

        if self.components.scheme().uses_workspace()
            && command.is_write()
            && ctx.is_origin_local()
        {
            return self.invoke_implicit(ctx, command, next).await;
        }

        match next.invoke(ctx, command).await {
            Err(e) if ctx.options.fail_silently => {
                warn!(command = %command, error = %e, "Failing silently");
                Ok(CommandResult::None)
            }
            other => other,
        }
    }
}

/// Completion callback registered with every local transaction that
/// touches the cache. Drives prepare before commit and commit/rollback
/// afterwards through the pipeline.
struct CacheSynchronization {
    components: Arc<CacheComponents>,
    gtx: GlobalTransaction,
}

impl CacheSynchronization {
    fn context(&self, tx: &Transaction, entry: Arc<TransactionEntry>) -> InvocationContext {
        let mut ctx = InvocationContext::local(InvocationOptions::new(), Some(tx.clone()));
        ctx.set_entry(Some(entry));
        ctx
    }
}

#[async_trait]
impl Synchronization for CacheSynchronization {
    async fn before_completion(&self, tx: &Transaction) -> Result<()> {
        let Some(entry) = self.components.tx_table.get(&self.gtx) else {
            return Ok(());
        };
        if entry.is_rollback_only() {
            return Err(Error::Transaction(TransactionError::RollbackOnly(
                self.gtx.to_string(),
            )));
        }
        let prepare = Command::Prepare {
            gtx: self.gtx.clone(),
            modifications: entry.modifications(),
            versions: Vec::new(),
            one_phase: false,
        };
        let mut ctx = self.context(tx, entry);
        self.components.invoke(&mut ctx, &prepare).await?;
        Ok(())
    }

    async fn after_completion(&self, tx: &Transaction, status: TransactionStatus) -> Result<()> {
        let Some(entry) = self.components.tx_table.get(&self.gtx) else {
            return Ok(());
        };
        let committed = status == TransactionStatus::Committed;
        let command = if committed {
            Command::Commit {
                gtx: self.gtx.clone(),
            }
        } else {
            Command::Rollback {
                gtx: self.gtx.clone(),
            }
        };
        let mut ctx = self.context(tx, entry);
        let result = self.components.invoke(&mut ctx, &command).await;

        self.components.tx_table.remove(&self.gtx);
        self.components.notifier.notify(
            &CacheEvent::TransactionCompleted {
                gtx: self.gtx.clone(),
                committed,
            },
            true,
        );
        result.map(|_| ())
    }
}
