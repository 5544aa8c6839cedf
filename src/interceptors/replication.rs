//! Propagation of writes and transaction boundaries to peers.

use super::{Interceptor, Next};
use crate::cache::CacheComponents;
use crate::command::{Command, CommandResult};
use crate::context::InvocationContext;
use crate::error::{Error, Result};
use crate::replication::RpcManager;
use crate::tree::undo::undo_all;
use crate::tx::TransactionEntry;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Replicates locally originated writes once they have been applied
/// here. Outside a transaction each write is sent on its own; inside one
/// nothing is sent until completion:
///
/// - synchronous modes send `Prepare` at prepare time and `Commit` or
///   `Rollback` afterwards
/// - asynchronous modes send a single one-phase `Prepare` after the local
///   commit, through the replication queue when one is configured
pub struct ReplicationInterceptor {
    components: Arc<CacheComponents>,
}

impl ReplicationInterceptor {
    pub fn new(components: Arc<CacheComponents>) -> Self {
        Self { components }
    }

    fn rpc(&self) -> Result<&Arc<RpcManager>> {
        self.components
            .rpc
            .as_ref()
            .ok_or_else(|| Error::Internal("replicated cache has no transport".to_string()))
    }

    async fn send(&self, command: &Command, sync: bool) -> Result<()> {
        let metrics = &self.components.metrics;
        let result = self
            .rpc()?
            .replicate(command, sync, self.components.sync_timeout())
            .await;
        match &result {
            Ok(()) => metrics.count(&metrics.replications),
            Err(_) => metrics.count(&metrics.replication_failures),
        }
        result
    }

    /// Queue or fire off `command` without waiting. Failures are logged.
    async fn send_async(&self, command: Command) {
        if let Some(queue) = &self.components.repl_queue {
            trace!(command = %command, "Queueing for replication");
            queue.enqueue(command);
            return;
        }
        if let Err(e) = self.send(&command, false).await {
            warn!(command = %command, error = %e, "Asynchronous replication failed");
        }
    }

    async fn replicate_write(&self, ctx: &InvocationContext, command: &Command) -> Result<()> {
        if !self.components.is_synchronous(ctx) {
            self.send_async(command.clone()).await;
            return Ok(());
        }
        match self.send(command, true).await {
            Err(e) if ctx.options.fail_silently => {
                debug!(command = %command, error = %e, "Ignoring replication failure");
                Ok(())
            }
            other => other,
        }
    }

    async fn on_prepare(&self, ctx: &InvocationContext, command: &Command) -> Result<()> {
        let (Some(entry), Command::Prepare { gtx, modifications, .. }) = (ctx.entry(), command)
        else {
            return Ok(());
        };
        if modifications.is_empty() || !self.components.is_synchronous(ctx) {
            return Ok(());
        }
        debug!(gtx = %gtx, count = modifications.len(), "Replicating prepare");
        entry.set_prepare_replicated();
        let remote = Command::Prepare {
            gtx: gtx.clone(),
            modifications: modifications.clone(),
            versions: entry.prepared_versions(),
            one_phase: false,
        };
        self.send(&remote, true).await
    }

    async fn on_commit(&self, ctx: &InvocationContext, entry: &TransactionEntry) {
        let gtx = entry.gtx().clone();
        if entry.is_prepare_replicated() {
            let sync = self.components.config.replication.sync_commit_phase;
            if let Err(e) = self.send(&Command::Commit { gtx: gtx.clone() }, sync).await {
                warn!(gtx = %gtx, error = %e, "Commit replication failed");
            }
            return;
        }

        let modifications = entry.modifications();
        if modifications.is_empty() || self.components.is_synchronous(ctx) {
            return;
        }
        self.send_async(Command::Prepare {
            gtx,
            modifications,
            versions: entry.prepared_versions(),
            one_phase: true,
        })
        .await;
    }

    async fn on_rollback(&self, entry: &TransactionEntry) {
        if !entry.is_prepare_replicated() {
            return;
        }
        let gtx = entry.gtx().clone();
        let sync = self.components.config.replication.sync_rollback_phase;
        if let Err(e) = self.send(&Command::Rollback { gtx: gtx.clone() }, sync).await {
            warn!(gtx = %gtx, error = %e, "Rollback replication failed");
        }
    }
}

#[async_trait]
impl Interceptor for ReplicationInterceptor {
    fn name(&self) -> &'static str {
        "replication"
    }

    async fn invoke(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        if !ctx.is_origin_local() || ctx.options.cache_mode_local {
            return next.invoke(ctx, command).await;
        }

        match command {
            Command::Prepare { .. } => {
                let result = next.invoke(ctx, command).await?;
                self.on_prepare(ctx, command).await?;
                Ok(result)
            }
            Command::Commit { .. } => {
                let entry = ctx.entry().cloned();
                let result = next.invoke(ctx, command).await?;
                if let Some(entry) = entry {
                    self.on_commit(ctx, &entry).await;
                }
                Ok(result)
            }
            Command::Rollback { .. } => {
                let entry = ctx.entry().cloned();
                let result = next.invoke(ctx, command).await;
                if let Some(entry) = entry {
                    self.on_rollback(&entry).await;
                }
                result
            }
            c if c.is_write() && !ctx.in_transaction() => {
                if !self.components.is_synchronous(ctx) {
                    let result = next.invoke(ctx, command).await?;
                    self.replicate_write(ctx, command).await?;
                    return Ok(result);
                }
                // Peers must ack before the write stands here.
                let owns_undo = ctx.begin_call_undo();
                let outcome = match next.invoke(ctx, command).await {
                    Ok(result) => self.replicate_write(ctx, command).await.map(|()| result),
                    Err(e) => Err(e),
                };
                let undo = if owns_undo { ctx.end_call_undo() } else { Vec::new() };
                if outcome.is_err() && !undo.is_empty() {
                    debug!(command = %command, "Reverting local write after failed replication");
                    undo_all(undo, &self.components.container);
                }
                outcome
            }
            _ => next.invoke(ctx, command).await,
        }
    }
}
