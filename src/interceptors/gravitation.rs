//! Data gravitation under buddy replication.

use super::{Interceptor, Next};
use crate::buddy::BuddyManager;
use crate::cache::CacheComponents;
use crate::command::{Command, CommandResult, GravitateResult};
use crate::config::BuddyReplicationConfig;
use crate::context::{InvocationContext, InvocationOptions};
use crate::error::Result;
use crate::fqn::Fqn;
use crate::replication::{RemoteResponse, ReplicationMessage};
use crate::tx::GlobalTransaction;
use crate::types::MemberId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// On a local read miss, asks the cluster for the data, installs it
/// under its primary path, and tells every other member to drop the
/// copies left behind. Also executes those cleanup requests when they
/// arrive from peers.
///
/// Inside a transaction the cleanup waits for the commit and is dropped
/// on rollback.
pub struct DataGravitatorInterceptor {
    components: Arc<CacheComponents>,
    pending_cleanups: DashMap<GlobalTransaction, Vec<Fqn>>,
}

impl DataGravitatorInterceptor {
    pub fn new(components: Arc<CacheComponents>) -> Self {
        Self {
            components,
            pending_cleanups: DashMap::new(),
        }
    }

    fn config(&self) -> &BuddyReplicationConfig {
        &self.components.config.buddy_replication
    }

    fn should_gravitate(&self, ctx: &InvocationContext, fqn: &Fqn) -> bool {
        let options = &ctx.options;
        if options.skip_data_gravitation
            || !(self.config().auto_data_gravitation || options.force_data_gravitation)
            || !ctx.is_origin_local()
            || BuddyManager::is_backup_fqn(fqn)
            || self.components.container.exists(fqn)
        {
            return false;
        }
        match ctx.entry() {
            Some(entry) => !entry.with_workspace(|w| w.node(fqn).is_some()),
            None => true,
        }
    }

    /// Find `fqn` in a backup subtree held here, or else ask every peer.
    /// A primary copy wins over a backup one.
    async fn locate(&self, fqn: &Fqn) -> Result<Option<(MemberId, GravitateResult)>> {
        let search_backup_subtrees = self.config().data_gravitation_search_backup_trees;
        let gravitate = Command::GravitateData {
            fqn: fqn.clone(),
            search_backup_subtrees,
        };
        if search_backup_subtrees {
            let local = gravitate
                .apply(&self.components.container, None)?
                .result
                .into_gravitation();
            if local.found {
                return Ok(Some((self.components.local_member, local)));
            }
        }

        let Some(rpc) = &self.components.rpc else {
            return Ok(None);
        };
        let request = ReplicationMessage::Command(gravitate);
        let responses = rpc
            .broadcast(&request, true, self.config().buddy_communication_timeout)
            .await?;

        let mut found: Vec<(MemberId, GravitateResult)> = Vec::new();
        for (member, response) in responses {
            match response {
                Ok(Some(RemoteResponse::Ok(CommandResult::Gravitation(result)))) if result.found => {
                    found.push((member, result));
                }
                Ok(Some(RemoteResponse::Failure(failure))) => {
                    debug!(member, %failure, "Gravitation request failed on member")
                }
                Ok(_) => {}
                Err(e) => debug!(member, error = %e, "No gravitation answer from member"),
            }
        }
        let primary = found
            .iter()
            .position(|(_, r)| r.location.as_ref() == Some(fqn))
            .unwrap_or(0);
        Ok((!found.is_empty()).then(|| found.swap_remove(primary)))
    }

    /// Pull `fqn` into the primary tree. Returns whether anything was
    /// found.
    async fn gravitate(
        &self,
        ctx: &mut InvocationContext,
        fqn: &Fqn,
        next: Next<'_>,
    ) -> Result<bool> {
        let Some((owner, result)) = self.locate(fqn).await? else {
            trace!(fqn = %fqn, "Nothing to gravitate");
            return Ok(false);
        };
        let nodes = result.relocated_to(fqn);
        info!(fqn = %fqn, from = owner, location = ?result.location, nodes = nodes.len(), "Gravitating data");

        for snapshot in nodes.into_iter().filter(|n| n.valid) {
            let install = Command::put_all(snapshot.fqn, snapshot.attributes, true);
            next.chain().invoke(ctx, &install).await?;
        }
        let metrics = &self.components.metrics;
        metrics.count(&metrics.gravitations);

        match ctx.gtx() {
            Some(gtx) => self
                .pending_cleanups
                .entry(gtx.clone())
                .or_default()
                .push(fqn.clone()),
            None => self.send_cleanup(fqn, next).await,
        }
        Ok(true)
    }

    /// Tell peers to drop their copies of `primary`, then drop any backup
    /// copy held here.
    async fn send_cleanup(&self, primary: &Fqn, next: Next<'_>) {
        let Some(rpc) = &self.components.rpc else {
            return;
        };
        let local = self.components.local_member;
        let cleanup = ReplicationMessage::Command(Command::DataGravitationCleanup {
            primary: primary.clone(),
            requester: local,
        });
        match rpc
            .broadcast(&cleanup, true, self.config().buddy_communication_timeout)
            .await
        {
            Ok(responses) => {
                for (member, response) in responses {
                    match response {
                        Ok(Some(RemoteResponse::Failure(failure))) => {
                            warn!(member, fqn = %primary, %failure, "Gravitation cleanup failed on member")
                        }
                        Err(e) => warn!(member, fqn = %primary, error = %e, "Gravitation cleanup not delivered"),
                        Ok(_) => {}
                    }
                }
            }
            Err(e) => warn!(fqn = %primary, error = %e, "Gravitation cleanup failed"),
        }
        if let Err(e) = self.remove_backups(primary, local, next).await {
            warn!(fqn = %primary, error = %e, "Could not remove local backup copies");
        }
    }

    /// Remove backup copies of `primary` from every backup group except
    /// `keep`'s.
    async fn remove_backups(&self, primary: &Fqn, keep: MemberId, next: Next<'_>) -> Result<()> {
        let container = &self.components.container;
        let keep = BuddyManager::group_name_for(keep);
        for group in container.children_of(&BuddyManager::backup_root()) {
            if group.last_element() == Some(keep.as_str()) {
                continue;
            }
            let copy = group.join(primary);
            if !container.exists(&copy) {
                continue;
            }
            debug!(fqn = %copy, "Removing stale backup copy");
            let mut ctx = InvocationContext::local(InvocationOptions::new().cache_mode_local(), None);
            next.chain()
                .invoke(&mut ctx, &Command::RemoveNode { fqn: copy })
                .await?;
        }
        Ok(())
    }

    /// Handle a peer's cleanup request after it gravitated `primary`.
    async fn cleanup(&self, primary: &Fqn, requester: MemberId, next: Next<'_>) -> Result<()> {
        if self.components.container.exists(primary) {
            let command = if self.config().data_gravitation_remove_on_find {
                Command::RemoveNode {
                    fqn: primary.clone(),
                }
            } else {
                Command::Evict {
                    fqn: primary.clone(),
                    recursive: true,
                }
            };
            debug!(fqn = %primary, requester, command = %command, "Dropping gravitated primary copy");
            let mut ctx = InvocationContext::local(InvocationOptions::new().cache_mode_local(), None);
            next.chain().invoke(&mut ctx, &command).await?;
        }
        self.remove_backups(primary, requester, next).await
    }
}

#[async_trait]
impl Interceptor for DataGravitatorInterceptor {
    fn name(&self) -> &'static str {
        "data-gravitator"
    }

    async fn invoke(
        &self,
        ctx: &mut InvocationContext,
        command: &Command,
        next: Next<'_>,
    ) -> Result<CommandResult> {
        match command {
            Command::DataGravitationCleanup { primary, requester } => {
                self.cleanup(primary, *requester, next).await?;
                Ok(CommandResult::None)
            }
            Command::Commit { gtx } if ctx.is_origin_local() => {
                let result = next.invoke(ctx, command).await?;
                if let Some((_, fqns)) = self.pending_cleanups.remove(gtx) {
                    for fqn in fqns {
                        self.send_cleanup(&fqn, next).await;
                    }
                }
                Ok(result)
            }
            Command::Rollback { gtx } => {
                self.pending_cleanups.remove(gtx);
                next.invoke(ctx, command).await
            }
            c if c.is_read() => {
                if let Some(fqn) = c.fqn().filter(|fqn| self.should_gravitate(ctx, fqn)) {
                    self.gravitate(ctx, fqn, next).await?;
                }
                next.invoke(ctx, command).await
            }
            _ => next.invoke(ctx, command).await,
        }
    }
}
