//! Reacting to membership views.

use super::CacheComponents;
use crate::buddy::BuddyManager;
use crate::command::Command;
use crate::context::InvocationContext;
use crate::fqn::Fqn;
use crate::notifications::CacheEvent;
use crate::replication::ReplicationMessage;
use crate::transport::MembershipEvent;
use crate::types::MemberId;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Applies each new view: notifies listeners, rolls back transactions
/// left behind by departed members and, under buddy replication,
/// hands state to new buddies.
pub(super) struct MembershipListener {
    components: Weak<CacheComponents>,
    previous: Vec<MemberId>,
}

impl MembershipListener {
    pub(super) fn new(components: &Arc<CacheComponents>) -> Self {
        Self {
            components: Arc::downgrade(components),
            previous: Vec::new(),
        }
    }

    pub(super) async fn on_view(&mut self, members: Vec<MemberId>) {
        if members == self.previous {
            return;
        }
        let Some(components) = self.components.upgrade() else {
            return;
        };
        info!(member = components.local_member, view = ?members, "View changed");
        components.notifier.notify(
            &CacheEvent::ViewChanged {
                members: members.clone(),
            },
            true,
        );

        for departed in self.previous.iter().filter(|m| !members.contains(m)) {
            Self::abandon_transactions(&components, *departed).await;
        }
        if let Some(buddy) = &components.buddy {
            Self::regroup(&components, buddy, &members).await;
        }
        self.previous = members;
    }

    /// Roll back remote transactions whose originator is gone; nobody
    /// is left to commit them.
    async fn abandon_transactions(components: &CacheComponents, departed: MemberId) {
        for gtx in components.tx_table.remote_from(departed) {
            debug!(gtx = %gtx, departed, "Rolling back transaction of departed member");
            let mut ctx = InvocationContext::remote(departed);
            let rollback = Command::Rollback { gtx: gtx.clone() };
            if let Err(e) = components.invoke(&mut ctx, &rollback).await {
                warn!(gtx = %gtx, error = %e, "Could not roll back orphaned transaction");
            }
        }
    }

    async fn regroup(components: &CacheComponents, buddy: &BuddyManager, members: &[MemberId]) {
        let change = buddy.view_changed(members);
        let Some(rpc) = &components.rpc else {
            return;
        };
        let local = components.local_member;
        let timeout = components.config.buddy_replication.buddy_communication_timeout;

        if !change.added.is_empty() {
            let state: Vec<_> = components
                .container
                .snapshot_subtree(&Fqn::root())
                .into_iter()
                .filter(|s| !s.fqn.is_root() && !BuddyManager::is_backup_fqn(&s.fqn))
                .collect();
            let assign = ReplicationMessage::AssignToBuddyGroup {
                owner: local,
                state,
            };
            for &added in &change.added {
                if let Err(e) = rpc.send(added, &assign, true, timeout).await {
                    warn!(buddy = added, error = %e, "Could not hand state to new buddy");
                }
            }
        }

        let release = ReplicationMessage::RemoveFromBuddyGroup { owner: local };
        for removed in change.removed.iter().filter(|m| members.contains(m)) {
            if let Err(e) = rpc.send(*removed, &release, false, timeout).await {
                debug!(buddy = removed, error = %e, "Could not release former buddy");
            }
        }
    }

    /// Apply views until shutdown, the stream ends, or the cache is
    /// dropped.
    pub(super) async fn run(
        mut self,
        mut views: mpsc::UnboundedReceiver<MembershipEvent>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Membership loop shutting down");
                    break;
                }
                event = views.recv() => match event {
                    Some(MembershipEvent::ViewChanged { members }) => {
                        if self.components.strong_count() == 0 {
                            break;
                        }
                        self.on_view(members).await;
                    }
                    None => break,
                },
            }
        }
    }
}
