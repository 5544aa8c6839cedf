use super::{RemoteResponse, ReplicationMessage};
use crate::buddy::BuddyManager;
use crate::cache::CacheComponents;
use crate::command::{Command, CommandResult};
use crate::context::InvocationContext;
use crate::error::{Error, Result};
use crate::transport::RequestHandler;
use crate::types::{CacheStatus, MemberId};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Runs messages from peers through this cache's pipeline, flagged as
/// remote so they are applied locally and never propagated again.
pub struct RpcDispatcher {
    components: Weak<CacheComponents>,
}

impl RpcDispatcher {
    pub fn new(components: &Arc<CacheComponents>) -> Self {
        Self {
            components: Arc::downgrade(components),
        }
    }

    async fn dispatch(&self, from: MemberId, payload: &[u8]) -> Result<CommandResult> {
        let components = self
            .components
            .upgrade()
            .ok_or(Error::CacheNotRunning(CacheStatus::Stopped))?;
        let status = components.status();
        if !status.allows_invocations() {
            return Err(Error::CacheNotRunning(status));
        }

        match ReplicationMessage::from_bytes(payload)? {
            ReplicationMessage::Command(command) => {
                let mut ctx = InvocationContext::remote(from);
                components.invoke(&mut ctx, &command).await
            }
            ReplicationMessage::Batch(commands) => {
                debug!(from, count = commands.len(), "Applying replicated batch");
                for command in &commands {
                    let mut ctx = InvocationContext::remote(from);
                    components.invoke(&mut ctx, command).await?;
                }
                Ok(CommandResult::None)
            }
            ReplicationMessage::AssignToBuddyGroup { owner, state } => {
                let group = BuddyManager::backup_group_fqn(owner);
                info!(owner, nodes = state.len(), "Joined buddy group");
                let mut ctx = InvocationContext::remote(from);
                components
                    .invoke(&mut ctx, &Command::RemoveNode { fqn: group.clone() })
                    .await?;
                for snapshot in state.into_iter().filter(|s| s.valid) {
                    let mut ctx = InvocationContext::remote(from);
                    let command = Command::put_all(group.join(&snapshot.fqn), snapshot.attributes, true);
                    components.invoke(&mut ctx, &command).await?;
                }
                Ok(CommandResult::None)
            }
            ReplicationMessage::RemoveFromBuddyGroup { owner } => {
                info!(owner, "Left buddy group");
                let mut ctx = InvocationContext::remote(from);
                components
                    .invoke(
                        &mut ctx,
                        &Command::RemoveNode {
                            fqn: BuddyManager::backup_group_fqn(owner),
                        },
                    )
                    .await
            }
        }
    }
}

#[async_trait]
impl RequestHandler for RpcDispatcher {
    async fn handle(&self, from: MemberId, payload: Bytes) -> Bytes {
        let response = match self.dispatch(from, &payload).await {
            Ok(result) => RemoteResponse::Ok(result),
            Err(e) => {
                debug!(from, error = %e, "Remote command failed");
                RemoteResponse::Failure(e.to_remote_failure())
            }
        };
        match response.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(from, error = %e, "Could not encode reply");
                Bytes::new()
            }
        }
    }
}
