use super::{RemoteResponse, ReplicationMessage};
use crate::buddy::BuddyManager;
use crate::command::Command;
use crate::error::{Error, ReplicationError, Result};
use crate::transport::{ResponseMode, Transport};
use crate::types::MemberId;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, trace};

/// One member's outcome for a send: its reply (synchronous sends) or the
/// failure to reach it.
pub type MemberResponse = (
    MemberId,
    std::result::Result<Option<RemoteResponse>, ReplicationError>,
);

/// Sends commands to peers over the transport. Under buddy replication
/// replicated writes go to the buddy group only, rewritten to land in
/// this member's backup subtree.
pub struct RpcManager {
    transport: Arc<dyn Transport>,
    buddy: Option<Arc<BuddyManager>>,
}

impl RpcManager {
    pub fn new(transport: Arc<dyn Transport>, buddy: Option<Arc<BuddyManager>>) -> Self {
        Self { transport, buddy }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn local_member(&self) -> MemberId {
        self.transport.local_member()
    }

    pub fn members(&self) -> Vec<MemberId> {
        self.transport.members()
    }

    /// Every member except this one.
    pub fn peers(&self) -> Vec<MemberId> {
        let local = self.local_member();
        self.members().into_iter().filter(|m| *m != local).collect()
    }

    /// Members that receive replicated writes.
    pub fn replication_targets(&self) -> Vec<MemberId> {
        match &self.buddy {
            Some(buddy) => buddy.buddies(),
            None => self.peers(),
        }
    }

    fn outbound(&self, command: &Command) -> Command {
        match &self.buddy {
            Some(buddy) => buddy.backup_command(command),
            None => command.clone(),
        }
    }

    /// Replicate `command` to the replication targets. Any failure to
    /// reach a target, or any failure a target reports, is an error.
    pub async fn replicate(&self, command: &Command, sync: bool, timeout: Duration) -> Result<()> {
        let targets = self.replication_targets();
        if targets.is_empty() {
            return Ok(());
        }
        trace!(command = %command, targets = ?targets, sync, "Replicating");
        let message = ReplicationMessage::Command(self.outbound(command));
        let responses = self.send_to(&targets, &message, sync, timeout).await?;
        for (member, response) in responses {
            match response {
                Ok(Some(RemoteResponse::Failure(failure))) => {
                    return Err(ReplicationError::RemoteFailure { member, failure }.into())
                }
                Err(e) => return Err(e.into()),
                Ok(_) => {}
            }
        }
        Ok(())
    }

    /// Replicate a batch asynchronously, in order.
    pub async fn replicate_batch(&self, commands: &[Command], timeout: Duration) -> Result<()> {
        let targets = self.replication_targets();
        if targets.is_empty() || commands.is_empty() {
            return Ok(());
        }
        debug!(count = commands.len(), targets = ?targets, "Replicating batch");
        let message = ReplicationMessage::Batch(commands.iter().map(|c| self.outbound(c)).collect());
        for (_, response) in self.send_to(&targets, &message, false, timeout).await? {
            response?;
        }
        Ok(())
    }

    /// Send `message` to every peer and collect each one's outcome.
    /// Failures are reported per member, not as an error.
    pub async fn broadcast(
        &self,
        message: &ReplicationMessage,
        sync: bool,
        timeout: Duration,
    ) -> Result<Vec<MemberResponse>> {
        let peers = self.peers();
        if peers.is_empty() {
            return Ok(Vec::new());
        }
        self.send_to(&peers, message, sync, timeout).await
    }

    /// Send `message` to one member. A reported failure is an error.
    pub async fn send(
        &self,
        target: MemberId,
        message: &ReplicationMessage,
        sync: bool,
        timeout: Duration,
    ) -> Result<Option<RemoteResponse>> {
        let mut responses = self.send_to(&[target], message, sync, timeout).await?;
        let Some((member, response)) = responses.pop() else {
            return Ok(None);
        };
        match response? {
            Some(RemoteResponse::Failure(failure)) => {
                Err(ReplicationError::RemoteFailure { member, failure }.into())
            }
            other => Ok(other),
        }
    }

    async fn send_to(
        &self,
        targets: &[MemberId],
        message: &ReplicationMessage,
        sync: bool,
        timeout: Duration,
    ) -> Result<Vec<MemberResponse>> {
        let payload = message.to_bytes()?;
        let mode = ResponseMode::from_sync(sync);

        if !sync {
            let mut responses = Vec::with_capacity(targets.len());
            for &target in targets {
                let sent = self
                    .transport
                    .send(target, payload.clone(), mode, timeout)
                    .await
                    .map(|_| None);
                responses.push((target, sent));
            }
            return Ok(responses);
        }

        let mut sends = JoinSet::new();
        for &target in targets {
            let transport = self.transport.clone();
            let payload = payload.clone();
            sends.spawn(async move {
                let response = match transport.send(target, payload, mode, timeout).await {
                    Ok(Some(reply)) => RemoteResponse::from_bytes(&reply)
                        .map(Some)
                        .map_err(|e| ReplicationError::Transport(e.to_string())),
                    Ok(None) => Ok(None),
                    Err(e) => Err(e),
                };
                (target, response)
            });
        }

        let mut responses = Vec::with_capacity(targets.len());
        while let Some(joined) = sends.join_next().await {
            let response =
                joined.map_err(|e| Error::Internal(format!("send task failed: {}", e)))?;
            responses.push(response);
        }
        responses.sort_by_key(|(member, _)| *member);
        Ok(responses)
    }
}
