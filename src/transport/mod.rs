//! Group communication capability.
//!
//! The cache talks to its peers through a [`Transport`]: point-to-point
//! sends with an optional reply, plus a stream of membership views.
//! [`LocalCluster`] is an in-process implementation used to run several
//! caches side by side.

mod local;

pub use local::{LocalCluster, LocalTransport};

use crate::error::ReplicationError;
use crate::types::MemberId;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Whether a send waits for the receiver's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Wait for the reply, up to the send timeout.
    Synchronous,
    /// Fire and forget. Messages from one sender are handled in order.
    Asynchronous,
}

impl ResponseMode {
    pub fn from_sync(sync: bool) -> Self {
        if sync {
            ResponseMode::Synchronous
        } else {
            ResponseMode::Asynchronous
        }
    }
}

/// Membership changes delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// The full current view, this member included, in join order.
    ViewChanged { members: Vec<MemberId> },
}

/// Receives messages addressed to this member.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle `payload` from `from`. The returned bytes are the reply for
    /// synchronous sends and dropped otherwise.
    async fn handle(&self, from: MemberId, payload: Bytes) -> Bytes;
}

/// Point-to-point messaging and membership.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_member(&self) -> MemberId;

    /// Current view, this member included.
    fn members(&self) -> Vec<MemberId>;

    fn set_handler(&self, handler: Arc<dyn RequestHandler>);

    fn clear_handler(&self);

    /// Stream of views. The current view is delivered immediately.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<MembershipEvent>;

    /// Send `payload` to `target`. Synchronous sends return the reply.
    async fn send(
        &self,
        target: MemberId,
        payload: Bytes,
        mode: ResponseMode,
        timeout: Duration,
    ) -> Result<Option<Bytes>, ReplicationError>;
}
