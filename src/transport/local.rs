use super::{MembershipEvent, RequestHandler, ResponseMode, Transport};
use crate::error::ReplicationError;
use crate::types::MemberId;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace};

type HandlerSlot = Option<Arc<dyn RequestHandler>>;

struct Envelope {
    from: MemberId,
    payload: Bytes,
    reply: Option<oneshot::Sender<Bytes>>,
}

struct MemberSlot {
    inbox: mpsc::UnboundedSender<Envelope>,
    handler: watch::Sender<HandlerSlot>,
    reachable: bool,
    subscribers: Vec<mpsc::UnboundedSender<MembershipEvent>>,
}

#[derive(Default)]
struct ClusterState {
    last_id: MemberId,
    members: Vec<MemberId>,
    slots: HashMap<MemberId, MemberSlot>,
}

impl ClusterState {
    fn publish_view(&mut self) {
        let event = MembershipEvent::ViewChanged {
            members: self.members.clone(),
        };
        for slot in self.slots.values_mut() {
            slot.subscribers.retain(|s| s.send(event.clone()).is_ok());
        }
    }
}

/// An in-process group. Every member joined through the same
/// `LocalCluster` can reach the others; views change as members join and
/// leave.
#[derive(Clone, Default)]
pub struct LocalCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl LocalCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member and start delivering its messages. Must be called
    /// within a Tokio runtime.
    pub fn join(&self) -> Arc<LocalTransport> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (handler_tx, handler_rx) = watch::channel::<HandlerSlot>(None);

        let member = {
            let mut state = self.state.lock();
            state.last_id += 1;
            let member = state.last_id;
            state.members.push(member);
            state.slots.insert(
                member,
                MemberSlot {
                    inbox: inbox_tx,
                    handler: handler_tx,
                    reachable: true,
                    subscribers: Vec::new(),
                },
            );
            state.publish_view();
            member
        };

        tokio::spawn(deliver(member, inbox_rx, handler_rx));
        info!(member, "Member joined local cluster");

        Arc::new(LocalTransport {
            member,
            cluster: self.clone(),
        })
    }

    /// Remove a member. Its pending and future messages fail as
    /// unreachable.
    pub fn leave(&self, member: MemberId) {
        let mut state = self.state.lock();
        if state.slots.remove(&member).is_none() {
            return;
        }
        state.members.retain(|m| *m != member);
        state.publish_view();
        info!(member, "Member left local cluster");
    }

    /// Cut a member off (or reconnect it) without changing the view.
    pub fn set_reachable(&self, member: MemberId, reachable: bool) {
        if let Some(slot) = self.state.lock().slots.get_mut(&member) {
            slot.reachable = reachable;
            debug!(member, reachable, "Member reachability changed");
        }
    }

    pub fn members(&self) -> Vec<MemberId> {
        self.state.lock().members.clone()
    }

    fn route(&self, from: MemberId, to: MemberId) -> Option<mpsc::UnboundedSender<Envelope>> {
        let state = self.state.lock();
        let sender_reachable = state.slots.get(&from).is_some_and(|s| s.reachable);
        state
            .slots
            .get(&to)
            .filter(|slot| slot.reachable && sender_reachable)
            .map(|slot| slot.inbox.clone())
    }
}

/// Delivery loop for one member. Asynchronous messages are handled one
/// at a time in arrival order; synchronous ones run concurrently.
async fn deliver(
    member: MemberId,
    mut inbox: mpsc::UnboundedReceiver<Envelope>,
    mut handler_rx: watch::Receiver<HandlerSlot>,
) {
    while let Some(envelope) = inbox.recv().await {
        let handler = loop {
            let current = handler_rx.borrow().clone();
            if let Some(handler) = current {
                break handler;
            }
            if handler_rx.changed().await.is_err() {
                return;
            }
        };

        trace!(member, from = envelope.from, bytes = envelope.payload.len(), "Delivering message");
        match envelope.reply {
            Some(reply) => {
                tokio::spawn(async move {
                    let response = handler.handle(envelope.from, envelope.payload).await;
                    let _ = reply.send(response);
                });
            }
            None => {
                handler.handle(envelope.from, envelope.payload).await;
            }
        }
    }
    debug!(member, "Delivery loop stopped");
}

/// One member's endpoint in a [`LocalCluster`].
pub struct LocalTransport {
    member: MemberId,
    cluster: LocalCluster,
}

impl LocalTransport {
    pub fn cluster(&self) -> &LocalCluster {
        &self.cluster
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_member(&self) -> MemberId {
        self.member
    }

    fn members(&self) -> Vec<MemberId> {
        self.cluster.members()
    }

    fn set_handler(&self, handler: Arc<dyn RequestHandler>) {
        if let Some(slot) = self.cluster.state.lock().slots.get(&self.member) {
            slot.handler.send_replace(Some(handler));
        }
    }

    fn clear_handler(&self) {
        if let Some(slot) = self.cluster.state.lock().slots.get(&self.member) {
            slot.handler.send_replace(None);
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<MembershipEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.cluster.state.lock();
        let view = MembershipEvent::ViewChanged {
            members: state.members.clone(),
        };
        if let Some(slot) = state.slots.get_mut(&self.member) {
            if tx.send(view).is_ok() {
                slot.subscribers.push(tx);
            }
        }
        rx
    }

    async fn send(
        &self,
        target: MemberId,
        payload: Bytes,
        mode: ResponseMode,
        timeout: Duration,
    ) -> Result<Option<Bytes>, ReplicationError> {
        let inbox = self
            .cluster
            .route(self.member, target)
            .ok_or(ReplicationError::Unreachable(target))?;

        match mode {
            ResponseMode::Asynchronous => {
                inbox
                    .send(Envelope {
                        from: self.member,
                        payload,
                        reply: None,
                    })
                    .map_err(|_| ReplicationError::Unreachable(target))?;
                Ok(None)
            }
            ResponseMode::Synchronous => {
                let (reply_tx, reply_rx) = oneshot::channel();
                inbox
                    .send(Envelope {
                        from: self.member,
                        payload,
                        reply: Some(reply_tx),
                    })
                    .map_err(|_| ReplicationError::Unreachable(target))?;
                match tokio::time::timeout(timeout, reply_rx).await {
                    Ok(Ok(reply)) => Ok(Some(reply)),
                    Ok(Err(_)) => Err(ReplicationError::Unreachable(target)),
                    Err(_) => Err(ReplicationError::ReplyTimeout {
                        member: target,
                        timeout,
                    }),
                }
            }
        }
    }
}
