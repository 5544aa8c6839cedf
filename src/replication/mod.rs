//! Propagating commands to peers.
//!
//! Commands travel as [`ReplicationMessage`]s encoded with bincode.
//! [`RpcManager`] sends them, [`ReplicationQueue`] batches asynchronous
//! ones, and [`RpcDispatcher`] runs incoming ones through the local
//! pipeline.

mod dispatcher;
mod queue;
mod rpc;

pub use dispatcher::RpcDispatcher;
pub use queue::ReplicationQueue;
pub use rpc::{MemberResponse, RpcManager};

use crate::command::{Command, CommandResult};
use crate::error::{RemoteFailure, Result};
use crate::tree::NodeSnapshot;
use crate::types::MemberId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A message between cache members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// Run one command on the receiver.
    Command(Command),

    /// Run several commands in order.
    Batch(Vec<Command>),

    /// The receiver became one of `owner`'s buddies; `state` is the
    /// owner's primary data.
    AssignToBuddyGroup {
        owner: MemberId,
        state: Vec<NodeSnapshot>,
    },

    /// The receiver is no longer one of `owner`'s buddies.
    RemoveFromBuddyGroup { owner: MemberId },
}

impl ReplicationMessage {
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Reply to a synchronous message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteResponse {
    Ok(CommandResult),
    Failure(RemoteFailure),
}

impl RemoteResponse {
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, FailureKind};
    use crate::fqn::Fqn;

    #[test]
    fn test_message_wire_format() {
        let message = ReplicationMessage::Batch(vec![
            Command::put("/a", "k", "v"),
            Command::remove_node("/b"),
        ]);
        let decoded = ReplicationMessage::from_bytes(&message.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, message);

        assert!(ReplicationMessage::from_bytes(b"\xff\xff").is_err());
    }

    #[test]
    fn test_failure_response_keeps_kind() {
        let failure = Error::NodeNotExists(Fqn::parse("/x")).to_remote_failure();
        let response = RemoteResponse::Failure(failure);
        match RemoteResponse::from_bytes(&response.to_bytes().unwrap()).unwrap() {
            RemoteResponse::Failure(f) => assert_eq!(f.kind, FailureKind::NodeNotExists),
            other => panic!("unexpected response {:?}", other),
        }
    }
}
