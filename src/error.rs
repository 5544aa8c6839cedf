//! Error types for the tree cache.

use crate::fqn::Fqn;
use crate::lock::LockMode;
use crate::types::{CacheStatus, MemberId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the tree cache.
#[derive(Error, Debug)]
pub enum Error {
    /// A bounded wait (reply, queue flush) expired.
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },

    /// A node lock could not be acquired within the acquisition timeout.
    #[error("could not acquire {mode} lock on {fqn} for {owner} within {timeout:?}")]
    LockTimeout {
        fqn: Fqn,
        mode: LockMode,
        owner: String,
        timeout: Duration,
    },

    /// Optimistic validation found a node newer than the one the
    /// transaction read.
    #[error("version conflict on {fqn}: transaction saw {expected}, tree holds {actual}")]
    VersionConflict {
        fqn: Fqn,
        expected: String,
        actual: String,
    },

    /// Two data versions of incompatible kinds were compared.
    #[error("incompatible data versions: {left} cannot be compared with {right}")]
    VersionTypeMismatch { left: String, right: String },

    /// Remote application failed or a peer could not be reached.
    #[error("replication error: {0}")]
    Replication(#[from] ReplicationError),

    /// The operation requires a node that does not exist.
    #[error("node does not exist: {0}")]
    NodeNotExists(Fqn),

    /// Transaction state errors.
    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),

    /// The operation is not valid for its arguments.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Cache loader failure.
    #[error("cache loader error: {0}")]
    Loader(String),

    /// Wire encoding failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// A combination of settings the cache refuses to run with.
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// The cache is not accepting invocations.
    #[error("cache is not running (status: {0})")]
    CacheNotRunning(CacheStatus),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors raised while propagating commands to peers.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// A peer executed the command and reported a failure.
    #[error("member {member} failed to apply command: {failure}")]
    RemoteFailure {
        member: MemberId,
        failure: RemoteFailure,
    },

    /// A peer could not be reached.
    #[error("member {0} is unreachable")]
    Unreachable(MemberId),

    /// A peer did not answer within the reply timeout.
    #[error("no reply from member {member} within {timeout:?}")]
    ReplyTimeout { member: MemberId, timeout: Duration },

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Transaction lifecycle errors.
#[derive(Error, Debug)]
pub enum TransactionError {
    /// The transaction is not in a state that allows the action.
    #[error("transaction {tx} is {state}, cannot {action}")]
    InvalidState {
        tx: String,
        state: String,
        action: &'static str,
    },

    /// The transaction was marked rollback-only by an earlier failure.
    #[error("transaction {0} is marked rollback-only")]
    RollbackOnly(String),

    /// Commit failed and the transaction was rolled back instead.
    #[error("transaction {tx} rolled back: {cause}")]
    RolledBack { tx: String, cause: Box<Error> },

    /// No global transaction is registered under this id.
    #[error("unknown global transaction {0}")]
    Unknown(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// True for failures a caller may reasonably retry.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Timeout { .. }
            | Error::LockTimeout { .. }
            | Error::VersionConflict { .. }
            | Error::Replication(_) => true,
            Error::Transaction(TransactionError::RolledBack { cause, .. }) => cause.is_retriable(),
            _ => false,
        }
    }

    /// True if this failure inside a transaction must mark it rollback-only.
    pub fn forces_rollback(&self) -> bool {
        !matches!(self, Error::NodeNotExists(_) | Error::InvalidOperation(_))
    }

    /// The underlying cause of a commit-time rollback, or `self`.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Transaction(TransactionError::RolledBack { cause, .. }) => cause.root_cause(),
            _ => self,
        }
    }

    /// Serializable description of this error for a remote caller.
    pub fn to_remote_failure(&self) -> RemoteFailure {
        let kind = match self.root_cause() {
            Error::Timeout { .. } => FailureKind::Timeout,
            Error::LockTimeout { .. } => FailureKind::LockTimeout,
            Error::VersionConflict { .. } => FailureKind::VersionConflict,
            Error::VersionTypeMismatch { .. } => FailureKind::VersionTypeMismatch,
            Error::NodeNotExists(_) => FailureKind::NodeNotExists,
            Error::Replication(_) => FailureKind::Replication,
            Error::Transaction(_) => FailureKind::Transaction,
            Error::CacheNotRunning(_) => FailureKind::NotRunning,
            _ => FailureKind::Other,
        };
        RemoteFailure {
            kind,
            message: self.to_string(),
        }
    }
}

/// Coarse classification of a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Timeout,
    LockTimeout,
    VersionConflict,
    VersionTypeMismatch,
    NodeNotExists,
    Replication,
    Transaction,
    NotRunning,
    Other,
}

/// A failure reported by a peer in reply to a replicated command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        let timeout = Error::LockTimeout {
            fqn: Fqn::parse("/x"),
            mode: LockMode::Write,
            owner: "tx".to_string(),
            timeout: Duration::ZERO,
        };
        assert!(timeout.is_retriable());
        assert!(timeout.forces_rollback());

        let mismatch = Error::VersionTypeMismatch {
            left: "ts:1".to_string(),
            right: "v1".to_string(),
        };
        assert!(!mismatch.is_retriable());

        assert!(!Error::NodeNotExists(Fqn::root()).forces_rollback());
    }

    #[test]
    fn test_rollback_cause_is_unwrapped() {
        let err = Error::Transaction(TransactionError::RolledBack {
            tx: "gtx".to_string(),
            cause: Box::new(Error::VersionConflict {
                fqn: Fqn::parse("/y"),
                expected: "v3".to_string(),
                actual: "v5".to_string(),
            }),
        });
        assert!(err.is_retriable());
        assert!(matches!(err.root_cause(), Error::VersionConflict { .. }));
        assert_eq!(err.to_remote_failure().kind, FailureKind::VersionConflict);
    }
}
