//! Commands: the reified form of every cache operation.
//!
//! Every public operation is turned into a [`Command`] before it enters the
//! interceptor chain. Commands are plain data, serializable, and safe to
//! re-apply, so the same value is executed locally and shipped to peers.

mod apply;

pub use apply::ApplyOutcome;

use crate::error::Result;
use crate::fqn::Fqn;
use crate::tree::NodeSnapshot;
use crate::tx::GlobalTransaction;
use crate::types::{AttributeMap, MemberId};
use crate::version::DataVersion;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A cache operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Put one attribute. With `put_for_external_read` an existing key is
    /// never overwritten.
    PutKeyValue {
        fqn: Fqn,
        key: String,
        value: Bytes,
        put_for_external_read: bool,
    },

    /// Put a map of attributes, optionally replacing the node's contents.
    PutDataMap {
        fqn: Fqn,
        data: AttributeMap,
        erase_contents: bool,
    },

    /// Remove one attribute.
    RemoveKey { fqn: Fqn, key: String },

    /// Remove a node and its subtree.
    RemoveNode { fqn: Fqn },

    /// Remove every attribute of a node, keeping the node.
    ClearData { fqn: Fqn },

    /// Move a node (and its subtree) below a new parent.
    Move { from: Fqn, to_parent: Fqn },

    /// Drop a node from memory. Nodes with children only lose their data.
    Evict { fqn: Fqn, recursive: bool },

    /// Drop a stale copy on behalf of another member. A version, when
    /// present, leaves a tombstone carrying it.
    Invalidate {
        fqn: Fqn,
        version: Option<DataVersion>,
    },

    GetKeyValue { fqn: Fqn, key: String },

    GetData { fqn: Fqn },

    GetKeys { fqn: Fqn },

    GetChildrenNames { fqn: Fqn },

    Exists { fqn: Fqn },

    /// Ask a member for its copy of `fqn`, optionally searching the
    /// buddy backup subtrees it holds.
    GravitateData {
        fqn: Fqn,
        search_backup_subtrees: bool,
    },

    /// Remove copies of `primary` left behind after `requester`
    /// gravitated it: the primary copy and every backup copy except the
    /// requester's own backup group.
    DataGravitationCleanup { primary: Fqn, requester: MemberId },

    /// First phase of two-phase commit, carrying the transaction's
    /// modifications and any explicit data versions.
    Prepare {
        gtx: GlobalTransaction,
        modifications: Vec<Command>,
        versions: Vec<(Fqn, DataVersion)>,
        one_phase: bool,
    },

    Commit { gtx: GlobalTransaction },

    Rollback { gtx: GlobalTransaction },
}

impl Command {
    pub fn put(fqn: impl Into<Fqn>, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Command::PutKeyValue {
            fqn: fqn.into(),
            key: key.into(),
            value: value.into(),
            put_for_external_read: false,
        }
    }

    pub fn put_all(fqn: impl Into<Fqn>, data: AttributeMap, erase_contents: bool) -> Self {
        Command::PutDataMap {
            fqn: fqn.into(),
            data,
            erase_contents,
        }
    }

    pub fn remove_key(fqn: impl Into<Fqn>, key: impl Into<String>) -> Self {
        Command::RemoveKey {
            fqn: fqn.into(),
            key: key.into(),
        }
    }

    pub fn remove_node(fqn: impl Into<Fqn>) -> Self {
        Command::RemoveNode { fqn: fqn.into() }
    }

    pub fn get(fqn: impl Into<Fqn>, key: impl Into<String>) -> Self {
        Command::GetKeyValue {
            fqn: fqn.into(),
            key: key.into(),
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::PutKeyValue { .. } => "PutKeyValue",
            Command::PutDataMap { .. } => "PutDataMap",
            Command::RemoveKey { .. } => "RemoveKey",
            Command::RemoveNode { .. } => "RemoveNode",
            Command::ClearData { .. } => "ClearData",
            Command::Move { .. } => "Move",
            Command::Evict { .. } => "Evict",
            Command::Invalidate { .. } => "Invalidate",
            Command::GetKeyValue { .. } => "GetKeyValue",
            Command::GetData { .. } => "GetData",
            Command::GetKeys { .. } => "GetKeys",
            Command::GetChildrenNames { .. } => "GetChildrenNames",
            Command::Exists { .. } => "Exists",
            Command::GravitateData { .. } => "GravitateData",
            Command::DataGravitationCleanup { .. } => "DataGravitationCleanup",
            Command::Prepare { .. } => "Prepare",
            Command::Commit { .. } => "Commit",
            Command::Rollback { .. } => "Rollback",
        }
    }

    /// The node this command targets, if it targets one.
    pub fn fqn(&self) -> Option<&Fqn> {
        match self {
            Command::PutKeyValue { fqn, .. }
            | Command::PutDataMap { fqn, .. }
            | Command::RemoveKey { fqn, .. }
            | Command::RemoveNode { fqn }
            | Command::ClearData { fqn }
            | Command::Evict { fqn, .. }
            | Command::Invalidate { fqn, .. }
            | Command::GetKeyValue { fqn, .. }
            | Command::GetData { fqn }
            | Command::GetKeys { fqn }
            | Command::GetChildrenNames { fqn }
            | Command::Exists { fqn }
            | Command::GravitateData { fqn, .. } => Some(fqn),
            Command::Move { from, .. } => Some(from),
            Command::DataGravitationCleanup { primary, .. } => Some(primary),
            Command::Prepare { .. } | Command::Commit { .. } | Command::Rollback { .. } => None,
        }
    }

    /// Writes that take part in transactions and are replicated.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Command::PutKeyValue { .. }
                | Command::PutDataMap { .. }
                | Command::RemoveKey { .. }
                | Command::RemoveNode { .. }
                | Command::ClearData { .. }
                | Command::Move { .. }
        )
    }

    /// Plain reads answered from the tree.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Command::GetKeyValue { .. }
                | Command::GetData { .. }
                | Command::GetKeys { .. }
                | Command::GetChildrenNames { .. }
                | Command::Exists { .. }
        )
    }

    /// Commands that mutate the tree outside of transactions
    /// (eviction, invalidation, gravitation cleanup).
    pub fn is_maintenance(&self) -> bool {
        matches!(
            self,
            Command::Evict { .. } | Command::Invalidate { .. } | Command::DataGravitationCleanup { .. }
        )
    }

    pub fn is_transaction_boundary(&self) -> bool {
        matches!(
            self,
            Command::Prepare { .. } | Command::Commit { .. } | Command::Rollback { .. }
        )
    }

    /// The transaction a boundary command refers to.
    pub fn gtx(&self) -> Option<&GlobalTransaction> {
        match self {
            Command::Prepare { gtx, .. } | Command::Commit { gtx } | Command::Rollback { gtx } => {
                Some(gtx)
            }
            _ => None,
        }
    }

    /// Paths whose state a write changes.
    pub fn modified_fqns(&self) -> Vec<Fqn> {
        match self {
            Command::PutKeyValue { fqn, .. }
            | Command::PutDataMap { fqn, .. }
            | Command::RemoveKey { fqn, .. }
            | Command::RemoveNode { fqn }
            | Command::ClearData { fqn }
            | Command::Evict { fqn, .. }
            | Command::Invalidate { fqn, .. } => vec![fqn.clone()],
            Command::Move { from, to_parent } => match from.last_element() {
                Some(name) => vec![from.clone(), to_parent.child(name)],
                None => vec![from.clone()],
            },
            Command::DataGravitationCleanup { primary, .. } => vec![primary.clone()],
            Command::Prepare { modifications, .. } => modifications
                .iter()
                .flat_map(|m| m.modified_fqns())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// The same command with every path rewritten by `f`. Transaction
    /// boundaries rewrite their modifications and versions.
    pub fn map_fqns(&self, f: &dyn Fn(&Fqn) -> Fqn) -> Command {
        let mut cmd = self.clone();
        match &mut cmd {
            Command::PutKeyValue { fqn, .. }
            | Command::PutDataMap { fqn, .. }
            | Command::RemoveKey { fqn, .. }
            | Command::RemoveNode { fqn }
            | Command::ClearData { fqn }
            | Command::Evict { fqn, .. }
            | Command::Invalidate { fqn, .. }
            | Command::GetKeyValue { fqn, .. }
            | Command::GetData { fqn }
            | Command::GetKeys { fqn }
            | Command::GetChildrenNames { fqn }
            | Command::Exists { fqn }
            | Command::GravitateData { fqn, .. } => *fqn = f(fqn),
            Command::Move { from, to_parent } => {
                *from = f(from);
                *to_parent = f(to_parent);
            }
            Command::DataGravitationCleanup { primary, .. } => *primary = f(primary),
            Command::Prepare {
                modifications,
                versions,
                ..
            } => {
                *modifications = modifications.iter().map(|m| m.map_fqns(f)).collect();
                for (fqn, _) in versions.iter_mut() {
                    *fqn = f(fqn);
                }
            }
            Command::Commit { .. } | Command::Rollback { .. } => {}
        }
        cmd
    }

    /// Serialize for the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.fqn(), self.gtx()) {
            (Some(fqn), _) => write!(f, "{}({})", self.name(), fqn),
            (None, Some(gtx)) => write!(f, "{}({})", self.name(), gtx),
            (None, None) => f.write_str(self.name()),
        }
    }
}

/// What a member found when asked to gravitate a path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GravitateResult {
    /// Whether any copy was found.
    pub found: bool,
    /// Where the copy lives on the responding member (primary or backup path).
    pub location: Option<Fqn>,
    /// The subtree rooted at `location`, parent first.
    pub nodes: Vec<NodeSnapshot>,
}

impl GravitateResult {
    pub fn not_found() -> Self {
        Self::default()
    }

    /// The gravitated subtree rewritten to live under `primary`.
    pub fn relocated_to(&self, primary: &Fqn) -> Vec<NodeSnapshot> {
        match &self.location {
            Some(location) => self
                .nodes
                .iter()
                .map(|n| n.relocated(location, primary))
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Result of executing a command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum CommandResult {
    #[default]
    None,
    Value(Option<Bytes>),
    Data(Option<AttributeMap>),
    Names(Option<BTreeSet<String>>),
    Bool(bool),
    Gravitation(GravitateResult),
}

impl CommandResult {
    pub fn into_value(self) -> Option<Bytes> {
        match self {
            CommandResult::Value(v) => v,
            _ => None,
        }
    }

    pub fn into_data(self) -> Option<AttributeMap> {
        match self {
            CommandResult::Data(d) => d,
            _ => None,
        }
    }

    pub fn into_names(self) -> Option<BTreeSet<String>> {
        match self {
            CommandResult::Names(n) => n,
            _ => None,
        }
    }

    pub fn into_bool(self) -> bool {
        matches!(self, CommandResult::Bool(true))
    }

    pub fn into_gravitation(self) -> GravitateResult {
        match self {
            CommandResult::Gravitation(g) => g,
            _ => GravitateResult::not_found(),
        }
    }

    /// Whether a read found something.
    pub fn is_hit(&self) -> bool {
        match self {
            CommandResult::Value(v) => v.is_some(),
            CommandResult::Data(d) => d.is_some(),
            CommandResult::Names(n) => n.is_some(),
            CommandResult::Bool(b) => *b,
            CommandResult::Gravitation(g) => g.found,
            CommandResult::None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_serialization() {
        let cmd = Command::put("/a/b", "k", "v");
        let bytes = cmd.to_bytes().unwrap();
        assert_eq!(Command::from_bytes(&bytes).unwrap(), cmd);
    }

    #[test]
    fn test_classification() {
        assert!(Command::put("/a", "k", "v").is_write());
        assert!(Command::get("/a", "k").is_read());
        assert!(!Command::get("/a", "k").is_write());
        assert!(Command::Evict {
            fqn: Fqn::parse("/a"),
            recursive: false
        }
        .is_maintenance());
        let gtx = GlobalTransaction::new(1, 1);
        assert!(Command::Commit { gtx: gtx.clone() }.is_transaction_boundary());
        assert_eq!(Command::Commit { gtx: gtx.clone() }.gtx(), Some(&gtx));
    }

    #[test]
    fn test_map_fqns_rewrites_prepare_modifications() {
        let gtx = GlobalTransaction::new(1, 7);
        let prepare = Command::Prepare {
            gtx,
            modifications: vec![Command::put("/a", "k", "v"), Command::remove_node("/b")],
            versions: vec![(Fqn::parse("/a"), DataVersion::Default(3))],
            one_phase: false,
        };
        let backup = Fqn::parse("/backup");
        let mapped = prepare.map_fqns(&|f: &Fqn| backup.join(f));

        assert_eq!(
            mapped.modified_fqns(),
            vec![Fqn::parse("/backup/a"), Fqn::parse("/backup/b")]
        );
        if let Command::Prepare { versions, .. } = mapped {
            assert_eq!(versions[0].0, Fqn::parse("/backup/a"));
        } else {
            panic!("expected Prepare");
        }
    }

    #[test]
    fn test_move_modifies_source_and_target() {
        let cmd = Command::Move {
            from: Fqn::parse("/a/b"),
            to_parent: Fqn::parse("/x"),
        };
        assert_eq!(
            cmd.modified_fqns(),
            vec![Fqn::parse("/a/b"), Fqn::parse("/x/b")]
        );
    }
}
