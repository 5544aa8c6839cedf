//! Per-transaction shadow copies of touched nodes.

use crate::command::{Command, CommandResult};
use crate::error::{Error, Result};
use crate::fqn::Fqn;
use crate::notifications::CacheEvent;
use crate::tree::{DataContainer, Node};
use crate::types::AttributeMap;
use crate::version::DataVersion;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

/// A transaction's private copy of one node.
#[derive(Debug, Clone)]
pub struct WorkspaceNode {
    /// Version the node had when first touched; `None` if it did not exist.
    pub original_version: Option<DataVersion>,
    /// Shared with the tree until first written.
    pub data: Arc<AttributeMap>,
    pub children_added: BTreeSet<String>,
    pub children_removed: BTreeSet<String>,
    pub created: bool,
    pub deleted: bool,
    pub dirty: bool,
    pub structure_changed: bool,
    pub explicit_version: Option<DataVersion>,
    /// Computed at prepare.
    pub new_version: Option<DataVersion>,
}

impl WorkspaceNode {
    fn from_tree(node: Option<&Node>) -> Self {
        let mut ws = WorkspaceNode::absent();
        if let Some(node) = node {
            ws.original_version = Some(node.version());
            if node.is_valid() {
                ws.data = node.data();
                ws.created = false;
            }
        }
        ws
    }

    fn from_read(read: &ReadSnapshot) -> Self {
        WorkspaceNode {
            original_version: Some(read.version.clone()),
            data: read.data.clone(),
            created: false,
            ..WorkspaceNode::absent()
        }
    }

    fn absent() -> Self {
        WorkspaceNode {
            original_version: None,
            data: Arc::new(AttributeMap::new()),
            children_added: BTreeSet::new(),
            children_removed: BTreeSet::new(),
            created: true,
            deleted: false,
            dirty: false,
            structure_changed: false,
            explicit_version: None,
            new_version: None,
        }
    }

    fn revive(&mut self) {
        if self.deleted {
            self.deleted = false;
            self.data = Arc::new(AttributeMap::new());
            self.dirty = true;
        }
    }

    fn link_child(&mut self, name: &str) {
        self.children_removed.remove(name);
        self.children_added.insert(name.to_string());
        self.structure_changed = true;
    }

    fn unlink_child(&mut self, name: &str) {
        self.children_added.remove(name);
        self.children_removed.insert(name.to_string());
        self.structure_changed = true;
    }

    fn data_mut(&mut self) -> &mut AttributeMap {
        self.dirty = true;
        Arc::make_mut(&mut self.data)
    }

    /// Whether the node's own contents or existence changed.
    pub fn is_modified(&self) -> bool {
        self.dirty || self.created || self.deleted
    }
}

/// What an MVCC transaction saw the first time it read a node.
#[derive(Debug, Clone)]
struct ReadSnapshot {
    version: DataVersion,
    data: Arc<AttributeMap>,
}

enum Lookup {
    Present(Arc<AttributeMap>),
    Absent,
}

impl Lookup {
    fn is_present(&self) -> bool {
        matches!(self, Lookup::Present(_))
    }
}

/// Shadow copies of every node a transaction touched.
///
/// In optimistic mode nodes are copied on first access, reads included,
/// and every copy is validated at prepare; a structural change bumps the
/// parent's version. In MVCC mode a read only remembers the version and
/// data it saw; the node is copied when written, starting from that
/// snapshot, so only modified nodes are validated but always against the
/// version the transaction actually read. Ancestors created concurrently
/// by another transaction are merged rather than treated as conflicts.
#[derive(Debug, Clone, Default)]
pub struct TransactionWorkspace {
    nodes: BTreeMap<Fqn, WorkspaceNode>,
    reads: BTreeMap<Fqn, ReadSnapshot>,
    mvcc: bool,
}

impl TransactionWorkspace {
    pub fn set_mvcc(&mut self, mvcc: bool) {
        self.mvcc = mvcc;
    }

    pub fn is_mvcc(&self) -> bool {
        self.mvcc
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, fqn: &Fqn) -> Option<&WorkspaceNode> {
        self.nodes.get(fqn)
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.reads.clear();
    }

    /// Version this transaction read `fqn` at, if it read it without
    /// writing it.
    pub fn read_version(&self, fqn: &Fqn) -> Option<&DataVersion> {
        self.reads.get(fqn).map(|r| &r.version)
    }

    /// Private copy of `fqn`, starting from the read snapshot if there is one.
    fn copy_of(&self, container: &DataContainer, fqn: &Fqn) -> WorkspaceNode {
        match self.reads.get(fqn) {
            Some(read) => WorkspaceNode::from_read(read),
            None => WorkspaceNode::from_tree(container.peek(fqn).as_deref()),
        }
    }

    fn lookup(&mut self, container: &DataContainer, fqn: &Fqn) -> Lookup {
        if let Some(node) = self.nodes.get(fqn) {
            return if node.deleted {
                Lookup::Absent
            } else {
                Lookup::Present(node.data.clone())
            };
        }
        if let Some(read) = self.reads.get(fqn) {
            return Lookup::Present(read.data.clone());
        }
        match container.peek_valid(fqn) {
            Some(node) => {
                let data = node.data();
                if self.mvcc {
                    let version = node.version();
                    self.reads.insert(
                        fqn.clone(),
                        ReadSnapshot {
                            version,
                            data: data.clone(),
                        },
                    );
                } else {
                    self.nodes
                        .insert(fqn.clone(), WorkspaceNode::from_tree(Some(node.as_ref())));
                }
                Lookup::Present(data)
            }
            None => Lookup::Absent,
        }
    }

    pub fn exists(&mut self, container: &DataContainer, fqn: &Fqn) -> bool {
        self.lookup(container, fqn).is_present()
    }

    pub fn get(&mut self, container: &DataContainer, fqn: &Fqn, key: &str) -> Option<bytes::Bytes> {
        match self.lookup(container, fqn) {
            Lookup::Present(data) => data.get(key).cloned(),
            Lookup::Absent => None,
        }
    }

    pub fn get_data(&mut self, container: &DataContainer, fqn: &Fqn) -> Option<AttributeMap> {
        match self.lookup(container, fqn) {
            Lookup::Present(data) => Some((*data).clone()),
            Lookup::Absent => None,
        }
    }

    pub fn get_keys(&mut self, container: &DataContainer, fqn: &Fqn) -> Option<BTreeSet<String>> {
        match self.lookup(container, fqn) {
            Lookup::Present(data) => Some(data.keys().cloned().collect()),
            Lookup::Absent => None,
        }
    }

    /// Children visible to this transaction.
    pub fn children_names(
        &mut self,
        container: &DataContainer,
        fqn: &Fqn,
    ) -> Option<BTreeSet<String>> {
        if !self.exists(container, fqn) {
            return None;
        }
        let mut names: BTreeSet<String> = container
            .peek_valid(fqn)
            .map(|n| n.children_names())
            .unwrap_or_default();
        if let Some(node) = self.nodes.get(fqn) {
            names.extend(node.children_added.iter().cloned());
            for removed in &node.children_removed {
                names.remove(removed);
            }
        }
        let visible = names
            .into_iter()
            .filter(|name| self.exists(container, &fqn.child(name.as_str())))
            .collect();
        Some(visible)
    }

    /// Make `fqn` writable in the workspace, creating it (and missing
    /// ancestors) if this transaction can't see it.
    fn ensure_for_write(&mut self, container: &DataContainer, fqn: &Fqn) -> &mut WorkspaceNode {
        let visible = self.lookup(container, fqn).is_present();
        if !visible {
            if let Some(name) = fqn.last_element() {
                let name = name.to_string();
                self.ensure_for_write(container, &fqn.parent())
                    .link_child(&name);
            }
        }
        let copy = self.copy_of(container, fqn);
        let node = self.nodes.entry(fqn.clone()).or_insert(copy);
        if !visible {
            node.revive();
        }
        node
    }

    /// The subtree visible at `fqn`, parent first.
    fn visible_subtree(&mut self, container: &DataContainer, fqn: &Fqn) -> Vec<Fqn> {
        let mut out = Vec::new();
        let mut queue = VecDeque::from([fqn.clone()]);
        while let Some(current) = queue.pop_front() {
            if let Some(children) = self.children_names(container, &current) {
                queue.extend(children.into_iter().map(|c| current.child(c)));
                out.push(current);
            }
        }
        out
    }

    fn remove_node(&mut self, container: &DataContainer, fqn: &Fqn) -> bool {
        if !self.exists(container, fqn) {
            return false;
        }
        let subtree = self.visible_subtree(container, fqn);
        if fqn.is_root() {
            for child in subtree.iter().skip(1) {
                self.mark_deleted(container, child);
            }
            let root = self.ensure_for_write(container, fqn);
            root.data_mut().clear();
            for child in subtree.iter().filter(|f| f.is_direct_child_of(fqn)) {
                if let Some(name) = child.last_element() {
                    root.unlink_child(name);
                }
            }
            return true;
        }
        for path in &subtree {
            self.mark_deleted(container, path);
        }
        if let Some(name) = fqn.last_element() {
            let name = name.to_string();
            self.ensure_for_write(container, &fqn.parent())
                .unlink_child(&name);
        }
        true
    }

    fn mark_deleted(&mut self, container: &DataContainer, fqn: &Fqn) {
        let copy = self.copy_of(container, fqn);
        let node = self.nodes.entry(fqn.clone()).or_insert(copy);
        node.deleted = true;
        node.dirty = false;
    }

    /// Apply a write command to the workspace.
    pub fn apply_write(
        &mut self,
        container: &DataContainer,
        command: &Command,
        explicit_version: Option<&DataVersion>,
    ) -> Result<CommandResult> {
        let result = match command {
            Command::PutKeyValue {
                fqn,
                key,
                value,
                put_for_external_read,
            } => {
                if *put_for_external_read && self.get(container, fqn, key).is_some() {
                    return Ok(CommandResult::Value(None));
                }
                let node = self.ensure_for_write(container, fqn);
                CommandResult::Value(node.data_mut().insert(key.clone(), value.clone()))
            }
            Command::PutDataMap {
                fqn,
                data,
                erase_contents,
            } => {
                let map = self.ensure_for_write(container, fqn).data_mut();
                if *erase_contents {
                    map.clear();
                }
                map.extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
                CommandResult::None
            }
            Command::RemoveKey { fqn, key } => {
                if self.get(container, fqn, key).is_none() {
                    return Ok(CommandResult::Value(None));
                }
                CommandResult::Value(self.ensure_for_write(container, fqn).data_mut().remove(key))
            }
            Command::ClearData { fqn } => {
                if self.exists(container, fqn) {
                    self.ensure_for_write(container, fqn).data_mut().clear();
                }
                CommandResult::None
            }
            Command::RemoveNode { fqn } => CommandResult::Bool(self.remove_node(container, fqn)),
            Command::Move { from, to_parent } => {
                self.move_node(container, from, to_parent)?;
                CommandResult::None
            }
            other => {
                return Err(Error::InvalidOperation(format!(
                    "{} cannot run inside a transaction workspace",
                    other.name()
                )))
            }
        };

        if let (Some(version), Some(fqn)) = (explicit_version, command.fqn()) {
            self.set_explicit_version(fqn, version.clone());
        }
        Ok(result)
    }

    fn move_node(&mut self, container: &DataContainer, from: &Fqn, to_parent: &Fqn) -> Result<()> {
        let name = from
            .last_element()
            .ok_or_else(|| Error::InvalidOperation("cannot move the root".to_string()))?;
        if to_parent.is_child_or_equals(from) {
            return Err(Error::InvalidOperation(format!(
                "cannot move {} below itself ({})",
                from, to_parent
            )));
        }
        if !self.exists(container, to_parent) {
            return Err(Error::NodeNotExists(to_parent.clone()));
        }
        if !self.exists(container, from) {
            return Err(Error::NodeNotExists(from.clone()));
        }
        let target = to_parent.child(name);

        let moved: Vec<(Fqn, AttributeMap)> = self
            .visible_subtree(container, from)
            .into_iter()
            .map(|f| {
                let data = self.get_data(container, &f).unwrap_or_default();
                (f.replace_ancestor(from, &target), data)
            })
            .collect();
        self.remove_node(container, from);
        self.remove_node(container, &target);
        for (fqn, data) in moved {
            *self.ensure_for_write(container, &fqn).data_mut() = data;
        }
        Ok(())
    }

    pub fn set_explicit_version(&mut self, fqn: &Fqn, version: DataVersion) {
        if let Some(node) = self.nodes.get_mut(fqn) {
            node.explicit_version = Some(version);
        }
    }

    fn must_write(&self, node: &WorkspaceNode) -> bool {
        node.is_modified() || (!self.mvcc && node.structure_changed)
    }

    fn must_validate(&self, node: &WorkspaceNode) -> bool {
        !self.mvcc || node.is_modified()
    }

    /// Nodes to lock at prepare, in lock order.
    pub fn lock_set(&self) -> Vec<Fqn> {
        self.nodes
            .iter()
            .filter(|(_, n)| self.must_validate(n))
            .map(|(f, _)| f.clone())
            .collect()
    }

    /// Check every copy against the tree. Fails with
    /// [`Error::VersionConflict`] when the tree moved on, or with
    /// [`Error::VersionTypeMismatch`] when versions of different kinds meet.
    pub fn validate(&self, container: &DataContainer) -> Result<()> {
        for (fqn, node) in self.nodes.iter().filter(|(_, n)| self.must_validate(n)) {
            let current = container.peek(fqn);
            let current_valid = current.as_ref().filter(|n| n.is_valid());

            match (&node.original_version, &current) {
                (None, _) => {
                    if let Some(tree) = current_valid {
                        if node.dirty && !self.mvcc {
                            return Err(conflict(fqn, "absent", tree.version().to_string()));
                        }
                    }
                }
                (Some(original), None) => {
                    if !node.deleted {
                        return Err(conflict(fqn, original.to_string(), "removed"));
                    }
                }
                (Some(original), Some(tree)) => {
                    let actual = tree.version();
                    if actual.newer_than(original)? {
                        return Err(conflict(fqn, original.to_string(), actual.to_string()));
                    }
                }
            }

            if let (Some(explicit), Some(tree)) = (&node.explicit_version, current_valid) {
                if !node.created && !explicit.newer_than(&tree.version())? {
                    return Err(conflict(
                        fqn,
                        format!("older than {}", explicit),
                        tree.version().to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Assign the version each written node will carry after commit.
    pub fn compute_versions(&mut self, container: &DataContainer) -> Result<()> {
        let mvcc = self.mvcc;
        for (fqn, node) in self.nodes.iter_mut() {
            let writes = node.is_modified() || (!mvcc && node.structure_changed);
            if !writes || node.deleted {
                node.new_version = None;
                continue;
            }
            node.new_version = Some(match &node.explicit_version {
                Some(explicit) => explicit.clone(),
                None => container
                    .peek(fqn)
                    .map(|n| n.version())
                    .unwrap_or_else(DataVersion::initial)
                    .increment()?,
            });
        }
        Ok(())
    }

    /// Versions assigned by [`compute_versions`](Self::compute_versions).
    pub fn new_versions(&self) -> Vec<(Fqn, DataVersion)> {
        self.nodes
            .iter()
            .filter_map(|(f, n)| n.new_version.clone().map(|v| (f.clone(), v)))
            .collect()
    }

    /// Install the workspace into the tree. Returns the events produced.
    pub fn commit(&mut self, container: &DataContainer) -> Vec<CacheEvent> {
        let nodes = std::mem::take(&mut self.nodes);
        self.reads.clear();
        let mut events = Vec::new();

        for (fqn, _) in nodes.iter().filter(|(_, n)| n.deleted && !n.created) {
            if container.remove_subtree(fqn).is_some() {
                events.push(CacheEvent::NodeRemoved(fqn.clone()));
            }
        }

        for (fqn, node) in nodes.iter().filter(|(_, n)| !n.deleted && self.must_write(n)) {
            let (tree, created) = container.get_or_create(fqn);
            events.extend(created.into_iter().map(CacheEvent::NodeCreated));
            if !tree.is_valid() {
                tree.set_valid(true);
                tree.set_data_loaded(true);
                events.push(CacheEvent::NodeCreated(fqn.clone()));
            }
            if node.dirty {
                tree.replace_data(node.data.clone());
                events.push(CacheEvent::NodeModified(fqn.clone()));
            }
            if let Some(version) = &node.new_version {
                tree.set_version(version.clone());
            }
        }
        events
    }
}

fn conflict(fqn: &Fqn, expected: impl Into<String>, actual: impl Into<String>) -> Error {
    Error::VersionConflict {
        fqn: fqn.clone(),
        expected: expected.into(),
        actual: actual.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn seeded() -> DataContainer {
        let container = DataContainer::new();
        Command::put("/y", "k", "v1").apply(&container, None).unwrap();
        container
    }

    #[test]
    fn test_writes_are_private_until_commit() {
        let container = seeded();
        let mut ws = TransactionWorkspace::default();
        ws.apply_write(&container, &Command::put("/y", "k", "v2"), None)
            .unwrap();
        ws.apply_write(&container, &Command::put("/a/b", "x", "1"), None)
            .unwrap();

        assert_eq!(ws.get(&container, &Fqn::parse("/y"), "k"), Some(Bytes::from("v2")));
        assert_eq!(
            container.peek(&Fqn::parse("/y")).unwrap().get("k"),
            Some(Bytes::from("v1"))
        );
        assert!(!container.exists(&Fqn::parse("/a")));

        ws.validate(&container).unwrap();
        ws.compute_versions(&container).unwrap();
        ws.commit(&container);
        assert_eq!(
            container.peek(&Fqn::parse("/y")).unwrap().get("k"),
            Some(Bytes::from("v2"))
        );
        assert!(container.exists(&Fqn::parse("/a/b")));
    }

    #[test]
    fn test_stale_read_fails_validation() {
        let container = seeded();
        let y = Fqn::parse("/y");
        container.peek(&y).unwrap().set_version(DataVersion::Default(3));

        let mut ws = TransactionWorkspace::default();
        ws.apply_write(&container, &Command::put("/y", "k", "mine"), None)
            .unwrap();
        container.peek(&y).unwrap().set_version(DataVersion::Default(5));

        let err = ws.validate(&container).unwrap_err();
        assert!(matches!(err, Error::VersionConflict { .. }));
    }

    #[test]
    fn test_current_read_commits_newer_version() {
        let container = seeded();
        let y = Fqn::parse("/y");
        container.peek(&y).unwrap().set_version(DataVersion::Default(5));

        let mut ws = TransactionWorkspace::default();
        ws.apply_write(&container, &Command::put("/y", "k", "mine"), None)
            .unwrap();
        ws.validate(&container).unwrap();
        ws.compute_versions(&container).unwrap();
        ws.commit(&container);

        let version = container.peek(&y).unwrap().version();
        assert!(version.newer_than(&DataVersion::Default(5)).unwrap());
    }

    #[test]
    fn test_mismatched_version_kinds_are_not_conflicts() {
        let container = seeded();
        let mut ws = TransactionWorkspace::default();
        ws.apply_write(
            &container,
            &Command::put("/y", "k", "v"),
            Some(&DataVersion::custom("ts", 10)),
        )
        .unwrap();
        let err = ws.validate(&container).unwrap_err();
        assert!(matches!(err, Error::VersionTypeMismatch { .. }));
    }

    #[test]
    fn test_optimistic_validates_reads_but_mvcc_does_not() {
        let container = seeded();
        let y = Fqn::parse("/y");

        let mut optimistic = TransactionWorkspace::default();
        optimistic.get(&container, &y, "k");
        let mut mvcc = TransactionWorkspace::default();
        mvcc.set_mvcc(true);
        mvcc.get(&container, &y, "k");
        assert_eq!(optimistic.len(), 1);
        assert!(mvcc.is_empty());

        Command::put("/y", "k", "other").apply(&container, None).unwrap();
        assert!(optimistic.validate(&container).is_err());
        assert!(mvcc.validate(&container).is_ok());
    }

    #[test]
    fn test_mvcc_write_validates_against_version_read() {
        let container = seeded();
        let y = Fqn::parse("/y");
        let mut ws = TransactionWorkspace::default();
        ws.set_mvcc(true);
        assert_eq!(ws.get(&container, &y, "k"), Some(Bytes::from("v1")));
        let seen = ws.read_version(&y).cloned().unwrap();

        Command::put("/y", "k", "other").apply(&container, None).unwrap();
        assert_eq!(ws.get(&container, &y, "k"), Some(Bytes::from("v1")));

        ws.apply_write(&container, &Command::put("/y", "k2", "mine"), None)
            .unwrap();
        assert_eq!(ws.node(&y).unwrap().original_version, Some(seen));
        assert_eq!(ws.get(&container, &y, "k"), Some(Bytes::from("v1")));
        let err = ws.validate(&container).unwrap_err();
        assert!(matches!(err, Error::VersionConflict { .. }));
    }

    #[test]
    fn test_mvcc_merges_concurrently_created_parent() {
        let container = DataContainer::new();
        let mut first = TransactionWorkspace::default();
        first.set_mvcc(true);
        first
            .apply_write(&container, &Command::put("/p/a", "k", "1"), None)
            .unwrap();

        let mut second = TransactionWorkspace::default();
        second.set_mvcc(true);
        second
            .apply_write(&container, &Command::put("/p/b", "k", "2"), None)
            .unwrap();

        first.validate(&container).unwrap();
        first.compute_versions(&container).unwrap();
        first.commit(&container);

        second.validate(&container).unwrap();
        second.compute_versions(&container).unwrap();
        second.commit(&container);

        let children = container.peek(&Fqn::parse("/p")).unwrap().children_names();
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn test_remove_and_move_in_workspace() {
        let container = DataContainer::new();
        Command::put("/a/b/c", "k", "v").apply(&container, None).unwrap();
        Command::put("/x", "k", "v").apply(&container, None).unwrap();

        let mut ws = TransactionWorkspace::default();
        ws.apply_write(
            &container,
            &Command::Move {
                from: Fqn::parse("/a/b"),
                to_parent: Fqn::parse("/x"),
            },
            None,
        )
        .unwrap();
        assert!(!ws.exists(&container, &Fqn::parse("/a/b")));
        assert_eq!(
            ws.get(&container, &Fqn::parse("/x/b/c"), "k"),
            Some(Bytes::from("v"))
        );
        assert_eq!(
            ws.children_names(&container, &Fqn::parse("/a")),
            Some(BTreeSet::new())
        );

        ws.validate(&container).unwrap();
        ws.compute_versions(&container).unwrap();
        ws.commit(&container);
        assert!(!container.exists(&Fqn::parse("/a/b")));
        assert!(container.exists(&Fqn::parse("/x/b/c")));
    }
}
