//! In-memory node tree.
//!
//! Nodes live in an arena keyed by [`Fqn`]. Parent/child links are kept as
//! child-name sets on each node and resolved through the arena, so there
//! are no back-references between nodes. The arena is sharded, so
//! operations on disjoint subtrees do not contend on a global lock.

mod node;
pub mod undo;

pub use node::{Node, NodeSnapshot};
pub use undo::UndoRecord;

use crate::error::{Error, Result};
use crate::fqn::Fqn;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

/// Arena of nodes indexed by path.
#[derive(Debug)]
pub struct DataContainer {
    nodes: DashMap<Fqn, Arc<Node>>,
}

impl Default for DataContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl DataContainer {
    /// Create a container holding only the root.
    pub fn new() -> Self {
        let nodes = DashMap::new();
        nodes.insert(Fqn::root(), Arc::new(Node::new(Fqn::root())));
        Self { nodes }
    }

    pub fn root(&self) -> Arc<Node> {
        self.nodes
            .entry(Fqn::root())
            .or_insert_with(|| Arc::new(Node::new(Fqn::root())))
            .clone()
    }

    /// Look up a node, including invalid (tombstoned) ones.
    pub fn peek(&self, fqn: &Fqn) -> Option<Arc<Node>> {
        self.nodes.get(fqn).map(|n| n.clone())
    }

    /// Look up a node that is visible to readers.
    pub fn peek_valid(&self, fqn: &Fqn) -> Option<Arc<Node>> {
        self.peek(fqn).filter(|n| n.is_valid())
    }

    pub fn exists(&self, fqn: &Fqn) -> bool {
        self.peek_valid(fqn).is_some()
    }

    /// Get a node, creating it and any missing ancestors.
    ///
    /// Returns the node plus the paths created, parent first.
    pub fn get_or_create(&self, fqn: &Fqn) -> (Arc<Node>, Vec<Fqn>) {
        if let Some(node) = self.peek(fqn) {
            return (node, Vec::new());
        }

        let mut created = Vec::new();
        let mut parent = self.root();
        for depth in 1..=fqn.depth() {
            let path = fqn.prefix(depth);
            let (node, is_new) = match self.nodes.entry(path.clone()) {
                Entry::Occupied(e) => (e.get().clone(), false),
                Entry::Vacant(v) => (v.insert(Arc::new(Node::new(path.clone()))).clone(), true),
            };
            if let Some(name) = path.last_element() {
                parent.add_child(name);
            }
            if is_new {
                trace!(fqn = %path, "Created node");
                created.push(path);
            }
            parent = node;
        }
        (parent, created)
    }

    /// Names of the children of `fqn`.
    pub fn children_of(&self, fqn: &Fqn) -> Vec<Fqn> {
        match self.peek(fqn) {
            Some(node) => node
                .children_names()
                .into_iter()
                .map(|name| fqn.child(name))
                .collect(),
            None => Vec::new(),
        }
    }

    /// `fqn` and every node below it, parent first.
    pub fn subtree_fqns(&self, fqn: &Fqn) -> Vec<Fqn> {
        let mut out = Vec::new();
        if self.peek(fqn).is_none() {
            return out;
        }
        let mut queue = VecDeque::from([fqn.clone()]);
        while let Some(current) = queue.pop_front() {
            queue.extend(self.children_of(&current));
            out.push(current);
        }
        out
    }

    /// Snapshot `fqn` and its descendants, parent first.
    pub fn snapshot_subtree(&self, fqn: &Fqn) -> Vec<NodeSnapshot> {
        self.subtree_fqns(fqn)
            .iter()
            .filter_map(|f| self.peek(f))
            .map(|n| n.snapshot())
            .collect()
    }

    /// Remove `fqn` and everything below it.
    ///
    /// Removing the root clears its data and drops all children but keeps
    /// the root node itself. Returns the removed paths, or `None` if the
    /// node did not exist.
    pub fn remove_subtree(&self, fqn: &Fqn) -> Option<Vec<Fqn>> {
        let removed = self.subtree_fqns(fqn);
        if removed.is_empty() {
            return None;
        }

        if fqn.is_root() {
            let root = self.root();
            for child in root.children_names() {
                root.remove_child(&child);
            }
            root.clear_data();
            for path in removed.iter().skip(1) {
                self.nodes.remove(path);
            }
            return Some(removed);
        }

        if let Some(parent) = self.peek(&fqn.parent()) {
            if let Some(name) = fqn.last_element() {
                parent.remove_child(name);
            }
        }
        for path in removed.iter().rev() {
            self.nodes.remove(path);
        }
        Some(removed)
    }

    /// Re-create nodes from snapshots (parent first), restoring their state.
    pub fn restore(&self, snapshots: &[NodeSnapshot]) {
        for snapshot in snapshots {
            let (node, _) = self.get_or_create(&snapshot.fqn);
            node.restore(snapshot);
        }
    }

    /// Move `from` (and its subtree) below `to_parent`. Returns the new path.
    pub fn move_subtree(&self, from: &Fqn, to_parent: &Fqn) -> Result<Fqn> {
        let name = from
            .last_element()
            .ok_or_else(|| Error::InvalidOperation("cannot move the root".to_string()))?;
        if to_parent.is_child_or_equals(from) {
            return Err(Error::InvalidOperation(format!(
                "cannot move {} below itself ({})",
                from, to_parent
            )));
        }
        if !self.exists(from) {
            return Err(Error::NodeNotExists(from.clone()));
        }
        let target = to_parent.child(name);
        let snapshots: Vec<NodeSnapshot> = self
            .snapshot_subtree(from)
            .iter()
            .map(|s| s.relocated(from, &target))
            .collect();
        self.remove_subtree(from);
        self.remove_subtree(&target);
        self.restore(&snapshots);
        Ok(target)
    }

    /// Number of nodes, root included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Every path currently in the arena, sorted.
    pub fn all_fqns(&self) -> Vec<Fqn> {
        let mut fqns: Vec<Fqn> = self.nodes.iter().map(|e| e.key().clone()).collect();
        fqns.sort();
        fqns
    }
}
