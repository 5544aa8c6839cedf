//! A single node of the tree.

use crate::fqn::Fqn;
use crate::types::AttributeMap;
use crate::version::DataVersion;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct NodeState {
    /// Shared so readers and MVCC workspaces can hold a snapshot without
    /// copying; writers copy on write.
    data: Arc<AttributeMap>,
    children: BTreeSet<String>,
    version: DataVersion,
    /// False once the node has been invalidated in place (tombstone).
    valid: bool,
    /// False after eviction cleared the data of a node with children.
    data_loaded: bool,
}

/// A node in the arena. Children are referenced by name and resolved
/// through the container, never by pointer.
#[derive(Debug)]
pub struct Node {
    fqn: Fqn,
    state: RwLock<NodeState>,
}

impl Node {
    pub(crate) fn new(fqn: Fqn) -> Self {
        Self {
            fqn,
            state: RwLock::new(NodeState {
                data: Arc::new(AttributeMap::new()),
                children: BTreeSet::new(),
                version: DataVersion::initial(),
                valid: true,
                data_loaded: true,
            }),
        }
    }

    pub fn fqn(&self) -> &Fqn {
        &self.fqn
    }

    /// Snapshot of the attribute map.
    pub fn data(&self) -> Arc<AttributeMap> {
        self.state.read().data.clone()
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.state.read().data.get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.state.read().data.contains_key(key)
    }

    pub fn keys(&self) -> BTreeSet<String> {
        self.state.read().data.keys().cloned().collect()
    }

    pub fn put(&self, key: String, value: Bytes) -> Option<Bytes> {
        let mut state = self.state.write();
        Arc::make_mut(&mut state.data).insert(key, value)
    }

    /// Merge `data` into the node, optionally clearing existing attributes first.
    pub fn put_all(&self, data: &AttributeMap, erase_contents: bool) {
        let mut state = self.state.write();
        let map = Arc::make_mut(&mut state.data);
        if erase_contents {
            map.clear();
        }
        for (k, v) in data {
            map.insert(k.clone(), v.clone());
        }
    }

    /// Merge `data` without overwriting keys already present.
    pub fn put_all_absent(&self, data: &AttributeMap) {
        let mut state = self.state.write();
        let map = Arc::make_mut(&mut state.data);
        for (k, v) in data {
            map.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    pub fn remove(&self, key: &str) -> Option<Bytes> {
        let mut state = self.state.write();
        if !state.data.contains_key(key) {
            return None;
        }
        Arc::make_mut(&mut state.data).remove(key)
    }

    /// Replace the attribute map wholesale.
    pub fn replace_data(&self, data: Arc<AttributeMap>) {
        self.state.write().data = data;
    }

    pub fn clear_data(&self) {
        self.state.write().data = Arc::new(AttributeMap::new());
    }

    pub fn version(&self) -> DataVersion {
        self.state.read().version.clone()
    }

    pub fn set_version(&self, version: DataVersion) {
        self.state.write().version = version;
    }

    pub fn is_valid(&self) -> bool {
        self.state.read().valid
    }

    pub fn set_valid(&self, valid: bool) {
        self.state.write().valid = valid;
    }

    pub fn is_data_loaded(&self) -> bool {
        self.state.read().data_loaded
    }

    pub fn set_data_loaded(&self, loaded: bool) {
        self.state.write().data_loaded = loaded;
    }

    pub fn children_names(&self) -> BTreeSet<String> {
        self.state.read().children.clone()
    }

    pub fn has_children(&self) -> bool {
        !self.state.read().children.is_empty()
    }

    pub(crate) fn add_child(&self, name: &str) {
        self.state.write().children.insert(name.to_string());
    }

    pub(crate) fn remove_child(&self, name: &str) -> bool {
        self.state.write().children.remove(name)
    }

    /// Point-in-time copy of this node's own state (children excluded).
    pub fn snapshot(&self) -> NodeSnapshot {
        let state = self.state.read();
        NodeSnapshot {
            fqn: self.fqn.clone(),
            attributes: (*state.data).clone(),
            version: state.version.clone(),
            valid: state.valid,
            data_loaded: state.data_loaded,
        }
    }

    /// Restore the node's own state from a snapshot.
    pub(crate) fn restore(&self, snapshot: &NodeSnapshot) {
        let mut state = self.state.write();
        state.data = Arc::new(snapshot.attributes.clone());
        state.version = snapshot.version.clone();
        state.valid = snapshot.valid;
        state.data_loaded = snapshot.data_loaded;
    }
}

/// Serializable copy of a node, used for undo records, gravitation
/// responses and buddy state transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub fqn: Fqn,
    pub attributes: AttributeMap,
    pub version: DataVersion,
    pub valid: bool,
    pub data_loaded: bool,
}

impl NodeSnapshot {
    /// The same snapshot relocated from one subtree to another.
    pub fn relocated(&self, old_root: &Fqn, new_root: &Fqn) -> NodeSnapshot {
        NodeSnapshot {
            fqn: self.fqn.replace_ancestor(old_root, new_root),
            ..self.clone()
        }
    }
}
