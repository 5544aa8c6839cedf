//! Undo records captured while a pessimistic transaction mutates the tree.

use crate::fqn::Fqn;
use crate::tree::{DataContainer, NodeSnapshot};

/// One reversible change. Records are replayed newest first on rollback.
#[derive(Debug, Clone, PartialEq)]
pub enum UndoRecord {
    /// Restore the node's own state (attributes, version, flags).
    RestoreNode(NodeSnapshot),

    /// Remove a node (and anything below it) the transaction created.
    RemoveCreated(Fqn),

    /// Re-create a subtree the transaction removed. Parent first.
    RestoreSubtree(Vec<NodeSnapshot>),
}

impl UndoRecord {
    /// Revert this change on `container`.
    pub fn undo(self, container: &DataContainer) {
        match self {
            UndoRecord::RestoreNode(snapshot) => {
                if let Some(node) = container.peek(&snapshot.fqn) {
                    node.restore(&snapshot);
                } else {
                    container.restore(std::slice::from_ref(&snapshot));
                }
            }
            UndoRecord::RemoveCreated(fqn) => {
                container.remove_subtree(&fqn);
            }
            UndoRecord::RestoreSubtree(snapshots) => {
                container.restore(&snapshots);
            }
        }
    }
}

/// Undo every record, newest first.
pub fn undo_all(records: Vec<UndoRecord>, container: &DataContainer) {
    for record in records.into_iter().rev() {
        record.undo(container);
    }
}
