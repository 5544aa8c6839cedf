//! Application of commands to the node tree.
//!
//! This is the innermost step of every invocation. Callers that need to
//! undo the change later (pessimistic transactions) pass an undo log that
//! receives the inverse of each mutation before it happens.

use super::{Command, CommandResult, GravitateResult};
use crate::buddy::BUDDY_BACKUP_ROOT;
use crate::error::{Error, Result};
use crate::fqn::Fqn;
use crate::notifications::CacheEvent;
use crate::tree::{DataContainer, Node, UndoRecord};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::trace;

/// Result of applying a command, plus the events it produced.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub result: CommandResult,
    pub events: Vec<CacheEvent>,
}

impl ApplyOutcome {
    fn of(result: CommandResult) -> Self {
        Self {
            result,
            events: Vec::new(),
        }
    }
}

/// Undo log wrapper so mutations don't care whether one is attached.
struct Undo<'a>(Option<&'a mut Vec<UndoRecord>>);

impl Undo<'_> {
    fn push(&mut self, record: UndoRecord) {
        if let Some(log) = self.0.as_deref_mut() {
            log.push(record);
        }
    }

    fn enabled(&self) -> bool {
        self.0.is_some()
    }
}

/// Advance a node's default version. Custom versions only move when a
/// caller supplies the next one.
fn bump_version(node: &Node) {
    if let Ok(next) = node.version().increment() {
        node.set_version(next);
    }
}

impl Command {
    /// Apply this command to `container`.
    ///
    /// Transaction boundaries and gravitation cleanup are handled by the
    /// interceptor stages and are no-ops here.
    pub fn apply(
        &self,
        container: &DataContainer,
        undo: Option<&mut Vec<UndoRecord>>,
    ) -> Result<ApplyOutcome> {
        let mut undo = Undo(undo);
        trace!(command = %self, "Applying command");
        match self {
            Command::PutKeyValue {
                fqn,
                key,
                value,
                put_for_external_read,
            } => {
                if *put_for_external_read {
                    if let Some(node) = container.peek_valid(fqn) {
                        if node.contains_key(key) {
                            return Ok(ApplyOutcome::of(CommandResult::Value(None)));
                        }
                    }
                }
                let (node, mut events) = write_target(container, fqn, &mut undo);
                let previous = node.put(key.clone(), value.clone());
                bump_version(&node);
                events.push(CacheEvent::NodeModified(fqn.clone()));
                Ok(ApplyOutcome {
                    result: CommandResult::Value(previous),
                    events,
                })
            }

            Command::PutDataMap {
                fqn,
                data,
                erase_contents,
            } => {
                let (node, mut events) = write_target(container, fqn, &mut undo);
                node.put_all(data, *erase_contents);
                bump_version(&node);
                events.push(CacheEvent::NodeModified(fqn.clone()));
                Ok(ApplyOutcome {
                    result: CommandResult::None,
                    events,
                })
            }

            Command::RemoveKey { fqn, key } => {
                let Some(node) = container.peek_valid(fqn) else {
                    return Ok(ApplyOutcome::of(CommandResult::Value(None)));
                };
                if !node.contains_key(key) {
                    return Ok(ApplyOutcome::of(CommandResult::Value(None)));
                }
                undo.push(UndoRecord::RestoreNode(node.snapshot()));
                let previous = node.remove(key);
                bump_version(&node);
                Ok(ApplyOutcome {
                    result: CommandResult::Value(previous),
                    events: vec![CacheEvent::NodeModified(fqn.clone())],
                })
            }

            Command::ClearData { fqn } => {
                let Some(node) = container.peek_valid(fqn) else {
                    return Ok(ApplyOutcome::of(CommandResult::None));
                };
                undo.push(UndoRecord::RestoreNode(node.snapshot()));
                node.clear_data();
                bump_version(&node);
                Ok(ApplyOutcome {
                    result: CommandResult::None,
                    events: vec![CacheEvent::NodeModified(fqn.clone())],
                })
            }

            Command::RemoveNode { fqn } => {
                if !container.exists(fqn) {
                    return Ok(ApplyOutcome::of(CommandResult::Bool(false)));
                }
                let parent = container.peek(&fqn.parent()).filter(|_| !fqn.is_root());
                if undo.enabled() {
                    if let Some(parent) = &parent {
                        undo.push(UndoRecord::RestoreNode(parent.snapshot()));
                    }
                    undo.push(UndoRecord::RestoreSubtree(container.snapshot_subtree(fqn)));
                }
                container.remove_subtree(fqn);
                if let Some(parent) = parent {
                    bump_version(&parent);
                }
                Ok(ApplyOutcome {
                    result: CommandResult::Bool(true),
                    events: vec![CacheEvent::NodeRemoved(fqn.clone())],
                })
            }

            Command::Move { from, to_parent } => {
                if !container.exists(to_parent) {
                    return Err(Error::NodeNotExists(to_parent.clone()));
                }
                let name = from
                    .last_element()
                    .ok_or_else(|| Error::InvalidOperation("cannot move the root".to_string()))?;
                let target = to_parent.child(name);
                if undo.enabled() && container.exists(from) && !to_parent.is_child_or_equals(from) {
                    let previous_target = container.snapshot_subtree(&target);
                    if !previous_target.is_empty() {
                        undo.push(UndoRecord::RestoreSubtree(previous_target));
                    }
                    undo.push(UndoRecord::RemoveCreated(target.clone()));
                    undo.push(UndoRecord::RestoreSubtree(container.snapshot_subtree(from)));
                }
                let target = container.move_subtree(from, to_parent)?;
                Ok(ApplyOutcome {
                    result: CommandResult::None,
                    events: vec![CacheEvent::NodeMoved {
                        from: from.clone(),
                        to: target,
                    }],
                })
            }

            Command::Evict { fqn, recursive } => Ok(evict(container, fqn, *recursive)),

            Command::Invalidate { fqn, version } => {
                let Some(node) = container.peek(fqn) else {
                    return Ok(ApplyOutcome::of(CommandResult::Bool(false)));
                };
                match version {
                    Some(version) => {
                        if !version.newer_than(&node.version())? {
                            trace!(fqn = %fqn, %version, "Local copy is current, not invalidating");
                            return Ok(ApplyOutcome::of(CommandResult::Bool(false)));
                        }
                        node.clear_data();
                        node.set_valid(false);
                        node.set_version(version.clone());
                    }
                    None => {
                        container.remove_subtree(fqn);
                    }
                }
                Ok(ApplyOutcome {
                    result: CommandResult::Bool(true),
                    events: vec![CacheEvent::NodeInvalidated(fqn.clone())],
                })
            }

            Command::GetKeyValue { fqn, key } => Ok(ApplyOutcome::of(CommandResult::Value(
                container.peek_valid(fqn).and_then(|n| n.get(key)),
            ))),

            Command::GetData { fqn } => Ok(ApplyOutcome::of(CommandResult::Data(
                container.peek_valid(fqn).map(|n| (*n.data()).clone()),
            ))),

            Command::GetKeys { fqn } => Ok(ApplyOutcome::of(CommandResult::Names(
                container.peek_valid(fqn).map(|n| n.keys()),
            ))),

            Command::GetChildrenNames { fqn } => {
                let names = container.peek_valid(fqn).map(|n| {
                    n.children_names()
                        .into_iter()
                        .filter(|name| container.exists(&fqn.child(name.as_str())))
                        .collect::<BTreeSet<_>>()
                });
                Ok(ApplyOutcome::of(CommandResult::Names(names)))
            }

            Command::Exists { fqn } => Ok(ApplyOutcome::of(CommandResult::Bool(
                container.exists(fqn),
            ))),

            Command::GravitateData {
                fqn,
                search_backup_subtrees,
            } => Ok(ApplyOutcome::of(CommandResult::Gravitation(gravitate(
                container,
                fqn,
                *search_backup_subtrees,
            )))),

            Command::DataGravitationCleanup { .. }
            | Command::Prepare { .. }
            | Command::Commit { .. }
            | Command::Rollback { .. } => Ok(ApplyOutcome::of(CommandResult::None)),
        }
    }
}

/// Resolve the node a write lands on, creating it (and ancestors) or
/// reviving a tombstone. Records the inverse in the undo log.
fn write_target(
    container: &DataContainer,
    fqn: &Fqn,
    undo: &mut Undo<'_>,
) -> (Arc<Node>, Vec<CacheEvent>) {
    if let Some(node) = container.peek(fqn) {
        undo.push(UndoRecord::RestoreNode(node.snapshot()));
        if !node.is_valid() {
            node.set_valid(true);
            node.set_data_loaded(true);
            return (node, vec![CacheEvent::NodeCreated(fqn.clone())]);
        }
        return (node, Vec::new());
    }

    let (node, created) = container.get_or_create(fqn);
    if let Some(first) = created.first() {
        if let Some(parent) = container.peek(&first.parent()) {
            undo.push(UndoRecord::RestoreNode(parent.snapshot()));
            bump_version(&parent);
        }
        undo.push(UndoRecord::RemoveCreated(first.clone()));
    }
    let events = created.into_iter().map(CacheEvent::NodeCreated).collect();
    (node, events)
}

fn evict(container: &DataContainer, fqn: &Fqn, recursive: bool) -> ApplyOutcome {
    let backup_root = Fqn::from_elements([BUDDY_BACKUP_ROOT]);
    let targets = if recursive {
        let mut subtree = container.subtree_fqns(fqn);
        subtree.reverse();
        subtree
    } else {
        vec![fqn.clone()]
    };

    let mut events = Vec::new();
    for target in targets {
        if target.is_root() || target == backup_root {
            continue;
        }
        let Some(node) = container.peek(&target) else {
            continue;
        };
        if node.has_children() {
            node.clear_data();
            node.set_data_loaded(false);
        } else {
            container.remove_subtree(&target);
        }
        events.push(CacheEvent::NodeEvicted(target));
    }
    ApplyOutcome {
        result: CommandResult::Bool(!events.is_empty()),
        events,
    }
}

fn gravitate(container: &DataContainer, fqn: &Fqn, search_backup_subtrees: bool) -> GravitateResult {
    if container.exists(fqn) {
        return GravitateResult {
            found: true,
            location: Some(fqn.clone()),
            nodes: container.snapshot_subtree(fqn),
        };
    }
    if !search_backup_subtrees {
        return GravitateResult::not_found();
    }
    let backup_root = Fqn::from_elements([BUDDY_BACKUP_ROOT]);
    for group in container.children_of(&backup_root) {
        let candidate = group.join(fqn);
        if container.exists(&candidate) {
            return GravitateResult {
                found: true,
                location: Some(candidate.clone()),
                nodes: container.snapshot_subtree(&candidate),
            };
        }
    }
    GravitateResult::not_found()
}
