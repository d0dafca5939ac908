use std::collections::HashSet;

use crate::control::{ControlSlot, ControlTree, EffectiveId, clamp_index};
use crate::error::{EngineError, Result};
use crate::logging::{LogLevel, Logger, emit, json_kv, json_str};
use crate::model::NodeRef;

const TARGET: &str = "formtree::repeat";

/// A mutation of a bound collection that repeat indexes must follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionChange {
    /// `node` was inserted; every repeat now bound to it points at it.
    Inserted { node: NodeRef },
    /// The node at 1-based `position` of `repeat`'s node-set was deleted.
    /// Captured before the deletion.
    Deleted {
        repeat: EffectiveId,
        position: u32,
        previous_size: u32,
        previous_index: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexChange {
    pub repeat: EffectiveId,
    pub old: u32,
    pub new: u32,
}

/// Keeps repeat indexes, including those of nested repeats, consistent
/// with insertions and deletions in bound collections.
#[derive(Clone, Default)]
pub struct RepeatIndexCoordinator {
    logger: Option<Logger>,
}

impl RepeatIndexCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_logger(mut self, logger: Option<Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Describe, before `node` is deleted, what the deletion does to every
    /// repeat bound to it.
    pub fn plan_delete(tree: &ControlTree, node: NodeRef) -> Vec<CollectionChange> {
        repeat_slots(tree)
            .into_iter()
            .filter_map(|slot| {
                let control = tree.get(slot)?;
                let repeat = control.repeat()?;
                let position = control.binding.nodes.iter().position(|n| *n == node)?;
                Some(CollectionChange::Deleted {
                    repeat: control.id().clone(),
                    position: position as u32 + 1,
                    previous_size: repeat.size,
                    previous_index: repeat.index,
                })
            })
            .collect()
    }

    /// Apply index rules for `changes` to a tree whose iterations already
    /// match the data. Repeats not addressed by a change are clamped.
    pub fn adjust(&self, tree: &mut ControlTree, changes: &[CollectionChange]) -> Vec<IndexChange> {
        let before = tree.repeat_indexes();
        let mut touched = HashSet::new();
        for change in changes {
            match change {
                CollectionChange::Inserted { node } => {
                    let targets: Vec<(ControlSlot, u32)> = repeat_slots(tree)
                        .into_iter()
                        .filter_map(|slot| {
                            let position = tree
                                .get(slot)?
                                .binding
                                .nodes
                                .iter()
                                .position(|n| n == node)?;
                            Some((slot, position as u32 + 1))
                        })
                        .collect();
                    for (slot, position) in targets {
                        set_clamped(tree, slot, position);
                        touched.insert(slot);
                        reinitialize_nested(tree, slot, position, &mut touched);
                    }
                }
                CollectionChange::Deleted {
                    repeat,
                    position,
                    previous_size,
                    previous_index,
                } => {
                    let Some(slot) = tree.slot_of(repeat) else {
                        continue;
                    };
                    let (index, reinit) = delete_index(*previous_index, *position, *previous_size);
                    let index = set_clamped(tree, slot, index);
                    touched.insert(slot);
                    if reinit && index > 0 {
                        reinitialize_nested(tree, slot, index, &mut touched);
                    }
                }
            }
        }
        for slot in repeat_slots(tree) {
            if !touched.contains(&slot) {
                if let Some(repeat) = tree.get_mut(slot).and_then(|c| c.repeat_mut()) {
                    repeat.clamp();
                }
            }
        }
        self.report(tree, &before)
    }

    /// Explicitly select iteration `index` of `repeat`. Nested repeats under
    /// the newly selected iteration are reinitialized when the index moves.
    pub fn set_index(
        &self,
        tree: &mut ControlTree,
        repeat: &EffectiveId,
        index: u32,
    ) -> Result<Vec<IndexChange>> {
        let slot = tree
            .slot_of(repeat)
            .filter(|s| tree.get(*s).is_some_and(|c| c.repeat().is_some()))
            .ok_or_else(|| EngineError::ControlNotFound(repeat.to_string()))?;
        let before = tree.repeat_indexes();
        let old = before.get(repeat).copied().unwrap_or(0);
        let new = set_clamped(tree, slot, index);
        if new != old && new > 0 {
            reinitialize_nested(tree, slot, new, &mut HashSet::new());
        }
        Ok(self.report(tree, &before))
    }

    fn report(
        &self,
        tree: &ControlTree,
        before: &indexmap::IndexMap<EffectiveId, u32>,
    ) -> Vec<IndexChange> {
        let changes: Vec<IndexChange> = tree
            .repeat_indexes()
            .into_iter()
            .filter_map(|(repeat, new)| {
                let old = before.get(&repeat).copied().unwrap_or(0);
                (old != new).then_some(IndexChange { repeat, old, new })
            })
            .collect();
        for change in &changes {
            emit(
                self.logger.as_ref(),
                LogLevel::Debug,
                TARGET,
                "repeat index moved",
                [
                    json_str("repeat", change.repeat.to_string()),
                    json_kv("old", change.old),
                    json_kv("new", change.new),
                ],
            );
        }
        changes
    }
}

/// New index after deleting position `deleted` (1-based) from a node-set of
/// `size` nodes whose index was `current`, and whether nested repeats under
/// the selected iteration must be reinitialized.
pub fn delete_index(current: u32, deleted: u32, size: u32) -> (u32, bool) {
    if size <= 1 {
        return (0, false);
    }
    if current == deleted {
        if deleted == size {
            (current - 1, true)
        } else {
            (current, true)
        }
    } else if current < deleted {
        (current, false)
    } else {
        (current - 1, false)
    }
}

/// Repeat controls in document order.
fn repeat_slots(tree: &ControlTree) -> Vec<ControlSlot> {
    tree.iter()
        .filter(|(_, _, c)| c.repeat().is_some())
        .map(|(_, slot, _)| slot)
        .collect()
}

fn set_clamped(tree: &mut ControlTree, slot: ControlSlot, index: u32) -> u32 {
    match tree.get_mut(slot).and_then(|c| c.repeat_mut()) {
        Some(repeat) => {
            repeat.index = clamp_index(index, repeat.size);
            repeat.index
        }
        None => 0,
    }
}

/// Reset every repeat inside iteration `position` of `repeat_slot` to its
/// start index, outer repeats first.
fn reinitialize_nested(
    tree: &mut ControlTree,
    repeat_slot: ControlSlot,
    position: u32,
    touched: &mut HashSet<ControlSlot>,
) {
    let Some(iteration) = position
        .checked_sub(1)
        .and_then(|i| tree.children(repeat_slot).get(i as usize).copied())
    else {
        return;
    };
    let nested: Vec<ControlSlot> = tree
        .iter_from(iteration)
        .filter(|(_, _, c)| c.repeat().is_some())
        .map(|(_, slot, _)| slot)
        .collect();
    for slot in nested {
        if let Some(repeat) = tree.get_mut(slot).and_then(|c| c.repeat_mut()) {
            repeat.index = 0;
            repeat.index = clamp_index(repeat.start_index, repeat.size);
        }
        touched.insert(slot);
    }
}
