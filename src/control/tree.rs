use indexmap::IndexMap;

use super::index::{ControlIndex, ControlSlot};
use super::instance::{ControlInstance, ControlKind, EffectiveId, IndexedKind};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone)]
struct ControlNode {
    instance: ControlInstance,
    parent: Option<ControlSlot>,
    children: Vec<ControlSlot>,
}

/// Arena-backed tree of live controls with an effective-id index.
///
/// Parent and child links are slot handles, so a snapshot is a plain clone
/// and shares nothing with the original.
#[derive(Debug, Clone, Default)]
pub struct ControlTree {
    slots: Vec<Option<ControlNode>>,
    free: Vec<usize>,
    root: Option<ControlSlot>,
    index: ControlIndex,
}

impl ControlTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> Option<ControlSlot> {
        self.root
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// True when there is nothing to reconcile: no root, or a root without
    /// any descendants.
    pub fn is_empty(&self) -> bool {
        self.root.is_none_or(|root| self.children(root).is_empty())
    }

    pub fn index(&self) -> &ControlIndex {
        &self.index
    }

    /// Attach `instance` under `parent`, or as the root when `parent` is
    /// `None`.
    pub fn insert(
        &mut self,
        parent: Option<ControlSlot>,
        instance: ControlInstance,
    ) -> Result<ControlSlot> {
        if self.index.lookup(instance.id()).is_some() {
            return Err(EngineError::Structural(format!(
                "duplicate effective id `{}`",
                instance.id()
            )));
        }
        match parent {
            None if self.root.is_some() => {
                return Err(EngineError::Structural("tree already has a root".into()));
            }
            Some(parent) if self.node(parent).is_none() => {
                return Err(EngineError::Structural(format!(
                    "parent slot {} is vacant",
                    parent.0
                )));
            }
            _ => {}
        }

        let slot = match self.free.pop() {
            Some(free) => ControlSlot(free),
            None => {
                self.slots.push(None);
                ControlSlot(self.slots.len() - 1)
            }
        };
        self.index.index(&instance, slot);
        self.slots[slot.0] = Some(ControlNode {
            instance,
            parent,
            children: Vec::new(),
        });
        match parent {
            Some(parent) => {
                if let Some(p) = self.node_mut(parent) {
                    p.children.push(slot);
                }
            }
            None => self.root = Some(slot),
        }
        Ok(slot)
    }

    pub fn get(&self, slot: ControlSlot) -> Option<&ControlInstance> {
        self.node(slot).map(|n| &n.instance)
    }

    pub fn get_mut(&mut self, slot: ControlSlot) -> Option<&mut ControlInstance> {
        self.node_mut(slot).map(|n| &mut n.instance)
    }

    pub fn find(&self, id: &EffectiveId) -> Option<&ControlInstance> {
        self.index.lookup(id).and_then(|slot| self.get(slot))
    }

    pub fn find_mut(&mut self, id: &EffectiveId) -> Option<&mut ControlInstance> {
        let slot = self.index.lookup(id)?;
        self.get_mut(slot)
    }

    pub fn slot_of(&self, id: &EffectiveId) -> Option<ControlSlot> {
        self.index.lookup(id)
    }

    pub fn parent(&self, slot: ControlSlot) -> Option<ControlSlot> {
        self.node(slot).and_then(|n| n.parent)
    }

    pub fn children(&self, slot: ControlSlot) -> &[ControlSlot] {
        self.node(slot).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    /// Whether `ancestor` is a proper ancestor of `slot`.
    pub fn is_ancestor(&self, ancestor: ControlSlot, slot: ControlSlot) -> bool {
        let mut current = self.parent(slot);
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = self.parent(parent);
        }
        false
    }

    /// Detach and release a subtree. The removed controls are deindexed and
    /// returned children-first, containers after their content.
    pub fn remove_subtree(&mut self, slot: ControlSlot) -> Vec<ControlInstance> {
        let order = self.post_order(slot);
        if let Some(parent) = self.parent(slot) {
            if let Some(p) = self.node_mut(parent) {
                p.children.retain(|c| *c != slot);
            }
        } else if self.root == Some(slot) {
            self.root = None;
        }

        let mut removed = Vec::with_capacity(order.len());
        for s in order {
            if let Some(node) = self.slots.get_mut(s.0).and_then(Option::take) {
                self.index.deindex(&node.instance);
                self.free.push(s.0);
                removed.push(node.instance);
            }
        }
        removed
    }

    pub(crate) fn set_children(&mut self, parent: ControlSlot, children: Vec<ControlSlot>) {
        if let Some(node) = self.node_mut(parent) {
            node.children = children;
        }
    }

    /// Move iterations to new 1-based positions, re-keying their subtrees.
    ///
    /// Every affected control is deindexed before any is re-keyed, so
    /// iterations may trade positions without colliding.
    pub fn renumber_iterations(&mut self, changes: &[(ControlSlot, u32)]) -> Result<()> {
        let mut affected = Vec::new();
        for (iteration, position) in changes {
            let level = self
                .get(*iteration)
                .filter(|i| i.iteration_position().is_some())
                .map(|i| i.id().depth())
                .and_then(|depth| depth.checked_sub(1))
                .ok_or_else(|| {
                    EngineError::Structural(format!("slot {} is not an iteration", iteration.0))
                })?;
            for slot in self.post_order(*iteration) {
                affected.push((slot, level, *position));
            }
        }

        for (slot, _, _) in &affected {
            if let Some(node) = self.slots.get(slot.0).and_then(Option::as_ref) {
                self.index.deindex(&node.instance);
            }
        }
        for (slot, level, position) in &affected {
            if let Some(instance) = self.get_mut(*slot) {
                instance.id_mut().set_position(*level, *position);
                if instance.id().depth() == level + 1 {
                    if let ControlKind::Iteration { position: p } = &mut instance.kind {
                        *p = *position;
                    }
                }
            }
        }
        for (slot, _, _) in &affected {
            if let Some(node) = self.slots.get(slot.0).and_then(Option::as_ref) {
                if let Some(existing) = self.index.lookup(node.instance.id()) {
                    if existing != *slot {
                        return Err(EngineError::Structural(format!(
                            "renumbering collides on `{}`",
                            node.instance.id()
                        )));
                    }
                }
                self.index.index(&node.instance, *slot);
            }
        }
        Ok(())
    }

    /// Pre-order walk from the root yielding `(depth, slot, control)`.
    pub fn iter(&self) -> PreOrder<'_> {
        PreOrder {
            tree: self,
            stack: self.root.map(|r| vec![(r, 0)]).unwrap_or_default(),
        }
    }

    /// Pre-order walk of the subtree rooted at `slot`.
    pub fn iter_from(&self, slot: ControlSlot) -> PreOrder<'_> {
        PreOrder {
            tree: self,
            stack: vec![(slot, 0)],
        }
    }

    /// Slots of a subtree with every container after its content.
    pub fn post_order(&self, slot: ControlSlot) -> Vec<ControlSlot> {
        let mut out = Vec::new();
        let mut stack = vec![(slot, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                out.push(current);
                continue;
            }
            stack.push((current, true));
            for child in self.children(current).iter().rev() {
                stack.push((*child, false));
            }
        }
        out
    }

    /// Current index of every repeat, in document order.
    pub fn repeat_indexes(&self) -> IndexMap<EffectiveId, u32> {
        self.iter()
            .filter_map(|(_, _, c)| c.repeat().map(|r| (c.id().clone(), r.index)))
            .collect()
    }

    pub fn repeats(&self) -> impl Iterator<Item = (&EffectiveId, ControlSlot)> + '_ {
        self.index.by_kind(IndexedKind::Repeat)
    }

    /// Independent deep copy; tracked state pairs are preserved.
    pub fn snapshot(&self) -> ControlTree {
        self.clone()
    }

    /// Accept every control's current state as the new baseline.
    pub fn commit_all(&mut self) {
        for node in self.slots.iter_mut().flatten() {
            node.instance.commit();
        }
    }

    pub fn rebuild_index(&mut self) {
        let mut index = ControlIndex::new();
        for (_, slot, control) in self.iter() {
            index.index(control, slot);
        }
        self.index = index;
    }

    fn node(&self, slot: ControlSlot) -> Option<&ControlNode> {
        self.slots.get(slot.0).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, slot: ControlSlot) -> Option<&mut ControlNode> {
        self.slots.get_mut(slot.0).and_then(Option::as_mut)
    }
}

pub struct PreOrder<'a> {
    tree: &'a ControlTree,
    stack: Vec<(ControlSlot, usize)>,
}

impl<'a> Iterator for PreOrder<'a> {
    type Item = (usize, ControlSlot, &'a ControlInstance);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((slot, depth)) = self.stack.pop() {
            let Some(node) = self.tree.node(slot) else {
                continue;
            };
            for child in node.children.iter().rev() {
                self.stack.push((*child, depth + 1));
            }
            return Some((depth, slot, &node.instance));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::instance::{Binding, ContainerFlavor, RepeatState};

    fn group(id: EffectiveId) -> ControlInstance {
        ControlInstance::new(id, ControlKind::Container(ContainerFlavor::Group), Binding::default())
    }

    fn iteration(id: &str, position: u32) -> ControlInstance {
        ControlInstance::new(
            EffectiveId::new(id).iteration(position),
            ControlKind::Iteration { position },
            Binding::default(),
        )
    }

    /// root > rows(repeat) > rows·1 > cell·1, rows·2 > cell·2
    fn sample() -> (ControlTree, ControlSlot, ControlSlot, ControlSlot) {
        let mut tree = ControlTree::new();
        let root = tree.insert(None, group(EffectiveId::new("root"))).unwrap();
        let repeat = tree
            .insert(
                Some(root),
                ControlInstance::new(
                    EffectiveId::new("rows"),
                    ControlKind::Repeat(RepeatState {
                        index: 1,
                        size: 2,
                        start_index: 1,
                    }),
                    Binding::default(),
                ),
            )
            .unwrap();
        let first = tree.insert(Some(repeat), iteration("rows", 1)).unwrap();
        tree.insert(Some(first), group(EffectiveId::with_positions("cell", vec![1])))
            .unwrap();
        let second = tree.insert(Some(repeat), iteration("rows", 2)).unwrap();
        tree.insert(Some(second), group(EffectiveId::with_positions("cell", vec![2])))
            .unwrap();
        (tree, repeat, first, second)
    }

    #[test]
    fn pre_order_visits_parents_first() {
        let (tree, _, _, _) = sample();
        let ids: Vec<(usize, String)> = tree
            .iter()
            .map(|(depth, _, c)| (depth, c.id().to_string()))
            .collect();
        assert_eq!(
            ids,
            vec![
                (0, "root".to_string()),
                (1, "rows".to_string()),
                (2, "rows·1".to_string()),
                (3, "cell·1".to_string()),
                (2, "rows·2".to_string()),
                (3, "cell·2".to_string()),
            ]
        );
    }

    #[test]
    fn duplicate_effective_ids_are_rejected() {
        let (mut tree, repeat, _, _) = sample();
        assert!(tree.insert(Some(repeat), iteration("rows", 1)).is_err());
    }

    #[test]
    fn remove_subtree_returns_post_order_and_deindexes() {
        let (mut tree, _, first, _) = sample();
        let removed: Vec<String> = tree
            .remove_subtree(first)
            .iter()
            .map(|c| c.id().to_string())
            .collect();
        assert_eq!(removed, vec!["cell·1", "rows·1"]);
        assert!(tree.find(&EffectiveId::with_positions("cell", vec![1])).is_none());
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn freed_slots_are_reused() {
        let (mut tree, repeat, first, _) = sample();
        tree.remove_subtree(first);
        let again = tree.insert(Some(repeat), iteration("rows", 3)).unwrap();
        assert_eq!(again, first);
    }

    #[test]
    fn renumbering_swaps_positions_without_collisions() {
        let (mut tree, _, first, second) = sample();
        tree.renumber_iterations(&[(first, 2), (second, 1)]).unwrap();
        let moved = tree.find(&EffectiveId::with_positions("cell", vec![2])).unwrap();
        assert!(moved.moved());
        assert_eq!(tree.slot_of(&EffectiveId::new("rows").iteration(2)), Some(first));
        assert_eq!(tree.get(first).unwrap().iteration_position(), Some(2));
    }

    #[test]
    fn snapshot_is_independent() {
        let (mut tree, repeat, _, _) = sample();
        let snapshot = tree.snapshot();
        tree.get_mut(repeat).unwrap().repeat_mut().unwrap().index = 2;
        let original = snapshot.find(&EffectiveId::new("rows")).unwrap();
        assert_eq!(original.repeat().unwrap().index, 1);
    }

    #[test]
    fn rebuilt_index_matches_incremental_one() {
        let (mut tree, _, _, _) = sample();
        let before: Vec<String> = tree.index().ids().map(|i| i.to_string()).collect();
        tree.rebuild_index();
        let after: Vec<String> = tree.index().ids().map(|i| i.to_string()).collect();
        assert_eq!(before, after);
        assert_eq!(tree.repeats().count(), 1);
    }

    #[test]
    fn ancestry_checks_follow_parent_links() {
        let (tree, repeat, first, second) = sample();
        let cell = tree.children(first)[0];
        assert!(tree.is_ancestor(repeat, cell));
        assert!(!tree.is_ancestor(second, cell));
    }
}
