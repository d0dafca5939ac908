use std::collections::HashMap;

use indexmap::IndexMap;

use super::instance::{ControlInstance, EffectiveId, IndexedKind};

/// Handle to a control stored in a [`ControlTree`](super::ControlTree) arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControlSlot(pub(crate) usize);

/// Effective-id lookup plus ordered per-kind listings.
///
/// The index only holds slot handles; the tree owns the controls. It can be
/// rebuilt at any time by re-walking the tree.
#[derive(Debug, Clone, Default)]
pub struct ControlIndex {
    by_id: IndexMap<EffectiveId, ControlSlot>,
    by_kind: HashMap<IndexedKind, IndexMap<EffectiveId, ControlSlot>>,
}

impl ControlIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or overwrite the entry for `control`.
    pub fn index(&mut self, control: &ControlInstance, slot: ControlSlot) {
        self.by_id.insert(control.id().clone(), slot);
        if let Some(kind) = control.indexed_kind() {
            self.by_kind
                .entry(kind)
                .or_default()
                .insert(control.id().clone(), slot);
        }
    }

    pub fn deindex(&mut self, control: &ControlInstance) {
        self.by_id.shift_remove(control.id());
        if let Some(kind) = control.indexed_kind() {
            if let Some(entries) = self.by_kind.get_mut(&kind) {
                entries.shift_remove(control.id());
            }
        }
    }

    pub fn lookup(&self, id: &EffectiveId) -> Option<ControlSlot> {
        self.by_id.get(id).copied()
    }

    /// Controls of `kind` in indexing order; empty when there are none.
    pub fn by_kind(&self, kind: IndexedKind) -> impl Iterator<Item = (&EffectiveId, ControlSlot)> + '_ {
        self.by_kind
            .get(&kind)
            .into_iter()
            .flat_map(|entries| entries.iter().map(|(id, slot)| (id, *slot)))
    }

    pub fn ids(&self) -> impl Iterator<Item = &EffectiveId> + '_ {
        self.by_id.keys()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_kind.clear();
    }
}
