use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::control::{
    ContainerFlavor, ControlInstance, ControlKind, ControlSlot, ControlTree, EffectiveId, Item,
    UploadInfo,
};
use crate::refresh::{Instruction, MessageLevel};

/// Attributes of one control that differ from what the client last saw.
/// Unchanged attributes are left out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevant: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid: Option<bool>,
    /// A cleared value is sent as the empty string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<UploadInfo>,
}

impl ControlUpdate {
    fn is_empty(&self) -> bool {
        self.relevant.is_none()
            && self.readonly.is_none()
            && self.required.is_none()
            && self.valid.is_none()
            && self.value.is_none()
            && self.visible.is_none()
            && self.upload.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatSize {
    pub repeat: String,
    pub old: u32,
    pub new: u32,
}

/// A switch now showing `shown`; every other case is hidden.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseToggle {
    pub switch: String,
    pub shown: String,
    pub hidden: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDelta {
    pub repeat: String,
    pub old: u32,
    pub new: u32,
}

/// Full listing on the first response, deltas afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "indexes", rename_all = "snake_case")]
pub enum RepeatIndexes {
    Full(BTreeMap<String, u32>),
    Delta(Vec<IndexDelta>),
}

impl Default for RepeatIndexes {
    fn default() -> Self {
        RepeatIndexes::Delta(Vec::new())
    }
}

impl RepeatIndexes {
    pub fn is_empty(&self) -> bool {
        match self {
            RepeatIndexes::Full(all) => all.is_empty(),
            RepeatIndexes::Delta(deltas) => deltas.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemsetUpdate {
    pub control: String,
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub level: MessageLevel,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadRequest {
    pub resource: String,
    pub replace: bool,
}

/// Everything the client must apply to catch up with the server-side tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub controls: Vec<ControlUpdate>,
    pub repeat_sizes: Vec<RepeatSize>,
    pub toggles: Vec<CaseToggle>,
    pub repeat_indexes: RepeatIndexes,
    pub itemsets: Vec<ItemsetUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load: Option<LoadRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus: Option<String>,
}

impl ChangeSet {
    /// Fold handler instructions in. Only the first submission, load and
    /// focus request survive; every message is kept.
    pub fn with_instructions(mut self, instructions: impl IntoIterator<Item = Instruction>) -> Self {
        for instruction in instructions {
            match instruction {
                Instruction::Message { level, text } => {
                    self.messages.push(Message { level, text });
                }
                Instruction::Load { resource, replace } => {
                    self.load.get_or_insert(LoadRequest { resource, replace });
                }
                Instruction::Submit { submission } => {
                    self.submission.get_or_insert(submission);
                }
                Instruction::SetFocus { control } => {
                    self.focus.get_or_insert(control);
                }
            }
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
            && self.repeat_sizes.is_empty()
            && self.toggles.is_empty()
            && self.repeat_indexes.is_empty()
            && self.itemsets.is_empty()
            && self.submission.is_none()
            && self.messages.is_empty()
            && self.load.is_none()
            && self.focus.is_none()
    }
}

/// Compare the tree the client last saw with the current one.
///
/// `initial_indexes` are the repeat indexes captured when the trees forked;
/// without them the indexes of `initial` are used. With `first` set every
/// control is reported in full.
pub fn diff(
    initial: &ControlTree,
    initial_indexes: Option<&IndexMap<EffectiveId, u32>>,
    current: &ControlTree,
    first: bool,
) -> ChangeSet {
    let mut changes = ChangeSet::default();
    let root = current.root();
    for (_, slot, control) in current.iter() {
        if Some(slot) == root {
            continue;
        }
        let before = if first { None } else { initial.find(control.id()) };
        let update = control_update(before, control);
        if !update.is_empty() {
            changes.controls.push(update);
        }

        match &control.kind {
            ControlKind::Repeat(repeat) => {
                let old = before.and_then(|c| c.repeat()).map_or(0, |r| r.size);
                if first || old != repeat.size {
                    changes.repeat_sizes.push(RepeatSize {
                        repeat: control.id().to_string(),
                        old,
                        new: repeat.size,
                    });
                }
            }
            ControlKind::Container(ContainerFlavor::Switch { selected_case }) => {
                let old = before.and_then(|c| match &c.kind {
                    ControlKind::Container(ContainerFlavor::Switch { selected_case }) => {
                        Some(selected_case.as_str())
                    }
                    _ => None,
                });
                if old != Some(selected_case.as_str()) {
                    changes.toggles.push(toggle(current, slot, control, selected_case));
                }
            }
            ControlKind::Value { items, .. } => {
                let old = before.map_or(&[][..], |c| c.items());
                if (first && !items.is_empty()) || (!first && old != items.as_slice()) {
                    changes.itemsets.push(ItemsetUpdate {
                        control: control.id().to_string(),
                        items: items.clone(),
                    });
                }
            }
            _ => {}
        }
    }

    changes.repeat_indexes = if first {
        RepeatIndexes::Full(
            current
                .repeat_indexes()
                .into_iter()
                .map(|(id, index)| (id.to_string(), index))
                .collect(),
        )
    } else {
        let derived;
        let before = match initial_indexes {
            Some(indexes) => indexes,
            None => {
                derived = initial.repeat_indexes();
                &derived
            }
        };
        RepeatIndexes::Delta(
            current
                .repeat_indexes()
                .into_iter()
                .filter_map(|(id, new)| {
                    let old = before.get(&id).copied().unwrap_or(0);
                    (old != new).then(|| IndexDelta {
                        repeat: id.to_string(),
                        old,
                        new,
                    })
                })
                .collect(),
        )
    };
    changes
}

fn control_update(before: Option<&ControlInstance>, control: &ControlInstance) -> ControlUpdate {
    fn differs<T: PartialEq + Clone>(old: Option<T>, new: T) -> Option<T> {
        if old.as_ref() == Some(&new) { None } else { Some(new) }
    }

    let state = &control.state;
    let old = before.map(|c| &c.state);
    let mut update = ControlUpdate {
        id: control.id().to_string(),
        relevant: differs(old.map(|s| *s.relevant.current()), *state.relevant.current()),
        readonly: differs(old.map(|s| *s.readonly.current()), *state.readonly.current()),
        required: differs(old.map(|s| *s.required.current()), *state.required.current()),
        valid: differs(old.map(|s| *s.valid.current()), *state.valid.current()),
        ..ControlUpdate::default()
    };
    if control.holds_value() {
        let value = state.value.current().clone().unwrap_or_default();
        let previous = old.map(|s| s.value.current().clone().unwrap_or_default());
        update.value = differs(previous, value);
    }
    match &control.kind {
        ControlKind::Dialog { visible } => {
            let previous = before.and_then(|c| match c.kind {
                ControlKind::Dialog { visible } => Some(visible),
                _ => None,
            });
            update.visible = differs(previous, *visible);
        }
        ControlKind::Upload(Some(info)) => {
            let previous = before.and_then(|c| match &c.kind {
                ControlKind::Upload(info) => info.clone(),
                _ => None,
            });
            update.upload = differs(previous, info.clone());
        }
        _ => {}
    }
    update
}

fn toggle(
    tree: &ControlTree,
    slot: ControlSlot,
    switch: &ControlInstance,
    selected_case: &str,
) -> CaseToggle {
    let case_id = |static_id: &str| {
        EffectiveId::with_positions(static_id, switch.id().positions().to_vec()).to_string()
    };
    let hidden = tree
        .children(slot)
        .iter()
        .filter_map(|s| tree.get(*s))
        .filter(|c| c.static_id() != selected_case)
        .map(|c| c.id().to_string())
        .collect();
    CaseToggle {
        switch: switch.id().to_string(),
        shown: case_id(selected_case),
        hidden,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::TreeBuilder;
    use crate::form::{ControlDef, ControlDefKind, FormDefinition};
    use crate::model::{DataModel, InstanceDocument, NodeRef, PathEvaluator};

    fn model() -> DataModel {
        let mut doc = InstanceDocument::new("data");
        let root = doc.root();
        doc.append(root, "name", "Ada").unwrap();
        let rows = doc.append(root, "rows", "").unwrap();
        for v in ["a", "b"] {
            doc.append(rows, "row", v).unwrap();
        }
        let mut model = DataModel::new();
        model.add_owned("main", doc);
        model
    }

    fn form() -> FormDefinition {
        let root = ControlDef::group("root")
            .child(ControlDef::input("name", "name"))
            .child(ControlDef::repeat("rows", "rows/row", 1).child(ControlDef::output("v", ".")))
            .child(
                ControlDef::new("tabs", ControlDefKind::Switch)
                    .child(ControlDef::new("one", ControlDefKind::Case { selected: true }))
                    .child(ControlDef::new("two", ControlDefKind::Case { selected: false })),
            );
        FormDefinition::new("f", root).with_instance("main", InstanceDocument::new("data"))
    }

    fn tree(form: &FormDefinition, model: &DataModel) -> ControlTree {
        let evaluator = PathEvaluator::new();
        let (mut tree, _) = TreeBuilder::new(form, model, &evaluator).build(None).unwrap();
        tree.commit_all();
        tree
    }

    #[test]
    fn first_response_lists_everything() {
        let (form, model) = (form(), model());
        let tree = tree(&form, &model);
        let changes = diff(&tree, None, &tree, true);
        let name = changes.controls.iter().find(|c| c.id == "name").unwrap();
        assert_eq!(name.value.as_deref(), Some("Ada"));
        assert_eq!(name.relevant, Some(true));
        assert_eq!(changes.repeat_sizes[0].new, 2);
        assert_eq!(changes.toggles[0].shown, "one");
        assert_eq!(changes.toggles[0].hidden, vec!["two".to_string()]);
        assert!(matches!(
            &changes.repeat_indexes,
            RepeatIndexes::Full(all) if all.get("rows") == Some(&1)
        ));
    }

    #[test]
    fn unchanged_tree_produces_no_changes() {
        let (form, model) = (form(), model());
        let tree = tree(&form, &model);
        let changes = diff(&tree, None, &tree.snapshot(), false);
        assert!(changes.is_empty(), "{changes:?}");
    }

    #[test]
    fn only_changed_attributes_are_sent() {
        let (form, mut model) = (form(), model());
        let initial = tree(&form, &model);
        let name = {
            let doc = model.document(0).unwrap();
            doc.children_named(doc.root(), "name")[0]
        };
        model.set_value(NodeRef::new(0, name), "Grace").unwrap();
        let mut current = initial.snapshot();
        let evaluator = PathEvaluator::new();
        TreeBuilder::new(&form, &model, &evaluator)
            .update_bindings(&mut current)
            .unwrap();
        if let Some(repeat) = current
            .find_mut(&EffectiveId::new("rows"))
            .and_then(|c| c.repeat_mut())
        {
            repeat.index = 2;
        }

        let changes = diff(&initial, Some(&initial.repeat_indexes()), &current, false);
        assert_eq!(
            changes.controls,
            vec![ControlUpdate {
                id: "name".into(),
                value: Some("Grace".into()),
                ..ControlUpdate::default()
            }]
        );
        assert_eq!(
            changes.repeat_indexes,
            RepeatIndexes::Delta(vec![IndexDelta {
                repeat: "rows".into(),
                old: 1,
                new: 2
            }])
        );
        assert!(changes.toggles.is_empty());
    }

    #[test]
    fn instructions_keep_first_singletons() {
        let changes = ChangeSet::default().with_instructions([
            Instruction::Submit { submission: "save".into() },
            Instruction::Submit { submission: "other".into() },
            Instruction::Message { level: MessageLevel::Info, text: "saved".into() },
            Instruction::SetFocus { control: "name".into() },
        ]);
        assert_eq!(changes.submission.as_deref(), Some("save"));
        assert_eq!(changes.messages.len(), 1);
        assert_eq!(changes.focus.as_deref(), Some("name"));
    }
}
