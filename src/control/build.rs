use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::index::ControlSlot;
use super::instance::{
    Binding, ContainerFlavor, ControlInstance, ControlKind, EffectiveId, EvaluatedState, Item,
    RepeatState, UploadInfo, ValueFlavor, clamp_index,
};
use super::tree::ControlTree;
use crate::error::{EngineError, Result};
use crate::form::{ControlDef, ControlDefKind, FormDefinition, StaticIndex};
use crate::model::{BindingEvaluator, DataModel, EvalContext, EvalValue, NodeRef};

/// A binding that could not be evaluated. Local to one control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingFailure {
    pub control: EffectiveId,
    pub message: String,
}

/// What one binding update pass did.
#[derive(Debug, Default)]
pub struct BindingUpdate {
    pub visited: usize,
    pub evaluated: usize,
    pub optimized: usize,
    pub created: usize,
    /// Controls of iterations whose node left the bound node-set, in post-order.
    pub removed: Vec<ControlInstance>,
    pub failures: Vec<BindingFailure>,
}

/// UI state that cannot be recomputed from the data: repeat indexes, switch
/// selections, open dialogs, upload metadata and focus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlsState {
    #[serde(default)]
    pub repeat_indexes: BTreeMap<String, u32>,
    #[serde(default)]
    pub selected_cases: BTreeMap<String, String>,
    #[serde(default)]
    pub open_dialogs: BTreeSet<String>,
    #[serde(default)]
    pub uploads: BTreeMap<String, UploadInfo>,
    #[serde(default)]
    pub focus: Option<String>,
}

impl ControlsState {
    pub fn capture(tree: &ControlTree, focus: Option<&EffectiveId>) -> Self {
        let mut state = Self {
            focus: focus.map(ToString::to_string),
            ..Self::default()
        };
        for (_, _, control) in tree.iter() {
            let key = control.id().to_string();
            match &control.kind {
                ControlKind::Repeat(repeat) => {
                    state.repeat_indexes.insert(key, repeat.index);
                }
                ControlKind::Container(ContainerFlavor::Switch { selected_case }) => {
                    state.selected_cases.insert(key, selected_case.clone());
                }
                ControlKind::Dialog { visible: true } => {
                    state.open_dialogs.insert(key);
                }
                ControlKind::Upload(Some(info)) => {
                    state.uploads.insert(key, info.clone());
                }
                _ => {}
            }
        }
        state
    }
}

/// Evaluation context handed from a control to its children.
#[derive(Debug, Clone, Copy)]
struct Inherited {
    node: Option<NodeRef>,
    position: usize,
    relevant: bool,
    readonly: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Rebind,
    StateOnly,
}

/// Builds control trees from a form definition and keeps their bindings and
/// state current as the data changes.
pub struct TreeBuilder<'a> {
    form: &'a FormDefinition,
    defs: StaticIndex<'a>,
    model: &'a DataModel,
    evaluator: &'a dyn BindingEvaluator,
    variables: HashMap<String, EvalValue>,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(
        form: &'a FormDefinition,
        model: &'a DataModel,
        evaluator: &'a dyn BindingEvaluator,
    ) -> Self {
        Self {
            form,
            defs: StaticIndex::new(form),
            model,
            evaluator,
            variables: HashMap::new(),
        }
    }

    /// Instantiate the whole tree. `restore` carries UI state from a
    /// serialized document so the rebuilt tree matches it.
    pub fn build(
        &self,
        restore: Option<&ControlsState>,
    ) -> Result<(ControlTree, Vec<BindingFailure>)> {
        let mut tree = ControlTree::new();
        let mut failures = Vec::new();
        self.build_control(
            &mut tree,
            None,
            &self.form.root,
            self.root_context(),
            &[],
            restore,
            &mut failures,
        )?;
        Ok((tree, failures))
    }

    /// Re-evaluate bindings, reconcile repeat iterations with their node-sets
    /// and recompute state for every control.
    pub fn update_bindings(&self, tree: &mut ControlTree) -> Result<BindingUpdate> {
        let mut update = BindingUpdate::default();
        if let Some(root) = tree.root() {
            self.update_control(tree, root, self.root_context(), Pass::Rebind, &mut update)?;
        }
        Ok(update)
    }

    /// Recompute state from the existing bindings without touching them.
    pub fn evaluate_all(&self, tree: &mut ControlTree) -> Result<()> {
        let mut update = BindingUpdate::default();
        if let Some(root) = tree.root() {
            self.update_control(tree, root, self.root_context(), Pass::StateOnly, &mut update)?;
        }
        Ok(())
    }

    fn root_context(&self) -> Inherited {
        Inherited {
            node: self.model.default_root(),
            position: 1,
            relevant: true,
            readonly: false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_control(
        &self,
        tree: &mut ControlTree,
        parent: Option<ControlSlot>,
        def: &ControlDef,
        inherited: Inherited,
        positions: &[u32],
        restore: Option<&ControlsState>,
        failures: &mut Vec<BindingFailure>,
    ) -> Result<ControlSlot> {
        let id = EffectiveId::with_positions(def.id.clone(), positions.to_vec());
        let (binding, failure) = self.bind(def, inherited);
        let kind = initial_kind(def, &id, restore);
        let mut instance = ControlInstance::new(id, kind, binding);
        self.evaluate(def, &mut instance, inherited, failure, failures);
        let context = child_context(def, &instance, inherited);
        let nodes = instance.binding.nodes.clone();
        let slot = tree.insert(parent, instance)?;

        if matches!(def.kind, ControlDefKind::Repeat { .. }) {
            for (i, node) in nodes.into_iter().enumerate() {
                self.build_iteration(
                    tree,
                    slot,
                    def,
                    i as u32 + 1,
                    node,
                    context,
                    positions,
                    restore,
                    failures,
                )?;
            }
            let key = EffectiveId::with_positions(def.id.clone(), positions.to_vec()).to_string();
            let size = tree.children(slot).len() as u32;
            if let Some(repeat) = tree.get_mut(slot).and_then(|c| c.repeat_mut()) {
                let restored = restore.and_then(|r| r.repeat_indexes.get(&key)).copied();
                repeat.size = size;
                repeat.index = clamp_index(restored.unwrap_or(repeat.start_index), size);
            }
        } else {
            for child in &def.children {
                self.build_control(tree, Some(slot), child, context, positions, restore, failures)?;
            }
        }
        Ok(slot)
    }

    /// Create one iteration of `repeat_def` bound to `node`, with content.
    #[allow(clippy::too_many_arguments)]
    fn build_iteration(
        &self,
        tree: &mut ControlTree,
        repeat_slot: ControlSlot,
        repeat_def: &ControlDef,
        position: u32,
        node: NodeRef,
        inherited: Inherited,
        repeat_positions: &[u32],
        restore: Option<&ControlsState>,
        failures: &mut Vec<BindingFailure>,
    ) -> Result<ControlSlot> {
        let mut positions = repeat_positions.to_vec();
        positions.push(position);
        let binding = self.iteration_binding(node, position);
        let mut instance = ControlInstance::new(
            EffectiveId::with_positions(repeat_def.id.clone(), positions.clone()),
            ControlKind::Iteration { position },
            binding,
        );
        let context = self.evaluate_iteration(&mut instance, inherited);
        let slot = tree.insert(Some(repeat_slot), instance)?;
        for child in &repeat_def.children {
            self.build_control(tree, Some(slot), child, context, &positions, restore, failures)?;
        }
        Ok(slot)
    }

    fn update_control(
        &self,
        tree: &mut ControlTree,
        slot: ControlSlot,
        inherited: Inherited,
        pass: Pass,
        update: &mut BindingUpdate,
    ) -> Result<()> {
        let (static_id, old) = match tree.get(slot) {
            Some(control) => (control.static_id().to_string(), control.binding.clone()),
            None => return Ok(()),
        };
        let def = self.defs.get(&static_id).ok_or_else(|| {
            EngineError::Structural(format!("no definition for control `{static_id}`"))
        })?;
        update.visited += 1;

        let unaffected = old.context == inherited.node
            && old.position == inherited.position
            && (def.bind.is_none() || old.revision == self.model.revision());
        let (binding, failure) = match pass {
            Pass::StateOnly => (old, None),
            Pass::Rebind if unaffected => {
                update.optimized += 1;
                (old, None)
            }
            Pass::Rebind => {
                update.evaluated += 1;
                self.bind(def, inherited)
            }
        };

        let context = {
            let Some(control) = tree.get_mut(slot) else {
                return Ok(());
            };
            control.binding = binding;
            self.evaluate(def, control, inherited, failure, &mut update.failures);
            child_context(def, control, inherited)
        };

        if matches!(def.kind, ControlDefKind::Repeat { .. }) {
            match pass {
                Pass::Rebind => self.update_iterations(tree, slot, def, context, update)?,
                Pass::StateOnly => {
                    for child in tree.children(slot).to_vec() {
                        self.update_iteration(tree, child, None, context, pass, update)?;
                    }
                }
            }
        } else {
            for child in tree.children(slot).to_vec() {
                self.update_control(tree, child, context, pass, update)?;
            }
        }
        Ok(())
    }

    /// Match existing iterations to the repeat's new node-set by node
    /// identity: vanished nodes lose their iteration, moved nodes keep it
    /// under a new position, new nodes get a fresh iteration.
    fn update_iterations(
        &self,
        tree: &mut ControlTree,
        repeat_slot: ControlSlot,
        def: &ControlDef,
        context: Inherited,
        update: &mut BindingUpdate,
    ) -> Result<()> {
        let Some(repeat) = tree.get(repeat_slot) else {
            return Ok(());
        };
        let repeat_positions = repeat.id().positions().to_vec();
        let nodes = repeat.binding.nodes.clone();

        let mut kept: HashMap<NodeRef, ControlSlot> = HashMap::new();
        for slot in tree.children(repeat_slot).to_vec() {
            let node = tree.get(slot).and_then(|c| c.binding.node());
            match node {
                Some(node) if nodes.contains(&node) && !kept.contains_key(&node) => {
                    kept.insert(node, slot);
                }
                _ => update.removed.extend(tree.remove_subtree(slot)),
            }
        }

        let mut renumber = Vec::new();
        let mut order = Vec::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            let position = i as u32 + 1;
            let existing = kept.remove(node);
            if let Some(slot) = existing {
                if tree.get(slot).and_then(|c| c.iteration_position()) != Some(position) {
                    renumber.push((slot, position));
                }
            }
            order.push(existing);
        }
        tree.renumber_iterations(&renumber)?;

        let mut children = Vec::with_capacity(nodes.len());
        for (i, (node, existing)) in nodes.iter().zip(order).enumerate() {
            let position = i as u32 + 1;
            let slot = match existing {
                Some(slot) => {
                    self.update_iteration(tree, slot, Some((*node, position)), context, Pass::Rebind, update)?;
                    slot
                }
                None => {
                    update.created += 1;
                    self.build_iteration(
                        tree,
                        repeat_slot,
                        def,
                        position,
                        *node,
                        context,
                        &repeat_positions,
                        None,
                        &mut update.failures,
                    )?
                }
            };
            children.push(slot);
        }
        tree.set_children(repeat_slot, children);

        if let Some(repeat) = tree.get_mut(repeat_slot).and_then(|c| c.repeat_mut()) {
            repeat.size = nodes.len() as u32;
            repeat.clamp();
        }
        Ok(())
    }

    fn update_iteration(
        &self,
        tree: &mut ControlTree,
        slot: ControlSlot,
        target: Option<(NodeRef, u32)>,
        inherited: Inherited,
        pass: Pass,
        update: &mut BindingUpdate,
    ) -> Result<()> {
        update.visited += 1;
        let context = {
            let Some(control) = tree.get_mut(slot) else {
                return Ok(());
            };
            if let Some((node, position)) = target {
                control.binding = self.iteration_binding(node, position);
            }
            self.evaluate_iteration(control, inherited)
        };
        for child in tree.children(slot).to_vec() {
            self.update_control(tree, child, context, pass, update)?;
        }
        Ok(())
    }

    fn iteration_binding(&self, node: NodeRef, position: u32) -> Binding {
        Binding {
            context: Some(node),
            nodes: vec![node],
            position: position as usize,
            revision: self.model.revision(),
            scalar: None,
            failed: false,
        }
    }

    fn bind(&self, def: &ControlDef, inherited: Inherited) -> (Binding, Option<String>) {
        let mut binding = Binding {
            context: inherited.node,
            nodes: Vec::new(),
            position: inherited.position,
            revision: self.model.revision(),
            scalar: None,
            failed: false,
        };
        let Some(expr) = def.bind.as_deref() else {
            binding.nodes.extend(inherited.node);
            return (binding, None);
        };
        let Some(node) = inherited.node else {
            return (binding, None);
        };

        let ctx = EvalContext {
            node,
            position: inherited.position,
            namespaces: &self.form.namespaces,
            variables: &self.variables,
        };
        match self.evaluator.evaluate(self.model, expr, &ctx) {
            Ok(EvalValue::Nodes(nodes)) => {
                binding.nodes = nodes;
                (binding, None)
            }
            Ok(EvalValue::Scalar(value)) if matches!(def.kind, ControlDefKind::Output) => {
                binding.scalar = Some(value);
                (binding, None)
            }
            Ok(EvalValue::Scalar(_)) => {
                binding.failed = true;
                (binding, Some(format!("`{expr}` must select nodes")))
            }
            Err(err) => {
                binding.failed = true;
                (binding, Some(err.to_string()))
            }
        }
    }

    fn evaluate(
        &self,
        def: &ControlDef,
        control: &mut ControlInstance,
        inherited: Inherited,
        failure: Option<String>,
        failures: &mut Vec<BindingFailure>,
    ) {
        if let Some(message) = failure {
            failures.push(BindingFailure {
                control: control.id().clone(),
                message,
            });
        }
        let bound = def.bind.is_some();
        let is_repeat = matches!(control.kind, ControlKind::Repeat(_));
        let node = if bound && !is_repeat {
            control.binding.node()
        } else {
            None
        };
        let props = node.and_then(|n| self.model.node(n)).map(|n| n.props);
        let failed = control.binding.failed;
        let has_target =
            !bound || is_repeat || node.is_some() || control.binding.scalar.is_some();

        let relevant =
            inherited.relevant && !failed && has_target && props.is_none_or(|p| p.relevant);
        let value = if relevant && control.holds_value() {
            control
                .binding
                .scalar
                .clone()
                .or_else(|| node.and_then(|n| self.model.value(n)).map(str::to_string))
        } else {
            None
        };
        control.state.apply(EvaluatedState {
            relevant,
            readonly: inherited.readonly || props.is_some_and(|p| p.readonly),
            required: props.is_some_and(|p| p.required),
            valid: !failed && props.is_none_or(|p| p.valid),
            value,
        });

        let control_id = control.id().clone();
        if let (ControlDefKind::Select { itemset: Some(expr), .. }, ControlKind::Value { items, .. }) =
            (&def.kind, &mut control.kind)
        {
            *items = if relevant {
                match self.itemset(expr, node.or(inherited.node), inherited.position) {
                    Ok(found) => found,
                    Err(message) => {
                        failures.push(BindingFailure {
                            control: control_id,
                            message,
                        });
                        Vec::new()
                    }
                }
            } else {
                Vec::new()
            };
        }
    }

    fn itemset(
        &self,
        expr: &str,
        node: Option<NodeRef>,
        position: usize,
    ) -> std::result::Result<Vec<Item>, String> {
        let Some(node) = node else {
            return Ok(Vec::new());
        };
        let ctx = EvalContext {
            node,
            position,
            namespaces: &self.form.namespaces,
            variables: &self.variables,
        };
        match self.evaluator.evaluate(self.model, expr, &ctx) {
            Ok(EvalValue::Nodes(nodes)) => Ok(nodes
                .into_iter()
                .filter_map(|n| self.model.node(n))
                .map(|n| Item {
                    label: n.value.clone(),
                    value: n.value.clone(),
                })
                .collect()),
            Ok(EvalValue::Scalar(_)) => Err(format!("itemset `{expr}` must select nodes")),
            Err(err) => Err(err.to_string()),
        }
    }

    fn evaluate_iteration(&self, control: &mut ControlInstance, inherited: Inherited) -> Inherited {
        let node = control.binding.node();
        let props = node.and_then(|n| self.model.node(n)).map(|n| n.props);
        let relevant = inherited.relevant && props.is_none_or(|p| p.relevant);
        let readonly = inherited.readonly || props.is_some_and(|p| p.readonly);
        control.state.apply(EvaluatedState {
            relevant,
            readonly,
            required: props.is_some_and(|p| p.required),
            valid: props.is_none_or(|p| p.valid),
            value: None,
        });
        Inherited {
            node,
            position: control.binding.position,
            relevant,
            readonly,
        }
    }
}

fn child_context(def: &ControlDef, control: &ControlInstance, inherited: Inherited) -> Inherited {
    let (node, position) = if def.bind.is_some() {
        (control.binding.node(), 1)
    } else {
        (inherited.node, inherited.position)
    };
    Inherited {
        node,
        position,
        relevant: control.is_relevant(),
        readonly: *control.state.readonly.current(),
    }
}

fn initial_kind(def: &ControlDef, id: &EffectiveId, restore: Option<&ControlsState>) -> ControlKind {
    let key = id.to_string();
    match &def.kind {
        ControlDefKind::Group => ControlKind::Container(ContainerFlavor::Group),
        ControlDefKind::Component => ControlKind::Container(ContainerFlavor::Component),
        ControlDefKind::Case { .. } => ControlKind::Container(ContainerFlavor::Case),
        ControlDefKind::Switch => {
            let restored = restore
                .and_then(|r| r.selected_cases.get(&key))
                .filter(|case| def.children.iter().any(|c| &c.id == *case))
                .cloned();
            let selected_case = restored
                .or_else(|| {
                    def.children
                        .iter()
                        .find(|c| matches!(c.kind, ControlDefKind::Case { selected: true }))
                        .map(|c| c.id.clone())
                })
                .or_else(|| def.children.first().map(|c| c.id.clone()))
                .unwrap_or_default();
            ControlKind::Container(ContainerFlavor::Switch { selected_case })
        }
        ControlDefKind::Input => value_kind(ValueFlavor::Input),
        ControlDefKind::Output => value_kind(ValueFlavor::Output),
        ControlDefKind::Trigger => value_kind(ValueFlavor::Trigger),
        ControlDefKind::Select { appearance, .. } => value_kind(ValueFlavor::Select(*appearance)),
        ControlDefKind::Repeat { start_index } => ControlKind::Repeat(RepeatState {
            index: 0,
            size: 0,
            start_index: *start_index,
        }),
        ControlDefKind::Dialog { initially_open } => ControlKind::Dialog {
            visible: restore.map_or(*initially_open, |r| r.open_dialogs.contains(&key)),
        },
        ControlDefKind::Upload => {
            ControlKind::Upload(restore.and_then(|r| r.uploads.get(&key)).cloned())
        }
    }
}

fn value_kind(flavor: ValueFlavor) -> ControlKind {
    ControlKind::Value {
        flavor,
        items: Vec::new(),
    }
}
