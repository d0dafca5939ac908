use std::collections::BTreeMap;
use std::sync::Arc;

use super::stimulus::Stimulus;
use crate::control::{
    ContainerFlavor, ControlInstance, ControlKind, ControlsState, EffectiveId, TreeBuilder,
    ValueFlavor,
};
use crate::error::{EngineError, Result, StateError};
use crate::form::{FormDefinition, InstanceSource, ListenerAnalysis, StaticIndex};
use crate::logging::{LogLevel, Logger, emit, json_kv, json_str};
use crate::metrics::MetricsHandle;
use crate::model::{BindingEvaluator, DataModel, InstanceDocument, NodeRef};
use crate::protocol::{ChangeSet, diff};
use crate::refresh::{
    Controls, EventHandler, EventKind, FocusTracker, Instruction, LifecycleEvent, MessageLevel,
    RefreshAudit, RefreshEngine, RefreshOutcome,
};
use crate::repeat::{CollectionChange, RepeatIndexCoordinator};
use crate::state::{DynamicState, InstanceLoader, SharedInstanceCache, SharedInstanceKey};

const TARGET: &str = "formtree::document";

/// Collaborators a document needs while it is being worked on. Borrowed from
/// the server for the duration of one request.
#[derive(Clone, Copy)]
pub struct DocumentEnv<'a> {
    pub evaluator: &'a dyn BindingEvaluator,
    pub shared: &'a SharedInstanceCache,
    pub loader: &'a dyn InstanceLoader,
    pub logger: Option<&'a Logger>,
    pub metrics: Option<&'a MetricsHandle>,
    pub audit: Option<&'a Arc<dyn RefreshAudit>>,
}

impl<'a> DocumentEnv<'a> {
    pub fn new(
        evaluator: &'a dyn BindingEvaluator,
        shared: &'a SharedInstanceCache,
        loader: &'a dyn InstanceLoader,
    ) -> Self {
        Self {
            evaluator,
            shared,
            loader,
            logger: None,
            metrics: None,
            audit: None,
        }
    }

    pub fn with_logger(mut self, logger: Option<&'a Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_metrics(mut self, metrics: Option<&'a MetricsHandle>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_audit(mut self, audit: Option<&'a Arc<dyn RefreshAudit>>) -> Self {
        self.audit = audit;
        self
    }

    fn engine(&self, form: &FormDefinition) -> RefreshEngine {
        let engine = RefreshEngine::new(ListenerAnalysis::analyze(form))
            .with_logger(self.logger.cloned())
            .with_metrics(self.metrics.cloned());
        match self.audit {
            Some(audit) => engine.with_audit(Arc::clone(audit)),
            None => engine,
        }
    }
}

/// One live form: its data, its control tree and the output collected for
/// the next response. This is the object the server pools between requests.
pub struct FormDocument {
    form: Arc<FormDefinition>,
    engine: RefreshEngine,
    coordinator: RepeatIndexCoordinator,
    model: DataModel,
    controls: Controls,
    sequence: u64,
    pending: Vec<Instruction>,
    logger: Option<Logger>,
}

impl FormDocument {
    /// Initialize a fresh document: load instances, build the tree and run
    /// the first refresh, which enables every relevant control.
    pub fn create(
        form: Arc<FormDefinition>,
        env: &DocumentEnv<'_>,
        handler: &mut dyn EventHandler,
    ) -> Result<Self> {
        form.validate()?;
        let model = load_model(&form, None, env)?;
        let (tree, failures) = TreeBuilder::new(&form, &model, env.evaluator).build(None)?;
        let size = tree.len();
        let mut document = Self::assemble(
            form,
            model,
            Controls::with_tree(tree, FocusTracker::new()),
            0,
            env,
        );

        if document.engine.analysis().has_listener(EventKind::BindingError) {
            let events = failures
                .into_iter()
                .map(|f| {
                    LifecycleEvent::new(f.control, EventKind::BindingError).with_detail(f.message)
                })
                .collect();
            document.raise(events, handler)?;
        }
        document.controls.mark_dirty();
        document.refresh(env, handler)?;

        emit(
            env.logger,
            LogLevel::Info,
            TARGET,
            "document created",
            [
                json_str("form", document.form.id.clone()),
                json_kv("controls", size),
            ],
        );
        Ok(document)
    }

    /// Rebuild a document from its serialized dynamic state. The restored
    /// tree is committed as-is; no events are dispatched.
    pub fn restore(
        form: Arc<FormDefinition>,
        state: DynamicState,
        env: &DocumentEnv<'_>,
    ) -> Result<Self> {
        let DynamicState {
            sequence,
            mut instances,
            controls,
        } = state;
        let model = load_model(&form, Some(&mut instances), env)?;
        let (mut tree, _) =
            TreeBuilder::new(&form, &model, env.evaluator).build(Some(&controls))?;
        tree.commit_all();
        let focus = FocusTracker::restore(controls.focus.as_deref().and_then(|f| f.parse().ok()));

        emit(
            env.logger,
            LogLevel::Debug,
            TARGET,
            "document restored",
            [json_str("form", form.id.clone()), json_kv("sequence", sequence)],
        );
        Ok(Self::assemble(
            form,
            model,
            Controls::with_tree(tree, focus),
            sequence,
            env,
        ))
    }

    fn assemble(
        form: Arc<FormDefinition>,
        model: DataModel,
        controls: Controls,
        sequence: u64,
        env: &DocumentEnv<'_>,
    ) -> Self {
        Self {
            engine: env.engine(&form),
            coordinator: RepeatIndexCoordinator::new().with_logger(env.logger.cloned()),
            form,
            model,
            controls,
            sequence,
            pending: Vec::new(),
            logger: env.logger.cloned(),
        }
    }

    pub fn form(&self) -> &Arc<FormDefinition> {
        &self.form
    }

    pub fn model(&self) -> &DataModel {
        &self.model
    }

    pub fn controls(&self) -> &Controls {
        &self.controls
    }

    /// Number of responses produced so far.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Apply one stimulus and reconcile the tree with the resulting data.
    pub fn apply(
        &mut self,
        stimulus: Stimulus,
        env: &DocumentEnv<'_>,
        handler: &mut dyn EventHandler,
    ) -> Result<()> {
        let mut op = self.logger.as_ref().map(|l| l.operation(TARGET, "stimulus"));
        if let Some(op) = op.as_mut() {
            op.record("kind", stimulus.name());
        }

        let changes = self.stimulate(stimulus, handler)?;
        let outcome = self.refresh(env, handler)?;
        if !changes.is_empty() {
            if let Some(tree) = self.controls.current_mut() {
                self.coordinator.adjust(tree, &changes);
            }
        }

        if let Some(op) = op.as_mut() {
            op.record("events", outcome.events.len());
        }
        Ok(())
    }

    /// Produce the change-set for the client and make the current tree the
    /// new baseline.
    pub fn respond(&mut self, first: bool) -> ChangeSet {
        let changes = match (self.controls.initial(), self.controls.current()) {
            (Some(initial), Some(current)) => {
                diff(initial, self.controls.initial_indexes(), current, first)
            }
            _ => ChangeSet::default(),
        };
        let changes = changes.with_instructions(self.pending.drain(..));
        self.controls.after_update_response();
        self.sequence += 1;
        changes
    }

    pub fn dynamic_state(&self) -> DynamicState {
        let controls = self
            .controls
            .current()
            .map(|tree| ControlsState::capture(tree, self.controls.focus().current()))
            .unwrap_or_default();
        DynamicState {
            sequence: self.sequence,
            instances: self
                .model
                .owned_instances()
                .map(|(id, doc)| (id.to_string(), doc.clone()))
                .collect(),
            controls,
        }
    }

    fn stimulate(
        &mut self,
        stimulus: Stimulus,
        handler: &mut dyn EventHandler,
    ) -> Result<Vec<CollectionChange>> {
        match stimulus {
            Stimulus::SetValue { control, value } => {
                let node = self.writable_node(&control)?;
                if self.model.set_value(node, value)? {
                    self.controls.mark_dirty();
                }
            }
            Stimulus::Activate { control } => {
                let id = self.relevant_id(&control)?;
                self.raise(vec![LifecycleEvent::new(id, EventKind::Activate)], handler)?;
            }
            Stimulus::Insert { repeat, after } => {
                let node = self.insert(&repeat, after)?;
                self.controls.mark_dirty();
                return Ok(vec![CollectionChange::Inserted { node }]);
            }
            Stimulus::Delete { repeat, position } => {
                let plan = self.delete(&repeat, position)?;
                self.controls.mark_dirty();
                return Ok(plan);
            }
            Stimulus::SetIndex { repeat, index } => {
                let id = self.find(&repeat)?.id().clone();
                if let Some(tree) = self.controls.current_mut() {
                    self.coordinator.set_index(tree, &id, index)?;
                }
            }
            Stimulus::Focus { control } => self.focus(&control, handler)?,
            Stimulus::SelectCase { switch, case } => self.select_case(&switch, &case, handler)?,
            Stimulus::OpenDialog { dialog } => self.show_dialog(&dialog, true, handler)?,
            Stimulus::CloseDialog { dialog } => self.show_dialog(&dialog, false, handler)?,
            Stimulus::Upload {
                control,
                file,
                value,
            } => {
                let node = self.writable_node(&control)?;
                let id = self.find(&control)?.id().clone();
                match self
                    .controls
                    .current_mut()
                    .and_then(|tree| tree.find_mut(&id))
                    .map(|c| &mut c.kind)
                {
                    Some(ControlKind::Upload(info)) => *info = Some(file),
                    _ => return Err(invalid(format!("`{control}` is not an upload control"))),
                }
                self.model.set_value(node, value)?;
                self.controls.mark_dirty();
            }
            Stimulus::SubmissionResult { submission, error } => {
                self.submission_result(submission, error, handler)?
            }
        }
        Ok(Vec::new())
    }

    fn refresh(
        &mut self,
        env: &DocumentEnv<'_>,
        handler: &mut dyn EventHandler,
    ) -> Result<RefreshOutcome> {
        let builder = TreeBuilder::new(&self.form, &self.model, env.evaluator);
        let outcome = self.engine.refresh(&mut self.controls, &builder, handler)?;
        self.pending.extend(outcome.instructions.iter().cloned());
        Ok(outcome)
    }

    fn raise(&mut self, events: Vec<LifecycleEvent>, handler: &mut dyn EventHandler) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let instructions = self.engine.dispatch(events, handler)?;
        self.pending.extend(instructions);
        Ok(())
    }

    fn find(&self, raw: &str) -> Result<&ControlInstance> {
        let not_found = || EngineError::ControlNotFound(raw.to_string());
        let id: EffectiveId = raw.parse().map_err(|_| not_found())?;
        self.controls
            .current()
            .and_then(|tree| tree.find(&id))
            .ok_or_else(not_found)
    }

    fn relevant_id(&self, raw: &str) -> Result<EffectiveId> {
        let control = self.find(raw)?;
        if !control.is_relevant() {
            return Err(invalid(format!("`{raw}` is not relevant")));
        }
        Ok(control.id().clone())
    }

    fn writable_node(&self, raw: &str) -> Result<NodeRef> {
        let control = self.find(raw)?;
        let editable = matches!(
            control.kind,
            ControlKind::Value {
                flavor: ValueFlavor::Input | ValueFlavor::Select(_),
                ..
            } | ControlKind::Upload(_)
        );
        if !editable {
            return Err(invalid(format!("`{raw}` does not accept values")));
        }
        if !control.is_relevant() {
            return Err(invalid(format!("`{raw}` is not relevant")));
        }
        if *control.state.readonly.current() {
            return Err(invalid(format!("`{raw}` is readonly")));
        }
        control
            .binding
            .node()
            .ok_or_else(|| invalid(format!("`{raw}` is not bound to a node")))
    }

    fn repeat_nodes(&self, raw: &str) -> Result<Vec<NodeRef>> {
        let control = self.find(raw)?;
        if control.repeat().is_none() {
            return Err(invalid(format!("`{raw}` is not a repeat")));
        }
        if *control.state.readonly.current() {
            return Err(invalid(format!("`{raw}` is readonly")));
        }
        Ok(control.binding.nodes.clone())
    }

    /// Copy the last node of the collection into place after `after`. An
    /// empty collection is seeded from the form's initial data instead.
    fn insert(&mut self, raw: &str, after: Option<u32>) -> Result<NodeRef> {
        let nodes = self.repeat_nodes(raw)?;
        let (Some(&first), Some(&origin)) = (nodes.first(), nodes.last()) else {
            return self.insert_from_template(raw);
        };
        let after = after.map_or(nodes.len(), |a| (a as usize).min(nodes.len()));
        let (reference, offset) = match after {
            0 => (first, 0),
            n => (nodes[n - 1], 1),
        };
        let parent = self
            .model
            .parent(reference)
            .ok_or_else(|| invalid(format!("cannot insert next to the root of `{raw}`")))?;
        let index = self
            .model
            .document(reference.instance)
            .and_then(|doc| {
                doc.children(parent.node)
                    .iter()
                    .position(|c| *c == reference.node)
            })
            .ok_or_else(|| invalid(format!("`{raw}` is bound to a detached node")))?;
        Ok(self.model.insert_copy(origin, parent, index + offset)?)
    }

    /// Resolve the repeat's bind as child steps: the parent in live data,
    /// and the first matching node under the same path in the initial
    /// inline document of that instance.
    fn insert_from_template(&mut self, raw: &str) -> Result<NodeRef> {
        let empty = || invalid(format!("cannot insert into `{raw}`: its collection is empty"));
        let form = Arc::clone(&self.form);
        let control = self.find(raw)?;
        let context = control.binding.context.ok_or_else(empty)?;
        let steps = StaticIndex::new(&form)
            .get(control.static_id())
            .and_then(|def| def.bind.as_deref())
            .and_then(child_steps)
            .ok_or_else(empty)?;
        let (last, parents) = steps.split_last().ok_or_else(empty)?;

        let instance_id = self
            .model
            .instances()
            .get(context.instance)
            .map(|i| i.id.as_str())
            .ok_or_else(empty)?;
        let initial = form
            .instances
            .iter()
            .find_map(|def| match &def.source {
                InstanceSource::Inline { document } if def.id == instance_id => Some(document),
                _ => None,
            })
            .ok_or_else(empty)?;
        let live = self.model.document(context.instance).ok_or_else(empty)?;
        let parent = live
            .descend(context.node, parents.iter().copied())
            .ok_or_else(empty)?;
        let context_path = live.path_names(context.node);
        let template = context_path
            .split_first()
            .filter(|(root, _)| initial.node(initial.root()).is_some_and(|n| n.name == **root))
            .and_then(|(_, below)| {
                initial.descend(initial.root(), below.iter().copied().chain(steps.iter().copied()))
            })
            .ok_or_else(empty)?;
        let siblings = live.children(parent);
        let index = siblings
            .iter()
            .rposition(|c| live.node(*c).is_some_and(|n| n.name == *last))
            .map_or(siblings.len(), |i| i + 1);

        let parent = NodeRef::new(context.instance, parent);
        Ok(self.model.import_copy(initial, template, parent, index)?)
    }

    fn delete(&mut self, raw: &str, position: u32) -> Result<Vec<CollectionChange>> {
        let nodes = self.repeat_nodes(raw)?;
        let node = (position as usize)
            .checked_sub(1)
            .and_then(|i| nodes.get(i))
            .copied()
            .ok_or_else(|| invalid(format!("`{raw}` has no iteration {position}")))?;
        let plan = self
            .controls
            .current()
            .map(|tree| RepeatIndexCoordinator::plan_delete(tree, node))
            .unwrap_or_default();
        self.model.delete(node)?;
        Ok(plan)
    }

    fn focus(&mut self, raw: &str, handler: &mut dyn EventHandler) -> Result<()> {
        let id = self.relevant_id(raw)?;
        let previous = self.controls.focus().current().cloned();
        if previous.as_ref() == Some(&id) {
            return Ok(());
        }
        let mut events = Vec::new();
        if let Some(previous) = previous {
            if self.controls.current().is_some_and(|t| t.find(&previous).is_some()) {
                events.push(LifecycleEvent::new(previous, EventKind::FocusOut));
            }
        }
        self.controls.focus_mut().set_focus(id.clone());
        events.push(LifecycleEvent::new(id, EventKind::FocusIn));
        self.raise(events, handler)
    }

    fn select_case(
        &mut self,
        raw: &str,
        case: &str,
        handler: &mut dyn EventHandler,
    ) -> Result<()> {
        let (switch_id, old) = {
            let switch = self.find(raw)?;
            match &switch.kind {
                ControlKind::Container(ContainerFlavor::Switch { selected_case }) => {
                    (switch.id().clone(), selected_case.clone())
                }
                _ => return Err(invalid(format!("`{raw}` is not a switch"))),
            }
        };
        if old == case {
            return Ok(());
        }
        let positions = switch_id.positions().to_vec();
        let case_id = EffectiveId::with_positions(case, positions.clone());
        let is_case = self.controls.current().is_some_and(|tree| {
            let parent = tree.slot_of(&case_id).and_then(|s| tree.parent(s));
            parent.is_some() && parent == tree.slot_of(&switch_id)
        });
        if !is_case {
            return Err(invalid(format!("`{raw}` has no case `{case}`")));
        }
        if let Some(ControlKind::Container(ContainerFlavor::Switch { selected_case })) = self
            .controls
            .current_mut()
            .and_then(|tree| tree.find_mut(&switch_id))
            .map(|c| &mut c.kind)
        {
            *selected_case = case.to_string();
        }
        self.raise(
            vec![
                LifecycleEvent::new(EffectiveId::with_positions(old, positions), EventKind::Deselect),
                LifecycleEvent::new(case_id, EventKind::Select),
            ],
            handler,
        )
    }

    fn show_dialog(
        &mut self,
        raw: &str,
        visible: bool,
        handler: &mut dyn EventHandler,
    ) -> Result<()> {
        let id = {
            let dialog = self.find(raw)?;
            match dialog.kind {
                ControlKind::Dialog { visible: current } if current == visible => return Ok(()),
                ControlKind::Dialog { .. } => dialog.id().clone(),
                _ => return Err(invalid(format!("`{raw}` is not a dialog"))),
            }
        };
        if let Some(ControlKind::Dialog { visible: current }) = self
            .controls
            .current_mut()
            .and_then(|tree| tree.find_mut(&id))
            .map(|c| &mut c.kind)
        {
            *current = visible;
        }
        let kind = if visible {
            EventKind::DialogShown
        } else {
            EventKind::DialogHidden
        };
        self.raise(vec![LifecycleEvent::new(id, kind)], handler)
    }

    /// Submissions are not controls; their outcome is reported on the root.
    fn submission_result(
        &mut self,
        submission: String,
        error: Option<String>,
        handler: &mut dyn EventHandler,
    ) -> Result<()> {
        let root = self
            .controls
            .current()
            .and_then(|tree| tree.root().and_then(|slot| tree.get(slot)))
            .map(|c| c.id().clone())
            .ok_or_else(|| EngineError::Structural("document has no controls".into()))?;
        let event = match error {
            None => LifecycleEvent::new(root, EventKind::SubmitDone).with_detail(submission),
            Some(error) => {
                emit(
                    self.logger.as_ref(),
                    LogLevel::Warn,
                    TARGET,
                    "submission failed",
                    [
                        json_str("submission", submission.clone()),
                        json_str("error", error.clone()),
                    ],
                );
                self.pending.push(Instruction::Message {
                    level: MessageLevel::Error,
                    text: format!("submission `{submission}` failed: {error}"),
                });
                LifecycleEvent::new(root, EventKind::SubmitError).with_detail(error)
            }
        };
        self.raise(vec![event], handler)
    }
}

/// Split a bind made only of child element steps, dropping predicates.
fn child_steps(expr: &str) -> Option<Vec<&str>> {
    expr.trim()
        .split('/')
        .map(|step| step.split('[').next().unwrap_or(step).trim())
        .map(|name| {
            let plain = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | ':'));
            plain.then_some(name)
        })
        .collect()
}

fn invalid(message: String) -> EngineError {
    EngineError::InvalidStimulus(message)
}

/// Owned instances come from `restored` when given, otherwise from the
/// definition. Shared instances always come from the cache.
fn load_model(
    form: &FormDefinition,
    mut restored: Option<&mut BTreeMap<String, InstanceDocument>>,
    env: &DocumentEnv<'_>,
) -> Result<DataModel> {
    let mut model = DataModel::new();
    for def in &form.instances {
        match &def.source {
            InstanceSource::Inline { document } => {
                let document = match restored.as_deref_mut() {
                    Some(instances) => instances.remove(&def.id).ok_or_else(|| {
                        StateError::Decode(format!("missing instance `{}`", def.id))
                    })?,
                    None => document.clone(),
                };
                model.add_owned(def.id.clone(), document);
            }
            InstanceSource::Shared {
                uri,
                ttl_ms,
                handle_xinclude,
            } => {
                let key = SharedInstanceKey::new(uri.clone(), *handle_xinclude);
                let document = env.shared.find_or_load(&key, *ttl_ms, env.loader)?;
                model.add_shared(def.id.clone(), uri.clone(), document);
            }
        }
    }
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form::{ControlDef, ControlDefKind, ListenerDef};
    use crate::model::{NodeProps, PathEvaluator};
    use crate::protocol::{CaseToggle, ControlUpdate, IndexDelta, RepeatIndexes, RepeatSize};
    use crate::refresh::{NullHandler, RecordingHandler};
    use crate::state::{MapInstanceLoader, StateCodec};

    struct Fixture {
        evaluator: PathEvaluator,
        shared: SharedInstanceCache,
        loader: MapInstanceLoader,
    }

    impl Fixture {
        fn new() -> Self {
            let mut codes = InstanceDocument::new("codes");
            let root = codes.root();
            for code in ["fr", "de"] {
                codes.append(root, "code", code).unwrap();
            }
            Self {
                evaluator: PathEvaluator::new(),
                shared: SharedInstanceCache::new(4),
                loader: MapInstanceLoader::new().with_document("mem://codes", codes),
            }
        }

        fn env(&self) -> DocumentEnv<'_> {
            DocumentEnv::new(&self.evaluator, &self.shared, &self.loader)
        }
    }

    fn data() -> InstanceDocument {
        let mut doc = InstanceDocument::new("data");
        let root = doc.root();
        doc.append(root, "name", "Ada").unwrap();
        let rows = doc.append(root, "rows", "").unwrap();
        for v in ["a", "b"] {
            let row = doc.append(rows, "row", "").unwrap();
            doc.append(row, "v", v).unwrap();
        }
        doc.append(root, "empty", "").unwrap();
        doc
    }

    fn form_with(doc: InstanceDocument, listeners: Vec<ListenerDef>) -> Arc<FormDefinition> {
        let root = ControlDef::group("root")
            .child(ControlDef::input("name", "name"))
            .child(ControlDef::repeat("rows", "rows/row", 1).child(ControlDef::input("v", "v")))
            .child(ControlDef::repeat("none", "empty/item", 1).child(ControlDef::input("w", ".")))
            .child(
                ControlDef::new("tabs", ControlDefKind::Switch)
                    .child(ControlDef::new("one", ControlDefKind::Case { selected: true }))
                    .child(ControlDef::new("two", ControlDefKind::Case { selected: false })),
            )
            .child(ControlDef::new("save", ControlDefKind::Trigger))
            .child(ControlDef::new(
                "help",
                ControlDefKind::Dialog {
                    initially_open: false,
                },
            ));
        let form = listeners.into_iter().fold(
            FormDefinition::new("orders", root).with_instance("main", doc),
            FormDefinition::with_listener,
        );
        Arc::new(form)
    }

    fn form(listeners: Vec<ListenerDef>) -> Arc<FormDefinition> {
        form_with(data(), listeners)
    }

    #[test]
    fn creation_enables_relevant_controls() {
        let fixture = Fixture::new();
        let mut handler = RecordingHandler::new();
        let mut doc = FormDocument::create(
            form(vec![ListenerDef::global(EventKind::Enabled)]),
            &fixture.env(),
            &mut handler,
        )
        .unwrap();
        assert_eq!(handler.kinds_for("name"), vec![EventKind::Enabled]);
        assert_eq!(handler.kinds_for("v·2"), vec![EventKind::Enabled]);

        let changes = doc.respond(true);
        let name = changes.controls.iter().find(|c| c.id == "name").unwrap();
        assert_eq!(name.value.as_deref(), Some("Ada"));
        assert_eq!(doc.sequence(), 1);
    }

    #[test]
    fn set_value_reports_only_the_change() {
        let fixture = Fixture::new();
        let env = fixture.env();
        let mut handler = RecordingHandler::new();
        let mut doc = FormDocument::create(
            form(vec![ListenerDef::global(EventKind::ValueChanged)]),
            &env,
            &mut handler,
        )
        .unwrap();
        doc.respond(true);
        handler.clear();

        doc.apply(
            Stimulus::SetValue {
                control: "name".into(),
                value: "Grace".into(),
            },
            &env,
            &mut handler,
        )
        .unwrap();
        assert_eq!(handler.summary(), vec![("name".to_string(), EventKind::ValueChanged)]);
        assert_eq!(
            doc.respond(false).controls,
            vec![ControlUpdate {
                id: "name".into(),
                value: Some("Grace".into()),
                ..ControlUpdate::default()
            }]
        );
    }

    #[test]
    fn insert_selects_the_new_iteration() {
        let fixture = Fixture::new();
        let env = fixture.env();
        let mut handler = RecordingHandler::new();
        let mut doc = FormDocument::create(
            form(vec![
                ListenerDef::global(EventKind::Enabled),
                ListenerDef::on("rows", EventKind::IterationMoved),
            ]),
            &env,
            &mut handler,
        )
        .unwrap();
        doc.respond(true);
        handler.clear();

        doc.apply(
            Stimulus::Insert {
                repeat: "rows".into(),
                after: Some(1),
            },
            &env,
            &mut handler,
        )
        .unwrap();
        assert_eq!(
            handler.summary(),
            vec![
                ("rows·2".to_string(), EventKind::Enabled),
                ("v·2".to_string(), EventKind::Enabled),
                ("rows·3".to_string(), EventKind::IterationMoved),
            ]
        );
        let changes = doc.respond(false);
        assert_eq!(
            changes.repeat_sizes,
            vec![RepeatSize {
                repeat: "rows".into(),
                old: 2,
                new: 3
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
    }

    #[test]
    fn deleting_the_selected_last_row_moves_the_index_back() {
        let fixture = Fixture::new();
        let env = fixture.env();
        let mut doc = FormDocument::create(form(vec![]), &env, &mut NullHandler).unwrap();
        doc.respond(true);

        let set = Stimulus::SetIndex {
            repeat: "rows".into(),
            index: 2,
        };
        doc.apply(set, &env, &mut NullHandler).unwrap();
        doc.respond(false);

        let delete = Stimulus::Delete {
            repeat: "rows".into(),
            position: 2,
        };
        doc.apply(delete, &env, &mut NullHandler).unwrap();
        let changes = doc.respond(false);
        assert_eq!(changes.repeat_sizes[0].new, 1);
        assert_eq!(
            changes.repeat_indexes,
            RepeatIndexes::Delta(vec![IndexDelta {
                repeat: "rows".into(),
                old: 2,
                new: 1
            }])
        );
    }

    #[test]
    fn emptied_collections_are_refilled_from_the_initial_data() {
        let fixture = Fixture::new();
        let env = fixture.env();
        let mut doc = FormDocument::create(form(vec![]), &env, &mut NullHandler).unwrap();
        doc.respond(true);
        for _ in 0..2 {
            let delete = Stimulus::Delete {
                repeat: "rows".into(),
                position: 1,
            };
            doc.apply(delete, &env, &mut NullHandler).unwrap();
        }
        assert_eq!(doc.respond(false).repeat_sizes[0].new, 0);

        let insert = Stimulus::Insert {
            repeat: "rows".into(),
            after: None,
        };
        doc.apply(insert, &env, &mut NullHandler).unwrap();
        let changes = doc.respond(false);
        assert_eq!(
            changes.repeat_sizes,
            vec![RepeatSize {
                repeat: "rows".into(),
                old: 0,
                new: 1
            }]
        );
        let v = changes.controls.iter().find(|c| c.id == "v·1").unwrap();
        assert_eq!(v.value.as_deref(), Some("a"));
    }

    #[test]
    fn rejected_stimuli_leave_the_document_untouched() {
        let fixture = Fixture::new();
        let env = fixture.env();
        let mut doc = data();
        let name = doc.children_named(doc.root(), "name")[0];
        doc.set_props(
            name,
            NodeProps {
                readonly: true,
                ..NodeProps::default()
            },
        )
        .unwrap();
        let mut document = FormDocument::create(form_with(doc, vec![]), &env, &mut NullHandler)
            .unwrap();
        let revision = document.model().revision();

        let cases = [
            Stimulus::SetValue {
                control: "name".into(),
                value: "x".into(),
            },
            Stimulus::Insert {
                repeat: "none".into(),
                after: None,
            },
            Stimulus::Delete {
                repeat: "rows".into(),
                position: 9,
            },
            Stimulus::SelectCase {
                switch: "tabs".into(),
                case: "name".into(),
            },
        ];
        for stimulus in cases {
            let err = document.apply(stimulus, &env, &mut NullHandler).unwrap_err();
            assert!(matches!(err, EngineError::InvalidStimulus(_)), "{err}");
        }
        assert!(matches!(
            document.apply(
                Stimulus::Activate {
                    control: "ghost".into()
                },
                &env,
                &mut NullHandler
            ),
            Err(EngineError::ControlNotFound(_))
        ));
        assert_eq!(document.model().revision(), revision);
    }

    #[test]
    fn restored_document_matches_the_original() {
        let fixture = Fixture::new();
        let env = fixture.env();
        let form = form(vec![]);
        let mut doc = FormDocument::create(form.clone(), &env, &mut NullHandler).unwrap();
        doc.respond(true);
        for stimulus in [
            Stimulus::SetValue {
                control: "name".into(),
                value: "Grace".into(),
            },
            Stimulus::SetIndex {
                repeat: "rows".into(),
                index: 2,
            },
            Stimulus::SelectCase {
                switch: "tabs".into(),
                case: "two".into(),
            },
            Stimulus::Focus {
                control: "name".into(),
            },
        ] {
            doc.apply(stimulus, &env, &mut NullHandler).unwrap();
        }
        doc.respond(false);

        let codec = StateCodec::new("test secret");
        let state: DynamicState = codec.decode(&codec.encode(&doc.dynamic_state()).unwrap()).unwrap();
        let mut restored = FormDocument::restore(form, state, &env).unwrap();
        let tree = restored.controls().current().unwrap();
        assert_eq!(tree.find(&EffectiveId::new("name")).unwrap().value(), Some("Grace"));
        assert_eq!(tree.repeat_indexes()[&EffectiveId::new("rows")], 2);
        assert_eq!(
            restored.controls().focus().current(),
            Some(&EffectiveId::new("name"))
        );
        assert_eq!(restored.sequence(), doc.sequence());
        assert_eq!(
            restored.dynamic_state().controls,
            doc.dynamic_state().controls
        );
        assert!(restored.respond(false).is_empty());
    }

    #[test]
    fn handler_instructions_reach_the_response() {
        let fixture = Fixture::new();
        let env = fixture.env();
        let mut handler = RecordingHandler::new().respond(
            EventKind::Activate,
            Instruction::Submit {
                submission: "save".into(),
            },
        );
        let mut doc = FormDocument::create(form(vec![]), &env, &mut handler).unwrap();
        doc.respond(true);

        let activate = Stimulus::Activate {
            control: "save".into(),
        };
        doc.apply(activate, &env, &mut handler).unwrap();
        assert_eq!(doc.respond(false).submission.as_deref(), Some("save"));

        let failed = Stimulus::SubmissionResult {
            submission: "save".into(),
            error: Some("timeout".into()),
        };
        doc.apply(failed, &env, &mut handler).unwrap();
        assert!(handler.kinds_for("root").contains(&EventKind::SubmitError));
        let changes = doc.respond(false);
        assert_eq!(changes.messages.len(), 1);
        assert_eq!(changes.messages[0].level, MessageLevel::Error);
    }

    #[test]
    fn switches_dialogs_and_focus_raise_their_events() {
        let fixture = Fixture::new();
        let env = fixture.env();
        let mut handler = RecordingHandler::new();
        let mut doc = FormDocument::create(form(vec![]), &env, &mut handler).unwrap();
        doc.respond(true);

        for stimulus in [
            Stimulus::SelectCase {
                switch: "tabs".into(),
                case: "two".into(),
            },
            Stimulus::OpenDialog {
                dialog: "help".into(),
            },
            Stimulus::Focus {
                control: "name".into(),
            },
            Stimulus::Focus {
                control: "v·1".into(),
            },
        ] {
            doc.apply(stimulus, &env, &mut handler).unwrap();
        }
        assert_eq!(
            handler.summary(),
            vec![
                ("one".to_string(), EventKind::Deselect),
                ("two".to_string(), EventKind::Select),
                ("help".to_string(), EventKind::DialogShown),
                ("name".to_string(), EventKind::FocusIn),
                ("name".to_string(), EventKind::FocusOut),
                ("v·1".to_string(), EventKind::FocusIn),
            ]
        );
        let changes = doc.respond(false);
        assert_eq!(
            changes.toggles,
            vec![CaseToggle {
                switch: "tabs".into(),
                shown: "two".into(),
                hidden: vec!["one".into()],
            }]
        );
        let help = changes.controls.iter().find(|c| c.id == "help").unwrap();
        assert_eq!(help.visible, Some(true));
    }

    #[test]
    fn shared_instances_are_loaded_once_and_never_serialized() {
        let fixture = Fixture::new();
        let env = fixture.env();
        let root = ControlDef::group("root").child(ControlDef::new(
            "country",
            ControlDefKind::Select {
                appearance: Default::default(),
                itemset: Some("instance('codes')/code".into()),
            },
        ));
        let form = Arc::new(
            FormDefinition::new("shared", root)
                .with_instance("main", data())
                .with_shared_instance("codes", "mem://codes", -1),
        );
        let first = FormDocument::create(form.clone(), &env, &mut NullHandler).unwrap();
        let _second = FormDocument::create(form, &env, &mut NullHandler).unwrap();
        assert_eq!(fixture.loader.loads(), 1);

        let country = first
            .controls()
            .current()
            .and_then(|t| t.find(&EffectiveId::new("country")))
            .unwrap();
        assert_eq!(country.items().len(), 2);
        let state = first.dynamic_state();
        assert_eq!(state.instances.keys().collect::<Vec<_>>(), vec!["main"]);
    }
}
