use std::sync::Arc;

use indexmap::IndexMap;

use super::audit::{NullRefreshAudit, RefreshAudit, RefreshAuditEventBuilder, RefreshAuditStage};
use super::events::{EventHandler, EventKind, Instruction, LifecycleEvent};
use super::focus::{FocusCheck, FocusTracker};
use crate::control::{ControlInstance, ControlTree, EffectiveId, TreeBuilder};
use crate::error::{DispatchFailure, EngineError, Result};
use crate::form::ListenerAnalysis;
use crate::logging::{LogLevel, Logger, emit, json_kv, json_str};
use crate::metrics::{MetricsHandle, with_metrics};

const TARGET: &str = "formtree::refresh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    /// Bindings match the data.
    Clean,
    /// The data changed; bindings must be recomputed first.
    BindingsDirty,
    /// Bindings are current but events for this round are not dispatched.
    RefreshPending,
}

/// The initial and current views of the control tree. They are one tree
/// until the first mutation after a response, when the initial view becomes
/// an independent copy.
#[derive(Debug, Clone, Default)]
enum TreeState {
    #[default]
    Empty,
    Unforked(ControlTree),
    Forked {
        initial: ControlTree,
        initial_indexes: IndexMap<EffectiveId, u32>,
        current: ControlTree,
    },
}

/// Control tree state owned by one form document.
#[derive(Debug, Clone)]
pub struct Controls {
    state: TreeState,
    phase: RefreshPhase,
    in_refresh: bool,
    focus: FocusTracker,
}

impl Default for Controls {
    fn default() -> Self {
        Self::new()
    }
}

impl Controls {
    pub fn new() -> Self {
        Self {
            state: TreeState::Empty,
            phase: RefreshPhase::Clean,
            in_refresh: false,
            focus: FocusTracker::new(),
        }
    }

    pub fn with_tree(tree: ControlTree, focus: FocusTracker) -> Self {
        Self {
            state: TreeState::Unforked(tree),
            focus,
            ..Self::new()
        }
    }

    pub fn phase(&self) -> RefreshPhase {
        self.phase
    }

    /// Data changed in a way that may affect bindings or relevance.
    pub fn mark_dirty(&mut self) {
        self.phase = RefreshPhase::BindingsDirty;
    }

    pub fn current(&self) -> Option<&ControlTree> {
        match &self.state {
            TreeState::Empty => None,
            TreeState::Unforked(tree) => Some(tree),
            TreeState::Forked { current, .. } => Some(current),
        }
    }

    pub fn initial(&self) -> Option<&ControlTree> {
        match &self.state {
            TreeState::Empty => None,
            TreeState::Unforked(tree) => Some(tree),
            TreeState::Forked { initial, .. } => Some(initial),
        }
    }

    /// Repeat indexes captured at the fork; `None` while unforked.
    pub fn initial_indexes(&self) -> Option<&IndexMap<EffectiveId, u32>> {
        match &self.state {
            TreeState::Forked {
                initial_indexes, ..
            } => Some(initial_indexes),
            _ => None,
        }
    }

    pub fn is_forked(&self) -> bool {
        matches!(self.state, TreeState::Forked { .. })
    }

    /// Mutable access to the current tree, copying the initial view first if
    /// this is the first mutation since the last response.
    pub fn current_mut(&mut self) -> Option<&mut ControlTree> {
        self.split_mut().map(|(tree, ..)| tree)
    }

    pub fn focus(&self) -> &FocusTracker {
        &self.focus
    }

    pub fn focus_mut(&mut self) -> &mut FocusTracker {
        &mut self.focus
    }

    /// The response has been produced: the current tree becomes the new
    /// initial view.
    pub fn after_update_response(&mut self) {
        self.state = match std::mem::take(&mut self.state) {
            TreeState::Forked { current, .. } => TreeState::Unforked(current),
            other => other,
        };
    }

    fn split_mut(
        &mut self,
    ) -> Option<(&mut ControlTree, &mut FocusTracker, &mut RefreshPhase)> {
        self.state = match std::mem::take(&mut self.state) {
            TreeState::Unforked(tree) => {
                let initial = tree.snapshot();
                let initial_indexes = initial.repeat_indexes();
                TreeState::Forked {
                    initial,
                    initial_indexes,
                    current: tree,
                }
            }
            other => other,
        };
        match &mut self.state {
            TreeState::Forked { current, .. } => {
                Some((current, &mut self.focus, &mut self.phase))
            }
            _ => None,
        }
    }
}

/// What one refresh pass did.
#[derive(Debug, Clone, Default)]
pub struct RefreshOutcome {
    /// False when the pass was a no-op.
    pub ran: bool,
    pub dispatch_skipped: bool,
    pub visited: usize,
    pub evaluated: usize,
    pub optimized: usize,
    pub events: Vec<LifecycleEvent>,
    pub instructions: Vec<Instruction>,
}

/// Runs reconciliation passes for the documents of one form.
pub struct RefreshEngine {
    analysis: ListenerAnalysis,
    logger: Option<Logger>,
    metrics: Option<MetricsHandle>,
    audit: Arc<dyn RefreshAudit>,
}

impl RefreshEngine {
    pub fn new(analysis: ListenerAnalysis) -> Self {
        Self {
            analysis,
            logger: None,
            metrics: None,
            audit: Arc::new(NullRefreshAudit),
        }
    }

    pub fn with_logger(mut self, logger: Option<Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_metrics(mut self, metrics: Option<MetricsHandle>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn RefreshAudit>) -> Self {
        self.audit = audit;
        self
    }

    pub fn analysis(&self) -> &ListenerAnalysis {
        &self.analysis
    }

    /// One reconciliation pass: update bindings, classify state changes,
    /// dispatch lifecycle events in document order, reconcile focus, commit.
    ///
    /// A handler failure abandons that control's remaining events, lets the
    /// other controls proceed, then fails the pass without committing.
    pub fn refresh(
        &self,
        controls: &mut Controls,
        builder: &TreeBuilder<'_>,
        handler: &mut dyn EventHandler,
    ) -> Result<RefreshOutcome> {
        if controls.in_refresh {
            if let Some(logger) = &self.logger {
                let _ = logger.log(LogLevel::Debug, TARGET, "nested refresh ignored");
            }
            self.audit
                .record(RefreshAuditEventBuilder::new(RefreshAuditStage::NestedRefreshIgnored).finish());
            return Ok(RefreshOutcome::default());
        }
        if controls.phase == RefreshPhase::Clean {
            return Ok(RefreshOutcome::default());
        }
        if controls.current().is_none_or(ControlTree::is_empty) {
            controls.phase = RefreshPhase::Clean;
            return Ok(RefreshOutcome::default());
        }

        controls.in_refresh = true;
        let result = self.run(controls, builder, handler);
        controls.in_refresh = false;
        result
    }

    fn run(
        &self,
        controls: &mut Controls,
        builder: &TreeBuilder<'_>,
        handler: &mut dyn EventHandler,
    ) -> Result<RefreshOutcome> {
        let mut op = self.logger.as_ref().map(|l| l.operation(TARGET, "refresh"));
        self.audit
            .record(RefreshAuditEventBuilder::new(RefreshAuditStage::PassStarted).finish());

        let was_forked = controls.is_forked();
        let Some((tree, focus, phase)) = controls.split_mut() else {
            return Ok(RefreshOutcome::default());
        };
        if !was_forked {
            self.audit
                .record(RefreshAuditEventBuilder::new(RefreshAuditStage::TreeForked).finish());
        }

        let update = builder.update_bindings(tree)?;
        *phase = RefreshPhase::RefreshPending;
        let mut outcome = RefreshOutcome {
            ran: true,
            visited: update.visited,
            evaluated: update.evaluated,
            optimized: update.optimized,
            ..RefreshOutcome::default()
        };
        self.audit.record(
            RefreshAuditEventBuilder::new(RefreshAuditStage::BindingsUpdated)
                .detail("visited", update.visited)
                .detail("evaluated", update.evaluated)
                .detail("optimized", update.optimized)
                .detail("created", update.created)
                .detail("removed", update.removed.len())
                .finish(),
        );
        with_metrics(self.metrics.as_ref(), |m| {
            m.record_refresh(update.visited, update.evaluated, update.optimized)
        });
        if let Some(op) = op.as_mut() {
            op.record("visited", update.visited)
                .record("evaluated", update.evaluated)
                .record("optimized", update.optimized);
        }

        if !self.analysis.has_refresh_listeners() {
            focus.reconcile(tree);
            tree.commit_all();
            *phase = RefreshPhase::Clean;
            outcome.dispatch_skipped = true;
            with_metrics(self.metrics.as_ref(), |m| m.record_dispatch_skipped());
            self.audit
                .record(RefreshAuditEventBuilder::new(RefreshAuditStage::DispatchSkipped).finish());
            self.audit
                .record(RefreshAuditEventBuilder::new(RefreshAuditStage::Committed).finish());
            return Ok(outcome);
        }

        let mut plan: Vec<Vec<LifecycleEvent>> = Vec::new();
        for removed in update.removed.iter().filter(|c| *c.state.relevant.committed()) {
            plan.push(vec![LifecycleEvent::new(
                removed.id().clone(),
                EventKind::Disabled,
            )]);
        }
        if self.analysis.has_listener(EventKind::BindingError) {
            for failure in &update.failures {
                plan.push(vec![
                    LifecycleEvent::new(failure.control.clone(), EventKind::BindingError)
                        .with_detail(failure.message.clone()),
                ]);
            }
        }
        let root = tree.root();
        for (_, slot, control) in tree.iter() {
            if Some(slot) == root {
                continue;
            }
            let kinds = classify(control, &self.analysis);
            if !kinds.is_empty() {
                plan.push(
                    kinds
                        .into_iter()
                        .map(|kind| LifecycleEvent::new(control.id().clone(), kind))
                        .collect(),
                );
            }
        }
        if let FocusCheck::Lost(id) = focus.reconcile(tree) {
            plan.push(vec![LifecycleEvent::new(id, EventKind::FocusOut)]);
        }

        let failures = self.deliver(plan, handler, &mut outcome);
        with_metrics(self.metrics.as_ref(), |m| m.record_dispatch(outcome.events.len()));
        if let Some(op) = op.as_mut() {
            op.record("events", outcome.events.len());
        }
        if !failures.is_empty() {
            self.audit.record(
                RefreshAuditEventBuilder::new(RefreshAuditStage::PassAborted)
                    .detail("failures", failures.len())
                    .finish(),
            );
            emit(
                self.logger.as_ref(),
                LogLevel::Error,
                TARGET,
                "refresh aborted",
                [json_kv("failures", failures.len())],
            );
            return Err(EngineError::Reconciliation { failures });
        }
        self.audit.record(
            RefreshAuditEventBuilder::new(RefreshAuditStage::EventsDispatched)
                .detail("events", outcome.events.len())
                .finish(),
        );

        tree.commit_all();
        *phase = RefreshPhase::Clean;
        self.audit
            .record(RefreshAuditEventBuilder::new(RefreshAuditStage::Committed).finish());
        Ok(outcome)
    }

    /// Deliver events raised directly by a stimulus, outside a refresh pass.
    pub fn dispatch(
        &self,
        events: Vec<LifecycleEvent>,
        handler: &mut dyn EventHandler,
    ) -> Result<Vec<Instruction>> {
        let mut outcome = RefreshOutcome::default();
        let plan = events.into_iter().map(|e| vec![e]).collect();
        let failures = self.deliver(plan, handler, &mut outcome);
        with_metrics(self.metrics.as_ref(), |m| m.record_dispatch(outcome.events.len()));
        if failures.is_empty() {
            Ok(outcome.instructions)
        } else {
            Err(EngineError::Reconciliation { failures })
        }
    }

    fn deliver(
        &self,
        plan: Vec<Vec<LifecycleEvent>>,
        handler: &mut dyn EventHandler,
        outcome: &mut RefreshOutcome,
    ) -> Vec<DispatchFailure> {
        let mut failures = Vec::new();
        for group in plan {
            for event in group {
                let result = handler.handle(&event);
                outcome.events.push(event.clone());
                match result {
                    Ok(instructions) => outcome.instructions.extend(instructions),
                    Err(err) => {
                        emit(
                            self.logger.as_ref(),
                            LogLevel::Warn,
                            TARGET,
                            "handler failed",
                            [
                                json_str("control", event.target.to_string()),
                                json_str("event", event.kind.name()),
                                json_str("error", err.0.clone()),
                            ],
                        );
                        failures.push(DispatchFailure {
                            target: event.target.to_string(),
                            event: event.kind,
                            message: err.0,
                        });
                        break;
                    }
                }
            }
        }
        failures
    }
}

/// Events a control needs given its committed and current state.
pub fn classify(control: &ControlInstance, analysis: &ListenerAnalysis) -> Vec<EventKind> {
    let state = &control.state;
    let mut kinds = Vec::new();
    match (*state.relevant.committed(), *state.relevant.current()) {
        (false, true) => {
            kinds.push(EventKind::Enabled);
            if *state.required.current() {
                kinds.push(EventKind::Required);
            }
            if *state.readonly.current() {
                kinds.push(EventKind::Readonly);
            }
            if !*state.valid.current() {
                kinds.push(EventKind::Invalid);
            }
        }
        (true, false) => kinds.push(EventKind::Disabled),
        (true, true) => {
            let mut gated = |kind: EventKind| {
                if analysis.has_listener(kind) {
                    kinds.push(kind);
                }
            };
            if state.value.changed() && control.holds_value() {
                gated(EventKind::ValueChanged);
            }
            if control.iteration_position().is_some()
                && control.trailing_moved()
                && analysis.has_listener_for(control.static_id(), EventKind::IterationMoved)
            {
                gated(EventKind::IterationMoved);
            }
            if state.valid.changed() {
                gated(toggle(*state.valid.current(), EventKind::Valid, EventKind::Invalid));
            }
            if state.required.changed() {
                gated(toggle(
                    *state.required.current(),
                    EventKind::Required,
                    EventKind::Optional,
                ));
            }
            if state.readonly.changed() {
                gated(toggle(
                    *state.readonly.current(),
                    EventKind::Readonly,
                    EventKind::Readwrite,
                ));
            }
        }
        (false, false) => {}
    }
    kinds
}

fn toggle(on: bool, when_on: EventKind, when_off: EventKind) -> EventKind {
    if on { when_on } else { when_off }
}
