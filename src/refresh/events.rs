use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::control::EffectiveId;

/// Lifecycle notifications delivered to event handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Enabled,
    Disabled,
    ValueChanged,
    IterationMoved,
    Valid,
    Invalid,
    Required,
    Optional,
    Readonly,
    Readwrite,
    BindingError,
    FocusIn,
    FocusOut,
    Activate,
    Select,
    Deselect,
    DialogShown,
    DialogHidden,
    SubmitDone,
    SubmitError,
}

impl EventKind {
    /// Kinds produced by a refresh pass rather than directly by a stimulus.
    pub const REFRESH: [EventKind; 11] = [
        EventKind::Enabled,
        EventKind::Disabled,
        EventKind::ValueChanged,
        EventKind::IterationMoved,
        EventKind::Valid,
        EventKind::Invalid,
        EventKind::Required,
        EventKind::Optional,
        EventKind::Readonly,
        EventKind::Readwrite,
        EventKind::BindingError,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EventKind::Enabled => "enabled",
            EventKind::Disabled => "disabled",
            EventKind::ValueChanged => "value-changed",
            EventKind::IterationMoved => "iteration-moved",
            EventKind::Valid => "valid",
            EventKind::Invalid => "invalid",
            EventKind::Required => "required",
            EventKind::Optional => "optional",
            EventKind::Readonly => "readonly",
            EventKind::Readwrite => "readwrite",
            EventKind::BindingError => "binding-error",
            EventKind::FocusIn => "focus-in",
            EventKind::FocusOut => "focus-out",
            EventKind::Activate => "activate",
            EventKind::Select => "select",
            EventKind::Deselect => "deselect",
            EventKind::DialogShown => "dialog-shown",
            EventKind::DialogHidden => "dialog-hidden",
            EventKind::SubmitDone => "submit-done",
            EventKind::SubmitError => "submit-error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub target: EffectiveId,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl LifecycleEvent {
    pub fn new(target: EffectiveId, kind: EventKind) -> Self {
        Self {
            target,
            kind,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

/// Side effects a handler asks the engine to forward to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Instruction {
    Message { level: MessageLevel, text: String },
    Load { resource: String, replace: bool },
    Submit { submission: String },
    SetFocus { control: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// Receives lifecycle events during dispatch.
pub trait EventHandler {
    fn handle(&mut self, event: &LifecycleEvent) -> Result<Vec<Instruction>, HandlerError>;
}

impl<F> EventHandler for F
where
    F: FnMut(&LifecycleEvent) -> Result<Vec<Instruction>, HandlerError>,
{
    fn handle(&mut self, event: &LifecycleEvent) -> Result<Vec<Instruction>, HandlerError> {
        self(event)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullHandler;

impl EventHandler for NullHandler {
    fn handle(&mut self, _event: &LifecycleEvent) -> Result<Vec<Instruction>, HandlerError> {
        Ok(Vec::new())
    }
}

/// Records every event it sees. Can be told to fail on chosen events and to
/// answer chosen kinds with instructions.
#[derive(Debug, Default, Clone)]
pub struct RecordingHandler {
    events: Vec<LifecycleEvent>,
    failing: HashSet<(String, EventKind)>,
    responses: Vec<(EventKind, Instruction)>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(mut self, target: impl Into<String>, kind: EventKind) -> Self {
        self.failing.insert((target.into(), kind));
        self
    }

    pub fn respond(mut self, kind: EventKind, instruction: Instruction) -> Self {
        self.responses.push((kind, instruction));
        self
    }

    pub fn events(&self) -> &[LifecycleEvent] {
        &self.events
    }

    /// `(target, kind)` pairs in dispatch order.
    pub fn summary(&self) -> Vec<(String, EventKind)> {
        self.events
            .iter()
            .map(|e| (e.target.to_string(), e.kind))
            .collect()
    }

    pub fn kinds_for(&self, target: &str) -> Vec<EventKind> {
        self.events
            .iter()
            .filter(|e| e.target.to_string() == target)
            .map(|e| e.kind)
            .collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl EventHandler for RecordingHandler {
    fn handle(&mut self, event: &LifecycleEvent) -> Result<Vec<Instruction>, HandlerError> {
        self.events.push(event.clone());
        if self
            .failing
            .contains(&(event.target.to_string(), event.kind))
        {
            return Err(HandlerError(format!(
                "handler failed on {} for `{}`",
                event.kind.name(),
                event.target
            )));
        }
        Ok(self
            .responses
            .iter()
            .filter(|(kind, _)| *kind == event.kind)
            .map(|(_, instruction)| instruction.clone())
            .collect())
    }
}
