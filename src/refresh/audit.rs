//! Refresh lifecycle audit hooks.
//!
//! Records capture a stage plus structured details so callers can log,
//! buffer or assert on how a reconciliation pass progressed without
//! touching the pass itself.

use std::sync::Mutex;
use std::time::SystemTime;

use serde_json::Value;

/// Checkpoints emitted by the refresh engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshAuditStage {
    /// A pass started with dirty bindings.
    PassStarted,
    /// A refresh was requested while another was running.
    NestedRefreshIgnored,
    /// The initial tree was copied before the first mutation.
    TreeForked,
    BindingsUpdated,
    /// Lifecycle events were delivered to handlers.
    EventsDispatched,
    /// No handler listens for refresh events; dispatch was skipped.
    DispatchSkipped,
    /// Current state became the committed baseline.
    Committed,
    /// A handler failed; nothing was committed.
    PassAborted,
}

#[derive(Debug, Clone)]
pub struct RefreshAuditEvent {
    pub timestamp: SystemTime,
    pub stage: RefreshAuditStage,
    pub details: Vec<(String, Value)>,
}

impl RefreshAuditEvent {
    fn new(stage: RefreshAuditStage) -> Self {
        Self {
            timestamp: SystemTime::now(),
            stage,
            details: Vec::new(),
        }
    }

    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

pub struct RefreshAuditEventBuilder {
    event: RefreshAuditEvent,
}

impl RefreshAuditEventBuilder {
    pub fn new(stage: RefreshAuditStage) -> Self {
        Self {
            event: RefreshAuditEvent::new(stage),
        }
    }

    pub fn detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.event.details.push((key.into(), value.into()));
        self
    }

    pub fn finish(self) -> RefreshAuditEvent {
        self.event
    }
}

pub trait RefreshAudit: Send + Sync {
    fn record(&self, event: RefreshAuditEvent);
}

/// Default sink used when auditing is disabled.
#[derive(Debug, Default)]
pub struct NullRefreshAudit;

impl RefreshAudit for NullRefreshAudit {
    fn record(&self, _event: RefreshAuditEvent) {}
}

/// Buffers records in memory.
#[derive(Debug, Default)]
pub struct RecordingRefreshAudit {
    events: Mutex<Vec<RefreshAuditEvent>>,
}

impl RecordingRefreshAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RefreshAuditEvent> {
        self.events
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn stages(&self) -> Vec<RefreshAuditStage> {
        self.events().into_iter().map(|e| e.stage).collect()
    }
}

impl RefreshAudit for RecordingRefreshAudit {
    fn record(&self, event: RefreshAuditEvent) {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(event);
        }
    }
}
