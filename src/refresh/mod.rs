mod audit;
mod core;
mod events;
mod focus;

pub use audit::{
    NullRefreshAudit, RecordingRefreshAudit, RefreshAudit, RefreshAuditEvent,
    RefreshAuditEventBuilder, RefreshAuditStage,
};
pub use self::core::{Controls, RefreshEngine, RefreshOutcome, RefreshPhase, classify};
pub use events::{
    EventHandler, EventKind, HandlerError, Instruction, LifecycleEvent, MessageLevel,
    NullHandler, RecordingHandler,
};
pub use focus::{FocusCheck, FocusTracker};
