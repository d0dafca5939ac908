//! Server-held control trees for declarative forms.
//!
//! A form definition is materialized into a tree of control instances bound
//! to an XML-like data model. Each client exchange applies stimuli to the
//! data, reconciles the tree through a refresh pass that raises lifecycle
//! events, and answers with a change-set. Documents survive between
//! exchanges in an object pool keyed by state tokens, and can always be
//! rebuilt from serialized state held inline or in a session store.
//!
//! The layering follows the data flow:
//! `model` → `form` → `control` → `refresh`/`repeat` → `document` →
//! `protocol` → `server`, with `state` providing serialization and caches.

pub mod control;
pub mod document;
pub mod error;
pub mod form;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod protocol;
pub mod refresh;
pub mod repeat;
pub mod server;
pub mod state;

pub use control::{ControlIndex, ControlInstance, ControlKind, ControlTree, EffectiveId};
pub use document::{DocumentEnv, FormDocument, Stimulus};
pub use error::{DispatchFailure, EngineError, Result, StateError};
pub use form::{ControlDef, ControlDefKind, FormDefinition, ListenerAnalysis, ListenerDef};
pub use logging::{LogEvent, LogFields, LogLevel, Logger, LoggingError, LoggingResult};
pub use metrics::{EngineMetrics, MetricSnapshot, MetricsHandle};
pub use model::{BindingEvaluator, DataModel, InstanceDocument, PathEvaluator};
pub use protocol::{ChangeSet, ControlUpdate, RepeatIndexes};
pub use refresh::{
    EventHandler, EventKind, Instruction, LifecycleEvent, NullHandler, RecordingHandler,
    RefreshEngine,
};
pub use repeat::RepeatIndexCoordinator;
pub use server::{EngineConfig, FormServer, Request, Response, StateHandling};
pub use state::{InstanceLoader, MapInstanceLoader, ObjectPool, SessionStateStore, SharedInstanceCache};
