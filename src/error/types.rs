use thiserror::Error;

use crate::model::{DataError, EvalError};
use crate::refresh::EventKind;

/// Unified result type for the formtree crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the reconciliation engine and its request layer.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The form definition cannot be turned into a control tree.
    #[error("malformed form definition: {0}")]
    Structural(String),
    #[error("control `{0}` not found")]
    ControlNotFound(String),
    #[error("stimulus rejected: {0}")]
    InvalidStimulus(String),
    /// One or more event handlers failed during a refresh pass. The pass was
    /// not committed and the owning document must be discarded.
    #[error("refresh aborted after {} handler failure(s)", failures.len())]
    Reconciliation { failures: Vec<DispatchFailure> },
    #[error("data model error: {0}")]
    Data(#[from] DataError),
    #[error("evaluation error: {0}")]
    Evaluation(#[from] EvalError),
    #[error("unable to load instance `{uri}`: {message}")]
    InstanceLoad { uri: String, message: String },
    #[error(transparent)]
    State(#[from] StateError),
}

/// A handler failure captured while dispatching refresh notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchFailure {
    pub target: String,
    pub event: EventKind,
    pub message: String,
}

/// Failures while decoding or locating serialized state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("unable to decode state: {0}")]
    Decode(String),
    #[error("state checksum mismatch")]
    Checksum,
    #[error("state serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("state encoding error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unable to retrieve state for `{0}`; the session may have expired, please reload")]
    Expired(String),
    #[error("inconsistent state tokens: static and dynamic state must use the same mode")]
    InconsistentTokens,
}
