mod types;

pub use types::{DispatchFailure, EngineError, Result, StateError};
