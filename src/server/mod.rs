//! Request handling: turns client exchanges into document updates and
//! change-sets, with state kept inline or in the session store.

mod config;
mod core;

pub use config::{EngineConfig, StateHandling};
pub use self::core::{FormServer, Request, Response};
