//! The pooled unit of work: one form's data model and control tree, driven
//! by client stimuli.

mod core;
mod stimulus;

pub use self::core::{DocumentEnv, FormDocument};
pub use stimulus::Stimulus;
