//! Static form definitions and their one-time analysis.

mod analysis;
mod definition;

pub use analysis::{ListenerAnalysis, StaticIndex};
pub use definition::{
    ControlDef, ControlDefKind, FormDefinition, InstanceDef, InstanceSource, ListenerDef,
    SelectAppearance,
};
