mod build;
mod index;
mod instance;
mod tree;

pub use build::{BindingFailure, BindingUpdate, ControlsState, TreeBuilder};
pub use index::{ControlIndex, ControlSlot};
pub use instance::{
    Binding, ContainerFlavor, ControlInstance, ControlKind, ControlState, EffectiveId,
    EvaluatedState, ITERATION_SEPARATOR, IndexedKind, Item, ParseEffectiveIdError, RepeatState,
    Tracked, UploadInfo, ValueFlavor, clamp_index,
};
pub use tree::{ControlTree, PreOrder};
