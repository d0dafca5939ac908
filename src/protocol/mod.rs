//! The change-set sent back to the client after each exchange.

mod changes;

pub use changes::{
    CaseToggle, ChangeSet, ControlUpdate, IndexDelta, ItemsetUpdate, LoadRequest, Message,
    RepeatIndexes, RepeatSize, diff,
};
