mod core;

pub use self::core::{CollectionChange, IndexChange, RepeatIndexCoordinator, delete_index};
