pub mod choice_selector;
pub mod retention_group;
pub mod snapshot;

pub use choice_selector::ChoiceSelector;
pub use retention_group::RetentionGroup;
pub use snapshot::Snapshot;
