use thiserror::Error;

/// Invariant violations raised while constructing or decoding model types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("Group {group_id} cannot depend on itself")]
    SelfDependency { group_id: String },

    #[error("Group {group_id} lists dependency {dependency} more than once")]
    DuplicateDependency { group_id: String, dependency: String },

    #[error("Group {group_id} has an empty dependency entry")]
    BlankDependency { group_id: String },

    #[error("Group {group_id} has invalid {field} {value} (must be >= 1)")]
    NonPositive {
        group_id: String,
        field: &'static str,
        value: u32,
    },

    #[error("Group id must not be empty")]
    BlankGroupId,

    #[error("Duplicate group id detected: {0}")]
    DuplicateGroup(String),
}
