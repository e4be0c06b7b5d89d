use thiserror::Error;

use super::types::{CollectionId, EntityId, RecordRef};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Scope id '{0}' is already in use")]
    DuplicateScopeId(String),

    #[error("Scope id is required")]
    MissingScopeId,

    #[error("Type '{type_name}' is already scoped by '{scope}' and cannot be scoped again")]
    AlreadyScoped { type_name: String, scope: String },

    #[error("Type '{0}' is not registered")]
    UnknownType(String),

    #[error("Type '{0}' is already registered")]
    DuplicateType(String),

    #[error("Scope '{0}' does not exist")]
    UnknownScope(String),

    #[error("Type '{type_name}' has no field or relation '{key}'")]
    UnknownKey { type_name: String, key: String },

    #[error("Shallow copy is not supported, use deep_clone")]
    ShallowCopyUnsupported,

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("Cannot process '{type_name}.{key}': {reason}")]
    ItemProcess {
        type_name: String,
        key: String,
        reason: String,
    },

    #[error("Cannot merge '{type_name}' items: they disagree on '{key}'")]
    MergeItemsNotTheSame { type_name: String, key: String },

    #[error("'{type_name}' item {item} matches several items to merge with")]
    MergeMultipleItemsMatch { type_name: String, item: EntityId },

    #[error("Entity {0} not found")]
    EntityNotFound(EntityId),

    #[error("Collection {0} not found")]
    CollectionNotFound(CollectionId),

    #[error("Model '{0}' not found")]
    ModelNotFound(String),

    #[error("Model '{0}' already exists")]
    ModelExists(String),

    #[error("Record {0} not found")]
    RecordNotFound(RecordRef),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl EngineError {
    pub(crate) fn unknown_key(type_name: &str, key: &str) -> Self {
        Self::UnknownKey {
            type_name: type_name.to_string(),
            key: key.to_string(),
        }
    }

    pub(crate) fn mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
