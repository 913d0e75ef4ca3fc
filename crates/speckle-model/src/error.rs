use thiserror::Error;

/// Errors produced by the object model.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("invalid property name {name:?}: {reason}")]
    InvalidPropertyName { name: String, reason: String },

    #[error("property name {0:?} is reserved")]
    ReservedName(String),

    #[error("type mismatch on {field}: expected {expected}, got {actual}")]
    TypeMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("field {field} declared twice on {speckle_type}")]
    DuplicateField { speckle_type: String, field: String },

    #[error("chunk size of {field} must be positive")]
    InvalidChunkSize { field: String },

    #[error("invalid type name {0:?}")]
    InvalidTypeName(String),
}

/// Result alias for object model operations.
pub type ModelResult<T> = Result<T, ModelError>;
