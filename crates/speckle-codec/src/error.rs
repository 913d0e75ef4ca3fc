use speckle_hash::HasherError;
use speckle_types::ObjectId;
use thiserror::Error;

/// Errors raised while turning a Base graph into fragments.
///
/// Any of these aborts the whole serialization; fragments already handed to
/// a sink must not be treated as a valid partial result.
#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("cannot serialize {kind} at {path}: {reason}")]
    UnsupportedValue {
        path: String,
        kind: String,
        reason: String,
    },

    #[error("reference cycle through {speckle_type} at {path}")]
    Cycle { speckle_type: String, path: String },

    #[error("chunk size of {field} must be positive")]
    InvalidChunkSize { field: String },

    #[error("blob at {path}: {reason}")]
    Blob { path: String, reason: String },

    #[error("blob hashing failed: {0}")]
    BlobHash(#[from] HasherError),

    #[error("fragment sink failed: {0}")]
    Sink(String),

    #[error("serialization canceled")]
    Canceled,
}

/// Result alias for serialization.
pub type SerializeResult<T> = Result<T, SerializeError>;

/// Errors raised while rebuilding a Base graph from fragments.
#[derive(Debug, Error)]
pub enum DeserializeError {
    #[error("malformed JSON in {}: {reason}", fragment_label(.id))]
    MalformedJson { id: Option<ObjectId>, reason: String },

    #[error("{} is not a JSON object", fragment_label(.id))]
    NotAnObject { id: Option<ObjectId> },

    #[error("invalid object id {0:?}")]
    InvalidId(String),

    #[error("type mismatch on {field} in {}: expected {expected}, got {actual}", fragment_label(.id))]
    TypeMismatch {
        id: Option<ObjectId>,
        field: String,
        expected: String,
        actual: String,
    },

    #[error("missing reference {id} (referenced by {})", fragment_label(.referenced_by))]
    MissingReference {
        id: ObjectId,
        referenced_by: Option<ObjectId>,
    },

    #[error("unresolvable dependencies among {} fragments", .ids.len())]
    UnresolvableDependencies { ids: Vec<ObjectId> },

    #[error("fragment fetch failed: {0}")]
    Fetch(String),

    #[error("deserialization canceled")]
    Canceled,
}

impl DeserializeError {
    pub fn is_missing_reference(&self) -> bool {
        matches!(self, DeserializeError::MissingReference { .. })
    }
}

fn fragment_label(id: &Option<ObjectId>) -> String {
    match id {
        Some(id) => format!("fragment {id}"),
        None => "document".to_string(),
    }
}

/// Result alias for deserialization.
pub type DeserializeResult<T> = Result<T, DeserializeError>;
