use speckle_codec::{DeserializeError, SerializeError};
use speckle_transport::TransportError;
use speckle_types::ObjectId;

/// Terminal failure of a send or receive.
///
/// Cancellation from any layer surfaces as [`OperationError::Canceled`], and
/// a missing reference found while decoding as
/// [`OperationError::MissingReference`], whatever stage noticed it.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("serialization failed: {0}")]
    Serialization(SerializeError),

    #[error("missing reference {id}{}", referenced_by.map(|p| format!(" (referenced by {p})")).unwrap_or_default())]
    MissingReference {
        id: ObjectId,
        referenced_by: Option<ObjectId>,
    },

    #[error("deserialization failed: {0}")]
    Deserialization(DeserializeError),

    #[error("transport failed: {0}")]
    Transport(TransportError),

    #[error("operation canceled")]
    Canceled,

    #[error("send needs at least one target")]
    NoTargets,

    /// A pipeline task died without reporting an error.
    #[error("worker failed: {0}")]
    Worker(String),
}

impl OperationError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

impl From<SerializeError> for OperationError {
    fn from(e: SerializeError) -> Self {
        match e {
            SerializeError::Canceled => Self::Canceled,
            other => Self::Serialization(other),
        }
    }
}

impl From<DeserializeError> for OperationError {
    fn from(e: DeserializeError) -> Self {
        match e {
            DeserializeError::Canceled => Self::Canceled,
            DeserializeError::MissingReference { id, referenced_by } => Self::MissingReference { id, referenced_by },
            other => Self::Deserialization(other),
        }
    }
}

impl From<TransportError> for OperationError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Canceled => Self::Canceled,
            other => Self::Transport(other),
        }
    }
}

impl From<tokio::task::JoinError> for OperationError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Worker(e.to_string())
    }
}

/// Result alias for pipeline operations.
pub type OperationResult<T> = Result<T, OperationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_unified() {
        assert!(OperationError::from(SerializeError::Canceled).is_canceled());
        assert!(OperationError::from(DeserializeError::Canceled).is_canceled());
        assert!(OperationError::from(TransportError::Canceled).is_canceled());
    }

    #[test]
    fn missing_references_are_lifted() {
        let id = ObjectId::from_bytes([1; 16]);
        let err = OperationError::from(DeserializeError::MissingReference {
            id,
            referenced_by: None,
        });
        assert!(matches!(err, OperationError::MissingReference { id: got, .. } if got == id));
        assert_eq!(err.to_string(), format!("missing reference {id}"));
    }

    #[test]
    fn transport_context_is_kept() {
        let err = OperationError::from(TransportError::database("sqlite", "locked"));
        assert_eq!(err.to_string(), "transport failed: sqlite: database error: locked");
    }
}
