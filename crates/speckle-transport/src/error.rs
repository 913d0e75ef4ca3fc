/// Errors from a storage tier. Every variant names the backend it came from.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Filesystem failure.
    #[error("{backend}: I/O error: {source}")]
    Io {
        backend: String,
        #[source]
        source: std::io::Error,
    },

    /// SQLite failure, including a failed background write.
    #[error("{backend}: database error: {reason}")]
    Database { backend: String, reason: String },

    /// The request never produced a response (connect, timeout, body).
    #[error("{backend}: request failed: {reason}")]
    Request { backend: String, reason: String },

    /// The server answered with a non-success status.
    #[error("{backend}: {url} returned {status}: {body}")]
    Status {
        backend: String,
        url: String,
        status: u16,
        body: String,
    },

    /// Stored or received data could not be understood.
    #[error("{backend}: corrupt data for {id}: {reason}")]
    Corrupt {
        backend: String,
        id: String,
        reason: String,
    },

    /// The tier has shut down and accepts no more work.
    #[error("{backend}: transport is closed")]
    Closed { backend: String },

    #[error("operation canceled")]
    Canceled,
}

impl TransportError {
    pub fn io(backend: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            backend: backend.into(),
            source,
        }
    }

    pub fn database(backend: impl Into<String>, reason: impl ToString) -> Self {
        Self::Database {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }

    pub fn corrupt(backend: impl Into<String>, id: impl ToString, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            backend: backend.into(),
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same idempotent request could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request { .. } => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// Result alias for storage tier operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_backend() {
        let err = TransportError::database("sqlite", "disk full");
        assert_eq!(err.to_string(), "sqlite: database error: disk full");
        let err = TransportError::Closed {
            backend: "sqlite".into(),
        };
        assert!(err.to_string().starts_with("sqlite:"));
    }

    #[test]
    fn transient_classification() {
        let status = |status| TransportError::Status {
            backend: "server".into(),
            url: "http://x/api".into(),
            status,
            body: String::new(),
        };
        assert!(status(503).is_transient());
        assert!(status(429).is_transient());
        assert!(!status(404).is_transient());
        assert!(!status(401).is_transient());
        assert!(TransportError::Request {
            backend: "server".into(),
            reason: "timeout".into()
        }
        .is_transient());
        assert!(!TransportError::Canceled.is_transient());
    }
}
