//! Domain-specific error types following panic-free policy.

use crate::SessionId;
use thiserror::Error;

/// Errors that can occur in session and registry operations.
#[derive(Error, Debug, Clone)]
pub enum DomainError {
    /// A session with this id already exists.
    #[error("session already exists: {session_id}")]
    DuplicateId { session_id: SessionId },

    /// The requested session was not found.
    #[error("session not found: {session_id}")]
    NotFound { session_id: SessionId },

    /// The session subprocess could not be started.
    #[error("failed to spawn session process: {reason}")]
    SpawnFailure { reason: String },

    /// The renderer helper did not answer a view request in time.
    #[error("timed out waiting for view of session {session_id} after {timeout_ms} ms")]
    ViewTimeout {
        session_id: SessionId,
        timeout_ms: u64,
    },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DomainError::DuplicateId {
            session_id: SessionId::new("build"),
        };
        assert_eq!(err.to_string(), "session already exists: build");

        let err = DomainError::NotFound {
            session_id: SessionId::new("ghost"),
        };
        assert_eq!(err.to_string(), "session not found: ghost");

        let err = DomainError::SpawnFailure {
            reason: "No such file or directory".to_string(),
        };
        assert!(err.to_string().contains("No such file or directory"));

        let err = DomainError::ViewTimeout {
            session_id: SessionId::new("render-1"),
            timeout_ms: 5000,
        };
        assert_eq!(
            err.to_string(),
            "timed out waiting for view of session render-1 after 5000 ms"
        );
    }
}
