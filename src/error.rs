//! Error taxonomy shared by the job pipeline, the stores and the HTTP layer.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Rejected before a job record exists (unknown advisor, unreadable image).
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("unsupported analysis mode: {0}")]
    UnsupportedMode(String),

    #[error("no adapter is indexed for advisor '{0}'")]
    AdapterUnavailable(String),

    #[error("inference timed out after {0:?}")]
    Timeout(Duration),

    #[error("inference engine unreachable: {0}")]
    Unreachable(String),

    /// The engine answered, but with an error status or an undecodable envelope.
    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("malformed analysis result: {0}")]
    MalformedResult(String),

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },

    #[error("job {0} has no analysis yet")]
    NotReady(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Transient failures park the job back in `queued` until retries run out.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Unreachable(_))
    }

    /// Short machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::NotFound(_) => "not_found",
            Error::UnsupportedMode(_) => "unsupported_mode",
            Error::AdapterUnavailable(_) => "adapter_unavailable",
            Error::Timeout(_) => "timeout",
            Error::Unreachable(_) => "unreachable",
            Error::InferenceFailed(_) => "inference_failed",
            Error::MalformedResult(_) => "malformed_result",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::NotReady(_) => "not_ready",
            Error::Embedding(_) => "embedding_error",
            Error::Database(_) => "database_error",
            Error::Serialization(_) => "serialization_error",
            Error::Io(_) => "io_error",
            Error::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Timeout(Duration::from_secs(120)).is_transient());
        assert!(Error::Unreachable("connection refused".into()).is_transient());
        assert!(!Error::MalformedResult("no json".into()).is_transient());
        assert!(!Error::AdapterUnavailable("adams".into()).is_transient());
        assert!(!Error::InferenceFailed("500".into()).is_transient());
    }

    #[test]
    fn test_messages_are_human_readable() {
        let err = Error::AdapterUnavailable("adams".into());
        assert_eq!(err.to_string(), "no adapter is indexed for advisor 'adams'");
        assert_eq!(err.code(), "adapter_unavailable");
    }
}
