//! Error types for kwgroup.

use thiserror::Error;

/// Result type alias using kwgroup's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for kwgroup operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Uploaded file could not be parsed (bad header, unreadable encoding).
    /// Not retryable: a human has to re-upload.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Request rejected before any state was mutated
    #[error("Validation error: {0}")]
    Validation(String),

    /// Project is locked by an in-flight ingestion
    #[error("Conflict: {0}")]
    LockConflict(String),

    /// Blob store operation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Job queue error
    #[error("Job error: {0}")]
    Job(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failure is a transient infrastructure problem.
    ///
    /// Transient failures leave an ingestion job `running` so the next
    /// recovery sweep requeues it; everything else fails the job outright.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Database(_) | Error::Io(_) | Error::Storage(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_parse() {
        let err = Error::Parse("missing keyword column".to_string());
        assert_eq!(err.to_string(), "Parse error: missing keyword column");
    }

    #[test]
    fn test_error_display_validation() {
        let err = Error::Validation("empty selection".to_string());
        assert_eq!(err.to_string(), "Validation error: empty selection");
    }

    #[test]
    fn test_error_display_lock_conflict() {
        let err = Error::LockConflict("project is processing".to_string());
        assert_eq!(err.to_string(), "Conflict: project is processing");
    }

    #[test]
    fn test_transient_classification() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow disk");
        assert!(Error::Io(io_err).is_transient());
        assert!(Error::Storage("bucket unavailable".into()).is_transient());
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_transient());

        assert!(!Error::Parse("bad header".into()).is_transient());
        assert!(!Error::Validation("cyclic merge".into()).is_transient());
        assert!(!Error::NotFound("blob".into()).is_transient());
        assert!(!Error::LockConflict("locked".into()).is_transient());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(err.to_string().contains("Serialization error:"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
