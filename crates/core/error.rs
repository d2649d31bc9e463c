//! Error types for the drover job framework.

use thiserror::Error;

/// The main error type for drover.
///
/// Failures raised by a job while it runs are not represented here; they are
/// recorded on the job's status (see [`JobError`](crate::JobError)).
#[derive(Error, Debug)]
pub enum DroverError {
    /// The caller's cancellation token fired before the operation finished.
    #[error("operation cancelled")]
    Cancelled,

    /// A job with this id is already stored and overwriting is disabled.
    #[error("duplicate job: {0}")]
    DuplicateJob(String),

    /// The operation is not valid in the current lifecycle state.
    #[error("invalid state: {0}")]
    State(String),

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Dependency manager error (for example a duplicate edge).
    #[error("dependency error: {0}")]
    Dependency(String),

    /// A scope token is held by another job.
    #[error("scope error: {0}")]
    Scope(String),

    /// The retry handler refused a job.
    #[error("retry handler error: {0}")]
    RetryHandler(String),

    /// Unknown or inconsistent registry type.
    #[error("registry error: {0}")]
    Registry(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DroverError {
    /// Returns true for errors caused by caller-initiated cancellation.
    ///
    /// These are expected during shutdown and should not be logged as failures.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Result type alias using DroverError.
pub type Result<T> = std::result::Result<T, DroverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_duplicate() {
        let err = DroverError::DuplicateJob("build-1".to_string());
        assert_eq!(format!("{}", err), "duplicate job: build-1");
    }

    #[test]
    fn test_error_display_state() {
        let err = DroverError::State("cannot set runner on active queue".to_string());
        assert_eq!(
            format!("{}", err),
            "invalid state: cannot set runner on active queue"
        );
    }

    #[test]
    fn test_error_display_scope() {
        let err = DroverError::Scope("token 'db' held by job-2".to_string());
        assert_eq!(format!("{}", err), "scope error: token 'db' held by job-2");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err: serde_json::Error = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: DroverError = json_err.into();
        assert!(matches!(err, DroverError::Serialization(_)));
        assert!(format!("{}", err).starts_with("serialization error:"));
    }

    #[test]
    fn test_is_cancelled() {
        assert!(DroverError::Cancelled.is_cancelled());
        assert!(!DroverError::JobNotFound("x".to_string()).is_cancelled());
    }
}
