// mlbreaker: Error types

use thiserror::Error;

/// Result type for learning-stack and collaborator operations
pub type MlResult<T> = Result<T, MlError>;

/// Errors raised inside the learning stack and optional collaborators.
///
/// These never reach the caller of `execute`: every ML step is wrapped so a
/// failing step is skipped, logged, and the previous state stands.
#[derive(Debug, Error)]
pub enum MlError {
    #[error("Feature error: {0}")]
    Feature(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Model serialization error: {0}")]
    Serialization(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Error surfaced to the caller of `execute`
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// Admission was denied. The operation was not invoked and no metric
    /// record was written.
    #[error("Circuit breaker `{name}` is open")]
    CircuitOpen { name: String },

    /// The wrapped operation failed; the cause is carried verbatim and a
    /// failure record was written.
    #[error("Operation failed: {0}")]
    Operation(E),
}

impl<E> BreakerError<E> {
    /// True when the error is the admission gate rather than the operation
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::CircuitOpen { .. })
    }

    /// The operation's own error, if that is what this is
    pub fn into_operation(self) -> Option<E> {
        match self {
            BreakerError::Operation(e) => Some(e),
            BreakerError::CircuitOpen { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_classification() {
        let err: BreakerError<String> = BreakerError::CircuitOpen {
            name: "payments".to_string(),
        };
        assert!(err.is_open());
        assert!(err.into_operation().is_none());
    }

    #[test]
    fn test_operation_error_carries_cause() {
        let err: BreakerError<String> = BreakerError::Operation("boom".to_string());
        assert!(!err.is_open());
        assert_eq!(err.into_operation().as_deref(), Some("boom"));
    }
}
