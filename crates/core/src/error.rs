//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// A business rule rejected the operation. Storage failures are reported by the
/// infrastructure layer, never here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A request failed validation (e.g. missing request id, non-positive quantity).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated (e.g. a counter would go negative).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }
}
