//! Shared error type
//!
//! Each crate defines its own error enum; this is the common type they bridge
//! into at the orchestration layer.

use thiserror::Error;

/// Top-level error for the CPQ engine
#[derive(Error, Debug)]
pub enum Error {
    /// Graph database unreachable after retries
    #[error("Graph unavailable: {0}")]
    GraphUnavailable(String),

    /// A graph query returned a shape violating schema invariants
    #[error("Graph schema violation: {0}")]
    GraphSchema(String),

    /// Intent extraction failed (non-fatal at the pipeline level)
    #[error("Scribe failure: {0}")]
    Scribe(String),

    /// Malformed tenant configuration (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session persistence failure
    #[error("Session error: {0}")]
    Session(String),

    /// Concurrent turn on the same session exceeded the lock wait threshold
    #[error("Session lock conflict for {session_id}")]
    SessionLockConflict { session_id: String },

    /// Gate condition referenced a parameter with an incompatible type
    #[error("Constraint evaluation error: {0}")]
    ConstraintEvaluation(String),

    #[error("{0}")]
    Other(String),
}

/// Convenience result alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a retry at the request level could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::GraphUnavailable(_) | Error::SessionLockConflict { .. }
        )
    }
}
