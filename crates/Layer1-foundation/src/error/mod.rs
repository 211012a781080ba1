//! Error types for devyard
//!
//! One variant per failure class. Request handlers return `Validation`,
//! `Conflict` and `NotFound` directly; `Process` and `Connection` errors raised
//! inside background work are recorded into the owning ring log instead of
//! being returned to whoever started the work. `Persistence` errors are logged
//! and swallowed by the snapshot writer.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// devyard error type
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Request errors
    // ========================================================================
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // ========================================================================
    // Background work
    // ========================================================================
    #[error("Process error: {0}")]
    Process(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    // ========================================================================
    // Storage / config
    // ========================================================================
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // Conversions
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the same call can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Timeout(_))
    }

    /// Whether the error describes a bad request rather than a server fault
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::Conflict(_) | Error::NotFound(_)
        )
    }

    pub fn process(message: impl Into<String>) -> Self {
        Error::Process(message.into())
    }

    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        Error::NotFound(format!("{} {}", what, id))
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::Connection("refused".into()).is_retryable());
        assert!(!Error::Validation("bad".into()).is_retryable());
        assert!(Error::not_found("agent", "a-1").is_user_facing());
        assert!(!Error::process("exit 1").is_user_facing());
    }

    #[test]
    fn test_display() {
        let err = Error::not_found("session", "s-1");
        assert_eq!(err.to_string(), "Not found: session s-1");
    }
}
