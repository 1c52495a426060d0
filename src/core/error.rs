//! Error types for the access layer
//!
//! This module defines all error types that can occur during provider
//! resolution, connection lifecycle, command execution, batch runs and
//! meta store operations.

use crate::core::provider::TransactionMode;

/// Result type alias for access-layer operations
pub type Result<T> = std::result::Result<T, DbError>;

/// Error types for access-layer operations
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// No provider registered under the requested name
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// A provider is already registered under this name
    #[error("provider already registered: {0}")]
    DuplicateProvider(String),

    /// Session establishment failed (auth, network or configuration)
    #[error("connection error: {reason}")]
    ConnectionError {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The connection this operation was issued against has been closed
    #[error("connection is closed")]
    ConnectionClosed,

    /// A backend failure, surfaced verbatim (provider code + message)
    #[error("execution error [{code}]: {message}")]
    ExecutionError { code: String, message: String },

    /// A command exceeded its timeout
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The provider does not support the requested transaction mode
    #[error("transaction mode {mode} not supported by provider {provider}")]
    UnsupportedMode {
        provider: String,
        mode: TransactionMode,
    },

    /// The command is not bound to any connection
    #[error("command is not bound to a connection")]
    NoConnection,

    /// Command text references a parameter that was never registered
    #[error("parameter `{name}` referenced in command text but not registered")]
    ParameterMismatch { name: String },

    /// Malformed batch script
    #[error("parse error at line {line}: {detail}")]
    ParseError { line: usize, detail: String },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A batch is already running against this connection
    #[error("a batch is already running on this connection")]
    AlreadyRunning,

    /// A batch command failed; the index names the failing command
    #[error("batch command {index} failed: {source}")]
    BatchFailed {
        index: usize,
        #[source]
        source: Box<DbError>,
    },

    /// Meta store query targets a table outside the catalog vocabulary
    #[error("unknown cache table: {0}")]
    UnknownCacheTable(String),

    /// Runtime plumbing failure that the taxonomy cannot classify
    #[error("internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// Create a connection error without an underlying source
    pub fn connection<S: Into<String>>(reason: S) -> Self {
        DbError::ConnectionError {
            reason: reason.into(),
            source: None,
        }
    }

    /// Create a connection error wrapping a backend error
    pub fn connection_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        DbError::ConnectionError {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Create an execution error with a provider code and message
    pub fn execution(code: impl Into<String>, message: impl Into<String>) -> Self {
        DbError::ExecutionError {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        DbError::Timeout { timeout_ms }
    }

    /// Create a parameter mismatch error
    pub fn parameter_mismatch(name: impl Into<String>) -> Self {
        DbError::ParameterMismatch { name: name.into() }
    }

    /// Create a parse error
    pub fn parse(line: usize, detail: impl Into<String>) -> Self {
        DbError::ParseError {
            line,
            detail: detail.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        DbError::Internal(msg.into())
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(code, message) => DbError::ExecutionError {
                code: code.extended_code.to_string(),
                message: message.unwrap_or_else(|| code.to_string()),
            },
            other => DbError::ExecutionError {
                code: "-1".to_string(),
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = DbError::connection("refused");
        assert!(matches!(err, DbError::ConnectionError { .. }));

        let err = DbError::execution("1", "syntax error");
        assert!(matches!(err, DbError::ExecutionError { .. }));

        let err = DbError::parameter_mismatch("name");
        assert!(matches!(err, DbError::ParameterMismatch { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = DbError::connection("refused");
        assert_eq!(err.to_string(), "connection error: refused");

        let err = DbError::execution("1", "no such table: user");
        assert_eq!(err.to_string(), "execution error [1]: no such table: user");

        let err = DbError::parse(3, "unterminated string literal");
        assert_eq!(
            err.to_string(),
            "parse error at line 3: unterminated string literal"
        );

        let err = DbError::UnknownCacheTable("_views".to_string());
        assert_eq!(err.to_string(), "unknown cache table: _views");
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let err: DbError = rusqlite::Error::InvalidQuery.into();
        match err {
            DbError::ExecutionError { code, .. } => assert_eq!(code, "-1"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
