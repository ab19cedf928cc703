//! Error types for the MySQL gateway.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! The variants follow the failure classes callers have to react to differently:
//! retry the whole transaction, fall back to a full rollback, fix the SQL, or
//! give up on the connection.

use crate::db::driver::{DriverError, codes};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Bad SQL. Never retried.
    #[error("SQL error: {message}: {query}")]
    Syntax { message: String, query: String },

    /// The server connection dropped while state was bound to it.
    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    #[error("Unsupported feature: {feature}")]
    UnsupportedFeature { feature: String },

    /// The surrounding transaction must be retried as a whole.
    #[error("Transaction conflict: {message}")]
    Conflict { message: String },

    /// Savepoints cannot be used here; roll back the whole transaction instead.
    #[error("Not available: {reason}")]
    NotAvailable { reason: String },

    #[error("Multiple select schema are not allowed")]
    IncompatibleSchemas,

    #[error("Database error {code}: {message}")]
    Database { code: u16, message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Create a syntax error carrying the offending query text.
    pub fn syntax(message: impl Into<String>, query: impl Into<String>) -> Self {
        Self::Syntax {
            message: message.into(),
            query: query.into(),
        }
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLost {
            message: message.into(),
        }
    }

    pub fn unsupported(feature: impl Into<String>) -> Self {
        Self::UnsupportedFeature {
            feature: feature.into(),
        }
    }

    /// Create a conflict error (the caller should retry the transaction).
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn not_available(reason: impl Into<String>) -> Self {
        Self::NotAvailable {
            reason: reason.into(),
        }
    }

    pub fn database(code: u16, message: impl Into<String>) -> Self {
        Self::Database {
            code,
            message: message.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Conflict { .. } => Some("Retry the whole transaction"),
            Self::NotAvailable { .. } => Some("Roll back the whole transaction instead"),
            _ => None,
        }
    }

    /// Check if retrying the surrounding unit of work may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. } | Self::Conflict { .. })
    }

    /// MySQL error number, when the error came from the server or client library.
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Database { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Default mapping for driver errors that were not classified by the caller.
impl From<DriverError> for GatewayError {
    fn from(err: DriverError) -> Self {
        if err.is_connection_loss() {
            GatewayError::connection_lost(err.to_string())
        } else if err.code == codes::ER_BAD_DB_ERROR {
            GatewayError::connection(err.message, "Check that the database name exists")
        } else {
            GatewayError::database(err.code, err.message)
        }
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        DriverError::from(err).into()
    }
}

/// Result type alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::syntax("Unknown column 'x'", "SELECT x FROM t");
        assert_eq!(err.to_string(), "SQL error: Unknown column 'x': SELECT x FROM t");
    }

    #[test]
    fn test_error_retryable() {
        assert!(GatewayError::conflict("begin failed").is_retryable());
        assert!(GatewayError::connection_lost("gone").is_retryable());
        assert!(!GatewayError::syntax("bad", "q").is_retryable());
        assert!(!GatewayError::unsupported("transactions").is_retryable());
    }

    #[test]
    fn test_error_suggestion() {
        let err = GatewayError::connection("refused", "Check the server is running");
        assert_eq!(err.suggestion(), Some("Check the server is running"));
        assert!(GatewayError::IncompatibleSchemas.suggestion().is_none());
    }

    #[test]
    fn test_driver_error_conversion() {
        let lost = DriverError::new(codes::CR_SERVER_LOST, "Lost connection");
        assert!(matches!(
            GatewayError::from(lost),
            GatewayError::ConnectionLost { .. }
        ));

        let other = DriverError::new(1062, "Duplicate entry");
        let err = GatewayError::from(other);
        assert_eq!(err.code(), Some(1062));
    }
}
