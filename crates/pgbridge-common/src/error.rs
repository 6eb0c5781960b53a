//! Error types for the pgbridge wire protocol server

use std::fmt;

/// Result type alias using PgWireError
pub type Result<T> = std::result::Result<T, PgWireError>;

/// Main error type for protocol handling
#[derive(Debug, thiserror::Error)]
pub enum PgWireError {
    /// Malformed frame (bad length, truncated packet). Terminates the connection.
    #[error("Invalid frame: {0}")]
    ProtocolFraming(String),

    /// A well-framed message whose payload could not be interpreted
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Authentication rejected; the connection is closed after reporting it
    #[error("{message}")]
    AuthenticationFailure {
        message: String,
        sqlstate: &'static str,
    },

    /// The backend refused to compile a statement
    #[error("Failed to prepare statement: {0}")]
    StatementCompilation(#[source] anyhow::Error),

    /// Bind, Describe or Close named a statement that does not exist
    #[error("No statement found with name: {0}")]
    UnknownStatement(String),

    /// Describe, Execute or Close named a portal that does not exist
    #[error("No portal found with name: {0}")]
    UnknownPortal(String),

    /// Format code outside {0, 1}, or a binary format the type cannot carry
    #[error("Unsupported format code: {0}")]
    UnsupportedFormatCode(i16),

    /// A bound parameter could not be decoded into its declared type
    #[error("Invalid value for parameter ${index}: {reason}")]
    InvalidParameterValue { index: usize, reason: String },

    /// The backend raised while executing or streaming results
    #[error("Execution failed: {0}")]
    ExecutionFailure(#[source] anyhow::Error),

    /// Unrecognised message tag in the steady-state phase
    #[error("Unsupported messageType: {}", char::from(*.0))]
    UnsupportedMessage(u8),

    /// Query was cancelled through a CancelRequest
    #[error("canceling statement due to user request")]
    QueryCancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Socket error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PgWireError {
    /// Authentication failure with the generic authorization SQLSTATE
    pub fn authentication(message: impl fmt::Display) -> Self {
        PgWireError::AuthenticationFailure {
            message: message.to_string(),
            sqlstate: "28000",
        }
    }

    /// Authentication failure caused by a rejected password
    pub fn invalid_password(user: &str) -> Self {
        PgWireError::AuthenticationFailure {
            message: format!("password authentication failed for user \"{}\"", user),
            sqlstate: "28P01",
        }
    }

    pub fn framing(message: impl fmt::Display) -> Self {
        PgWireError::ProtocolFraming(message.to_string())
    }

    pub fn violation(message: impl fmt::Display) -> Self {
        PgWireError::ProtocolViolation(message.to_string())
    }

    /// Get the error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            PgWireError::ProtocolFraming(_) => "PROTOCOL_FRAMING",
            PgWireError::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
            PgWireError::AuthenticationFailure { .. } => "AUTHENTICATION_FAILURE",
            PgWireError::StatementCompilation(_) => "STATEMENT_COMPILATION",
            PgWireError::UnknownStatement(_) => "UNKNOWN_STATEMENT",
            PgWireError::UnknownPortal(_) => "UNKNOWN_PORTAL",
            PgWireError::UnsupportedFormatCode(_) => "UNSUPPORTED_FORMAT_CODE",
            PgWireError::InvalidParameterValue { .. } => "INVALID_PARAMETER_VALUE",
            PgWireError::ExecutionFailure(_) => "EXECUTION_FAILURE",
            PgWireError::UnsupportedMessage(_) => "UNSUPPORTED_MESSAGE",
            PgWireError::QueryCancelled => "CANCELLED",
            PgWireError::Configuration(_) => "CONFIG_ERROR",
            PgWireError::Io(_) => "IO_ERROR",
        }
    }

    /// Fatal errors close the connection instead of entering ignore-until-sync
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PgWireError::ProtocolFraming(_)
                | PgWireError::AuthenticationFailure { .. }
                | PgWireError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(PgWireError::UnknownPortal("p1".into()).code(), "UNKNOWN_PORTAL");
        assert_eq!(PgWireError::QueryCancelled.code(), "CANCELLED");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(PgWireError::framing("negative length").is_fatal());
        assert!(PgWireError::invalid_password("alice").is_fatal());
        assert!(!PgWireError::UnknownStatement("s1".into()).is_fatal());
        assert!(!PgWireError::UnsupportedMessage(b'?').is_fatal());
    }

    #[test]
    fn test_unsupported_message_display() {
        let err = PgWireError::UnsupportedMessage(b'W');
        assert_eq!(err.to_string(), "Unsupported messageType: W");
    }

    #[test]
    fn test_invalid_password_message() {
        match PgWireError::invalid_password("alice") {
            PgWireError::AuthenticationFailure { message, sqlstate } => {
                assert_eq!(message, "password authentication failed for user \"alice\"");
                assert_eq!(sqlstate, "28P01");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
