//! Error classification for client-facing ErrorResponses
//!
//! Maps `PgWireError` kinds and located `BackendError`s onto PostgreSQL
//! SQLSTATE codes, severities and source locations.

use crate::backend::BackendError;
use crate::pg_wire::protocol::messages::ErrorFields;
use pgbridge_common::PgWireError;
use std::error::Error as StdError;

/// PostgreSQL SQLSTATE error codes
/// See: https://www.postgresql.org/docs/current/errcodes-appendix.html
pub mod sqlstate {
    // Class 08: Connection Exception
    pub const CONNECTION_FAILURE: &str = "08006";
    pub const PROTOCOL_VIOLATION: &str = "08P01";

    // Class 0A: Feature Not Supported
    pub const FEATURE_NOT_SUPPORTED: &str = "0A000";

    // Class 22: Data Exception
    pub const INVALID_PARAMETER_VALUE: &str = "22023";
    pub const INVALID_TEXT_REPRESENTATION: &str = "22P02";

    // Class 26: Invalid SQL Statement Name
    pub const INVALID_SQL_STATEMENT_NAME: &str = "26000";

    // Class 28: Invalid Authorization Specification
    pub const INVALID_AUTHORIZATION: &str = "28000";
    pub const INVALID_PASSWORD: &str = "28P01";

    // Class 34: Invalid Cursor Name
    pub const INVALID_CURSOR_NAME: &str = "34000";

    // Class 42: Syntax Error or Access Rule Violation
    pub const SYNTAX_ERROR: &str = "42601";
    pub const UNDEFINED_PARAMETER: &str = "42P02";

    // Class 57: Operator Intervention
    pub const QUERY_CANCELED: &str = "57014";

    // Class XX: Internal Error
    pub const INTERNAL_ERROR: &str = "XX000";
}

pub const SEVERITY_ERROR: &str = "ERROR";
pub const SEVERITY_FATAL: &str = "FATAL";

/// Routine reported for authentication failures
const AUTH_ROUTINE: &str = "ClientAuthentication";

/// SQLSTATE for a protocol error kind
pub fn sqlstate_for(err: &PgWireError) -> &'static str {
    match err {
        PgWireError::ProtocolFraming(_) | PgWireError::ProtocolViolation(_) => {
            sqlstate::PROTOCOL_VIOLATION
        }
        PgWireError::AuthenticationFailure { sqlstate, .. } => sqlstate,
        PgWireError::StatementCompilation(_) => sqlstate::SYNTAX_ERROR,
        PgWireError::UnknownStatement(_) => sqlstate::INVALID_SQL_STATEMENT_NAME,
        PgWireError::UnknownPortal(_) => sqlstate::INVALID_CURSOR_NAME,
        PgWireError::UnsupportedFormatCode(_) => sqlstate::INVALID_PARAMETER_VALUE,
        PgWireError::InvalidParameterValue { .. } => sqlstate::INVALID_TEXT_REPRESENTATION,
        PgWireError::ExecutionFailure(_) | PgWireError::Configuration(_) => sqlstate::INTERNAL_ERROR,
        PgWireError::UnsupportedMessage(_) => sqlstate::FEATURE_NOT_SUPPORTED,
        PgWireError::QueryCancelled => sqlstate::QUERY_CANCELED,
        PgWireError::Io(_) => sqlstate::CONNECTION_FAILURE,
    }
}

fn chain<'a>(err: &'a (dyn StdError + 'static)) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |e: &&'a (dyn StdError + 'static)| (*e).source())
}

impl ErrorFields {
    /// Build an ErrorResponse from any error chain.
    ///
    /// The message is the root cause. A `BackendError` anywhere in the chain
    /// supplies the SQLSTATE and location; otherwise the first `PgWireError`
    /// decides the code and severity.
    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        let wire = chain(err).find_map(|e| e.downcast_ref::<PgWireError>());
        let backend = chain(err).find_map(|e| e.downcast_ref::<BackendError>());
        let root = chain(err).last().unwrap_or(err);

        let severity = match wire {
            Some(w) if w.is_fatal() => SEVERITY_FATAL,
            _ => SEVERITY_ERROR,
        };
        let code = backend
            .and_then(|b| b.sqlstate)
            .or_else(|| wire.map(sqlstate_for))
            .unwrap_or(sqlstate::INTERNAL_ERROR);

        let mut fields = ErrorFields {
            severity: severity.to_string(),
            code: code.to_string(),
            message: root.to_string(),
            ..Default::default()
        };
        if let Some(backend) = backend {
            fields.file = Some(backend.location.file.clone());
            fields.line = Some(backend.location.line);
            fields.routine = backend.location.routine.clone();
        } else if let Some(PgWireError::AuthenticationFailure { .. }) = wire {
            fields.routine = Some(AUTH_ROUTINE.to_string());
        }
        fields
    }

    /// Convenience for anyhow chains
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let err: &(dyn StdError + Send + Sync + 'static) = err.as_ref();
        Self::from_error(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_unknown_statement() {
        let fields = ErrorFields::from_error(&PgWireError::UnknownStatement("s1".into()));
        assert_eq!(fields.severity, "ERROR");
        assert_eq!(fields.code, sqlstate::INVALID_SQL_STATEMENT_NAME);
        assert_eq!(fields.message, "No statement found with name: s1");
        assert!(fields.file.is_none());
    }

    #[test]
    fn test_auth_failure_is_fatal() {
        let fields = ErrorFields::from_error(&PgWireError::invalid_password("alice"));
        assert_eq!(fields.severity, "FATAL");
        assert_eq!(fields.code, sqlstate::INVALID_PASSWORD);
        assert_eq!(fields.routine.as_deref(), Some("ClientAuthentication"));
        assert_eq!(fields.message, "password authentication failed for user \"alice\"");
    }

    #[test]
    fn test_root_cause_and_backend_location() {
        let inner: anyhow::Result<()> = Err(BackendError::new("relation \"t\" does not exist")
            .with_sqlstate("42P01")
            .with_routine("parserOpenTable")
            .into());
        let err = inner.context("while preparing").unwrap_err();
        let wire = PgWireError::StatementCompilation(err);
        let fields = ErrorFields::from_error(&wire);
        assert_eq!(fields.message, "relation \"t\" does not exist");
        assert_eq!(fields.code, "42P01");
        assert_eq!(fields.routine.as_deref(), Some("parserOpenTable"));
        assert!(fields.file.unwrap().ends_with("errors.rs"));
        assert!(fields.line.is_some());
    }

    #[test]
    fn test_plain_anyhow_is_internal() {
        let err = anyhow::anyhow!("disk on fire").context("executing");
        let fields = ErrorFields::from_anyhow(&err);
        assert_eq!(fields.code, sqlstate::INTERNAL_ERROR);
        assert_eq!(fields.message, "disk on fire");
    }

    #[test]
    fn test_cancelled() {
        let fields = ErrorFields::from_error(&PgWireError::QueryCancelled);
        assert_eq!(fields.code, "57014");
        assert_eq!(fields.message, "canceling statement due to user request");
    }

    #[test]
    fn test_unsupported_message() {
        let fields = ErrorFields::from_error(&PgWireError::UnsupportedMessage(b'F'));
        assert_eq!(fields.code, "0A000");
        assert_eq!(fields.message, "Unsupported messageType: F");
    }
}
