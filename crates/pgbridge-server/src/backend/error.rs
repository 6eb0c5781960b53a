//! Located backend errors
//!
//! Backends may return a `BackendError` anywhere in their anyhow chain to
//! control the SQLSTATE and source location reported to the client.

use std::panic::Location;

/// Where an error was raised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub routine: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    pub sqlstate: Option<&'static str>,
    pub location: SourceLocation,
}

impl BackendError {
    /// Create an error located at the caller
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        let caller = Location::caller();
        Self {
            message: message.into(),
            sqlstate: None,
            location: SourceLocation {
                file: caller.file().to_string(),
                line: caller.line(),
                routine: None,
            },
        }
    }

    pub fn with_sqlstate(mut self, sqlstate: &'static str) -> Self {
        self.sqlstate = Some(sqlstate);
        self
    }

    pub fn with_routine(mut self, routine: impl Into<String>) -> Self {
        self.location.routine = Some(routine.into());
        self
    }
}
