//! Placeholder data backend

use super::{BackendError, PreparedStatement, SessionHandler, Statement};
use crate::errors::sqlstate;
use std::sync::Arc;

/// Rejects every statement; stands in until a real engine is wired in
#[derive(Debug, Default)]
pub struct UnavailableSessionHandler;

impl UnavailableSessionHandler {
    fn unavailable(&self) -> anyhow::Error {
        BackendError::new("no data backend is configured for this server")
            .with_sqlstate(sqlstate::FEATURE_NOT_SUPPORTED)
            .with_routine("prepare")
            .into()
    }
}

impl SessionHandler for UnavailableSessionHandler {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn prepare_statement(&self, _sql: &str) -> anyhow::Result<Arc<dyn PreparedStatement>> {
        Err(self.unavailable())
    }

    fn create_statement(&self) -> anyhow::Result<Box<dyn Statement>> {
        Err(self.unavailable())
    }
}
