//! Backend for empty statements (`""`, `";"`)

use super::{ColumnMetadata, PreparedStatement, ResultSet, SessionHandler, Statement, VecResultSet};
use crate::pg_wire::protocol::types::Value;
use std::sync::Arc;

/// Accepts only empty SQL; every statement is a no-op without a result set
#[derive(Debug, Default)]
pub struct EmptySessionHandler;

struct EmptyStatement;

impl PreparedStatement for EmptyStatement {
    fn result_columns(&self) -> anyhow::Result<Option<Vec<ColumnMetadata>>> {
        Ok(None)
    }

    fn set_parameter(&self, index: usize, _value: Value) -> anyhow::Result<()> {
        anyhow::bail!("empty statement has no parameter ${}", index + 1)
    }

    fn execute(&self) -> anyhow::Result<bool> {
        Ok(false)
    }

    fn result_set(&self) -> anyhow::Result<Box<dyn ResultSet>> {
        Ok(Box::new(VecResultSet::new(Vec::new(), Vec::new())))
    }
}

impl Statement for EmptyStatement {
    fn execute(&mut self, _sql: &str) -> anyhow::Result<bool> {
        Ok(false)
    }

    fn result_set(&mut self) -> anyhow::Result<Box<dyn ResultSet>> {
        Ok(Box::new(VecResultSet::new(Vec::new(), Vec::new())))
    }
}

impl SessionHandler for EmptySessionHandler {
    fn name(&self) -> &str {
        "empty"
    }

    fn prepare_statement(&self, _sql: &str) -> anyhow::Result<Arc<dyn PreparedStatement>> {
        Ok(Arc::new(EmptyStatement))
    }

    fn create_statement(&self) -> anyhow::Result<Box<dyn Statement>> {
        Ok(Box::new(EmptyStatement))
    }
}
