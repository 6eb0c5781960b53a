//! Canned responses for intercepted commands (BEGIN, SET, SHOW, ...)

use super::{ColumnMetadata, PreparedStatement, ResultSet, SessionHandler, Statement, VecResultSet};
use crate::pg_wire::protocol::types::{PgType, Value};
use std::sync::Arc;

/// Fixed result of an intercepted command
#[derive(Debug, Clone, PartialEq)]
pub struct CannedResult {
    pub columns: Vec<ColumnMetadata>,
    pub rows: Vec<Vec<Value>>,
    pub command_tag: String,
}

impl CannedResult {
    /// Command with no result set
    pub fn command(tag: impl Into<String>) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            command_tag: tag.into(),
        }
    }

    /// Single-row, single-column text result
    pub fn single_text(column: &str, value: &str, tag: impl Into<String>) -> Self {
        Self {
            columns: vec![ColumnMetadata::new(column, PgType::Text)],
            rows: vec![vec![Value::Text(value.to_string())]],
            command_tag: tag.into(),
        }
    }

    fn has_rows(&self) -> bool {
        !self.columns.is_empty()
    }
}

/// Serves one canned result regardless of the SQL it is handed
pub struct CannedSessionHandler {
    result: CannedResult,
}

impl CannedSessionHandler {
    pub fn new(result: CannedResult) -> Self {
        Self { result }
    }
}

struct CannedStatement {
    result: CannedResult,
}

impl PreparedStatement for CannedStatement {
    fn result_columns(&self) -> anyhow::Result<Option<Vec<ColumnMetadata>>> {
        Ok(self.result.has_rows().then(|| self.result.columns.clone()))
    }

    fn set_parameter(&self, _index: usize, _value: Value) -> anyhow::Result<()> {
        Ok(())
    }

    fn execute(&self) -> anyhow::Result<bool> {
        Ok(self.result.has_rows())
    }

    fn command_tag(&self) -> Option<String> {
        Some(self.result.command_tag.clone())
    }

    fn result_set(&self) -> anyhow::Result<Box<dyn ResultSet>> {
        Ok(Box::new(VecResultSet::new(
            self.result.columns.clone(),
            self.result.rows.clone(),
        )))
    }
}

impl Statement for CannedStatement {
    fn execute(&mut self, _sql: &str) -> anyhow::Result<bool> {
        Ok(self.result.has_rows())
    }

    fn command_tag(&self) -> Option<String> {
        Some(self.result.command_tag.clone())
    }

    fn result_set(&mut self) -> anyhow::Result<Box<dyn ResultSet>> {
        Ok(Box::new(VecResultSet::new(
            self.result.columns.clone(),
            self.result.rows.clone(),
        )))
    }
}

impl SessionHandler for CannedSessionHandler {
    fn name(&self) -> &str {
        "canned"
    }

    fn prepare_statement(&self, _sql: &str) -> anyhow::Result<Arc<dyn PreparedStatement>> {
        Ok(Arc::new(CannedStatement {
            result: self.result.clone(),
        }))
    }

    fn create_statement(&self) -> anyhow::Result<Box<dyn Statement>> {
        Ok(Box::new(CannedStatement {
            result: self.result.clone(),
        }))
    }
}
