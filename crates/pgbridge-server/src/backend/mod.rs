//! Execution backend collaborators
//!
//! The protocol layer never evaluates SQL itself. It hands statements to a
//! `SessionHandler` (one for data queries, one for metadata/catalog
//! queries) and streams whatever `ResultSet` comes back. All calls are
//! synchronous and run on the shared worker pool.

mod canned;
mod constant;
mod empty;
mod error;
mod unavailable;

pub use canned::{CannedResult, CannedSessionHandler};
pub use constant::ConstantSessionHandler;
pub use empty::EmptySessionHandler;
pub use error::{BackendError, SourceLocation};
pub use unavailable::UnavailableSessionHandler;

use crate::pg_wire::protocol::types::{PgType, Value};
use std::sync::Arc;

/// Name and wire type of a result column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub name: String,
    pub pg_type: PgType,
}

impl ColumnMetadata {
    pub fn new(name: impl Into<String>, pg_type: PgType) -> Self {
        Self {
            name: name.into(),
            pg_type,
        }
    }
}

/// Forward-only cursor over result rows
pub trait ResultSet: Send {
    fn columns(&self) -> &[ColumnMetadata];

    /// Next row, or `None` once exhausted
    fn next_row(&mut self) -> anyhow::Result<Option<Vec<Value>>>;
}

/// A compiled statement produced by `SessionHandler::prepare_statement`
pub trait PreparedStatement: Send + Sync {
    /// Parameter types the backend inferred; may be shorter than the placeholder count
    fn parameter_types(&self) -> anyhow::Result<Vec<PgType>> {
        Ok(Vec::new())
    }

    /// Result columns, or `None` when the statement produces no rows
    fn result_columns(&self) -> anyhow::Result<Option<Vec<ColumnMetadata>>>;

    /// Bind parameter `index` (zero-based)
    fn set_parameter(&self, index: usize, value: Value) -> anyhow::Result<()>;

    /// Run the statement; true when a result set is available
    fn execute(&self) -> anyhow::Result<bool>;

    /// Rows affected by the last `execute` that returned false
    fn update_count(&self) -> u64 {
        0
    }

    /// Fixed CommandComplete tag overriding the one derived from the SQL text
    fn command_tag(&self) -> Option<String> {
        None
    }

    fn result_set(&self) -> anyhow::Result<Box<dyn ResultSet>>;

    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A one-shot statement for the simple query path
pub trait Statement: Send {
    fn execute(&mut self, sql: &str) -> anyhow::Result<bool>;

    fn update_count(&self) -> u64 {
        0
    }

    fn command_tag(&self) -> Option<String> {
        None
    }

    fn result_set(&mut self) -> anyhow::Result<Box<dyn ResultSet>>;

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// An execution engine able to serve a session
pub trait SessionHandler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    fn prepare_statement(&self, sql: &str) -> anyhow::Result<Arc<dyn PreparedStatement>>;

    fn create_statement(&self) -> anyhow::Result<Box<dyn Statement>>;
}

/// In-memory result set
pub struct VecResultSet {
    columns: Vec<ColumnMetadata>,
    rows: std::vec::IntoIter<Vec<Value>>,
}

impl VecResultSet {
    pub fn new(columns: Vec<ColumnMetadata>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns,
            rows: rows.into_iter(),
        }
    }
}

impl ResultSet for VecResultSet {
    fn columns(&self) -> &[ColumnMetadata] {
        &self.columns
    }

    fn next_row(&mut self) -> anyhow::Result<Option<Vec<Value>>> {
        Ok(self.rows.next())
    }
}
