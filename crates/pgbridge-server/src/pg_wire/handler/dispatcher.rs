//! Execution dispatcher
//!
//! Picks the backend that serves a statement. Session commands are answered
//! from canned results, catalog queries and relation-free queries go to the
//! metadata backend and everything else goes to the data backend. Routing is
//! advisory only; nothing is executed here.

use crate::backend::{CannedResult, CannedSessionHandler, EmptySessionHandler, SessionHandler};
use crate::metrics;
use crate::pg_wire::query::handle_pg_specific_command;
use sqlparser::ast::{visit_relations, ObjectName, Statement};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::trace;

/// Schemas whose relations are served by the metadata backend
const SYSTEM_SCHEMAS: &[&str] = &["pg_catalog", "information_schema"];

/// Backend selected for a statement
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Empty SQL text
    Empty,
    /// Intercepted session command
    Canned(CannedResult),
    Metadata,
    Data,
}

impl Route {
    pub fn label(&self) -> &'static str {
        match self {
            Route::Empty => "empty",
            Route::Canned(_) => "canned",
            Route::Metadata => "metadata",
            Route::Data => "data",
        }
    }
}

/// Classify parsed statements by the relations they reference
pub fn classify(statements: &[Statement]) -> Route {
    let mut saw_relation = false;
    for statement in statements {
        let hit_system = visit_relations(statement, |relation: &ObjectName| {
            saw_relation = true;
            if is_system_relation(relation) {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        if hit_system.is_break() {
            return Route::Metadata;
        }
    }

    if saw_relation {
        Route::Data
    } else {
        Route::Metadata
    }
}

fn is_system_relation(relation: &ObjectName) -> bool {
    let name = relation.to_string().to_lowercase();
    let parts: Vec<&str> = name.split('.').map(|p| p.trim_matches('"')).collect();
    match parts.as_slice() {
        [table] => table.starts_with("pg_"),
        [.., schema, _] => SYSTEM_SCHEMAS.contains(schema),
        [] => false,
    }
}

/// Routes statements to the data or metadata backend
pub struct ExecutionDispatcher {
    data: Arc<dyn SessionHandler>,
    metadata: Arc<dyn SessionHandler>,
    empty: Arc<dyn SessionHandler>,
    server_version: String,
}

impl ExecutionDispatcher {
    pub fn new(
        data: Arc<dyn SessionHandler>,
        metadata: Arc<dyn SessionHandler>,
        server_version: impl Into<String>,
    ) -> Self {
        Self {
            data,
            metadata,
            empty: Arc::new(EmptySessionHandler),
            server_version: server_version.into(),
        }
    }

    /// Route one statement's SQL text
    pub fn route(&self, sql: &str) -> Route {
        let trimmed = sql.trim().trim_end_matches(';').trim();
        if trimmed.is_empty() {
            return Route::Empty;
        }
        if let Some(result) = handle_pg_specific_command(trimmed, &self.server_version) {
            return Route::Canned(result);
        }
        match Parser::parse_sql(&PostgreSqlDialect {}, trimmed) {
            Ok(statements) => classify(&statements),
            // The data backend is the authority on its own dialect
            Err(e) => {
                trace!(error = %e, "Unparseable statement, routing to data backend");
                Route::Data
            }
        }
    }

    /// Backend that should prepare or execute `sql`
    pub fn handler_for(&self, sql: &str) -> Arc<dyn SessionHandler> {
        self.handler(self.route(sql))
    }

    pub fn handler(&self, route: Route) -> Arc<dyn SessionHandler> {
        trace!(?route, "Routed statement");
        metrics::record_route(&route);
        match route {
            Route::Empty => self.empty.clone(),
            Route::Canned(result) => Arc::new(CannedSessionHandler::new(result)),
            Route::Metadata => self.metadata.clone(),
            Route::Data => self.data.clone(),
        }
    }
}
