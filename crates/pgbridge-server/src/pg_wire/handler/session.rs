//! Per-connection session state
//!
//! Holds prepared statements and portals and submits executions to the
//! worker pool. State is owned by the connection's dispatch loop; worker
//! threads only see the pieces each job needs (statement handle, bound
//! values, portal cursor), never the maps themselves.

use super::cancel::CancelFlag;
use super::delayed_writes::{chain, completed, CompletionFuture, DelayableWriteChannel, ExecutionOutcome};
use super::dispatcher::{ExecutionDispatcher, Route};
use super::result_receiver::{row_description, ResultReceiver, StreamEnd};
use super::worker_pool::WorkerPool;
use crate::backend::{PreparedStatement, ResultSet};
use crate::metrics;
use crate::pg_wire::protocol::messages::{BackendMessage, Target};
use crate::pg_wire::protocol::types::{FormatCode, PgType, Value};
use crate::pg_wire::query::{command_tag, split_statements};
use bytes::Bytes;
use parking_lot::Mutex;
use pgbridge_common::{Identity, PgWireError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Shared execution machinery handed to every session
#[derive(Clone)]
pub struct ExecutionResources {
    pub dispatcher: Arc<ExecutionDispatcher>,
    pub pool: Arc<WorkerPool>,
    pub result_flush_rows: usize,
}

struct PreparedEntry {
    sql: String,
    /// Resolved from declared OIDs, falling back to what the backend inferred
    param_types: Vec<PgType>,
    statement: Arc<dyn PreparedStatement>,
    /// Serializes parameter binding and execution of the shared handle
    exec_lock: Mutex<()>,
    empty: bool,
}

enum PortalCursor {
    /// Not executed yet
    Pending,
    /// Suspended by a row limit; `next` was fetched but not sent
    Open {
        rs: Box<dyn ResultSet>,
        next: Option<Vec<Value>>,
    },
    Exhausted,
}

struct Portal {
    statement: Arc<PreparedEntry>,
    params: Vec<Value>,
    result_formats: Vec<FormatCode>,
    cursor: Arc<Mutex<PortalCursor>>,
    /// Executions on one portal start in submission order
    last_execution: CompletionFuture,
}

pub struct Session {
    resources: ExecutionResources,
    channel: DelayableWriteChannel,
    cancel: Arc<CancelFlag>,
    identity: Identity,
    database: Option<String>,
    application_name: Option<String>,
    statements: HashMap<String, Arc<PreparedEntry>>,
    portals: HashMap<String, Portal>,
    active_execution: CompletionFuture,
    execution_failed: Arc<AtomicBool>,
}

impl Session {
    pub fn new(
        resources: ExecutionResources,
        channel: DelayableWriteChannel,
        cancel: Arc<CancelFlag>,
        identity: Identity,
    ) -> Self {
        Self {
            resources,
            channel,
            cancel,
            identity,
            database: None,
            application_name: None,
            statements: HashMap::new(),
            portals: HashMap::new(),
            active_execution: completed(),
            execution_failed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_startup(mut self, database: Option<String>, application_name: Option<String>) -> Self {
        self.database = database;
        self.application_name = application_name;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn application_name(&self) -> Option<&str> {
        self.application_name.as_deref()
    }

    pub fn channel(&self) -> &DelayableWriteChannel {
        &self.channel
    }

    /// Compile `sql` and store it under `name`, replacing any previous statement
    pub async fn parse(&mut self, name: String, sql: String, declared: Vec<u32>) -> Result<(), PgWireError> {
        let dispatcher = self.resources.dispatcher.clone();
        let job_sql = sql.clone();
        let (route, statement, inferred) = self
            .resources
            .pool
            .run(move || {
                let route = dispatcher.route(&job_sql);
                let statement = dispatcher.handler(route.clone()).prepare_statement(&job_sql)?;
                let inferred = statement.parameter_types()?;
                Ok::<_, anyhow::Error>((route, statement, inferred))
            })
            .await?
            .map_err(PgWireError::StatementCompilation)?;

        let entry = Arc::new(PreparedEntry {
            param_types: resolve_parameter_types(&declared, &inferred),
            empty: route == Route::Empty,
            sql,
            statement,
            exec_lock: Mutex::new(()),
        });
        debug!(statement = %name, params = entry.param_types.len(), "Parsed statement");
        if let Some(previous) = self.statements.insert(name, entry) {
            self.release_statement(previous);
        }
        self.channel.write_message(&BackendMessage::ParseComplete)
    }

    /// Bind parameters to a statement, creating or replacing a portal
    pub fn bind(
        &mut self,
        portal: String,
        statement: &str,
        param_formats: &[i16],
        params: &[Option<Bytes>],
        result_formats: &[i16],
    ) -> Result<(), PgWireError> {
        let entry = self
            .statements
            .get(statement)
            .cloned()
            .ok_or_else(|| PgWireError::UnknownStatement(statement.to_string()))?;
        let param_formats = parse_formats(param_formats)?;
        let result_formats = parse_formats(result_formats)?;

        if param_formats.len() > 1 && param_formats.len() != params.len() {
            return Err(PgWireError::violation(format!(
                "bind message has {} parameter formats but {} parameters",
                param_formats.len(),
                params.len()
            )));
        }
        if !entry.param_types.is_empty() && entry.param_types.len() != params.len() {
            return Err(PgWireError::violation(format!(
                "bind message supplies {} parameters, but prepared statement \"{}\" requires {}",
                params.len(),
                statement,
                entry.param_types.len()
            )));
        }

        let values = params
            .iter()
            .enumerate()
            .map(|(idx, raw)| match raw {
                None => Ok(Value::Null),
                Some(bytes) => entry
                    .param_types
                    .get(idx)
                    .copied()
                    .unwrap_or(PgType::Unknown)
                    .decode(idx, bytes, FormatCode::for_index(&param_formats, idx)),
            })
            .collect::<Result<Vec<_>, _>>()?;

        trace!(portal = %portal, statement = %statement, "Bound portal");
        self.portals.insert(
            portal,
            Portal {
                statement: entry,
                params: values,
                result_formats,
                cursor: Arc::new(Mutex::new(PortalCursor::Pending)),
                last_execution: completed(),
            },
        );
        self.channel.write_message(&BackendMessage::BindComplete)
    }

    /// Send parameter and/or row metadata for a statement or portal
    pub async fn describe(&mut self, target: Target, name: &str) -> Result<(), PgWireError> {
        let (entry, formats) = match target {
            Target::Statement => {
                let entry = self
                    .statements
                    .get(name)
                    .cloned()
                    .ok_or_else(|| PgWireError::UnknownStatement(name.to_string()))?;
                (entry, Vec::new())
            }
            Target::Portal => {
                let portal = self
                    .portals
                    .get(name)
                    .ok_or_else(|| PgWireError::UnknownPortal(name.to_string()))?;
                (portal.statement.clone(), portal.result_formats.clone())
            }
        };

        let statement = entry.statement.clone();
        let columns = self
            .resources
            .pool
            .run(move || statement.result_columns())
            .await?
            .map_err(PgWireError::ExecutionFailure)?;

        if target == Target::Statement {
            let oids = entry.param_types.iter().map(|ty| ty.oid()).collect();
            self.channel
                .write_message(&BackendMessage::ParameterDescription(oids))?;
        }
        match columns {
            Some(columns) => {
                FormatCode::check_count(&formats, columns.len())?;
                self.channel.write_message(&row_description(&columns, &formats))
            }
            None => self.channel.write_message(&BackendMessage::NoData),
        }
    }

    /// Submit a portal for execution; `max_rows` of 0 means unlimited
    pub fn execute(&mut self, portal: &str, max_rows: i32) -> Result<CompletionFuture, PgWireError> {
        let entry = self
            .portals
            .get_mut(portal)
            .ok_or_else(|| PgWireError::UnknownPortal(portal.to_string()))?;
        let (slot, done) = self.channel.delay_writes()?;

        let job = PortalJob {
            entry: entry.statement.clone(),
            params: entry.params.clone(),
            formats: entry.result_formats.clone(),
            cursor: entry.cursor.clone(),
            limit: usize::try_from(max_rows).ok().filter(|n| *n > 0),
        };
        let previous = std::mem::replace(&mut entry.last_execution, done.clone());

        let pool = self.resources.pool.clone();
        let flush_rows = self.resources.result_flush_rows;
        let cancel = self.cancel.clone();
        let failed = self.execution_failed.clone();
        let timer = metrics::execution_started("extended");
        tokio::spawn(async move {
            previous.await;
            let result = pool
                .run(move || {
                    let receiver = ResultReceiver::new(slot, flush_rows, cancel.begin());
                    job.run(receiver, &failed)
                })
                .await;
            match result {
                Ok(outcome) => timer.finish(&outcome),
                Err(e) => debug!(error = %e, "Portal execution did not run"),
            }
        });

        self.active_execution = chain(self.active_execution.clone(), done.clone());
        Ok(done)
    }

    /// Run a simple query; statements execute one after another
    pub fn execute_simple(&mut self, sql: &str) -> Result<CompletionFuture, PgWireError> {
        let statements = split_statements(sql);
        if statements.is_empty() {
            self.channel.write_message(&BackendMessage::EmptyQueryResponse)?;
            return Ok(completed());
        }
        let (slot, done) = self.channel.delay_writes()?;

        let dispatcher = self.resources.dispatcher.clone();
        let pool = self.resources.pool.clone();
        let flush_rows = self.resources.result_flush_rows;
        let cancel = self.cancel.clone();
        let timer = metrics::execution_started("simple");
        tokio::spawn(async move {
            let result = pool
                .run(move || {
                    let receiver = ResultReceiver::new(slot, flush_rows, cancel.begin());
                    run_simple(&dispatcher, &statements, receiver)
                })
                .await;
            match result {
                Ok(outcome) => timer.finish(&outcome),
                Err(e) => debug!(error = %e, "Simple query did not run"),
            }
        });

        self.active_execution = chain(self.active_execution.clone(), done.clone());
        Ok(done)
    }

    /// Close a statement (cascading to its portals) or a portal
    pub fn close(&mut self, target: Target, name: &str) -> Result<(), PgWireError> {
        match target {
            Target::Statement => {
                let entry = self
                    .statements
                    .remove(name)
                    .ok_or_else(|| PgWireError::UnknownStatement(name.to_string()))?;
                self.release_statement(entry);
            }
            Target::Portal => {
                self.portals.remove(name);
            }
        }
        self.channel.write_message(&BackendMessage::CloseComplete)
    }

    /// Close every portal and statement
    pub fn clear_state(&mut self) {
        self.portals.clear();
        let statements: Vec<_> = self.statements.drain().map(|(_, entry)| entry).collect();
        for entry in statements {
            self.release_statement(entry);
        }
    }

    /// Wait for every submitted execution to be written
    pub async fn sync(&mut self) -> ExecutionOutcome {
        let tail = std::mem::replace(&mut self.active_execution, completed());
        let outcome = tail.await;
        // Every failing job sets the flag before its completion resolves
        self.execution_failed.store(false, Ordering::SeqCst);
        outcome
    }

    /// True once if an execution failed since the last check
    pub fn take_execution_failure(&self) -> bool {
        self.execution_failed.swap(false, Ordering::SeqCst)
    }

    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    pub fn portal_count(&self) -> usize {
        self.portals.len()
    }

    /// Drop portals of `entry` and close its backend handle once running work drains
    fn release_statement(&mut self, entry: Arc<PreparedEntry>) {
        self.portals.retain(|_, portal| !Arc::ptr_eq(&portal.statement, &entry));
        let tail = self.active_execution.clone();
        let pool = self.resources.pool.clone();
        tokio::spawn(async move {
            tail.await;
            let statement = entry.statement.clone();
            match pool.run(move || statement.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "Backend failed to close statement"),
                Err(e) => debug!(error = %e, "Statement close did not run"),
            }
        });
    }
}

fn parse_formats(codes: &[i16]) -> Result<Vec<FormatCode>, PgWireError> {
    codes.iter().map(|code| FormatCode::from_code(*code)).collect()
}

fn resolve_parameter_types(declared: &[u32], inferred: &[PgType]) -> Vec<PgType> {
    let count = declared.len().max(inferred.len());
    (0..count)
        .map(|idx| {
            declared
                .get(idx)
                .filter(|oid| **oid != 0)
                .and_then(|oid| PgType::from_oid(*oid))
                .or_else(|| inferred.get(idx).copied())
                .unwrap_or(PgType::Unknown)
        })
        .collect()
}

struct PortalJob {
    entry: Arc<PreparedEntry>,
    params: Vec<Value>,
    formats: Vec<FormatCode>,
    cursor: Arc<Mutex<PortalCursor>>,
    limit: Option<usize>,
}

impl PortalJob {
    fn run(self, mut receiver: ResultReceiver, failed: &AtomicBool) -> ExecutionOutcome {
        if receiver.batch_failed() {
            // Nothing of this batch reaches the client after the failure
            trace!("Skipping execution after failure earlier in the batch");
            failed.store(true, Ordering::SeqCst);
            return receiver.finish(ExecutionOutcome::Failed("skipped after earlier failure".to_string()));
        }
        let outcome = match self.stream(&mut receiver) {
            Ok(()) => ExecutionOutcome::Completed,
            Err(e) => receiver.error(&e),
        };
        if matches!(outcome, ExecutionOutcome::Failed(_)) {
            failed.store(true, Ordering::SeqCst);
        }
        receiver.finish(outcome)
    }

    fn stream(&self, receiver: &mut ResultReceiver) -> Result<(), PgWireError> {
        let mut cursor = self.cursor.lock();
        let (mut rs, next) = match std::mem::replace(&mut *cursor, PortalCursor::Exhausted) {
            PortalCursor::Pending => match self.start(receiver)? {
                Some(rs) => (rs, None),
                None => return Ok(()),
            },
            PortalCursor::Open { rs, next } => (rs, next),
            PortalCursor::Exhausted => {
                let done = if self.entry.empty {
                    BackendMessage::EmptyQueryResponse
                } else {
                    BackendMessage::CommandComplete(self.tag(0))
                };
                receiver.message(&done);
                return Ok(());
            }
        };

        match receiver.stream(rs.as_mut(), next, self.limit, &self.formats)? {
            StreamEnd::Suspended { rows, next } => {
                trace!(rows, "Portal suspended");
                *cursor = PortalCursor::Open { rs, next: Some(next) };
                receiver.message(&BackendMessage::PortalSuspended);
            }
            StreamEnd::Exhausted { rows } => {
                receiver.message(&BackendMessage::CommandComplete(self.tag(rows)));
            }
        }
        Ok(())
    }

    /// First execution: bind, run, and open the result set if there is one
    fn start(&self, receiver: &mut ResultReceiver) -> Result<Option<Box<dyn ResultSet>>, PgWireError> {
        if self.entry.empty {
            receiver.message(&BackendMessage::EmptyQueryResponse);
            return Ok(None);
        }
        let statement = &self.entry.statement;
        let _exclusive = self.entry.exec_lock.lock();
        for (idx, value) in self.params.iter().enumerate() {
            statement
                .set_parameter(idx, value.clone())
                .map_err(PgWireError::ExecutionFailure)?;
        }
        if !statement.execute().map_err(PgWireError::ExecutionFailure)? {
            let tag = statement
                .command_tag()
                .unwrap_or_else(|| command_tag(&self.entry.sql, statement.update_count()));
            receiver.message(&BackendMessage::CommandComplete(tag));
            return Ok(None);
        }
        statement
            .result_set()
            .map(Some)
            .map_err(PgWireError::ExecutionFailure)
    }

    fn tag(&self, rows: u64) -> String {
        self.entry
            .statement
            .command_tag()
            .unwrap_or_else(|| command_tag(&self.entry.sql, rows))
    }
}

fn run_simple(
    dispatcher: &ExecutionDispatcher,
    statements: &[String],
    mut receiver: ResultReceiver,
) -> ExecutionOutcome {
    for sql in statements {
        if let Err(e) = run_simple_statement(dispatcher, sql, &mut receiver) {
            let outcome = receiver.error(&e);
            return receiver.finish(outcome);
        }
        receiver.flush();
    }
    receiver.finish(ExecutionOutcome::Completed)
}

fn run_simple_statement(
    dispatcher: &ExecutionDispatcher,
    sql: &str,
    receiver: &mut ResultReceiver,
) -> Result<(), PgWireError> {
    let mut statement = dispatcher
        .handler_for(sql)
        .create_statement()
        .map_err(PgWireError::StatementCompilation)?;
    let has_rows = statement.execute(sql).map_err(PgWireError::ExecutionFailure)?;

    let rows = if has_rows {
        let mut rs = statement.result_set().map_err(PgWireError::ExecutionFailure)?;
        receiver.message(&row_description(rs.columns(), &[]));
        match receiver.stream(rs.as_mut(), None, None, &[])? {
            StreamEnd::Exhausted { rows } | StreamEnd::Suspended { rows, .. } => rows,
        }
    } else {
        statement.update_count()
    };
    let tag = statement.command_tag().unwrap_or_else(|| command_tag(sql, rows));
    receiver.message(&BackendMessage::CommandComplete(tag));

    if let Err(e) = statement.close() {
        debug!(error = %e, "Backend failed to close statement");
    }
    Ok(())
}
