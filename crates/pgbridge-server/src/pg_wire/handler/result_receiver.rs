//! Streams backend results into a delayed write slot
//!
//! Runs on a worker thread. Frames are encoded into a local buffer and handed
//! to the writer every `flush_rows` rows, so memory stays bounded for large
//! results while ordering is still enforced by the slot.

use super::cancel::ActiveExecution;
use super::delayed_writes::{DelayedWrites, ExecutionOutcome};
use crate::backend::{ColumnMetadata, ResultSet};
use crate::pg_wire::protocol::messages::{write_data_row, BackendMessage, ErrorFields, FieldDescription};
use crate::pg_wire::protocol::types::{FormatCode, PgType, Value};
use bytes::BytesMut;
use pgbridge_common::PgWireError;
use tracing::{debug, trace};

/// RowDescription for `columns` sent with the given result formats
pub fn row_description(columns: &[ColumnMetadata], formats: &[FormatCode]) -> BackendMessage {
    let fields = columns
        .iter()
        .enumerate()
        .map(|(idx, column)| FieldDescription {
            name: column.name.clone(),
            table_oid: 0,
            column_id: 0,
            type_oid: column.pg_type.oid(),
            type_len: column.pg_type.type_len(),
            type_modifier: -1,
            format: FormatCode::for_index(formats, idx).code(),
        })
        .collect();
    BackendMessage::RowDescription(fields)
}

/// How a streaming pass ended
#[derive(Debug)]
pub enum StreamEnd {
    /// The result set is exhausted
    Exhausted { rows: u64 },
    /// The row limit was reached and `next` is the first unsent row
    Suspended { rows: u64, next: Vec<Value> },
}

pub struct ResultReceiver {
    slot: DelayedWrites,
    buf: BytesMut,
    flush_rows: usize,
    buffered_rows: usize,
    disconnected: bool,
    execution: ActiveExecution,
}

impl ResultReceiver {
    pub fn new(slot: DelayedWrites, flush_rows: usize, execution: ActiveExecution) -> Self {
        Self {
            slot,
            buf: BytesMut::with_capacity(8 * 1024),
            flush_rows: flush_rows.max(1),
            buffered_rows: 0,
            disconnected: false,
            execution,
        }
    }

    /// An earlier execution of this batch failed; output would be discarded
    pub fn batch_failed(&self) -> bool {
        self.slot.batch_failed()
    }

    pub fn message(&mut self, message: &BackendMessage) {
        message.encode(&mut self.buf);
    }

    /// Stream rows until the result set ends or `limit` rows were sent.
    ///
    /// `pending` is a row fetched by an earlier pass that must go out first.
    pub fn stream(
        &mut self,
        rs: &mut dyn ResultSet,
        pending: Option<Vec<Value>>,
        limit: Option<usize>,
        formats: &[FormatCode],
    ) -> Result<StreamEnd, PgWireError> {
        FormatCode::check_count(formats, rs.columns().len())?;
        let types: Vec<PgType> = rs.columns().iter().map(|c| c.pg_type).collect();
        let mut rows: u64 = 0;
        let mut pending = pending;

        loop {
            if self.execution.is_cancelled() {
                return Err(PgWireError::QueryCancelled);
            }
            let row = match pending.take() {
                Some(row) => row,
                None => match rs.next_row().map_err(PgWireError::ExecutionFailure)? {
                    Some(row) => row,
                    None => return Ok(StreamEnd::Exhausted { rows }),
                },
            };
            if limit.is_some_and(|max| rows as usize >= max) {
                return Ok(StreamEnd::Suspended { rows, next: row });
            }
            write_data_row(&mut self.buf, &row, &types, formats)?;
            rows += 1;
            self.buffered_rows += 1;
            if self.buffered_rows >= self.flush_rows {
                self.flush();
                if self.disconnected {
                    return Err(PgWireError::Io(std::io::ErrorKind::BrokenPipe.into()));
                }
            }
        }
    }

    /// Hand buffered frames to the writer
    pub fn flush(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        trace!(bytes = self.buf.len(), rows = self.buffered_rows, "Flushing result chunk");
        let chunk = self.buf.split().freeze();
        self.buffered_rows = 0;
        if !self.slot.send(chunk) {
            self.disconnected = true;
        }
    }

    /// Append an ErrorResponse for `err`; returns the failed outcome
    pub fn error(&mut self, err: &PgWireError) -> ExecutionOutcome {
        if matches!(err, PgWireError::Io(_)) && self.disconnected {
            return ExecutionOutcome::Interrupted;
        }
        debug!(error = %err, "Execution failed");
        let fields = ErrorFields::from_error(err);
        let message = fields.message.clone();
        self.message(&BackendMessage::ErrorResponse(fields));
        ExecutionOutcome::Failed(message)
    }

    /// Flush what is left and close the slot
    pub fn finish(mut self, outcome: ExecutionOutcome) -> ExecutionOutcome {
        self.flush();
        let outcome = if self.disconnected {
            ExecutionOutcome::Interrupted
        } else {
            outcome
        };
        self.slot.finish(outcome.clone());
        outcome
    }
}
