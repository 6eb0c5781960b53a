//! Main message loop
//!
//! Dispatches one frame at a time to the session. Errors inside an extended
//! query sequence switch the loop into ignore-until-sync: later frames are
//! skipped unparsed until Sync, which clears session state and reports
//! ReadyForQuery once every submitted execution has been written.
//! Output queued behind a failed execution is dropped by the writer, so the
//! ignore flag only saves work; it does not decide what the client sees.

use super::delayed_writes::ExecutionOutcome;
use super::session::Session;
use crate::pg_wire::decoder::{ConnectionFrame, PgDecoder};
use crate::pg_wire::protocol::constants::{frontend, TRANSACTION_STATUS_IDLE};
use crate::pg_wire::protocol::messages::{BackendMessage, ErrorFields, FrontendMessage};
use bytes::Bytes;
use futures::StreamExt;
use pgbridge_common::PgWireError;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tracing::{debug, trace, warn};

/// What the loop should do after a frame
enum Flow {
    Continue,
    Terminate,
}

/// Run the steady-state loop until Terminate, EOF or a fatal error
pub(crate) async fn run_query_loop<R>(reader: &mut FramedRead<R, PgDecoder>, mut session: Session) -> Result<(), PgWireError>
where
    R: AsyncRead + Unpin,
{
    let mut ignore_till_sync = false;
    debug!(
        user = %session.identity().user,
        database = session.database().unwrap_or_default(),
        application = session.application_name().unwrap_or_default(),
        "Session ready"
    );

    while let Some(frame) = reader.next().await {
        let (tag, payload) = match frame {
            Ok(ConnectionFrame::Message { tag, payload }) => (tag, payload),
            Ok(other) => {
                let err = PgWireError::framing(format!("unexpected {:?} after startup", other));
                report(&session, &err, true);
                return Err(err);
            }
            Err(e) => {
                report(&session, &e, true);
                return Err(e);
            }
        };

        // An execution that already failed poisons the rest of the batch
        if session.take_execution_failure() {
            ignore_till_sync = true;
        }
        if ignore_till_sync && tag != frontend::SYNC {
            trace!(tag = %char::from(tag), "Ignoring message until Sync");
            continue;
        }

        match dispatch(&mut session, tag, payload, &mut ignore_till_sync).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Terminate) => {
                debug!("Client terminated the session");
                session.clear_state();
                return Ok(());
            }
            Err(e) if e.is_fatal() => {
                report(&session, &e, true);
                return Err(e);
            }
            Err(e) => {
                warn!(error = %e, kind = e.code(), "Error processing message");
                report(&session, &e, false);
                if tag == frontend::QUERY {
                    // Simple query errors end the cycle on their own
                    ready_for_query(&session)?;
                } else {
                    ignore_till_sync = true;
                }
            }
        }
    }

    debug!("Client closed the connection");
    session.clear_state();
    Ok(())
}

/// Queue an ErrorResponse; a fatal one bypasses the discard of a failed batch
fn report(session: &Session, err: &PgWireError, fatal: bool) {
    if matches!(err, PgWireError::Io(_)) {
        return;
    }
    let message = BackendMessage::ErrorResponse(ErrorFields::from_error(err));
    let queued = if fatal {
        session.channel().end_batch(&message)
    } else {
        session.channel().write_message(&message)
    };
    if let Err(e) = queued {
        debug!("Could not report error: {}", e);
    }
}

async fn dispatch(
    session: &mut Session,
    tag: u8,
    payload: Bytes,
    ignore_till_sync: &mut bool,
) -> Result<Flow, PgWireError> {
    let message = FrontendMessage::decode(tag, payload)?;
    trace!(?message, "Received message");

    match message {
        FrontendMessage::Query(sql) => {
            debug!(query = %sql, "Simple query");
            let done = session.execute_simple(&sql)?;
            if done.await == ExecutionOutcome::Interrupted {
                return Err(PgWireError::Io(std::io::ErrorKind::BrokenPipe.into()));
            }
            ready_for_query(session)?;
        }
        FrontendMessage::Parse {
            name,
            query,
            param_types,
        } => {
            debug!(statement = %name, query = %query, "Parse");
            session.parse(name, query, param_types).await?;
        }
        FrontendMessage::Bind {
            portal,
            statement,
            param_formats,
            params,
            result_formats,
        } => {
            session.bind(portal, &statement, &param_formats, &params, &result_formats)?;
        }
        FrontendMessage::Describe { target, name } => {
            session.describe(target, &name).await?;
        }
        FrontendMessage::Execute { portal, max_rows } => {
            session.execute(&portal, max_rows)?;
        }
        FrontendMessage::Close { target, name } => {
            session.close(target, &name)?;
        }
        FrontendMessage::Sync => {
            let outcome = session.sync().await;
            if *ignore_till_sync || matches!(outcome, ExecutionOutcome::Failed(_)) {
                session.clear_state();
                *ignore_till_sync = false;
            }
            debug!(
                statements = session.statement_count(),
                portals = session.portal_count(),
                ?outcome,
                "Sync"
            );
            if outcome == ExecutionOutcome::Interrupted {
                return Err(PgWireError::Io(std::io::ErrorKind::BrokenPipe.into()));
            }
            ready_for_query(session)?;
        }
        // The writer flushes whenever its queue drains
        FrontendMessage::Flush => {}
        FrontendMessage::Terminate => return Ok(Flow::Terminate),
        FrontendMessage::Password(_) => {
            return Err(PgWireError::violation("unexpected password message outside authentication"));
        }
    }
    Ok(Flow::Continue)
}

/// ReadyForQuery closes the batch, so it is written even after a failure
fn ready_for_query(session: &Session) -> Result<(), PgWireError> {
    session
        .channel()
        .end_batch(&BackendMessage::ReadyForQuery(TRANSACTION_STATUS_IDLE))
}
