//! Ordered result delivery
//!
//! A single writer task owns the socket's write half and consumes a FIFO of
//! segments. A segment is either frames that are ready now, or a delayed slot
//! reserved by an execution that has not produced its response yet. The
//! writer drains a delayed slot to completion before touching the next
//! segment, so responses reach the client in submission order no matter when
//! the worker threads finish.
//!
//! Segments belong to a batch, the frames between two ReadyForQuery
//! messages. Once a delayed slot of a batch ends in failure, everything the
//! batch queued after it is discarded until the batch's ReadyForQuery, so the
//! client never sees output for messages that followed an error.

use crate::errors::{sqlstate, SEVERITY_ERROR};
use crate::pg_wire::protocol::messages::{BackendMessage, ErrorFields};
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use pgbridge_common::PgWireError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// How an execution's response ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Rows and CommandComplete (or PortalSuspended) were written
    Completed,
    /// An ErrorResponse was written
    Failed(String),
    /// The connection went away before the response was written
    Interrupted,
}

impl ExecutionOutcome {
    /// Combine two outcomes in a chain; the worse one wins
    pub fn merge(self, next: ExecutionOutcome) -> ExecutionOutcome {
        match (self, next) {
            (ExecutionOutcome::Interrupted, _) | (_, ExecutionOutcome::Interrupted) => {
                ExecutionOutcome::Interrupted
            }
            (failed @ ExecutionOutcome::Failed(_), _) | (_, failed @ ExecutionOutcome::Failed(_)) => failed,
            _ => ExecutionOutcome::Completed,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Completed => "completed",
            ExecutionOutcome::Failed(_) => "failed",
            ExecutionOutcome::Interrupted => "interrupted",
        }
    }
}

/// Resolves once an execution's response has been handed to the socket
pub type CompletionFuture = Shared<BoxFuture<'static, ExecutionOutcome>>;

/// A completion that has already happened
pub fn completed() -> CompletionFuture {
    futures::future::ready(ExecutionOutcome::Completed).boxed().shared()
}

/// Chain `next` after `previous`, resolving to the merged outcome
pub fn chain(previous: CompletionFuture, next: CompletionFuture) -> CompletionFuture {
    async move {
        let first = previous.await;
        first.merge(next.await)
    }
    .boxed()
    .shared()
}

/// What an execution sends into its delayed slot
#[derive(Debug)]
pub enum Delivery {
    Frames(Bytes),
    Finished(ExecutionOutcome),
}

enum Segment {
    Frames {
        batch: u64,
        bytes: Bytes,
    },
    Delayed {
        batch: u64,
        deliveries: mpsc::UnboundedReceiver<Delivery>,
        done: oneshot::Sender<ExecutionOutcome>,
    },
    /// Always written; closes the current batch
    EndOfBatch(Bytes),
}

/// Batch bookkeeping shared by the channel handles and the writer
#[derive(Debug)]
struct Batches {
    /// Batch that new segments join; starts at 1
    current: AtomicU64,
    /// Latest batch with a failed slot, 0 for none
    failed: AtomicU64,
}

impl Batches {
    fn has_failed(&self, batch: u64) -> bool {
        self.failed.load(Ordering::SeqCst) == batch
    }
}

/// Cloneable handle to the connection's writer task
#[derive(Clone)]
pub struct DelayableWriteChannel {
    tx: mpsc::UnboundedSender<Segment>,
    batches: Arc<Batches>,
}

impl DelayableWriteChannel {
    /// Spawn the writer task over `writer`
    pub fn spawn<W>(writer: W) -> (Self, JoinHandle<std::io::Result<()>>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let batches = Arc::new(Batches {
            current: AtomicU64::new(1),
            failed: AtomicU64::new(0),
        });
        let handle = tokio::spawn(run_writer(writer, rx, batches.clone()));
        (Self { tx, batches }, handle)
    }

    fn batch(&self) -> u64 {
        self.batches.current.load(Ordering::SeqCst)
    }

    /// Queue frames behind everything submitted so far
    pub fn write(&self, bytes: Bytes) -> Result<(), PgWireError> {
        let batch = self.batch();
        self.tx.send(Segment::Frames { batch, bytes }).map_err(|_| closed())
    }

    pub fn write_message(&self, message: &BackendMessage) -> Result<(), PgWireError> {
        self.write(message.to_bytes())
    }

    /// Queue `message` unconditionally and start a new batch.
    ///
    /// Used for ReadyForQuery, and for fatal errors that must reach the
    /// client even when the batch was already failed.
    pub fn end_batch(&self, message: &BackendMessage) -> Result<(), PgWireError> {
        self.tx
            .send(Segment::EndOfBatch(message.to_bytes()))
            .map_err(|_| closed())?;
        self.batches.current.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Reserve a slot for an execution's response.
    ///
    /// Writes issued after this call are held back until the returned
    /// `DelayedWrites` is finished or dropped. The future resolves once the
    /// slot has been fully written.
    pub fn delay_writes(&self) -> Result<(DelayedWrites, CompletionFuture), PgWireError> {
        let (delivery_tx, deliveries) = mpsc::unbounded_channel();
        let (done, done_rx) = oneshot::channel();
        let batch = self.batch();
        self.tx
            .send(Segment::Delayed { batch, deliveries, done })
            .map_err(|_| closed())?;
        let completion = done_rx
            .map(|outcome| outcome.unwrap_or(ExecutionOutcome::Interrupted))
            .boxed()
            .shared();
        Ok((
            DelayedWrites {
                tx: delivery_tx,
                batch,
                batches: self.batches.clone(),
                finished: false,
            },
            completion,
        ))
    }
}

fn closed() -> PgWireError {
    PgWireError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "connection writer has shut down",
    ))
}

/// Producer side of a reserved slot
pub struct DelayedWrites {
    tx: mpsc::UnboundedSender<Delivery>,
    batch: u64,
    batches: Arc<Batches>,
    finished: bool,
}

impl DelayedWrites {
    /// True when an earlier slot of the same batch already failed; anything
    /// sent here will be discarded
    pub fn batch_failed(&self) -> bool {
        self.batches.has_failed(self.batch)
    }

    /// Hand a chunk of frames to the writer; false once the connection is gone
    pub fn send(&self, bytes: Bytes) -> bool {
        bytes.is_empty() || self.tx.send(Delivery::Frames(bytes)).is_ok()
    }

    /// Close the slot with its outcome
    pub fn finish(mut self, outcome: ExecutionOutcome) {
        self.finished = true;
        let _ = self.tx.send(Delivery::Finished(outcome));
    }
}

impl Drop for DelayedWrites {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Delayed writes dropped without an outcome");
        }
    }
}

async fn run_writer<W>(
    mut writer: W,
    mut segments: mpsc::UnboundedReceiver<Segment>,
    batches: Arc<Batches>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(segment) = segments.recv().await {
        match segment {
            Segment::Frames { batch, bytes } => {
                if batches.has_failed(batch) {
                    trace!(batch, bytes = bytes.len(), "Discarding frames after failed execution");
                } else {
                    writer.write_all(&bytes).await?;
                }
            }
            Segment::Delayed {
                batch,
                mut deliveries,
                done,
            } => {
                let discard = batches.has_failed(batch);
                // A failed write drops `done`, which resolves the completion as Interrupted
                let outcome = drain_delayed(&mut writer, &mut deliveries, discard).await?;
                if matches!(outcome, ExecutionOutcome::Failed(_)) {
                    batches.failed.fetch_max(batch, Ordering::SeqCst);
                }
                let _ = done.send(outcome);
            }
            Segment::EndOfBatch(bytes) => writer.write_all(&bytes).await?,
        }
        if segments.is_empty() {
            writer.flush().await?;
        }
    }
    writer.flush().await?;
    writer.shutdown().await
}

async fn drain_delayed<W>(
    writer: &mut W,
    deliveries: &mut mpsc::UnboundedReceiver<Delivery>,
    discard: bool,
) -> std::io::Result<ExecutionOutcome>
where
    W: AsyncWrite + Unpin,
{
    loop {
        match deliveries.recv().await {
            Some(Delivery::Frames(_)) if discard => {}
            Some(Delivery::Frames(bytes)) => {
                writer.write_all(&bytes).await?;
                writer.flush().await?;
            }
            Some(Delivery::Finished(outcome)) => return Ok(outcome),
            None if discard => return Ok(ExecutionOutcome::Failed("discarded".to_string())),
            None => {
                // Producer vanished (panicked or was dropped) without finishing
                let message = "execution ended without producing a response".to_string();
                warn!("{}", message);
                let error = BackendMessage::ErrorResponse(ErrorFields {
                    severity: SEVERITY_ERROR.to_string(),
                    code: sqlstate::INTERNAL_ERROR.to_string(),
                    message: message.clone(),
                    ..Default::default()
                });
                writer.write_all(&error.to_bytes()).await?;
                return Ok(ExecutionOutcome::Failed(message));
            }
        }
    }
}
