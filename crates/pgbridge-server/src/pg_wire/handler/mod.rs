//! PostgreSQL wire protocol handler
//!
//! - `core` - ServerContext, PgWireServer and the accept loop
//! - `connection` - TLS negotiation, startup handling, TCP keepalive
//! - `auth` - Authentication flow (password, trust, GSS)
//! - `query_loop` - Steady-state dispatch with ignore-until-sync recovery
//! - `session` - Prepared statements, portals and execution submission
//! - `dispatcher` - Chooses the backend for each statement
//! - `delayed_writes` - Ordered result delivery over a single writer task
//! - `result_receiver` - Streams result sets into a delayed slot
//! - `worker_pool` - Bounded pool for synchronous backend calls
//! - `cancel` - CancelRequest registry and per-session flags

mod auth;
pub mod cancel;
mod connection;
pub mod core;
pub mod delayed_writes;
pub mod dispatcher;
mod query_loop;
pub mod result_receiver;
pub mod session;
pub mod worker_pool;

pub use self::core::{PgWireServer, ServerContext};
pub use cancel::{BackendKey, CancelFlag, CancelRegistry};
pub use connection::serve_connection;
pub use delayed_writes::{CompletionFuture, DelayableWriteChannel, ExecutionOutcome};
pub use dispatcher::{ExecutionDispatcher, Route};
pub use session::{ExecutionResources, Session};
pub use worker_pool::WorkerPool;
