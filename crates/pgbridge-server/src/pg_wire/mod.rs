//! PostgreSQL wire protocol implementation
//!
//! Lets any PostgreSQL client (psql, JDBC, BI tools) connect and run SQL
//! while evaluation is delegated to pluggable backends.
//!
//! ## Module Structure
//!
//! - `config` - Protocol-facing configuration
//! - `protocol` - Wire protocol messages, types, and constants
//! - `decoder` - Connection-phase aware framing
//! - `query` - Statement splitting, command tags and intercepted commands
//! - `handler` - Server, connection, authentication and session handling
//!
//! ## Architecture
//!
//! 1. Connection arrives → SSL/GSSENC negotiation → startup → authentication
//! 2. Frames are dispatched one at a time to the connection's Session
//! 3. Execute and Query reserve a slot in the ordered writer, then run on the worker pool
//! 4. The writer drains slots in submission order; Sync waits for the tail

pub mod config;
pub mod decoder;
pub mod handler;
pub mod protocol;
pub mod query;

pub use config::PgWireConfig;
pub use handler::{serve_connection, PgWireServer, ServerContext};
