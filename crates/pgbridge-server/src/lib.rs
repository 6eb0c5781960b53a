//! pgbridge server library
//!
//! A PostgreSQL wire protocol front end. Clients connect with any standard
//! PostgreSQL driver; statements are routed to a data or metadata
//! `SessionHandler` supplied by the embedding application.
//!
//! ```ignore
//! let context = ServerContext::new(config, data_backend, metadata_backend, auth)
//!     .with_tls(load_tls_config(&settings.tls)?);
//! PgWireServer::new(addr, context).start().await?;
//! ```

pub mod auth;
pub mod backend;
pub mod errors;
pub mod metrics;
pub mod pg_wire;
pub mod telemetry;
pub mod tls_config;

pub use pg_wire::{serve_connection, PgWireConfig, PgWireServer, ServerContext};
