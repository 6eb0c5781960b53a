//! pgbridge common library
//!
//! Error, configuration and identity types shared by the pgbridge crates.

pub mod config;
pub mod error;
pub mod identity;

// Re-export commonly used types
pub use config::ServerConfig;
pub use error::{PgWireError, Result};
pub use identity::{Identity, IdentitySource};
