//! PostgreSQL wire protocol definitions
//!
//! Contains type mappings, constants, and message builders for the PostgreSQL wire protocol.

pub mod constants;
pub mod messages;
pub mod types;
