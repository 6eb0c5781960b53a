//! SQL text helpers used by the protocol handler
//!
//! Statement splitting for the simple query path, CommandComplete tags and
//! interception of session commands that never reach a backend.

pub mod command_tag;
pub mod pg_commands;
pub mod splitter;

pub use command_tag::command_tag;
pub use pg_commands::{handle_pg_specific_command, server_parameters};
pub use splitter::split_statements;
