//! PostgreSQL command interception
//!
//! Session commands (SET, SHOW, BEGIN, ...) are answered with canned
//! responses and never reach an execution backend. Transactions are not
//! modeled, so these only need to look successful to the client.

use crate::backend::CannedResult;
use tracing::debug;

/// ParameterStatus values announced after authentication, in wire order
pub fn server_parameters(server_version: &str) -> Vec<(&'static str, String)> {
    vec![
        ("server_version", server_version.to_string()),
        ("server_encoding", "UTF8".to_string()),
        ("client_encoding", "UTF8".to_string()),
        ("DateStyle", "ISO".to_string()),
        ("TimeZone", "UTC".to_string()),
        ("integer_datetimes", "on".to_string()),
    ]
}

/// Handle PostgreSQL-specific commands that don't need a backend.
/// Returns Some(result) if the command was intercepted, None otherwise
pub fn handle_pg_specific_command(sql: &str, server_version: &str) -> Option<CannedResult> {
    let sql_trimmed = sql.trim().trim_end_matches(';').trim_end();
    let sql_upper = sql_trimmed.to_uppercase();
    let words: Vec<&str> = sql_upper.split_whitespace().collect();

    let result = match words.as_slice() {
        ["BEGIN", ..] | ["START", "TRANSACTION", ..] => CannedResult::command("BEGIN"),
        ["COMMIT", ..] | ["END", ..] => CannedResult::command("COMMIT"),
        ["ROLLBACK", ..] | ["ABORT", ..] => CannedResult::command("ROLLBACK"),
        ["SET", _, ..] => CannedResult::command("SET"),
        ["RESET", _, ..] => CannedResult::command("RESET"),
        ["DISCARD", _, ..] => CannedResult::command("DISCARD"),
        ["DEALLOCATE", _, ..] => CannedResult::command("DEALLOCATE"),
        ["SHOW", "TRANSACTION", "ISOLATION", ..] => {
            CannedResult::single_text("transaction_isolation", "read committed", "SHOW")
        }
        ["SHOW", _, ..] => {
            // Names match case-insensitively
            let name = sql_trimmed.get(4..).unwrap_or_default().trim();
            let value = server_parameters(server_version)
                .into_iter()
                .find(|(param, _)| param.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
                .unwrap_or_default();
            CannedResult::single_text(&name.to_lowercase(), &value, "SHOW")
        }
        _ => return None,
    };

    debug!(tag = %result.command_tag, "Intercepted session command");
    Some(result)
}
