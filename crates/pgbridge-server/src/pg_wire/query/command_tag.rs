//! CommandComplete tags

/// Verbs whose tag never carries a row count
const BARE_VERBS: &[&str] = &["BEGIN", "COMMIT", "ROLLBACK", "SET", "RESET", "DISCARD", "DEALLOCATE"];

/// Uppercased first keyword of `sql`, skipping whitespace, comments and
/// opening parentheses
pub fn first_keyword(sql: &str) -> String {
    let mut rest = sql;
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map_or("", |(_, tail)| tail);
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map_or("", |(_, tail)| tail);
        } else {
            break;
        }
    }
    rest.chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_uppercase()
}

/// Tag for a statement that produced or affected `rows` rows
pub fn command_tag(sql: &str, rows: u64) -> String {
    let verb = first_keyword(sql);
    if verb == "INSERT" {
        format!("INSERT 0 {}", rows)
    } else if BARE_VERBS.contains(&verb.as_str()) {
        verb
    } else {
        format!("{} {}", verb, rows)
    }
}
