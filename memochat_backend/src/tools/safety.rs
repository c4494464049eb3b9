//! Guards for SQL and tool parameters coming from a model or a remote caller.
//!
//! `validate_query` scans the statement with string literals and comments
//! blanked out, so a keyword inside `'...'` never trips a rule, a `;` inside a
//! literal is not a statement separator, and a commented-out `WHERE` does not
//! count as one.

use serde_json::Value;

/// Maximum depth for JSON parameter nesting
const MAX_JSON_DEPTH: usize = 10;

const MAX_PARAM_STRING_BYTES: usize = 1_000_000;

/// Statements that may be run at all.
const ALLOWED_LEADING_KEYWORDS: &[&str] = &["SELECT", "WITH", "INSERT", "UPDATE", "DELETE"];

/// Blocked anywhere in the statement.
const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    (r"(?i)\bPRAGMA\b", "PRAGMA"),
    (r"(?i)\bATTACH\b", "ATTACH"),
    (r"(?i)\bDETACH\b", "DETACH"),
    (r"(?i)\bCREATE\b", "CREATE"),
    (r"(?i)\bALTER\b", "ALTER"),
    (r"(?i)\bDROP\b", "DROP"),
    (r"(?i)\bVACUUM\b", "VACUUM"),
    (r"(?i)\bREINDEX\b", "REINDEX"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlVerdict {
    Allow,
    Block(String),
}

impl SqlVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, SqlVerdict::Allow)
    }
}

/// Replace the contents of `'...'` and `"..."` with spaces, keeping length,
/// and blank out `-- ...` and `/* ... */` comments entirely.
/// A doubled quote inside a literal is an escaped quote.
fn mask_literals_and_comments(sql: &str) -> String {
    let mut masked = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(ch) = chars.next() {
        match quote {
            None => match (ch, chars.peek().copied()) {
                ('\'', _) | ('"', _) => {
                    quote = Some(ch);
                    masked.push(ch);
                }
                ('-', Some('-')) => {
                    masked.push(' ');
                    while let Some(&next) = chars.peek() {
                        if next == '\n' {
                            break;
                        }
                        chars.next();
                        masked.push(' ');
                    }
                }
                ('/', Some('*')) => {
                    chars.next();
                    masked.push_str("  ");
                    let mut prev = '\0';
                    for next in chars.by_ref() {
                        masked.push(' ');
                        if prev == '*' && next == '/' {
                            break;
                        }
                        prev = next;
                    }
                }
                _ => masked.push(ch),
            },
            Some(q) if ch == q => {
                if chars.peek() == Some(&q) {
                    chars.next();
                    masked.push_str("  ");
                } else {
                    quote = None;
                    masked.push(ch);
                }
            }
            Some(_) => masked.push(' '),
        }
    }
    masked
}

fn leading_keyword(sql: &str) -> String {
    sql.trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or("")
        .to_ascii_uppercase()
}

/// Decide whether `sql` may be executed.
pub fn validate_query(sql: &str) -> SqlVerdict {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return SqlVerdict::Block("Empty query".to_string());
    }

    let masked = mask_literals_and_comments(trimmed);
    let body = masked.trim_end().trim_end_matches(';');
    if body.contains(';') {
        return SqlVerdict::Block("Multiple statements not allowed".to_string());
    }

    for (pattern, name) in DANGEROUS_PATTERNS {
        if let Ok(re) = regex_lite::Regex::new(pattern) {
            if re.is_match(body) {
                return SqlVerdict::Block(format!("{} statements are not allowed", name));
            }
        }
    }

    let keyword = leading_keyword(body);
    if !ALLOWED_LEADING_KEYWORDS.contains(&keyword.as_str()) {
        return SqlVerdict::Block(format!(
            "Unsupported statement '{}'; allowed: {}",
            keyword,
            ALLOWED_LEADING_KEYWORDS.join(", ")
        ));
    }

    if matches!(keyword.as_str(), "UPDATE" | "DELETE") {
        let has_where = regex_lite::Regex::new(r"(?i)\bWHERE\b")
            .map(|re| re.is_match(body))
            .unwrap_or(false);
        if !has_where {
            return SqlVerdict::Block(format!(
                "{} queries must include a WHERE clause",
                keyword
            ));
        }
    }

    SqlVerdict::Allow
}

/// Validate tool input parameters: bounded nesting and string sizes.
pub fn validate_input(params: &Value) -> SqlVerdict {
    if json_depth(params) > MAX_JSON_DEPTH {
        return SqlVerdict::Block(format!(
            "Parameter nesting depth exceeds maximum of {}",
            MAX_JSON_DEPTH
        ));
    }
    if let Some(large) = find_large_strings(params, MAX_PARAM_STRING_BYTES) {
        return SqlVerdict::Block(format!(
            "Parameter '{}' contains string value exceeding 1MB",
            large
        ));
    }
    SqlVerdict::Allow
}

fn json_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(json_depth).max().unwrap_or(0),
        Value::Array(arr) => 1 + arr.iter().map(json_depth).max().unwrap_or(0),
        _ => 1,
    }
}

fn find_large_strings(value: &Value, max_len: usize) -> Option<String> {
    match value {
        Value::String(s) if s.len() > max_len => Some("(root)".to_string()),
        Value::Object(map) => map.iter().find_map(|(key, val)| match val {
            Value::String(s) if s.len() > max_len => Some(key.clone()),
            _ => find_large_strings(val, max_len).map(|found| format!("{}.{}", key, found)),
        }),
        Value::Array(arr) => arr.iter().enumerate().find_map(|(i, val)| {
            find_large_strings(val, max_len).map(|found| format!("[{}].{}", i, found))
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocked(sql: &str) -> bool {
        !validate_query(sql).is_allowed()
    }

    #[test]
    fn plain_reads_and_scoped_writes_pass() {
        assert!(validate_query("SELECT * FROM conversations").is_allowed());
        assert!(validate_query("select count(*) from messages;").is_allowed());
        assert!(validate_query(
            "WITH recent AS (SELECT * FROM messages) SELECT COUNT(*) FROM recent"
        )
        .is_allowed());
        assert!(validate_query("UPDATE tasks SET status = 'completed' WHERE id = 'x'").is_allowed());
        assert!(validate_query("DELETE FROM agent_memory WHERE importance < 2").is_allowed());
    }

    #[test]
    fn schema_and_engine_statements_are_blocked() {
        assert!(blocked("PRAGMA table_info(messages)"));
        assert!(blocked("ATTACH DATABASE 'x.db' AS other"));
        assert!(blocked("DROP TABLE messages"));
        assert!(blocked("CREATE TABLE t (id INTEGER)"));
        assert!(blocked("ALTER TABLE tasks ADD COLUMN x TEXT"));
        assert!(blocked("VACUUM"));
    }

    #[test]
    fn unscoped_writes_are_blocked() {
        assert!(blocked("DELETE FROM messages"));
        assert!(blocked("UPDATE tasks SET status = 'completed'"));
        // WHERE inside a literal does not count.
        assert!(blocked("UPDATE tasks SET description = 'WHERE'"));
        // Nor inside a comment.
        assert!(blocked("DELETE FROM messages -- WHERE"));
        assert!(blocked("UPDATE tasks SET status='x' /* WHERE */"));
        assert!(blocked("DELETE FROM messages /* WHERE id = 1"));
    }

    #[test]
    fn comments_are_ignored_but_code_after_them_is_not() {
        assert!(validate_query("DELETE FROM messages -- stale rows\nWHERE id = 3").is_allowed());
        assert!(validate_query("SELECT 1 /* note */ FROM tasks").is_allowed());
        assert!(blocked("SELECT 1 /* x */; DROP TABLE tasks"));
        assert!(validate_query("SELECT '--' AS dashes WHERE 1 = 1").is_allowed());
    }

    #[test]
    fn multiple_statements_are_blocked() {
        assert!(blocked("SELECT 1; SELECT 2"));
        assert!(blocked("SELECT * FROM tasks; DROP TABLE tasks"));
    }

    #[test]
    fn literals_do_not_trip_keyword_or_separator_rules() {
        assert!(validate_query(
            "SELECT * FROM messages WHERE content LIKE '%drop table; pragma%'"
        )
        .is_allowed());
        assert!(validate_query("SELECT 'it''s; fine'").is_allowed());
    }

    #[test]
    fn unknown_or_empty_statements_are_blocked() {
        assert!(blocked("   "));
        assert!(blocked("REPLACE INTO tasks VALUES (1)"));
        assert!(blocked("EXPLAIN SELECT 1"));
    }

    #[test]
    fn deep_parameters_are_rejected() {
        let mut val = serde_json::json!("leaf");
        for _ in 0..15 {
            val = serde_json::json!({"nested": val});
        }
        assert!(!validate_input(&val).is_allowed());
        assert!(validate_input(&serde_json::json!({"query": "SELECT 1"})).is_allowed());
    }
}
