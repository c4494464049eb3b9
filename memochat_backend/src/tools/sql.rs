//! SQL access to the chat store for model tools and the HTTP API.
//!
//! Every caller-supplied statement passes [`validate_query`] first. The
//! natural-language front end only maps requests onto fixed, parameterized
//! queries; it never splices user text into SQL.

use anyhow::Result;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

use super::safety::{validate_query, SqlVerdict};
use crate::database::{like_contains_pattern, ChatDatabase, MemoryTypeCount};

const DIRECT_ROW_PREVIEW: usize = 20;
const NL_ROW_PREVIEW: usize = 10;

pub const NL_SUGGESTION: &str = "Try requests like: 'show recent conversations', 'how many conversations', 'show active tasks', 'search for \"rust\"', 'show stats'";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SqlOutcome {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
        row_count: usize,
    },
    Changes {
        changes: usize,
    },
    Rejected {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub not_null: bool,
    pub default: Option<String>,
    pub primary_key: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub row_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaInfo {
    pub tables: Vec<TableInfo>,
    pub total_tables: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslationError {
    #[error("could not extract a search term from the request")]
    MissingSearchTerm,

    #[error("could not convert request to SQL: {0}")]
    Unrecognized(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct NaturalLanguageResult {
    pub original_request: String,
    pub generated_sql: String,
    pub outcome: SqlOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoleStats {
    pub role: String,
    pub message_count: usize,
    pub avg_message_length: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyActivity {
    pub date: String,
    pub conversations_started: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusShare {
    pub status: String,
    pub task_count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationInsights {
    pub conversation_id: Option<String>,
    pub message_stats: Vec<RoleStats>,
    pub conversation_activity: Vec<DailyActivity>,
    pub task_completion: Vec<TaskStatusShare>,
    pub memory_distribution: Vec<MemoryTypeCount>,
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn to_json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<blob {} bytes>", bytes.len())),
    }
}

fn run_statement(conn: &Connection, query: &str, params: &[Value]) -> Result<SqlOutcome> {
    let mut stmt = conn.prepare(query)?;
    let bound = params_from_iter(params.iter().map(to_sql_value));

    if stmt.column_count() == 0 {
        let changes = stmt.execute(bound)?;
        return Ok(SqlOutcome::Changes { changes });
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
    let width = columns.len();
    let mut rows = Vec::new();
    let mut cursor = stmt.query(bound)?;
    while let Some(row) = cursor.next()? {
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            values.push(to_json_value(row.get_ref(idx)?));
        }
        rows.push(values);
    }
    Ok(SqlOutcome::Rows {
        row_count: rows.len(),
        columns,
        rows,
    })
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Pull the search term out of requests like `search for "x"` or `find x`.
pub fn extract_search_term(request: &str) -> Option<String> {
    const PATTERNS: &[&str] = &[
        r#"(?i)search for "([^"]+)""#,
        r"(?i)search for '([^']+)'",
        r"(?i)search for ([A-Za-z0-9_]+)",
        r"(?i)find messages about ([A-Za-z0-9_]+)",
        r"(?i)search messages for ([A-Za-z0-9_]+)",
        r"(?i)find ([A-Za-z0-9_]+)",
    ];
    PATTERNS.iter().find_map(|pattern| {
        regex_lite::Regex::new(pattern)
            .ok()?
            .captures(request)?
            .get(1)
            .map(|m| m.as_str().trim().to_string())
            .filter(|term| !term.is_empty())
    })
}

/// Map a plain-language request onto one of the canned queries.
pub fn natural_language_to_sql(request: &str) -> Result<GeneratedQuery, TranslationError> {
    let lowered = request.to_lowercase();
    let canned = |sql: &str| {
        Ok(GeneratedQuery {
            sql: sql.to_string(),
            params: Vec::new(),
        })
    };

    if lowered.contains("how many") && lowered.contains("conversation") {
        canned("SELECT COUNT(*) AS conversation_count FROM conversations")
    } else if lowered.contains("recent conversation") || lowered.contains("latest conversation") {
        canned(
            "SELECT id, title, created_at, updated_at FROM conversations \
             ORDER BY updated_at DESC LIMIT 10",
        )
    } else if lowered.contains("user preference") && lowered.contains("show") {
        canned(
            "SELECT conversation_id, state_data, timestamp FROM agent_state \
             WHERE state_type = 'user_preferences' ORDER BY timestamp DESC, id DESC",
        )
    } else if lowered.contains("active task") {
        canned(
            "SELECT task_name, description, status, priority, created_at FROM tasks \
             WHERE status != 'completed' ORDER BY priority DESC, created_at ASC",
        )
    } else if (lowered.contains("memory") || lowered.contains("memories"))
        && lowered.contains("important")
    {
        canned(
            "SELECT memory_type, content, importance, created_at FROM agent_memory \
             WHERE importance >= 3 ORDER BY importance DESC, created_at DESC LIMIT 20",
        )
    } else if lowered.contains("search") || lowered.contains("find") {
        let term = extract_search_term(request).ok_or(TranslationError::MissingSearchTerm)?;
        Ok(GeneratedQuery {
            sql: "SELECT m.content, m.role, m.timestamp, c.title FROM messages m \
                  JOIN conversations c ON m.conversation_id = c.id \
                  WHERE m.content LIKE ?1 ESCAPE '\\' \
                  ORDER BY m.timestamp DESC, m.id DESC LIMIT 20"
                .to_string(),
            params: vec![Value::String(like_contains_pattern(&term))],
        })
    } else if lowered.contains("stats") || lowered.contains("statistics") {
        canned(
            "SELECT (SELECT COUNT(*) FROM conversations) AS total_conversations, \
             (SELECT COUNT(*) FROM messages) AS total_messages, \
             (SELECT COUNT(*) FROM tasks) AS total_tasks, \
             (SELECT COUNT(*) FROM agent_memory) AS total_memories",
        )
    } else {
        Err(TranslationError::Unrecognized(request.to_string()))
    }
}

/// Pull SQL out of a ```sql fenced block or an `execute: SELECT ...` line.
fn extract_direct_sql(request: &str) -> Option<String> {
    let fenced = regex_lite::Regex::new(r"(?is)```sql\s*(.*?)\s*```").ok()?;
    if let Some(found) = fenced.captures(request).and_then(|c| c.get(1)) {
        return Some(found.as_str().trim().to_string());
    }
    let inline = regex_lite::Regex::new(r"(?im)execute:\s*(SELECT.*?)$").ok()?;
    inline
        .captures(request)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_table(columns: &[String], rows: &[Vec<Value>], limit: usize) -> String {
    let mut out = columns.join(" | ");
    out.push('\n');
    out.push_str(
        &columns
            .iter()
            .map(|c| "-".repeat(c.len().max(1)))
            .collect::<Vec<_>>()
            .join(" | "),
    );
    out.push('\n');
    for row in rows.iter().take(limit) {
        out.push_str(&row.iter().map(render_cell).collect::<Vec<_>>().join(" | "));
        out.push('\n');
    }
    if rows.len() > limit {
        out.push_str(&format!("\n... and {} more rows", rows.len() - limit));
    }
    out
}

#[derive(Clone)]
pub struct SqlTools {
    db: Arc<ChatDatabase>,
}

impl SqlTools {
    pub fn new(db: Arc<ChatDatabase>) -> Self {
        Self { db }
    }

    /// Validate then run one statement with positional parameters.
    pub fn execute_sql(&self, query: &str, params: &[Value]) -> Result<SqlOutcome> {
        if let SqlVerdict::Block(reason) = validate_query(query) {
            tracing::warn!("Rejected SQL: {} ({})", query.trim(), reason);
            return Ok(SqlOutcome::Rejected { reason });
        }
        let query = query.trim().trim_end_matches(';');
        self.db
            .with_connection(|conn| run_statement(conn, query, params))
    }

    pub fn get_schema_info(&self) -> Result<SchemaInfo> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut tables = Vec::with_capacity(names.len());
            for name in names {
                let quoted = quote_identifier(&name);
                let mut info = conn.prepare(&format!("PRAGMA table_info({})", quoted))?;
                let columns = info
                    .query_map([], |row| {
                        Ok(ColumnInfo {
                            name: row.get(1)?,
                            data_type: row.get(2)?,
                            not_null: row.get::<_, i64>(3)? != 0,
                            default: row.get(4)?,
                            primary_key: row.get::<_, i64>(5)? != 0,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                let row_count: i64 = conn.query_row(
                    &format!("SELECT COUNT(*) FROM {}", quoted),
                    [],
                    |row| row.get(0),
                )?;
                tables.push(TableInfo {
                    name,
                    columns,
                    row_count: row_count as usize,
                });
            }

            Ok(SchemaInfo {
                total_tables: tables.len(),
                tables,
            })
        })
    }

    pub fn natural_language_to_sql(&self, request: &str) -> Result<GeneratedQuery, TranslationError> {
        natural_language_to_sql(request)
    }

    /// Translate and run. Translation failures come back as a [`TranslationError`].
    pub fn execute_natural_language_query(&self, request: &str) -> Result<NaturalLanguageResult> {
        let generated = natural_language_to_sql(request)?;
        let outcome = self.execute_sql(&generated.sql, &generated.params)?;
        Ok(NaturalLanguageResult {
            original_request: request.to_string(),
            generated_sql: generated.sql,
            outcome,
        })
    }

    pub fn get_conversation_insights(
        &self,
        conversation_id: Option<&str>,
    ) -> Result<ConversationInsights> {
        let memory_distribution = self.db.memory_distribution()?;
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT role, COUNT(*), AVG(LENGTH(content)) FROM messages
                 WHERE ?1 IS NULL OR conversation_id = ?1
                 GROUP BY role ORDER BY role",
            )?;
            let message_stats = stmt
                .query_map([conversation_id], |row| {
                    Ok(RoleStats {
                        role: row.get(0)?,
                        message_count: row.get::<_, i64>(1)? as usize,
                        avg_message_length: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut stmt = conn.prepare(
                "SELECT substr(created_at, 1, 10) AS day, COUNT(*) FROM conversations
                 GROUP BY day ORDER BY day DESC LIMIT 30",
            )?;
            let conversation_activity = stmt
                .query_map([], |row| {
                    Ok(DailyActivity {
                        date: row.get(0)?,
                        conversations_started: row.get::<_, i64>(1)? as usize,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*),
                        ROUND(COUNT(*) * 100.0 / (SELECT COUNT(*) FROM tasks), 2)
                 FROM tasks GROUP BY status ORDER BY COUNT(*) DESC, status",
            )?;
            let task_completion = stmt
                .query_map([], |row| {
                    Ok(TaskStatusShare {
                        status: row.get(0)?,
                        task_count: row.get::<_, i64>(1)? as usize,
                        percentage: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(ConversationInsights {
                conversation_id: conversation_id.map(str::to_string),
                message_stats,
                conversation_activity,
                task_completion,
                memory_distribution,
            })
        })
    }

    /// Answer a free-form database request as readable text. Errors are
    /// rendered into the text rather than returned.
    pub fn process_database_request(&self, request: &str) -> String {
        let lowered = request.to_lowercase();
        let rendered = if ["schema", "structure", "tables", "columns"]
            .iter()
            .any(|word| lowered.contains(word))
        {
            self.describe_schema()
        } else if ["insight", "analytics", "summary"]
            .iter()
            .any(|word| lowered.contains(word))
        {
            self.describe_insights()
        } else if lowered.contains("sql") && (lowered.contains("execute") || lowered.contains("run")) {
            self.describe_direct_sql(request)
        } else {
            self.describe_natural_language(request)
        };

        rendered.unwrap_or_else(|e| format!("Error: {}", e))
    }

    fn describe_schema(&self) -> Result<String> {
        let schema = self.get_schema_info()?;
        let mut out = format!("Database schema ({} tables):\n\n", schema.total_tables);
        for table in &schema.tables {
            out.push_str(&format!("{} ({} rows)\n", table.name, table.row_count));
            for column in &table.columns {
                out.push_str(&format!(
                    "  • {}: {}{}{}\n",
                    column.name,
                    column.data_type,
                    if column.primary_key { " (PRIMARY KEY)" } else { "" },
                    if column.not_null { " NOT NULL" } else { "" },
                ));
            }
            out.push('\n');
        }
        Ok(out)
    }

    fn describe_insights(&self) -> Result<String> {
        let insights = self.get_conversation_insights(None)?;
        let mut out = String::from("Database insights:\n\n");

        out.push_str("Message statistics:\n");
        for stats in &insights.message_stats {
            out.push_str(&format!(
                "  • {}: {} messages (avg {:.0} chars)\n",
                stats.role, stats.message_count, stats.avg_message_length
            ));
        }
        out.push_str("\nTask completion:\n");
        for share in &insights.task_completion {
            out.push_str(&format!(
                "  • {}: {} tasks ({}%)\n",
                share.status, share.task_count, share.percentage
            ));
        }
        out.push_str("\nMemory distribution:\n");
        for entry in &insights.memory_distribution {
            out.push_str(&format!(
                "  • {}: {} memories (importance: {:.1})\n",
                entry.memory_type, entry.count, entry.avg_importance
            ));
        }
        Ok(out)
    }

    fn describe_direct_sql(&self, request: &str) -> Result<String> {
        let Some(query) = extract_direct_sql(request) else {
            return Ok(
                "Could not extract a SQL query from the request. Wrap it in a ```sql block."
                    .to_string(),
            );
        };

        Ok(match self.execute_sql(&query, &[])? {
            SqlOutcome::Rejected { reason } => {
                format!("Query rejected: {}\nQuery: {}", reason, query)
            }
            SqlOutcome::Changes { changes } => {
                format!("Query executed successfully. Changes: {}", changes)
            }
            SqlOutcome::Rows {
                columns,
                rows,
                row_count,
            } => {
                let mut out = format!("Query executed successfully ({} rows):\n\n", row_count);
                if rows.is_empty() {
                    out.push_str("No data returned.");
                } else {
                    out.push_str(&render_table(&columns, &rows, DIRECT_ROW_PREVIEW));
                }
                out
            }
        })
    }

    fn describe_natural_language(&self, request: &str) -> Result<String> {
        let generated = match natural_language_to_sql(request) {
            Ok(generated) => generated,
            Err(e) => {
                return Ok(format!(
                    "Could not process request: {}\n{}",
                    e, NL_SUGGESTION
                ))
            }
        };

        let mut out = format!(
            "Results for: '{}'\nGenerated SQL:\n```sql\n{}\n```\n\n",
            request, generated.sql
        );
        match self.execute_sql(&generated.sql, &generated.params)? {
            SqlOutcome::Rows { columns, rows, .. } if !rows.is_empty() => {
                out.push_str(&render_table(&columns, &rows, NL_ROW_PREVIEW));
            }
            SqlOutcome::Rejected { reason } => out.push_str(&format!("Query rejected: {}", reason)),
            _ => out.push_str("No data found."),
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{MessageRole, TaskStatus};
    use crate::payload::MemoryKind;

    fn seeded() -> (SqlTools, String) {
        let db = Arc::new(ChatDatabase::open_in_memory().expect("db init"));
        let conversation = db.create_conversation(Some("Rust help")).expect("create");
        db.add_message(&conversation.id, MessageRole::User, "How do lifetimes work in rust?")
            .expect("user");
        db.add_message(&conversation.id, MessageRole::Assistant, "They describe borrows.")
            .expect("assistant");
        let task = db
            .create_task(&conversation.id, "Learn lifetimes", None, 2)
            .expect("task");
        db.create_task(&conversation.id, "Read the book", None, 1)
            .expect("task");
        db.update_task_status(&task.id, &TaskStatus::Completed)
            .expect("complete");
        db.store_memory(Some(&conversation.id), &MemoryKind::ImportantFacts, "Learning Rust", 3)
            .expect("memory");
        (SqlTools::new(db), conversation.id)
    }

    fn rows(outcome: SqlOutcome) -> (Vec<String>, Vec<Vec<Value>>) {
        match outcome {
            SqlOutcome::Rows { columns, rows, .. } => (columns, rows),
            other => panic!("expected rows, got {:?}", other),
        }
    }

    #[test]
    fn select_returns_columns_and_rows() {
        let (tools, _) = seeded();
        let (columns, data) = rows(
            tools
                .execute_sql("SELECT title FROM conversations WHERE title = ?1", &[json!("Rust help")])
                .expect("select"),
        );
        assert_eq!(columns, vec!["title"]);
        assert_eq!(data, vec![vec![json!("Rust help")]]);
    }

    #[test]
    fn writes_report_changes_and_unsafe_sql_is_rejected() {
        let (tools, conversation_id) = seeded();
        let outcome = tools
            .execute_sql(
                "UPDATE tasks SET priority = 5 WHERE conversation_id = ?1",
                &[json!(conversation_id)],
            )
            .expect("update");
        assert!(matches!(outcome, SqlOutcome::Changes { changes: 2 }));

        let outcome = tools.execute_sql("DELETE FROM messages", &[]).expect("delete");
        assert!(matches!(outcome, SqlOutcome::Rejected { .. }));
        let (_, data) = rows(tools.execute_sql("SELECT COUNT(*) FROM messages", &[]).expect("count"));
        assert_eq!(data[0][0], json!(2));
    }

    #[test]
    fn schema_lists_store_tables() {
        let (tools, _) = seeded();
        let schema = tools.get_schema_info().expect("schema");
        let names: Vec<&str> = schema.tables.iter().map(|t| t.name.as_str()).collect();
        for table in ["agent_memory", "agent_state", "conversations", "messages", "sessions", "tasks"] {
            assert!(names.contains(&table), "missing {}", table);
        }
        let messages = schema
            .tables
            .iter()
            .find(|t| t.name == "messages")
            .expect("messages");
        assert_eq!(messages.row_count, 2);
        assert!(messages.columns.iter().any(|c| c.name == "role" && c.not_null));
    }

    #[test]
    fn requests_map_to_canned_queries() {
        assert!(natural_language_to_sql("How many conversations do I have?")
            .expect("count")
            .sql
            .contains("COUNT(*)"));
        assert!(natural_language_to_sql("show active tasks")
            .expect("tasks")
            .sql
            .contains("status != 'completed'"));
        assert_eq!(
            natural_language_to_sql("search messages please"),
            Err(TranslationError::MissingSearchTerm)
        );
        assert!(matches!(
            natural_language_to_sql("make me a sandwich"),
            Err(TranslationError::Unrecognized(_))
        ));
    }

    #[test]
    fn search_terms_are_bound_not_spliced() {
        assert_eq!(extract_search_term("search for \"borrow checker\""), Some("borrow checker".to_string()));
        assert_eq!(extract_search_term("Find lifetimes"), Some("lifetimes".to_string()));

        let generated = natural_language_to_sql("search for '100%'").expect("search");
        assert!(!generated.sql.contains("100"));
        assert_eq!(generated.params, vec![json!("%100\\%%")]);
    }

    #[test]
    fn natural_language_search_finds_messages() {
        let (tools, _) = seeded();
        let result = tools
            .execute_natural_language_query("search for lifetimes")
            .expect("query");
        let (columns, data) = rows(result.outcome);
        assert_eq!(columns[0], "content");
        assert_eq!(data.len(), 1);
        assert_eq!(data[0][3], json!("Rust help"));

        let err = tools
            .execute_natural_language_query("do something odd")
            .expect_err("unrecognized");
        assert!(err.downcast_ref::<TranslationError>().is_some());
    }

    #[test]
    fn insights_cover_roles_tasks_and_memories() {
        let (tools, conversation_id) = seeded();
        let insights = tools
            .get_conversation_insights(Some(&conversation_id))
            .expect("insights");
        assert_eq!(insights.message_stats.len(), 2);
        assert_eq!(insights.conversation_activity.len(), 1);
        let completed = insights
            .task_completion
            .iter()
            .find(|share| share.status == "completed")
            .expect("completed share");
        assert_eq!(completed.percentage, 50.0);
        assert_eq!(insights.memory_distribution[0].memory_type, "important_facts");

        let none = tools
            .get_conversation_insights(Some("missing"))
            .expect("insights");
        assert!(none.message_stats.is_empty());
    }

    #[test]
    fn database_requests_render_text() {
        let (tools, _) = seeded();
        assert!(tools
            .process_database_request("show me the schema")
            .contains("messages (2 rows)"));
        assert!(tools
            .process_database_request("give me insights")
            .contains("Memory distribution"));
        let direct = tools.process_database_request(
            "please run this sql:\n```sql\nSELECT task_name FROM tasks ORDER BY priority DESC\n```",
        );
        assert!(direct.contains("(2 rows)"));
        assert!(direct.contains("Learn lifetimes"));
        assert!(tools
            .process_database_request("execute sql ```sql\nDROP TABLE tasks\n```")
            .starts_with("Query rejected"));
        assert!(tools
            .process_database_request("how many conversations")
            .contains("conversation_count"));
        assert!(tools
            .process_database_request("tell me a joke")
            .starts_with("Could not process request"));
    }
}
