//! SQLite-backed store for conversations, messages and the agent memory that
//! is derived from them.
//!
//! One file, one connection behind a mutex. Every public call takes the lock
//! for its whole duration, and calls that touch more than one row open a
//! transaction, so each call is atomic on its own.

mod agent_state;
mod conversations;
mod maintenance;
mod memories;
mod sessions;
mod tasks;

pub use agent_state::StateRecord;
pub use conversations::{
    pair_turns, Conversation, ConversationStats, Message, MessageRole, RecentConversation, Turn,
};
pub use maintenance::{AgentStats, CleanupReport, RETENTION_IMPORTANCE_FLOOR};
pub use memories::{Memory, MemoryTypeCount};
pub use sessions::Session;
pub use tasks::{Task, TaskStatus};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::StoreError;

pub struct ChatDatabase {
    conn: Mutex<Connection>,
}

impl ChatDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()).into())
    }

    /// Create or open the database file, creating parent directories as needed.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        tracing::debug!("Opened {:?} (journal_mode={})", path, journal_mode);
        Self::from_connection(conn)
    }

    /// Private in-memory database; contents vanish when dropped.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    /// Run `f` against the locked connection.
    pub(crate) fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.lock_conn()?;
        f(&conn)
    }

    fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(columns.iter().any(|name| name == column))
    }

    /// Columns added after the first schema shipped. Additive only.
    fn ensure_added_columns(conn: &Connection) -> Result<()> {
        if !Self::table_has_column(conn, "agent_memory", "conversation_id")? {
            conn.execute("ALTER TABLE agent_memory ADD COLUMN conversation_id TEXT", [])?;
        }
        if !Self::table_has_column(conn, "tasks", "updated_at")? {
            conn.execute("ALTER TABLE tasks ADD COLUMN updated_at TEXT", [])?;
            conn.execute(
                "UPDATE tasks SET updated_at = created_at WHERE updated_at IS NULL",
                [],
            )?;
        }
        if !Self::table_has_column(conn, "sessions", "last_active")? {
            conn.execute("ALTER TABLE sessions ADD COLUMN last_active TEXT", [])?;
            conn.execute(
                "UPDATE sessions SET last_active = started_at WHERE last_active IS NULL",
                [],
            )?;
        }
        Ok(())
    }

    /// Create the database schema
    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agent_state (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                state_type TEXT NOT NULL,
                state_data TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                task_name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending',
                priority INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agent_memory (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT,
                memory_type TEXT NOT NULL,
                content TEXT NOT NULL,
                importance INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                session_data TEXT NOT NULL,
                started_at TEXT NOT NULL,
                last_active TEXT NOT NULL
            );
            "#,
        )?;

        Self::ensure_added_columns(&conn)?;

        conn.execute_batch(
            r#"
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_agent_state_conv
                ON agent_state(conversation_id);
            CREATE INDEX IF NOT EXISTS idx_agent_state_conv_type
                ON agent_state(conversation_id, state_type, timestamp);
            CREATE INDEX IF NOT EXISTS idx_tasks_conv
                ON tasks(conversation_id);
            CREATE INDEX IF NOT EXISTS idx_memory_conv
                ON agent_memory(conversation_id);
            CREATE INDEX IF NOT EXISTS idx_memory_type_importance
                ON agent_memory(memory_type, importance DESC, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_sessions_conv
                ON sessions(conversation_id);
            "#,
        )?;

        Ok(())
    }
}

/// Fixed-width RFC 3339 UTC text, so lexical order is chronological order.
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// The current time, or `latest` if the clock has stepped back behind it.
pub(crate) fn timestamp_not_before(latest: Option<String>) -> String {
    let now = now_timestamp();
    match latest {
        Some(latest) if latest > now => latest,
        _ => now,
    }
}

/// Accepts RFC 3339 and the `YYYY-MM-DD HH:MM:SS` form SQLite's
/// `CURRENT_TIMESTAMP` writes (rows from databases created by older tools).
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Read a timestamp column, mapping bad text to a conversion error.
pub(crate) fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unrecognized timestamp '{}'", raw).into(),
        )
    })
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern and wrap in wildcards.
pub(crate) fn like_contains_pattern(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len() + 2);
    escaped.push('%');
    for ch in needle.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

pub(crate) fn conversation_exists(conn: &Connection, conversation_id: &str) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM conversations WHERE id = ?1",
            [conversation_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

pub(crate) fn require_conversation(conn: &Connection, conversation_id: &str) -> Result<()> {
    if conversation_exists(conn, conversation_id)? {
        Ok(())
    } else {
        Err(StoreError::ConversationNotFound(conversation_id.to_string()).into())
    }
}
