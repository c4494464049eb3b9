use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{now_timestamp, require_conversation, timestamp_column, ChatDatabase};
use crate::error::StoreError;

/// One run of interaction against a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub conversation_id: String,
    pub data: Value,
    pub started_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

const SESSION_COLUMNS: &str =
    "id, conversation_id, session_data, started_at, COALESCE(last_active, started_at)";

fn map_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    let raw: String = row.get(2)?;
    let data = serde_json::from_str(&raw).unwrap_or_else(|e| {
        tracing::warn!("Ignoring malformed session payload: {}", e);
        Value::Null
    });
    Ok(Session {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        data,
        started_at: timestamp_column(row, 3)?,
        last_active: timestamp_column(row, 4)?,
    })
}

impl ChatDatabase {
    pub fn create_session(&self, conversation_id: &str, data: &Value) -> Result<Session> {
        let id = uuid::Uuid::new_v4().to_string();
        let encoded = serde_json::to_string(data).context("Failed to encode session data")?;
        let now = now_timestamp();
        let conn = self.lock_conn()?;
        require_conversation(&conn, conversation_id)?;
        conn.execute(
            "INSERT INTO sessions (id, conversation_id, session_data, started_at, last_active)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![id, conversation_id, encoded, now],
        )?;
        let sql = format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS);
        Ok(conn.query_row(&sql, [&id], map_session)?)
    }

    /// Replace the session payload and bump `last_active`.
    pub fn update_session(&self, session_id: &str, data: &Value) -> Result<()> {
        let encoded = serde_json::to_string(data).context("Failed to encode session data")?;
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE sessions SET session_data = ?2, last_active = ?3 WHERE id = ?1",
            params![session_id, encoded, now_timestamp()],
        )?;
        if changed == 0 {
            return Err(StoreError::SessionNotFound(session_id.to_string()).into());
        }
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let conn = self.lock_conn()?;
        let sql = format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS);
        Ok(conn.query_row(&sql, [session_id], map_session).optional()?)
    }

    pub fn latest_session_for_conversation(&self, conversation_id: &str) -> Result<Option<Session>> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {} FROM sessions WHERE conversation_id = ?1
             ORDER BY COALESCE(last_active, started_at) DESC, rowid DESC LIMIT 1",
            SESSION_COLUMNS
        );
        Ok(conn
            .query_row(&sql, [conversation_id], map_session)
            .optional()?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::error::is_not_found;
    use serde_json::json;

    #[test]
    fn session_lifecycle_updates_in_place() {
        let db = memory_db();
        let conversation = db.create_conversation(None).expect("create");
        let session = db
            .create_session(
                &conversation.id,
                &json!({"user_agent": "terminal", "initial_message": "hi"}),
            )
            .expect("session");
        assert_eq!(session.started_at, session.last_active);

        db.update_session(&session.id, &json!({"user_agent": "terminal", "turns": 3}))
            .expect("update");
        let fetched = db.get_session(&session.id).expect("get").expect("exists");
        assert_eq!(fetched.data["turns"], json!(3));
        assert!(fetched.last_active >= fetched.started_at);

        let latest = db
            .latest_session_for_conversation(&conversation.id)
            .expect("latest")
            .expect("exists");
        assert_eq!(latest.id, session.id);
    }

    #[test]
    fn updating_missing_session_is_not_found() {
        let db = memory_db();
        let err = db
            .update_session("nope", &json!({}))
            .expect_err("missing");
        assert!(is_not_found(&err));
        assert!(db.get_session("nope").expect("get").is_none());
    }
}
