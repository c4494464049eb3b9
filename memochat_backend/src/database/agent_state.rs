//! Versioned per-conversation state.
//!
//! Rows are never updated: a write appends a full snapshot and a read takes
//! the newest one. Preferences use read-merge-append so the log doubles as
//! an audit trail of how they evolved.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

use super::{
    now_timestamp, require_conversation, timestamp_column, timestamp_not_before, ChatDatabase,
    MessageRole,
};
use crate::payload::{ConversationSummaryState, PreferenceMap, StateKind, StatePayload};

const RECENT_REQUESTS_IN_SUMMARY: usize = 5;
const REQUEST_PREVIEW_CHARS: usize = 80;

#[derive(Debug, Clone, Serialize)]
pub struct StateRecord {
    pub id: i64,
    pub conversation_id: String,
    pub state_type: String,
    /// `None` when the stored text is malformed for its kind.
    #[serde(skip)]
    pub payload: Option<StatePayload>,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

fn latest_state_raw(
    conn: &Connection,
    conversation_id: &str,
    state_type: &str,
) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT state_data FROM agent_state
             WHERE conversation_id = ?1 AND state_type = ?2
             ORDER BY timestamp DESC, id DESC
             LIMIT 1",
            params![conversation_id, state_type],
            |row| row.get(0),
        )
        .optional()?)
}

fn insert_state(
    conn: &Connection,
    conversation_id: &str,
    state_type: &str,
    state_data: &str,
) -> Result<i64> {
    let latest: Option<String> = conn.query_row(
        "SELECT MAX(timestamp) FROM agent_state WHERE conversation_id = ?1 AND state_type = ?2",
        params![conversation_id, state_type],
        |row| row.get(0),
    )?;
    conn.execute(
        "INSERT INTO agent_state (conversation_id, state_type, state_data, timestamp)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            conversation_id,
            state_type,
            state_data,
            timestamp_not_before(latest)
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn latest_preferences(conn: &Connection, conversation_id: &str) -> Result<PreferenceMap> {
    Ok(
        latest_state_raw(conn, conversation_id, StateKind::UserPreferences.as_str())?
            .and_then(|raw| StatePayload::decode(&StateKind::UserPreferences, &raw))
            .and_then(StatePayload::into_preferences)
            .unwrap_or_default(),
    )
}

impl ChatDatabase {
    /// Append a snapshot for the payload's kind.
    pub fn store_state(&self, conversation_id: &str, payload: &StatePayload) -> Result<i64> {
        let encoded = payload.encode()?;
        let conn = self.lock_conn()?;
        require_conversation(&conn, conversation_id)?;
        insert_state(&conn, conversation_id, payload.kind().as_str(), &encoded)
    }

    /// Append a snapshot under a free-form tag.
    pub fn store_raw_state(
        &self,
        conversation_id: &str,
        state_type: &str,
        data: &Value,
    ) -> Result<i64> {
        let encoded = serde_json::to_string(data).context("Failed to encode state payload")?;
        let conn = self.lock_conn()?;
        require_conversation(&conn, conversation_id)?;
        insert_state(&conn, conversation_id, state_type.trim(), &encoded)
    }

    /// Latest snapshot for `(conversation_id, kind)`, decoded.
    pub fn get_state(
        &self,
        conversation_id: &str,
        kind: &StateKind,
    ) -> Result<Option<StatePayload>> {
        let conn = self.lock_conn()?;
        Ok(latest_state_raw(&conn, conversation_id, kind.as_str())?
            .and_then(|raw| StatePayload::decode(kind, &raw)))
    }

    /// Snapshots for a kind, newest first.
    pub fn state_history(
        &self,
        conversation_id: &str,
        kind: &StateKind,
        limit: usize,
    ) -> Result<Vec<StateRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, state_type, state_data, timestamp
             FROM agent_state
             WHERE conversation_id = ?1 AND state_type = ?2
             ORDER BY timestamp DESC, id DESC
             LIMIT ?3",
        )?;
        let records = stmt
            .query_map(
                params![conversation_id, kind.as_str(), limit as i64],
                |row| {
                    let raw: String = row.get(3)?;
                    let payload = StatePayload::decode(kind, &raw);
                    let data = payload
                        .as_ref()
                        .map(StatePayload::to_value)
                        .unwrap_or(Value::Null);
                    Ok(StateRecord {
                        id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        state_type: row.get(2)?,
                        payload,
                        data,
                        timestamp: timestamp_column(row, 4)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn count_state_rows(&self, conversation_id: &str, kind: &StateKind) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM agent_state WHERE conversation_id = ?1 AND state_type = ?2",
            params![conversation_id, kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Current preference map, empty when none was stored (or it is unreadable).
    pub fn get_preferences(&self, conversation_id: &str) -> Result<PreferenceMap> {
        let conn = self.lock_conn()?;
        latest_preferences(&conn, conversation_id)
    }

    pub fn get_preference(&self, conversation_id: &str, key: &str, default: Value) -> Result<Value> {
        Ok(self
            .get_preferences(conversation_id)?
            .get(key)
            .cloned()
            .unwrap_or(default))
    }

    /// Set one preference: read the latest map, override `key`, append the whole map.
    pub fn store_preference(&self, conversation_id: &str, key: &str, value: Value) -> Result<()> {
        let mut updates = PreferenceMap::new();
        updates.insert(key.to_string(), value);
        self.store_preferences(conversation_id, updates)
    }

    /// Merge several keys into one new snapshot.
    pub fn store_preferences(&self, conversation_id: &str, updates: PreferenceMap) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        require_conversation(&tx, conversation_id)?;

        let mut preferences = latest_preferences(&tx, conversation_id)?;
        for (key, value) in updates {
            preferences.insert(key, value);
        }
        let encoded = StatePayload::UserPreferences(preferences).encode()?;
        insert_state(
            &tx,
            conversation_id,
            StateKind::UserPreferences.as_str(),
            &encoded,
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Read-modify-append in one transaction. `edit` sees the latest map;
    /// the result is written as a new snapshot and returned.
    pub fn update_preferences<F>(&self, conversation_id: &str, edit: F) -> Result<PreferenceMap>
    where
        F: FnOnce(&mut PreferenceMap),
    {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        require_conversation(&tx, conversation_id)?;

        let mut preferences = latest_preferences(&tx, conversation_id)?;
        edit(&mut preferences);
        let encoded = StatePayload::UserPreferences(preferences.clone()).encode()?;
        insert_state(
            &tx,
            conversation_id,
            StateKind::UserPreferences.as_str(),
            &encoded,
        )?;
        tx.commit()?;
        Ok(preferences)
    }

    /// Record a summary snapshot once the conversation has more than
    /// `max_turns` turns. Returns the snapshot when one was written.
    pub fn summarize_conversation(
        &self,
        conversation_id: &str,
        max_turns: usize,
    ) -> Result<Option<ConversationSummaryState>> {
        let messages = self.get_messages(conversation_id)?;
        let turns = super::pair_turns(&messages);
        if turns.len() <= max_turns {
            return Ok(None);
        }

        let mut user_requests: Vec<String> = messages
            .iter()
            .rev()
            .filter(|m| m.role == MessageRole::User)
            .take(RECENT_REQUESTS_IN_SUMMARY)
            .map(|m| m.content.chars().take(REQUEST_PREVIEW_CHARS).collect())
            .collect();
        user_requests.reverse();

        let summary = ConversationSummaryState {
            total_messages: turns.len(),
            last_summarized: now_timestamp(),
            key_topics: Vec::new(),
            user_requests,
        };
        self.store_state(
            conversation_id,
            &StatePayload::ConversationSummary(summary.clone()),
        )?;
        tracing::debug!(
            "Summarized conversation {} at {} turns",
            conversation_id,
            summary.total_messages
        );
        Ok(Some(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::error::is_not_found;
    use crate::payload::CurrentTaskState;
    use serde_json::json;

    #[test]
    fn snapshot_after_a_clock_step_back_is_still_latest() {
        let db = memory_db();
        let conversation = db.create_conversation(None).expect("create");
        db.store_preference(&conversation.id, "tone", json!("casual"))
            .expect("first");
        let ahead = super::super::format_timestamp(Utc::now() + chrono::Duration::hours(1));
        db.with_connection(|conn| {
            conn.execute("UPDATE agent_state SET timestamp = ?1", params![ahead])?;
            Ok(())
        })
        .expect("shift clock");

        db.store_preference(&conversation.id, "tone", json!("formal"))
            .expect("second");
        assert_eq!(
            db.get_preference(&conversation.id, "tone", json!(null))
                .expect("tone"),
            json!("formal")
        );
        let stamps: Vec<String> = db
            .with_connection(|conn| {
                let mut stmt = conn.prepare("SELECT timestamp FROM agent_state ORDER BY id")?;
                let stamps = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(stamps)
            })
            .expect("timestamps");
        assert!(stamps[1] >= stamps[0]);
    }

    #[test]
    fn preferences_keep_last_written_values_and_history() {
        let db = memory_db();
        let conversation = db.create_conversation(Some("prefs")).expect("create");
        let id = conversation.id.as_str();

        db.store_preference(id, "language", json!("Python")).expect("p1");
        db.store_preference(id, "framework", json!("Flask")).expect("p2");
        db.store_preference(id, "editor", json!("vim")).expect("p3");
        for value in ["Rust", "Go", "Zig"] {
            db.store_preference(id, "language", json!(value))
                .expect("overwrite");
        }

        let prefs = db.get_preferences(id).expect("prefs");
        assert_eq!(prefs.len(), 3);
        assert_eq!(prefs["language"], json!("Zig"));
        assert_eq!(prefs["framework"], json!("Flask"));
        assert_eq!(
            db.get_preference(id, "editor", json!(null)).expect("get"),
            json!("vim")
        );
        assert_eq!(
            db.get_preference(id, "missing", json!(0)).expect("default"),
            json!(0)
        );

        // `language` written M = 4 times, N = 3 distinct keys.
        let (m, n) = (4, 3);
        assert_eq!(
            db.count_state_rows(id, &StateKind::UserPreferences)
                .expect("count"),
            m + (n - 1)
        );
    }

    #[test]
    fn restoring_unchanged_preferences_keeps_keys_and_order() {
        let db = memory_db();
        let conversation = db.create_conversation(None).expect("create");
        let mut prefs = PreferenceMap::new();
        prefs.insert("zeta".to_string(), json!(1));
        prefs.insert("alpha".to_string(), json!({"nested": true}));
        prefs.insert("beta".to_string(), json!("x"));

        db.store_state(&conversation.id, &StatePayload::UserPreferences(prefs.clone()))
            .expect("store");
        let fetched = db.get_preferences(&conversation.id).expect("get");
        db.store_state(&conversation.id, &StatePayload::UserPreferences(fetched))
            .expect("restore");
        let again = db.get_preferences(&conversation.id).expect("get again");

        assert_eq!(again, prefs);
        let keys: Vec<&str> = again.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "beta"]);
    }

    #[test]
    fn state_is_scoped_per_conversation_and_latest_wins() {
        let db = memory_db();
        let a = db.create_conversation(Some("a")).expect("a");
        let b = db.create_conversation(Some("b")).expect("b");

        let first = StatePayload::CurrentTask(CurrentTaskState {
            task: "draft schema".to_string(),
            task_id: None,
            notes: None,
        });
        let second = StatePayload::CurrentTask(CurrentTaskState {
            task: "write migrations".to_string(),
            task_id: Some("t-2".to_string()),
            notes: None,
        });
        db.store_state(&a.id, &first).expect("first");
        db.store_state(&a.id, &second).expect("second");

        assert_eq!(
            db.get_state(&a.id, &StateKind::CurrentTask).expect("get"),
            Some(second)
        );
        assert!(db
            .get_state(&b.id, &StateKind::CurrentTask)
            .expect("get b")
            .is_none());

        let history = db
            .state_history(&a.id, &StateKind::CurrentTask, 10)
            .expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].data["task"], json!("write migrations"));
    }

    #[test]
    fn malformed_snapshot_reads_as_absent() {
        let db = memory_db();
        let conversation = db.create_conversation(None).expect("create");
        db.with_connection(|conn| {
            insert_state(conn, &conversation.id, "user_preferences", "{broken")?;
            Ok(())
        })
        .expect("seed");

        assert!(db
            .get_state(&conversation.id, &StateKind::UserPreferences)
            .expect("get")
            .is_none());
        assert!(db.get_preferences(&conversation.id).expect("prefs").is_empty());

        db.store_preference(&conversation.id, "language", json!("Rust"))
            .expect("recover");
        assert_eq!(
            db.get_preferences(&conversation.id).expect("prefs")["language"],
            json!("Rust")
        );
    }

    #[test]
    fn unknown_state_types_round_trip_opaque() {
        let db = memory_db();
        let conversation = db.create_conversation(None).expect("create");
        db.store_raw_state(&conversation.id, "mood", &json!({"valence": 0.4}))
            .expect("store");
        let state = db
            .get_state(&conversation.id, &StateKind::from_db("mood"))
            .expect("get")
            .expect("present");
        assert_eq!(state.to_value(), json!({"valence": 0.4}));
    }

    #[test]
    fn writes_to_unknown_conversation_fail() {
        let db = memory_db();
        let err = db
            .store_preference("missing", "k", json!(1))
            .expect_err("should fail");
        assert!(is_not_found(&err));
    }

    #[test]
    fn summary_written_only_past_threshold() {
        let db = memory_db();
        let conversation = db.create_conversation(None).expect("create");
        for i in 0..3 {
            db.add_message(&conversation.id, MessageRole::User, &format!("question {}", i))
                .expect("user");
            db.add_message(&conversation.id, MessageRole::Assistant, "answer")
                .expect("assistant");
        }

        assert!(db
            .summarize_conversation(&conversation.id, 3)
            .expect("at threshold")
            .is_none());

        let summary = db
            .summarize_conversation(&conversation.id, 2)
            .expect("past threshold")
            .expect("summary");
        assert_eq!(summary.total_messages, 3);
        assert_eq!(
            summary.user_requests,
            vec!["question 0", "question 1", "question 2"]
        );
        assert!(matches!(
            db.get_state(&conversation.id, &StateKind::ConversationSummary)
                .expect("get"),
            Some(StatePayload::ConversationSummary(_))
        ));
    }
}
