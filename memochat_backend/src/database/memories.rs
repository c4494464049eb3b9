//! Long-term memory: append-only notes tagged by kind and ranked by importance.
//!
//! `retrieve_memories` reads one pool shared by every conversation. The
//! conversation a memory came from is recorded but only used by
//! `retrieve_memories_for_conversation` and `promote_importance`.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{
    like_contains_pattern, now_timestamp, require_conversation, timestamp_column, ChatDatabase,
};
use crate::payload::{AgentDecision, MemoryKind, MemoryPayload, ResponseMetrics};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: i64,
    pub conversation_id: Option<String>,
    pub memory_type: MemoryKind,
    pub content: String,
    pub importance: i64,
    pub created_at: DateTime<Utc>,
}

impl Memory {
    pub fn payload(&self) -> MemoryPayload {
        MemoryPayload::decode(&self.memory_type, &self.content)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryTypeCount {
    pub memory_type: String,
    pub count: usize,
    pub avg_importance: f64,
}

const MEMORY_COLUMNS: &str =
    "id, conversation_id, memory_type, content, COALESCE(importance, 1), created_at";

fn map_memory(row: &Row<'_>) -> rusqlite::Result<Memory> {
    let memory_type: String = row.get(2)?;
    Ok(Memory {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        memory_type: MemoryKind::from_db(&memory_type),
        content: row.get(3)?,
        importance: row.get(4)?,
        created_at: timestamp_column(row, 5)?,
    })
}

fn insert_memory(
    conn: &Connection,
    conversation_id: Option<&str>,
    kind: &MemoryKind,
    content: &str,
    importance: i64,
) -> Result<i64> {
    if let Some(conversation_id) = conversation_id {
        require_conversation(conn, conversation_id)?;
    }
    conn.execute(
        "INSERT INTO agent_memory (conversation_id, memory_type, content, importance, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            conversation_id,
            kind.as_str(),
            content,
            importance.max(1),
            now_timestamp()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl ChatDatabase {
    /// Append a memory. Importance is clamped to at least 1.
    pub fn store_memory(
        &self,
        conversation_id: Option<&str>,
        kind: &MemoryKind,
        content: &str,
        importance: i64,
    ) -> Result<i64> {
        let conn = self.lock_conn()?;
        insert_memory(&conn, conversation_id, kind, content, importance)
    }

    /// Like [`store_memory`](Self::store_memory) but skips content already
    /// stored under the same kind (trimmed, ASCII case-insensitive exact match).
    /// The lookup and the insert share one transaction.
    pub fn store_memory_unique(
        &self,
        conversation_id: Option<&str>,
        kind: &MemoryKind,
        content: &str,
        importance: i64,
    ) -> Result<Option<i64>> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM agent_memory
                 WHERE memory_type = ?1 AND LOWER(TRIM(content)) = LOWER(TRIM(?2))
                 LIMIT 1",
                params![kind.as_str(), content],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Ok(None);
        }
        let id = insert_memory(&tx, conversation_id, kind, content, importance)?;
        tx.commit()?;
        Ok(Some(id))
    }

    /// Top memories of a kind across all conversations: importance, then recency.
    pub fn retrieve_memories(&self, kind: &MemoryKind, limit: usize) -> Result<Vec<Memory>> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {} FROM agent_memory
             WHERE memory_type = ?1
             ORDER BY importance DESC, created_at DESC, id DESC
             LIMIT ?2",
            MEMORY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let memories = stmt
            .query_map(params![kind.as_str(), limit as i64], map_memory)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(memories)
    }

    /// Same ranking as [`retrieve_memories`](Self::retrieve_memories), limited to one conversation.
    pub fn retrieve_memories_for_conversation(
        &self,
        conversation_id: &str,
        kind: &MemoryKind,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {} FROM agent_memory
             WHERE conversation_id = ?1 AND memory_type = ?2
             ORDER BY importance DESC, created_at DESC, id DESC
             LIMIT ?3",
            MEMORY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let memories = stmt
            .query_map(
                params![conversation_id, kind.as_str(), limit as i64],
                map_memory,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(memories)
    }

    /// Raise importance by one for a conversation's memories containing `pattern`.
    pub fn promote_importance(&self, conversation_id: &str, pattern: &str) -> Result<usize> {
        if pattern.trim().is_empty() {
            bail!("promotion pattern cannot be empty");
        }
        let conn = self.lock_conn()?;
        let promoted = conn.execute(
            "UPDATE agent_memory SET importance = COALESCE(importance, 1) + 1
             WHERE conversation_id = ?1 AND content LIKE ?2 ESCAPE '\\'",
            params![conversation_id, like_contains_pattern(pattern)],
        )?;
        tracing::debug!(
            "Promoted {} memories in {} matching '{}'",
            promoted,
            conversation_id,
            pattern
        );
        Ok(promoted)
    }

    pub fn track_agent_decision(
        &self,
        conversation_id: &str,
        context: &str,
        decision: &str,
    ) -> Result<i64> {
        let payload = MemoryPayload::AgentDecision(AgentDecision {
            context: context.to_string(),
            decision: decision.to_string(),
            timestamp: now_timestamp(),
        });
        self.store_memory(
            Some(conversation_id),
            &MemoryKind::AgentDecisions,
            &payload.encode()?,
            2,
        )
    }

    pub fn record_response_metrics(
        &self,
        conversation_id: &str,
        metrics: &ResponseMetrics,
    ) -> Result<i64> {
        let payload = MemoryPayload::ResponseMetrics(metrics.clone());
        self.store_memory(
            Some(conversation_id),
            &MemoryKind::ResponseMetrics,
            &payload.encode()?,
            1,
        )
    }

    /// Count and mean importance per memory type, largest first.
    pub fn memory_distribution(&self) -> Result<Vec<MemoryTypeCount>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT memory_type, COUNT(*), AVG(COALESCE(importance, 1))
             FROM agent_memory
             GROUP BY memory_type
             ORDER BY COUNT(*) DESC, memory_type ASC",
        )?;
        let counts = stmt
            .query_map([], |row| {
                Ok(MemoryTypeCount {
                    memory_type: row.get(0)?,
                    count: row.get::<_, i64>(1)? as usize,
                    avg_importance: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn retrieval_ranks_by_importance_then_recency() {
        let db = memory_db();
        let conversation = db.create_conversation(None).expect("create");
        for (content, importance) in [("three", 3), ("one", 1), ("two", 2)] {
            db.store_memory(
                Some(&conversation.id),
                &MemoryKind::Patterns,
                content,
                importance,
            )
            .expect("store");
        }

        let top = db
            .retrieve_memories(&MemoryKind::Patterns, 2)
            .expect("retrieve");
        let contents: Vec<&str> = top.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["three", "two"]);

        db.store_memory(None, &MemoryKind::Patterns, "newer two", 2)
            .expect("store");
        let top = db
            .retrieve_memories(&MemoryKind::Patterns, 3)
            .expect("retrieve");
        let contents: Vec<&str> = top.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["three", "newer two", "two"]);
    }

    #[test]
    fn memories_are_visible_from_unrelated_conversations() {
        let db = memory_db();
        let origin = db.create_conversation(Some("origin")).expect("origin");
        let other = db.create_conversation(Some("other")).expect("other");
        db.store_memory(Some(&origin.id), &MemoryKind::ImportantFacts, "X", 3)
            .expect("store");

        let global = db
            .retrieve_memories(&MemoryKind::ImportantFacts, 10)
            .expect("retrieve");
        assert_eq!(global.len(), 1);
        assert_eq!(global[0].content, "X");

        let scoped = db
            .retrieve_memories_for_conversation(&other.id, &MemoryKind::ImportantFacts, 10)
            .expect("scoped");
        assert!(scoped.is_empty());
    }

    #[test]
    fn importance_is_clamped_and_promotion_is_scoped() {
        let db = memory_db();
        let a = db.create_conversation(None).expect("a");
        let b = db.create_conversation(None).expect("b");
        db.store_memory(Some(&a.id), &MemoryKind::ImportantFacts, "likes Rust", 0)
            .expect("a1");
        db.store_memory(Some(&a.id), &MemoryKind::Patterns, "RUST questions", 1)
            .expect("a2");
        db.store_memory(Some(&b.id), &MemoryKind::ImportantFacts, "rust too", 1)
            .expect("b1");

        assert_eq!(db.promote_importance(&a.id, "rust").expect("promote"), 2);
        assert!(db.promote_importance(&a.id, "  ").is_err());

        let facts = db
            .retrieve_memories(&MemoryKind::ImportantFacts, 10)
            .expect("facts");
        let mine = facts.iter().find(|m| m.content == "likes Rust").expect("a1");
        let theirs = facts.iter().find(|m| m.content == "rust too").expect("b1");
        assert_eq!(mine.importance, 2);
        assert_eq!(theirs.importance, 1);
    }

    #[test]
    fn unique_store_skips_exact_duplicates() {
        let db = memory_db();
        assert!(db
            .store_memory_unique(None, &MemoryKind::ImportantFacts, "Uses Postgres", 2)
            .expect("first")
            .is_some());
        assert!(db
            .store_memory_unique(None, &MemoryKind::ImportantFacts, "  uses postgres ", 2)
            .expect("dup")
            .is_none());
        assert!(db
            .store_memory_unique(None, &MemoryKind::Patterns, "Uses Postgres", 2)
            .expect("other kind")
            .is_some());
    }

    #[test]
    fn concurrent_unique_stores_insert_once() {
        let db = memory_db();
        let stored: Vec<Option<i64>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        db.store_memory_unique(None, &MemoryKind::Patterns, "Prefers tabs", 1)
                            .expect("store")
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("join"))
                .collect()
        });

        assert_eq!(stored.iter().filter(|id| id.is_some()).count(), 1);
        assert_eq!(
            db.retrieve_memories(&MemoryKind::Patterns, 10)
                .expect("retrieve")
                .len(),
            1
        );
    }

    #[test]
    fn decisions_and_metrics_decode_typed() {
        let db = memory_db();
        let conversation = db.create_conversation(None).expect("create");
        db.track_agent_decision(&conversation.id, "user asked for brevity", "short answers")
            .expect("decision");
        db.record_response_metrics(
            &conversation.id,
            &ResponseMetrics {
                response_chars: 420,
                fragment_count: 12,
                duration_ms: 900,
                model: "qwen-3-coder-480b".to_string(),
            },
        )
        .expect("metrics");

        let decisions = db
            .retrieve_memories(&MemoryKind::AgentDecisions, 1)
            .expect("decisions");
        assert_eq!(decisions[0].importance, 2);
        match decisions[0].payload() {
            MemoryPayload::AgentDecision(decision) => {
                assert_eq!(decision.decision, "short answers")
            }
            other => panic!("unexpected payload: {:?}", other),
        }

        let distribution = db.memory_distribution().expect("distribution");
        assert_eq!(distribution.len(), 2);
        assert!(distribution.iter().all(|entry| entry.count == 1));
    }
}
