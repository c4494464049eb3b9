use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{
    like_contains_pattern, now_timestamp, require_conversation, timestamp_column,
    timestamp_not_before, ChatDatabase,
};
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_db_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn from_db(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// One user message and the reply that answered it.
///
/// Either side may be absent: a user message still waiting for (or never
/// given) a reply, or an assistant message with no open user message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub user: Option<String>,
    pub assistant: Option<String>,
}

impl Turn {
    pub fn new(user: impl Into<String>, assistant: Option<String>) -> Self {
        Self {
            user: Some(user.into()),
            assistant,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentConversation {
    pub id: String,
    pub title: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationStats {
    pub total_conversations: usize,
    pub total_messages: usize,
    pub most_recent: Option<RecentConversation>,
}

/// Fold the flat message log into turns.
///
/// A user message opens a turn, flushing any turn still open without a
/// reply. An assistant message closes the open turn. A user message left
/// open at the end becomes a turn with no reply.
pub fn pair_turns(messages: &[Message]) -> Vec<Turn> {
    let mut turns = Vec::new();
    let mut open: Option<String> = None;

    for message in messages {
        match message.role {
            MessageRole::User => {
                if let Some(unanswered) = open.take() {
                    turns.push(Turn {
                        user: Some(unanswered),
                        assistant: None,
                    });
                }
                open = Some(message.content.clone());
            }
            MessageRole::Assistant => turns.push(Turn {
                user: open.take(),
                assistant: Some(message.content.clone()),
            }),
        }
    }

    if let Some(unanswered) = open {
        turns.push(Turn {
            user: Some(unanswered),
            assistant: None,
        });
    }

    turns
}

const CONVERSATION_COLUMNS: &str = r#"
    c.id,
    c.title,
    c.created_at,
    c.updated_at,
    (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id) AS message_count
"#;

fn map_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: timestamp_column(row, 2)?,
        updated_at: timestamp_column(row, 3)?,
        message_count: row.get::<_, i64>(4)? as usize,
    })
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let role_raw: String = row.get(2)?;
    let role = MessageRole::from_db(&role_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown message role '{}'", role_raw).into(),
        )
    })?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role,
        content: row.get(3)?,
        timestamp: timestamp_column(row, 4)?,
    })
}

fn query_conversation(conn: &Connection, conversation_id: &str) -> Result<Option<Conversation>> {
    let sql = format!(
        "SELECT {} FROM conversations c WHERE c.id = ?1",
        CONVERSATION_COLUMNS
    );
    Ok(conn
        .query_row(&sql, [conversation_id], map_conversation)
        .optional()?)
}

impl ChatDatabase {
    /// Create a new conversation and return it. A blank title becomes
    /// `Chat YYYY-MM-DD HH:MM`.
    pub fn create_conversation(&self, title: Option<&str>) -> Result<Conversation> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let now_str = super::format_timestamp(now);
        let title = title
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Chat {}", now.format("%Y-%m-%d %H:%M")));

        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO conversations (id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, title, now_str, now_str],
        )?;
        tracing::debug!("Created conversation {} ({})", id, title);

        Ok(Conversation {
            id,
            title,
            created_at: now,
            updated_at: now,
            message_count: 0,
        })
    }

    /// Fetch one conversation by ID.
    pub fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let conn = self.lock_conn()?;
        query_conversation(&conn, conversation_id)
    }

    /// Append a message and bump the parent's `updated_at`.
    ///
    /// The stored timestamp never precedes the conversation's latest message,
    /// so display order survives a clock stepping backwards.
    pub fn add_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<Message> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        require_conversation(&tx, conversation_id)?;

        let latest: Option<String> = tx.query_row(
            "SELECT MAX(timestamp) FROM messages WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        let timestamp = timestamp_not_before(latest);

        tx.execute(
            "INSERT INTO messages (conversation_id, role, content, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![conversation_id, role.as_db_str(), content, timestamp],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE conversations
             SET updated_at = CASE WHEN updated_at < ?2 THEN ?2 ELSE updated_at END
             WHERE id = ?1",
            params![conversation_id, timestamp],
        )?;
        let message = tx.query_row(
            "SELECT id, conversation_id, role, content, timestamp FROM messages WHERE id = ?1",
            [id],
            map_message,
        )?;
        tx.commit()?;

        Ok(message)
    }

    /// Every message of a conversation in display order.
    pub fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, timestamp
             FROM messages
             WHERE conversation_id = ?1 AND role IN ('user', 'assistant')
             ORDER BY timestamp ASC, id ASC",
        )?;
        let messages = stmt
            .query_map([conversation_id], map_message)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    /// The conversation as paired turns, oldest first.
    pub fn get_conversation_messages(&self, conversation_id: &str) -> Result<Vec<Turn>> {
        Ok(pair_turns(&self.get_messages(conversation_id)?))
    }

    /// All conversations, most recently active first.
    pub fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.list_recent_conversations(None)
    }

    pub fn list_recent_conversations(&self, limit: Option<usize>) -> Result<Vec<Conversation>> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {} FROM conversations c ORDER BY c.updated_at DESC, c.rowid DESC LIMIT ?1",
            CONVERSATION_COLUMNS
        );
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = conn.prepare(&sql)?;
        let conversations = stmt
            .query_map([limit], map_conversation)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(conversations)
    }

    pub fn update_conversation_title(&self, conversation_id: &str, title: &str) -> Result<()> {
        let title = title.trim();
        if title.is_empty() {
            bail!("conversation title cannot be empty");
        }
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE conversations SET title = ?2, updated_at = ?3 WHERE id = ?1",
            params![conversation_id, title, now_timestamp()],
        )?;
        if changed == 0 {
            return Err(StoreError::ConversationNotFound(conversation_id.to_string()).into());
        }
        Ok(())
    }

    /// Delete a conversation and everything scoped to it, in one transaction.
    ///
    /// Memories recorded against it are detached rather than deleted; they
    /// belong to the shared pool. Returns false when nothing matched.
    pub fn delete_conversation(&self, conversation_id: &str) -> Result<bool> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let messages = tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            [conversation_id],
        )?;
        tx.execute(
            "DELETE FROM agent_state WHERE conversation_id = ?1",
            [conversation_id],
        )?;
        tx.execute("DELETE FROM tasks WHERE conversation_id = ?1", [conversation_id])?;
        tx.execute(
            "DELETE FROM sessions WHERE conversation_id = ?1",
            [conversation_id],
        )?;
        tx.execute(
            "UPDATE agent_memory SET conversation_id = NULL WHERE conversation_id = ?1",
            [conversation_id],
        )?;
        let removed = tx.execute("DELETE FROM conversations WHERE id = ?1", [conversation_id])?;
        tx.commit()?;

        if removed > 0 {
            tracing::info!(
                "Deleted conversation {} ({} messages)",
                conversation_id,
                messages
            );
        }
        Ok(removed > 0)
    }

    /// Conversations whose title or any message contains `query`
    /// (ASCII case-insensitive), most recently active first.
    pub fn search_conversations(&self, query: &str) -> Result<Vec<Conversation>> {
        let query = query.trim();
        if query.is_empty() {
            return self.list_conversations();
        }
        let pattern = like_contains_pattern(query);
        let conn = self.lock_conn()?;
        let sql = format!(
            r#"SELECT {}
               FROM conversations c
               WHERE c.title LIKE ?1 ESCAPE '\'
                  OR EXISTS (
                      SELECT 1 FROM messages m
                      WHERE m.conversation_id = c.id AND m.content LIKE ?1 ESCAPE '\'
                  )
               ORDER BY c.updated_at DESC, c.rowid DESC"#,
            CONVERSATION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let conversations = stmt
            .query_map([pattern], map_conversation)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(conversations)
    }

    pub fn get_stats(&self) -> Result<ConversationStats> {
        let conn = self.lock_conn()?;
        let total_conversations: i64 =
            conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?;
        let total_messages: i64 =
            conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        let most_recent = conn
            .query_row(
                "SELECT id, title, updated_at FROM conversations
                 ORDER BY updated_at DESC, rowid DESC LIMIT 1",
                [],
                |row| {
                    Ok(RecentConversation {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        updated_at: timestamp_column(row, 2)?,
                    })
                },
            )
            .optional()?;

        Ok(ConversationStats {
            total_conversations: total_conversations as usize,
            total_messages: total_messages as usize,
            most_recent,
        })
    }
}
