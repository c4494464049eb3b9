use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::{format_timestamp, ChatDatabase, ConversationStats};
use crate::error::StoreError;

/// Memories at or above this importance survive the retention sweep.
pub const RETENTION_IMPORTANCE_FLOOR: i64 = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub states_removed: usize,
    pub memories_removed: usize,
    pub state_cutoff: String,
    pub memory_cutoff: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStats {
    #[serde(flatten)]
    pub conversations: ConversationStats,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub task_completion_rate: f64,
    pub total_memories: usize,
    /// Sessions touched in the last 24 hours.
    pub active_sessions: usize,
}

impl ChatDatabase {
    /// Drop agent state older than `days`, and low-importance memories older
    /// than twice that. The newest snapshot of each state kind in a
    /// conversation is always kept, however old.
    pub fn cleanup_old_states(&self, days: u32) -> Result<CleanupReport> {
        self.cleanup_as_of(Utc::now(), days)
    }

    pub(crate) fn cleanup_as_of(&self, now: DateTime<Utc>, days: u32) -> Result<CleanupReport> {
        let cutoff = |span: i64| {
            Duration::try_days(span)
                .and_then(|span| now.checked_sub_signed(span))
                .map(format_timestamp)
                .ok_or(StoreError::RetentionOutOfRange(days))
        };
        let state_cutoff = cutoff(i64::from(days))?;
        let memory_cutoff = cutoff(i64::from(days) * 2)?;

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let states_removed = tx.execute(
            "DELETE FROM agent_state
             WHERE timestamp < ?1
               AND EXISTS (
                   SELECT 1 FROM agent_state newer
                   WHERE newer.conversation_id = agent_state.conversation_id
                     AND newer.state_type = agent_state.state_type
                     AND (newer.timestamp > agent_state.timestamp
                          OR (newer.timestamp = agent_state.timestamp AND newer.id > agent_state.id))
               )",
            params![state_cutoff],
        )?;
        let memories_removed = tx.execute(
            "DELETE FROM agent_memory WHERE created_at < ?1 AND COALESCE(importance, 1) < ?2",
            params![memory_cutoff, RETENTION_IMPORTANCE_FLOOR],
        )?;
        tx.commit()?;

        tracing::info!(
            "Retention sweep ({} days): removed {} states, {} memories",
            days,
            states_removed,
            memories_removed
        );
        Ok(CleanupReport {
            states_removed,
            memories_removed,
            state_cutoff,
            memory_cutoff,
        })
    }

    pub fn get_agent_stats(&self) -> Result<AgentStats> {
        let conversations = self.get_stats()?;
        let active_since = format_timestamp(Utc::now() - Duration::days(1));

        let conn = self.lock_conn()?;
        let count = |sql: &str| -> Result<usize> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };
        let total_tasks = count("SELECT COUNT(*) FROM tasks")?;
        let completed_tasks = count("SELECT COUNT(*) FROM tasks WHERE status = 'completed'")?;
        let total_memories = count("SELECT COUNT(*) FROM agent_memory")?;
        let active_sessions: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE COALESCE(last_active, started_at) > ?1",
            params![active_since],
            |row| row.get(0),
        )?;

        let task_completion_rate = if total_tasks > 0 {
            completed_tasks as f64 / total_tasks as f64
        } else {
            0.0
        };

        Ok(AgentStats {
            conversations,
            total_tasks,
            completed_tasks,
            task_completion_rate,
            total_memories,
            active_sessions: active_sessions as usize,
        })
    }
}
