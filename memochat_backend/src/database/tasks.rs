use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{now_timestamp, require_conversation, timestamp_column, ChatDatabase};
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Other(String),
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Other(raw) => raw.as_str(),
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw {
            "pending" => TaskStatus::Pending,
            "in_progress" => TaskStatus::InProgress,
            "completed" => TaskStatus::Completed,
            other => TaskStatus::Other(other.to_string()),
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, TaskStatus::Completed)
    }
}

impl From<String> for TaskStatus {
    fn from(raw: String) -> Self {
        TaskStatus::from_db(&raw)
    }
}

impl From<TaskStatus> for String {
    fn from(status: TaskStatus) -> Self {
        status.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub conversation_id: String,
    pub task_name: String,
    pub description: String,
    pub status: TaskStatus,
    /// Higher is more urgent.
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const TASK_COLUMNS: &str =
    "id, conversation_id, task_name, COALESCE(description, ''), COALESCE(status, 'pending'), COALESCE(priority, 1), created_at, COALESCE(updated_at, created_at)";

fn map_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(4)?;
    Ok(Task {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        task_name: row.get(2)?,
        description: row.get(3)?,
        status: TaskStatus::from_db(&status),
        priority: row.get(5)?,
        created_at: timestamp_column(row, 6)?,
        updated_at: timestamp_column(row, 7)?,
    })
}

impl ChatDatabase {
    pub fn create_task(
        &self,
        conversation_id: &str,
        task_name: &str,
        description: Option<&str>,
        priority: i64,
    ) -> Result<Task> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_timestamp();
        let conn = self.lock_conn()?;
        require_conversation(&conn, conversation_id)?;
        conn.execute(
            "INSERT INTO tasks (id, conversation_id, task_name, description, status, priority, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                id,
                conversation_id,
                task_name,
                description.unwrap_or(""),
                TaskStatus::Pending.as_str(),
                priority,
                now,
            ],
        )?;
        let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
        Ok(conn.query_row(&sql, [&id], map_task)?)
    }

    /// Set a task's status in place and bump `updated_at`.
    pub fn update_task_status(&self, task_id: &str, status: &TaskStatus) -> Result<()> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE tasks SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![task_id, status.as_str(), now_timestamp()],
        )?;
        if changed == 0 {
            return Err(StoreError::TaskNotFound(task_id.to_string()).into());
        }
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let conn = self.lock_conn()?;
        let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
        Ok(conn.query_row(&sql, [task_id], map_task).optional()?)
    }

    /// Tasks not marked completed: most urgent first, then oldest first.
    pub fn get_active_tasks(&self, conversation_id: &str) -> Result<Vec<Task>> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {} FROM tasks
             WHERE conversation_id = ?1 AND COALESCE(status, 'pending') != 'completed'
             ORDER BY priority DESC, created_at ASC, rowid ASC",
            TASK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let tasks = stmt
            .query_map([conversation_id], map_task)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Every task of a conversation, including completed ones, oldest first.
    pub fn list_tasks(&self, conversation_id: &str) -> Result<Vec<Task>> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {} FROM tasks WHERE conversation_id = ?1 ORDER BY created_at ASC, rowid ASC",
            TASK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let tasks = stmt
            .query_map([conversation_id], map_task)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }
}
