// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Session task list, projected from the agent's task tool calls.
//!
//! `TodoWrite` replaces the whole list atomically; `TaskCreate` and
//! `TaskUpdate` upsert single rows keyed by `external_id`.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{Db, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "in_progress" => TaskStatus::InProgress,
            "completed" => TaskStatus::Completed,
            _ => TaskStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTask {
    pub id: String,
    pub session_id: String,
    pub external_id: Option<String>,
    pub content: String,
    pub status: TaskStatus,
    pub priority: Option<String>,
    pub position: i64,
    pub source_tool_name: String,
}

#[derive(Clone)]
pub struct TaskStore {
    db: Db,
}

impl TaskStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Replace the session's whole task list in one transaction (TodoWrite).
    pub async fn replace_all(
        &self,
        session_id: &str,
        tasks: Vec<SessionTask>,
    ) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM session_tasks WHERE session_id = ?1",
                    [session_id.as_str()],
                )?;
                for task in &tasks {
                    tx.execute(
                        "INSERT INTO session_tasks
                             (id, session_id, external_id, content, status, priority,
                              position, source_tool_name, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        rusqlite::params![
                            task.id,
                            session_id,
                            task.external_id,
                            task.content,
                            task.status.as_str(),
                            task.priority,
                            task.position,
                            task.source_tool_name,
                            now,
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Insert or update one task, matching on `external_id` within the
    /// session (TaskCreate / TaskUpdate).
    pub async fn upsert(&self, task: SessionTask) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db
            .call(move |conn| {
                let existing: Option<String> = match &task.external_id {
                    Some(ext) => conn
                        .query_row(
                            "SELECT id FROM session_tasks
                             WHERE session_id = ?1 AND external_id = ?2",
                            rusqlite::params![task.session_id, ext],
                            |row| row.get(0),
                        )
                        .map(Some)
                        .or_else(|e| match e {
                            rusqlite::Error::QueryReturnedNoRows => Ok(None),
                            other => Err(other),
                        })?,
                    None => None,
                };

                match existing {
                    Some(id) => {
                        conn.execute(
                            "UPDATE session_tasks
                             SET content = ?2, status = ?3, priority = ?4,
                                 position = ?5, source_tool_name = ?6, updated_at = ?7
                             WHERE id = ?1",
                            rusqlite::params![
                                id,
                                task.content,
                                task.status.as_str(),
                                task.priority,
                                task.position,
                                task.source_tool_name,
                                now,
                            ],
                        )?;
                    }
                    None => {
                        conn.execute(
                            "INSERT INTO session_tasks
                                 (id, session_id, external_id, content, status, priority,
                                  position, source_tool_name, updated_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                            rusqlite::params![
                                task.id,
                                task.session_id,
                                task.external_id,
                                task.content,
                                task.status.as_str(),
                                task.priority,
                                task.position,
                                task.source_tool_name,
                                now,
                            ],
                        )?;
                    }
                }
                Ok(())
            })
            .await
    }

    /// Tasks for a session, ordered by position.
    pub async fn list(&self, session_id: &str) -> Result<Vec<SessionTask>, StoreError> {
        let session_id = session_id.to_string();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, session_id, external_id, content, status, priority,
                            position, source_tool_name
                     FROM session_tasks WHERE session_id = ?1
                     ORDER BY position ASC",
                )?;
                let rows = stmt.query_map([session_id], |row| {
                    Ok(SessionTask {
                        id: row.get(0)?,
                        session_id: row.get(1)?,
                        external_id: row.get(2)?,
                        content: row.get(3)?,
                        status: TaskStatus::parse(&row.get::<_, String>(4)?),
                        priority: row.get(5)?,
                        position: row.get(6)?,
                        source_tool_name: row.get(7)?,
                    })
                })?;
                let mut tasks = Vec::new();
                for row in rows {
                    tasks.push(row?);
                }
                Ok(tasks)
            })
            .await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM session_tasks WHERE session_id = ?1",
                    [session_id],
                )?;
                Ok(())
            })
            .await
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
