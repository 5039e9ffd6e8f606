// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Session directory — the gateway's view of the workspace `sessions` table.
//!
//! The broader application owns richer session state; the gateway reads and
//! writes only what it needs: the agent-assigned session id (for resume),
//! the workspace directory, and the lifecycle status the reconciler scans.

use serde::{Deserialize, Serialize};

use crate::{Db, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Pooled,
    Deleting,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Pooled => "pooled",
            SessionStatus::Deleting => "deleting",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "running" => SessionStatus::Running,
            "pooled" => SessionStatus::Pooled,
            "deleting" => SessionStatus::Deleting,
            _ => SessionStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub project_id: Option<String>,
    pub agent_session_id: Option<String>,
    pub workspace_dir: Option<String>,
    pub status: SessionStatus,
    pub title: Option<String>,
}

#[derive(Clone)]
pub struct SessionDirectory {
    db: Db,
}

impl SessionDirectory {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let session_id = session_id.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT session_id, project_id, agent_session_id, workspace_dir,
                            status, title
                     FROM sessions WHERE session_id = ?1",
                    [session_id],
                    |row| {
                        Ok(SessionRecord {
                            session_id: row.get(0)?,
                            project_id: row.get(1)?,
                            agent_session_id: row.get(2)?,
                            workspace_dir: row.get(3)?,
                            status: SessionStatus::parse(&row.get::<_, String>(4)?),
                            title: row.get(5)?,
                        })
                    },
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other.into()),
                })
            })
            .await
    }

    /// Insert a fresh `running` row unless the session already exists.
    pub async fn create_if_absent(
        &self,
        session_id: &str,
        workspace_dir: &str,
    ) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        let workspace_dir = workspace_dir.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sessions (session_id, workspace_dir, status)
                     VALUES (?1, ?2, 'running')
                     ON CONFLICT (session_id) DO NOTHING",
                    rusqlite::params![session_id, workspace_dir],
                )?;
                Ok(())
            })
            .await
    }

    /// Record (or clear, with `None`) the agent-assigned session id.
    pub async fn set_agent_session_id(
        &self,
        session_id: &str,
        agent_session_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        let agent_session_id = agent_session_id.map(String::from);
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE sessions SET agent_session_id = ?2 WHERE session_id = ?1",
                    rusqlite::params![session_id, agent_session_id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        let status = status.as_str();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE sessions SET status = ?2 WHERE session_id = ?1",
                    rusqlite::params![session_id, status],
                )?;
                Ok(())
            })
            .await
    }

    /// All sessions the reconciler should keep a monitor on.
    pub async fn list_running(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.db
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, project_id, agent_session_id, workspace_dir,
                            status, title
                     FROM sessions WHERE status = 'running'
                     ORDER BY session_id",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(SessionRecord {
                        session_id: row.get(0)?,
                        project_id: row.get(1)?,
                        agent_session_id: row.get(2)?,
                        workspace_dir: row.get(3)?,
                        status: SessionStatus::parse(&row.get::<_, String>(4)?),
                        title: row.get(5)?,
                    })
                })?;
                let mut sessions = Vec::new();
                for row in rows {
                    sessions.push(row?);
                }
                Ok(sessions)
            })
            .await
    }

    pub async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        self.db
            .call(move |conn| {
                conn.execute("DELETE FROM sessions WHERE session_id = ?1", [session_id])?;
                Ok(())
            })
            .await
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
