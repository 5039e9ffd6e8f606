// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Append-only agent event log.
//!
//! `(session_id, sequence)` is the primary key; rows are never updated or
//! deleted while the session lives. Sequence assignment happens upstream in
//! the session monitor — this repository only enforces immutability.

use serde_json::Value;

use crate::{Db, StoreError};

/// One persisted envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub sequence: i64,
    pub envelope: Value,
}

#[derive(Clone)]
pub struct EventLog {
    db: Db,
}

impl EventLog {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert one envelope at an explicit sequence. Inserting an existing
    /// `(session, sequence)` pair is an error — the log is immutable.
    pub async fn store(
        &self,
        session_id: &str,
        sequence: i64,
        envelope: &Value,
    ) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        let data = serde_json::to_string(envelope)?;
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agent_events (session_id, sequence, event_data)
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![session_id, sequence, data],
                )?;
                Ok(())
            })
            .await
    }

    /// Highest sequence for a session, `-1` when the log is empty.
    pub async fn max_sequence(&self, session_id: &str) -> Result<i64, StoreError> {
        let session_id = session_id.to_string();
        self.db
            .call(move |conn| {
                let max: Option<i64> = conn.query_row(
                    "SELECT MAX(sequence) FROM agent_events WHERE session_id = ?1",
                    [session_id],
                    |row| row.get(0),
                )?;
                Ok(max.unwrap_or(-1))
            })
            .await
    }

    /// Events in ascending sequence order, optionally only those strictly
    /// after `after_sequence`.
    pub async fn events_after(
        &self,
        session_id: &str,
        after_sequence: Option<i64>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let session_id = session_id.to_string();
        let after = after_sequence.unwrap_or(-1);
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT sequence, event_data FROM agent_events
                     WHERE session_id = ?1 AND sequence > ?2
                     ORDER BY sequence ASC",
                )?;
                let rows = stmt.query_map(rusqlite::params![session_id, after], |row| {
                    let sequence: i64 = row.get(0)?;
                    let data: String = row.get(1)?;
                    Ok((sequence, data))
                })?;
                let mut events = Vec::new();
                for row in rows {
                    let (sequence, data) = row?;
                    events.push(StoredEvent {
                        sequence,
                        envelope: serde_json::from_str(&data)?,
                    });
                }
                Ok(events)
            })
            .await
    }

    /// Drop a session's log (only on session delete).
    pub async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM agent_events WHERE session_id = ?1",
                    [session_id],
                )?;
                Ok(())
            })
            .await
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
