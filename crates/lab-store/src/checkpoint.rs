// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Replay checkpoints.
//!
//! Clients persist their accumulator state here after a successful replay
//! so reconnects can skip the known-good prefix. Rows are parser-versioned:
//! a version mismatch means the replay semantics changed and the checkpoint
//! is worthless.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Db, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayCheckpoint {
    pub parser_version: u32,
    pub last_sequence: i64,
    pub replay_state: Value,
}

#[derive(Clone)]
pub struct CheckpointStore {
    db: Db,
}

impl CheckpointStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<ReplayCheckpoint>, StoreError> {
        let session_id = session_id.to_string();
        self.db
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT parser_version, last_sequence, replay_state
                         FROM acp_replay_checkpoints WHERE session_id = ?1",
                        [session_id],
                        |row| {
                            let version: u32 = row.get(0)?;
                            let last: i64 = row.get(1)?;
                            let state: String = row.get(2)?;
                            Ok((version, last, state))
                        },
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                match row {
                    Some((parser_version, last_sequence, state)) => Ok(Some(ReplayCheckpoint {
                        parser_version,
                        last_sequence,
                        replay_state: serde_json::from_str(&state)?,
                    })),
                    None => Ok(None),
                }
            })
            .await
    }

    pub async fn upsert(
        &self,
        session_id: &str,
        checkpoint: &ReplayCheckpoint,
    ) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        let version = checkpoint.parser_version;
        let last = checkpoint.last_sequence;
        let state = serde_json::to_string(&checkpoint.replay_state)?;
        let now = Utc::now().to_rfc3339();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO acp_replay_checkpoints
                         (session_id, parser_version, last_sequence, replay_state, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (session_id) DO UPDATE
                     SET parser_version = ?2, last_sequence = ?3,
                         replay_state = ?4, updated_at = ?5",
                    rusqlite::params![session_id, version, last, state, now],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM acp_replay_checkpoints WHERE session_id = ?1",
                    [session_id],
                )?;
                Ok(())
            })
            .await
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
