// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Session metadata — the authoritative home of `inference_status` and the
//! last-message preview. Every transport publishes what this table says.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{Db, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceStatus {
    Idle,
    Generating,
}

impl InferenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InferenceStatus::Idle => "idle",
            InferenceStatus::Generating => "generating",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "generating" => InferenceStatus::Generating,
            _ => InferenceStatus::Idle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub inference_status: InferenceStatus,
    pub last_message: Option<String>,
}

#[derive(Clone)]
pub struct MetadataStore {
    db: Db,
}

impl MetadataStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn set_inference_status(
        &self,
        session_id: &str,
        status: InferenceStatus,
    ) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        let status = status.as_str();
        let now = Utc::now().to_rfc3339();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO session_metadata (session_id, inference_status, updated_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT (session_id) DO UPDATE
                     SET inference_status = ?2, updated_at = ?3",
                    rusqlite::params![session_id, status, now],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn set_last_message(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        let text = text.to_string();
        let now = Utc::now().to_rfc3339();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO session_metadata (session_id, inference_status, last_message, updated_at)
                     VALUES (?1, 'idle', ?2, ?3)
                     ON CONFLICT (session_id) DO UPDATE
                     SET last_message = ?2, updated_at = ?3",
                    rusqlite::params![session_id, text, now],
                )?;
                Ok(())
            })
            .await
    }

    /// Missing rows read as `idle` with no preview.
    pub async fn get(&self, session_id: &str) -> Result<SessionMetadata, StoreError> {
        let sid = session_id.to_string();
        let found = self
            .db
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT inference_status, last_message FROM session_metadata
                         WHERE session_id = ?1",
                        [sid.as_str()],
                        |row| {
                            let status: String = row.get(0)?;
                            let last: Option<String> = row.get(1)?;
                            Ok((status, last))
                        },
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                Ok(row)
            })
            .await?;

        Ok(match found {
            Some((status, last_message)) => SessionMetadata {
                session_id: session_id.to_string(),
                inference_status: InferenceStatus::parse(&status),
                last_message,
            },
            None => SessionMetadata {
                session_id: session_id.to_string(),
                inference_status: InferenceStatus::Idle,
                last_message: None,
            },
        })
    }

    pub async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM session_metadata WHERE session_id = ?1",
                    [session_id],
                )?;
                Ok(())
            })
            .await
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MetadataStore {
        MetadataStore::new(Db::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn missing_row_reads_idle_with_no_preview() {
        let s = store();
        let meta = s.get("nope").await.unwrap();
        assert_eq!(meta.inference_status, InferenceStatus::Idle);
        assert!(meta.last_message.is_none());
    }

    #[tokio::test]
    async fn status_upsert_round_trips() {
        let s = store();
        s.set_inference_status("s1", InferenceStatus::Generating)
            .await
            .unwrap();
        assert_eq!(
            s.get("s1").await.unwrap().inference_status,
            InferenceStatus::Generating
        );
        s.set_inference_status("s1", InferenceStatus::Idle).await.unwrap();
        assert_eq!(
            s.get("s1").await.unwrap().inference_status,
            InferenceStatus::Idle
        );
    }

    #[tokio::test]
    async fn last_message_survives_status_updates() {
        let s = store();
        s.set_last_message("s1", "Hello!").await.unwrap();
        s.set_inference_status("s1", InferenceStatus::Generating)
            .await
            .unwrap();
        let meta = s.get("s1").await.unwrap();
        assert_eq!(meta.last_message.as_deref(), Some("Hello!"));
        assert_eq!(meta.inference_status, InferenceStatus::Generating);
    }

    #[tokio::test]
    async fn delete_resets_to_defaults() {
        let s = store();
        s.set_last_message("s1", "x").await.unwrap();
        s.delete("s1").await.unwrap();
        assert!(s.get("s1").await.unwrap().last_message.is_none());
    }
}
