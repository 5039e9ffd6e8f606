// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Database handle and migrations.

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use rusqlite::Connection;
use tracing::debug;

use crate::StoreError;

const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS agent_events (
    session_id  TEXT    NOT NULL,
    sequence    INTEGER NOT NULL,
    event_data  TEXT    NOT NULL,
    PRIMARY KEY (session_id, sequence)
);

CREATE TABLE IF NOT EXISTS session_metadata (
    session_id       TEXT PRIMARY KEY,
    inference_status TEXT NOT NULL DEFAULT 'idle',
    last_message     TEXT,
    updated_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS acp_replay_checkpoints (
    session_id     TEXT PRIMARY KEY,
    parser_version INTEGER NOT NULL,
    last_sequence  INTEGER NOT NULL,
    replay_state   TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    session_id        TEXT PRIMARY KEY,
    project_id        TEXT,
    agent_session_id  TEXT,
    workspace_dir     TEXT,
    status            TEXT NOT NULL DEFAULT 'pending',
    title             TEXT
);

CREATE TABLE IF NOT EXISTS session_tasks (
    id               TEXT PRIMARY KEY,
    session_id       TEXT NOT NULL,
    external_id      TEXT,
    content          TEXT NOT NULL,
    status           TEXT NOT NULL,
    priority         TEXT,
    position         INTEGER NOT NULL,
    source_tool_name TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_session_tasks_session
    ON session_tasks (session_id, position);
"#;

/// Cheap-to-clone database handle.
///
/// The connection lives behind a `std::sync::Mutex` and every statement runs
/// via [`Db::call`] on the blocking pool, which keeps the reactor free and
/// naturally serializes writers.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (creating if needed) and migrate the database.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Self::init(conn)
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(MIGRATIONS)?;
        debug!("database opened and migrated");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    pub async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|_| StoreError::Cancelled)?
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
