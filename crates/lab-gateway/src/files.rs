// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Workspace file views for the `/files/*` routes.
//!
//! Change status prefers asking git directly in the session workspace; when
//! that fails (no git, no repo, empty workspace) it falls back to scanning
//! the persisted tool-call envelopes for file-mutating tools.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use serde::Serialize;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use lab_store::EventLog;

use crate::GatewayError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileChange {
    pub path: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

/// Tool names (normalized) whose calls mutate workspace files.
const MUTATING_TOOLS: &[&str] = &["write", "edit", "multiedit", "patch", "delete"];

/// Changed files in the workspace: `git status --porcelain` when possible,
/// else derived from the event log.
pub async fn file_status(
    workspace: &Path,
    log: &EventLog,
    session_id: &str,
) -> Result<Vec<FileChange>, GatewayError> {
    match git_status(workspace).await {
        Some(changes) => Ok(changes),
        None => {
            debug!(%session_id, "git status unavailable, scanning tool-call events");
            scan_tool_events(log, session_id).await
        }
    }
}

async fn git_status(workspace: &Path) -> Option<Vec<FileChange>> {
    let output = Command::new("git")
        .args(["status", "--porcelain=v1", "--untracked-files=all"])
        .current_dir(workspace)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let text = String::from_utf8_lossy(&output.stdout);
    Some(parse_porcelain(&text))
}

/// Porcelain v1: two status columns, a space, then the path
/// (`R` entries are `old -> new`).
fn parse_porcelain(text: &str) -> Vec<FileChange> {
    let mut changes = Vec::new();
    for line in text.lines() {
        if line.len() < 4 {
            continue;
        }
        let status = line[..2].trim().to_string();
        let path = line[3..].trim();
        let path = match path.split_once(" -> ") {
            Some((_, renamed)) => renamed,
            None => path,
        };
        changes.push(FileChange {
            path: path.to_string(),
            status: if status.is_empty() { "??".to_string() } else { status },
        });
    }
    changes
}

async fn scan_tool_events(
    log: &EventLog,
    session_id: &str,
) -> Result<Vec<FileChange>, GatewayError> {
    let mut paths = BTreeSet::new();
    for stored in log.events_after(session_id, None).await? {
        let envelope = &stored.envelope;
        if lab_acp::envelope::session_update_kind(envelope) != Some("tool_call") {
            continue;
        }
        let Some(tool) = lab_acp::envelope::claude_tool_name(envelope) else {
            continue;
        };
        if !MUTATING_TOOLS.contains(&tool.as_str()) {
            continue;
        }
        let touched = lab_acp::envelope::update_payload(envelope)
            .and_then(|u| u.get("rawInput"))
            .and_then(|input| {
                input
                    .get("file_path")
                    .or_else(|| input.get("path"))
                    .and_then(Value::as_str)
            });
        if let Some(path) = touched {
            paths.insert(path.to_string());
        }
    }
    Ok(paths
        .into_iter()
        .map(|path| FileChange { path, status: "M".to_string() })
        .collect())
}

/// Entries of one workspace directory. `rel` is resolved against the
/// workspace root and must stay inside it.
pub async fn list_dir(workspace: &Path, rel: &str) -> Result<Vec<DirEntry>, GatewayError> {
    let dir = resolve(workspace, rel)?;
    let mut read = tokio::fs::read_dir(&dir)
        .await
        .map_err(|e| GatewayError::Internal(format!("list {}: {e}", dir.display())))?;

    let mut entries = Vec::new();
    while let Some(entry) = read
        .next_entry()
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        let path = if rel.is_empty() {
            name.clone()
        } else {
            format!("{}/{name}", rel.trim_end_matches('/'))
        };
        entries.push(DirEntry {
            name,
            path,
            kind: if is_dir { "directory" } else { "file" },
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// A workspace file's text content.
pub async fn read_file(workspace: &Path, rel: &str) -> Result<String, GatewayError> {
    let path = resolve(workspace, rel)?;
    tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| GatewayError::Internal(format!("read {}: {e}", path.display())))
}

/// Join and reject traversal out of the workspace.
fn resolve(workspace: &Path, rel: &str) -> Result<PathBuf, GatewayError> {
    let rel = rel.trim_start_matches('/');
    if rel.split('/').any(|seg| seg == "..") {
        return Err(GatewayError::Internal(format!("path escapes workspace: {rel}")));
    }
    Ok(workspace.join(rel))
}

// ── Unit tests ────────────────────────────────────────────────────────────────
