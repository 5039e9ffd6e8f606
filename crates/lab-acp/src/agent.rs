// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The agent subprocess handle.
//!
//! Owns the child process and the [`AcpConnection`] running over its stdio.
//! stderr is drained to debug logs in the background (agents log liberally
//! there and a full pipe would wedge them).
//!
//! Shutdown ladder: close stdin → SIGTERM → grace → SIGKILL. Well-behaved
//! agents exit on stdin EOF alone; the signals cover the rest.

use std::{collections::HashMap, path::PathBuf, process::Stdio, time::Duration};

use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    sync::{mpsc, Mutex},
};
use tracing::{debug, info, warn};

use crate::{connection::ClientHandler, AcpConnection, AcpError};

/// Everything needed to launch (or relaunch) one agent subprocess.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: PathBuf,
}

/// A spawned agent: child process + framed connection.
pub struct AcpAgent {
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
    conn: AcpConnection,
}

impl AcpAgent {
    /// Spawn the agent and bring up the connection over its stdio.
    pub fn spawn<H>(
        spec: &SpawnSpec,
        handler: std::sync::Arc<H>,
        event_tx: mpsc::UnboundedSender<Value>,
        request_timeout: Duration,
    ) -> Result<Self, AcpError>
    where
        H: ClientHandler + 'static,
    {
        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .envs(&spec.env)
            .current_dir(&spec.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AcpError::Spawn(format!("'{}': {e}", spec.command)))?;

        let stdin = child.stdin.take().ok_or(AcpError::StdinUnavailable)?;
        let stdout = child.stdout.take().ok_or_else(|| {
            AcpError::Spawn("child has no stdout pipe".to_string())
        })?;

        if let Some(stderr) = child.stderr.take() {
            let command = spec.command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        debug!(agent = %command, "stderr: {line}");
                    }
                }
            });
        }

        let pid = child.id();
        info!(command = %spec.command, ?pid, cwd = %spec.cwd.display(), "agent spawned");

        let conn = AcpConnection::start(stdout, stdin, handler, event_tx, request_timeout);
        Ok(Self { child: Mutex::new(Some(child)), pid, conn })
    }

    pub fn connection(&self) -> &AcpConnection {
        &self.conn
    }

    pub fn is_alive(&self) -> bool {
        self.conn.is_alive()
    }

    /// Graceful stop: stdin EOF, then SIGTERM, then SIGKILL after `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        self.conn.close_writer().await;

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        if let Some(pid) = self.pid {
            // SAFETY: plain signal delivery to our own child's pid.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "agent exited"),
            Ok(Err(e)) => warn!("error waiting for agent exit: {e}"),
            Err(_) => {
                warn!("agent ignored SIGTERM, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }

    /// Immediate SIGKILL, no grace.
    pub async fn kill(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
