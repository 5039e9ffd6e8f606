// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Per-session terminal registry for the `terminal/*` agent requests.
//!
//! Each created terminal is a subprocess whose stdout **and** stderr drain
//! into a single shared buffer (the agent sees one interleaved text stream,
//! like a real console). Exit status is published on a watch channel so
//! `wait_for_exit` resolves immediately once the process is gone and any
//! number of waiters can queue before that.

use std::{
    collections::HashMap,
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use serde_json::{json, Value};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    sync::{oneshot, watch, Mutex},
};
use tracing::debug;

use crate::connection::RpcError;

struct Terminal {
    buffer: Arc<Mutex<String>>,
    exit: watch::Receiver<Option<i64>>,
    kill: Option<oneshot::Sender<()>>,
}

/// Registry of live terminals for one session. Ids are monotonic within the
/// session (`term-1`, `term-2`, …) and never reused.
#[derive(Default)]
pub struct TerminalRegistry {
    next_id: AtomicU64,
    terminals: Mutex<HashMap<String, Terminal>>,
}

impl TerminalRegistry {
    /// Spawn a terminal process and start capturing its output.
    pub async fn create(
        &self,
        command: &str,
        args: &[String],
        cwd: Option<&str>,
        env: &HashMap<String, String>,
    ) -> Result<String, RpcError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in env {
            cmd.env(k, v);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| RpcError::internal(format!("failed to spawn '{command}': {e}")))?;

        let buffer = Arc::new(Mutex::new(String::new()));
        if let Some(out) = child.stdout.take() {
            tokio::spawn(drain_into(out, buffer.clone()));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(drain_into(err, buffer.clone()));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let mut kill_seen = false;
            loop {
                tokio::select! {
                    status = child.wait() => {
                        let code = status.ok().and_then(|s| s.code()).map(i64::from);
                        // A signal-terminated process has no code; report -1
                        // so waiters still resolve.
                        let _ = exit_tx.send(Some(code.unwrap_or(-1)));
                        break;
                    }
                    kill = &mut kill_rx, if !kill_seen => {
                        kill_seen = true;
                        // A dropped sender (release) is not a kill request.
                        if kill.is_ok() {
                            let _ = child.start_kill();
                        }
                    }
                }
            }
        });

        let id = format!("term-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.terminals.lock().await.insert(
            id.clone(),
            Terminal { buffer, exit: exit_rx, kill: Some(kill_tx) },
        );
        debug!(terminal = %id, %command, "terminal created");
        Ok(id)
    }

    /// Drain and clear the capture buffer, reporting exit status if the
    /// process has already finished.
    pub async fn output(&self, id: &str) -> Result<Value, RpcError> {
        let terminals = self.terminals.lock().await;
        let term = terminals.get(id).ok_or_else(|| unknown(id))?;
        let output = std::mem::take(&mut *term.buffer.lock().await);
        let mut reply = json!({ "output": output, "truncated": false });
        if let Some(code) = *term.exit.borrow() {
            reply["exitStatus"] = json!({ "exitCode": code });
        }
        Ok(reply)
    }

    /// Resolve once the process exits (immediately if it already has).
    pub async fn wait_for_exit(&self, id: &str) -> Result<Value, RpcError> {
        let mut exit = {
            let terminals = self.terminals.lock().await;
            terminals.get(id).ok_or_else(|| unknown(id))?.exit.clone()
        };
        let code = *exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RpcError::internal("terminal exit watcher dropped"))?;
        Ok(json!({ "exitCode": code }))
    }

    /// Stop tracking a terminal. The process, if still running, keeps
    /// running; release only frees the registry slot.
    pub async fn release(&self, id: &str) -> Result<(), RpcError> {
        self.terminals.lock().await.remove(id).ok_or_else(|| unknown(id))?;
        Ok(())
    }

    /// SIGKILL the terminal process. The entry stays until released so the
    /// agent can still collect final output and exit status.
    pub async fn kill(&self, id: &str) -> Result<(), RpcError> {
        let mut terminals = self.terminals.lock().await;
        let term = terminals.get_mut(id).ok_or_else(|| unknown(id))?;
        if let Some(kill) = term.kill.take() {
            let _ = kill.send(());
        }
        Ok(())
    }
}

fn unknown(id: &str) -> RpcError {
    RpcError::invalid_params(format!("unknown terminal: {id}"))
}

async fn drain_into<R: AsyncRead + Unpin>(mut src: R, buffer: Arc<Mutex<String>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match src.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&chunk[..n]).into_owned();
                buffer.lock().await.push_str(&text);
            }
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
