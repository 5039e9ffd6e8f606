// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Agent session manager — one agent subprocess per lab session.
//!
//! # Fan-out
//!
//! Every envelope a session produces (wire notifications and the synthetic
//! `user_message` / terminator envelopes the manager injects) flows into a
//! per-session channel that **survives process respawns**: subscribers such
//! as the session monitor stay attached across recovery. While nobody is
//! subscribed, envelopes buffer up to a cap and the oldest are dropped; the
//! first subscriber drains the buffer in arrival order.
//!
//! # Establishment chain
//!
//! `create_session` is idempotent per lab session id. A fresh subprocess is
//! initialized and then walked down `resumeSession → loadSession →
//! newSession`, trying each step only when the agent advertises the
//! capability and a prior agent session id exists; each fallback swallows
//! only the error of the step it replaces. The final id is written back to
//! the session directory so the *next* spawn can resume.
//!
//! # Fatal transport timeouts
//!
//! A timed-out JSON-RPC call means the transport is wedged, not merely that
//! the agent is slow: the manager emits a synthetic `error`, tears the
//! process down, respawns with `loadSessionId` set to the prior agent
//! session id, and closes the turn with a synthetic `end_turn`. A
//! per-session guard makes concurrent recoveries idempotent.

use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lab_acp::{
    envelope::{synthetic_error, synthetic_stop, synthetic_user_message},
    AcpAgent, AcpError, GatewayClientHandler, SpawnSpec,
};
use lab_config::AgentDefinition;
use lab_store::SessionDirectory;

use crate::GatewayError;

/// Spawn-time knobs, resolved from the gateway config.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub agent: AgentDefinition,
    pub workspace_root: PathBuf,
    pub mcp_server_url: Option<String>,
    pub request_timeout: Duration,
    pub term_grace: Duration,
    pub prompt_race: Duration,
    pub event_buffer_cap: usize,
}

/// Init options snapshotted per session, reapplied when recovery respawns
/// the subprocess. The resume target itself lives in the session directory
/// row (`agent_session_id`), which every successful establishment updates.
#[derive(Debug, Clone, Default)]
struct SessionOptions {
    model: Option<String>,
}

// ── Per-session fan-out channel ───────────────────────────────────────────────

struct ChannelInner {
    buffer: VecDeque<Value>,
    subscribers: Vec<mpsc::UnboundedSender<Value>>,
}

/// Envelope fan-out for one lab session. Outlives the subprocess.
pub struct SessionChannel {
    cap: usize,
    inner: Mutex<ChannelInner>,
}

impl SessionChannel {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            inner: Mutex::new(ChannelInner {
                buffer: VecDeque::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Deliver to all live subscribers, or buffer when there are none.
    /// Closed subscribers are pruned here, within the dispatch.
    fn emit(&self, envelope: Value) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.subscribers.retain(|s| !s.is_closed());
        if inner.subscribers.is_empty() {
            if inner.buffer.len() >= self.cap {
                inner.buffer.pop_front();
            }
            inner.buffer.push_back(envelope);
        } else {
            for sub in &inner.subscribers {
                let _ = sub.send(envelope.clone());
            }
        }
    }

    /// Attach a subscriber; any buffered envelopes are drained to it first,
    /// in arrival order.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for envelope in inner.buffer.drain(..) {
            let _ = tx.send(envelope);
        }
        inner.subscribers.push(tx);
        rx
    }
}

// ── Per-session process state ─────────────────────────────────────────────────

struct ManagedSession {
    agent: Arc<AcpAgent>,
    agent_session_id: Mutex<Option<String>>,
    options: Mutex<SessionOptions>,
    prompt_in_flight: AtomicBool,
    fatal_reset_in_flight: AtomicBool,
}

impl ManagedSession {
    fn agent_session_id(&self) -> Option<String> {
        self.agent_session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Claim the in-flight prompt for terminator emission. Whoever takes it
    /// (normal resolution or an explicit cancel) emits exactly one
    /// terminator for this prompt.
    fn take_prompt(&self) -> bool {
        self.prompt_in_flight.swap(false, Ordering::SeqCst)
    }
}

// ── Manager ───────────────────────────────────────────────────────────────────

pub struct AgentSessionManager {
    cfg: ManagerConfig,
    directory: SessionDirectory,
    sessions: DashMap<String, Arc<ManagedSession>>,
    channels: DashMap<String, Arc<SessionChannel>>,
    establish_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl AgentSessionManager {
    pub fn new(cfg: ManagerConfig, directory: SessionDirectory) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            directory,
            sessions: DashMap::new(),
            channels: DashMap::new(),
            establish_locks: DashMap::new(),
        })
    }

    /// The fan-out channel for a session, created on first touch.
    fn channel(&self, server_id: &str) -> Arc<SessionChannel> {
        self.channels
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(SessionChannel::new(self.cfg.event_buffer_cap)))
            .clone()
    }

    /// Subscribe to a session's envelope stream (buffered events first).
    pub fn subscribe(&self, server_id: &str) -> mpsc::UnboundedReceiver<Value> {
        self.channel(server_id).subscribe()
    }

    /// Whether a live subprocess exists for this session.
    pub fn has_live_session(&self, server_id: &str) -> bool {
        self.sessions
            .get(server_id)
            .map(|s| s.agent.is_alive())
            .unwrap_or(false)
    }

    pub fn agent_session_id(&self, server_id: &str) -> Option<String> {
        self.sessions.get(server_id).and_then(|s| s.agent_session_id())
    }

    /// Create (or return) the agent session for this lab session.
    ///
    /// Idempotent: a live session's id is returned as-is. Otherwise a
    /// subprocess is spawned and the resume → load → new chain runs.
    pub async fn create_session(
        self: &Arc<Self>,
        server_id: &str,
        model: Option<String>,
    ) -> Result<String, GatewayError> {
        if let Some(id) = self.live_session_id(server_id) {
            return Ok(id);
        }

        let lock = self
            .establish_locks
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Re-check: a concurrent caller may have finished while we waited.
        if let Some(id) = self.live_session_id(server_id) {
            return Ok(id);
        }

        self.establish(server_id, model).await
    }

    fn live_session_id(&self, server_id: &str) -> Option<String> {
        self.sessions
            .get(server_id)
            .filter(|s| s.agent.is_alive())
            .and_then(|s| s.agent_session_id())
    }

    async fn establish(
        self: &Arc<Self>,
        server_id: &str,
        model: Option<String>,
    ) -> Result<String, GatewayError> {
        let workspace = self.cfg.workspace_root.join(server_id);
        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(|e| GatewayError::Internal(format!("workspace dir: {e}")))?;
        let workspace_str = workspace.display().to_string();

        self.directory.create_if_absent(server_id, &workspace_str).await?;
        let load_hint = self
            .directory
            .get(server_id)
            .await?
            .and_then(|r| r.agent_session_id);

        // Spawn and wire the notification pump into the fan-out channel.
        let handler = Arc::new(GatewayClientHandler::new(workspace.clone()));
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let spec = SpawnSpec {
            command: self.cfg.agent.command.clone(),
            args: self.cfg.agent.args.clone(),
            env: self.cfg.agent.env.clone(),
            cwd: workspace,
        };
        let agent = Arc::new(AcpAgent::spawn(
            &spec,
            handler,
            event_tx,
            self.cfg.request_timeout,
        )?);

        let channel = self.channel(server_id);
        tokio::spawn(async move {
            while let Some(envelope) = event_rx.recv().await {
                channel.emit(envelope);
            }
        });

        let conn = agent.connection();
        let init = conn
            .request(
                "initialize",
                json!({
                    "protocolVersion": 1,
                    "clientInfo": {
                        "name": "lab-gateway",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "clientCapabilities": {
                        "fs": { "readTextFile": true, "writeTextFile": true },
                        "terminal": true,
                    },
                }),
            )
            .await?;

        let caps = init.get("agentCapabilities").cloned().unwrap_or(Value::Null);
        let supports_load = caps.get("loadSession").and_then(Value::as_bool).unwrap_or(false);
        let supports_resume = caps
            .get("sessionCapabilities")
            .and_then(|s| s.get("resume"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let cwd = workspace_str;

        // resume → load → new; each fallback swallows only the error of the
        // step it replaces.
        let mut agent_session_id: Option<String> = None;
        if let Some(prior) = &load_hint {
            if supports_resume {
                match conn
                    .request(
                        "unstableResumeSession",
                        json!({ "sessionId": prior, "cwd": cwd }),
                    )
                    .await
                {
                    Ok(reply) => {
                        agent_session_id = Some(reply_session_id(&reply, prior));
                        info!(%server_id, %prior, "resumed agent session");
                    }
                    Err(e) => warn!(%server_id, "resumeSession failed, falling back: {e}"),
                }
            }
            if agent_session_id.is_none() && supports_load {
                match conn
                    .request(
                        "loadSession",
                        json!({ "sessionId": prior, "cwd": cwd, "mcpServers": [] }),
                    )
                    .await
                {
                    Ok(reply) => {
                        agent_session_id = Some(reply_session_id(&reply, prior));
                        info!(%server_id, %prior, "loaded agent session");
                    }
                    Err(e) => warn!(%server_id, "loadSession failed, falling back: {e}"),
                }
            }
        }

        let agent_session_id = match agent_session_id {
            Some(id) => id,
            None => {
                let reply = conn.request("newSession", self.new_session_params(&cwd)).await?;
                reply
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        GatewayError::Acp(AcpError::InvalidReply(
                            "newSession reply has no sessionId".to_string(),
                        ))
                    })?
                    .to_string()
            }
        };

        self.directory
            .set_agent_session_id(server_id, Some(&agent_session_id))
            .await?;

        if let Some(model_id) = &model {
            if let Err(e) = conn
                .request(
                    "unstableSetSessionModel",
                    json!({ "sessionId": agent_session_id, "modelId": model_id }),
                )
                .await
            {
                warn!(%server_id, %model_id, "could not set session model: {e}");
            }
        }

        let session = Arc::new(ManagedSession {
            agent,
            agent_session_id: Mutex::new(Some(agent_session_id.clone())),
            options: Mutex::new(SessionOptions { model }),
            prompt_in_flight: AtomicBool::new(false),
            fatal_reset_in_flight: AtomicBool::new(false),
        });
        self.sessions.insert(server_id.to_string(), session);

        info!(%server_id, %agent_session_id, "agent session established");
        Ok(agent_session_id)
    }

    fn new_session_params(&self, cwd: &str) -> Value {
        let mut params = json!({ "cwd": cwd, "mcpServers": [] });
        if let Some(url) = &self.cfg.mcp_server_url {
            params["_meta"] = json!({
                "claudeCode": {
                    "mcpServers": {
                        "lab": { "type": "http", "url": url }
                    }
                }
            });
        }
        params
    }

    /// Forward the user's message to the agent.
    ///
    /// The synthetic `user_message` is emitted *before* the `prompt` call so
    /// the text flows through the persistence pipeline exactly once; pass
    /// `emit_user = false` on retries that already emitted it.
    ///
    /// Resolution races a short startup timer: the call returns as soon as
    /// the prompt resolves **or** the timer fires, whichever is first, so
    /// HTTP callers release their connection while the agent streams.
    pub async fn send_message(
        self: &Arc<Self>,
        server_id: &str,
        text: &str,
        emit_user: bool,
    ) -> Result<(), GatewayError> {
        let session = self
            .sessions
            .get(server_id)
            .map(|s| s.clone())
            .ok_or_else(|| GatewayError::NoSession(server_id.to_string()))?;
        let agent_session_id = session
            .agent_session_id()
            .ok_or_else(|| GatewayError::NoSession(server_id.to_string()))?;

        let channel = self.channel(server_id);
        if emit_user {
            channel.emit(synthetic_user_message(text));
        }

        session.prompt_in_flight.store(true, Ordering::SeqCst);

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let this = self.clone();
        let sid = server_id.to_string();
        let text = text.to_string();
        tokio::spawn(async move {
            let result = this
                .run_prompt(&sid, session, channel, &agent_session_id, &text)
                .await;
            let _ = done_tx.send(result);
        });

        tokio::select! {
            res = done_rx => {
                res.unwrap_or_else(|_| Err(GatewayError::Internal("prompt task dropped".to_string())))
            }
            _ = tokio::time::sleep(self.cfg.prompt_race) => {
                debug!(%server_id, "prompt still streaming, releasing caller");
                Ok(())
            }
        }
    }

    async fn run_prompt(
        self: Arc<Self>,
        server_id: &str,
        session: Arc<ManagedSession>,
        channel: Arc<SessionChannel>,
        agent_session_id: &str,
        text: &str,
    ) -> Result<(), GatewayError> {
        let params = json!({
            "sessionId": agent_session_id,
            "prompt": [{ "type": "text", "text": text }],
        });

        match session.agent.connection().request("prompt", params).await {
            Ok(result) => match result.get("stopReason").and_then(Value::as_str) {
                Some(reason) => {
                    if session.take_prompt() {
                        channel.emit(synthetic_stop(reason));
                    }
                    Ok(())
                }
                None => {
                    let err = GatewayError::NoResult;
                    if session.take_prompt() {
                        channel.emit(synthetic_error(&err.to_string()));
                        channel.emit(synthetic_stop("end_turn"));
                    }
                    Err(err)
                }
            },
            Err(e @ AcpError::Timeout { .. }) => {
                // Transport is wedged; recovery owns the synthetic envelopes
                // from here.
                session.take_prompt();
                let this = self.clone();
                let sid = server_id.to_string();
                tokio::spawn(async move {
                    this.recover(&sid).await;
                });
                Err(e.into())
            }
            Err(e) => {
                if session.take_prompt() {
                    channel.emit(synthetic_error(&e.to_string()));
                    channel.emit(synthetic_stop("end_turn"));
                }
                Err(e.into())
            }
        }
    }

    /// Tear down and re-establish after a fatal transport timeout.
    async fn recover(self: &Arc<Self>, server_id: &str) {
        let Some(session) = self.sessions.get(server_id).map(|s| s.clone()) else {
            return;
        };
        if session.fatal_reset_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }

        warn!(%server_id, "fatal transport timeout, recovering agent session");
        let channel = self.channel(server_id);
        channel.emit(synthetic_error("agent transport timed out"));

        let model = session
            .options
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .model
            .clone();

        session.agent.kill().await;
        self.sessions.remove(server_id);

        // The directory still carries the prior agent session id, so the
        // establishment chain resumes it.
        if let Err(e) = self.create_session(server_id, model).await {
            warn!(%server_id, "recovery respawn failed: {e}");
        }
        channel.emit(synthetic_stop("end_turn"));
    }

    /// Switch the agent's model for this session.
    pub async fn set_session_model(
        &self,
        server_id: &str,
        model_id: &str,
    ) -> Result<(), GatewayError> {
        let session = self
            .sessions
            .get(server_id)
            .map(|s| s.clone())
            .ok_or_else(|| GatewayError::NoSession(server_id.to_string()))?;
        let agent_session_id = session
            .agent_session_id()
            .ok_or_else(|| GatewayError::NoSession(server_id.to_string()))?;

        session
            .agent
            .connection()
            .request(
                "unstableSetSessionModel",
                json!({ "sessionId": agent_session_id, "modelId": model_id }),
            )
            .await?;
        session
            .options
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .model = Some(model_id.to_string());
        Ok(())
    }

    /// Cancel the in-flight prompt, if any. The `cancelled` terminator is
    /// emitted at most once per prompt, however many cancels race.
    pub async fn cancel_prompt(&self, server_id: &str) -> Result<(), GatewayError> {
        let session = self
            .sessions
            .get(server_id)
            .map(|s| s.clone())
            .ok_or_else(|| GatewayError::NoSession(server_id.to_string()))?;

        if let Some(agent_session_id) = session.agent_session_id() {
            let _ = session
                .agent
                .connection()
                .notify("cancel", json!({ "sessionId": agent_session_id }))
                .await;
        }
        if session.take_prompt() {
            self.channel(server_id).emit(synthetic_stop("cancelled"));
        }
        Ok(())
    }

    /// Stop the subprocess and drop all per-process state. The fan-out
    /// channel (and anyone subscribed to it) survives.
    pub async fn destroy_session(&self, server_id: &str) {
        if let Some((_, session)) = self.sessions.remove(server_id) {
            info!(%server_id, "destroying agent session");
            session.agent.shutdown(self.cfg.term_grace).await;
        }
    }

    /// Full teardown on session delete: process, channel, locks.
    pub async fn delete_session(&self, server_id: &str) {
        self.destroy_session(server_id).await;
        self.channels.remove(server_id);
        self.establish_locks.remove(server_id);
    }
}

fn reply_session_id(reply: &Value, fallback: &str) -> String {
    reply
        .get("sessionId")
        .and_then(Value::as_str)
        .unwrap_or(fallback)
        .to_string()
}

// ── Unit tests ────────────────────────────────────────────────────────────────
