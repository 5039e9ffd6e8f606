// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Gateway configuration schema.
//!
//! Configuration is YAML (never TOML).  Layers are **deep-merged** — you can
//! override only the fields you care about in each file.
//!
//! Search order (later overrides earlier):
//! 1. `/etc/lab/gateway.yaml`
//! 2. `~/.config/lab/gateway.yaml`
//! 3. `.lab/gateway.yaml` (workspace-local)
//! 4. Path given to [`crate::load`] explicitly.
//!
//! **All defaults are production-safe.** Running `load(None)` with no config
//! file gives you a loopback bind, a per-user database path, and the stock
//! ACP timers.
//!
//! # Example full config
//! ```yaml
//! http:
//!   bind: "127.0.0.1:18750"
//!   route_prefix: "/api/agent"
//!
//! storage:
//!   db_path: "~/.local/share/lab/gateway.db"
//!
//! workspace_root: "~/.local/share/lab/workspaces"
//!
//! acp:
//!   mcp_server_url: "http://127.0.0.1:18791/mcp"
//!
//! agents:
//!   - id: "claude-code"
//!     name: "Claude Code"
//!     command: "claude-code-acp"
//!     models:
//!       - id: "claude-sonnet"
//!         name: "Claude Sonnet"
//!         default: true
//! default_agent: "claude-code"
//! ```

use std::{collections::HashMap, path::PathBuf};

use serde::{Deserialize, Serialize};

fn default_http_bind() -> String {
    "127.0.0.1:18750".to_string()
}
fn default_route_prefix() -> String {
    "/api/agent".to_string()
}
fn default_max_body() -> usize {
    4 * 1024 * 1024
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub acp: AcpConfig,
    /// Installed agent definitions, served by `GET /agents` and used to
    /// spawn the per-session subprocess.
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
    /// Id of the agent used when a session doesn't name one.
    /// Defaults to the first entry in `agents`.
    pub default_agent: Option<String>,
    /// Base directory under which per-session workspaces live
    /// (`<workspace_root>/<lab_session_id>`).
    pub workspace_root: Option<PathBuf>,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// `host:port` to listen on. Default: `127.0.0.1:18750` (loopback only).
    #[serde(default = "default_http_bind")]
    pub bind: String,

    /// Prefix all gateway routes are nested under.
    #[serde(default = "default_route_prefix")]
    pub route_prefix: String,

    /// Maximum request body size in bytes (default: 4 MiB).
    #[serde(default = "default_max_body")]
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_http_bind(),
            route_prefix: default_route_prefix(),
            max_body_bytes: default_max_body(),
        }
    }
}

/// Durable storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path. Defaults to `~/.local/share/lab/gateway.db`.
    pub db_path: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolve the database path, expanding `~` and falling back to the
    /// per-user data directory.
    pub fn resolved_db_path(&self) -> PathBuf {
        match &self.db_path {
            Some(p) => expand_path(p),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("lab/gateway.db"),
        }
    }
}

/// Timers and protocol knobs for the ACP subprocess channel.
///
/// The defaults encode the protocol-level contract; override them only in
/// tests or when an agent is known to be pathologically slow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcpConfig {
    /// MCP server URL advertised to the agent on `newSession` under
    /// `_meta.claudeCode.mcpServers`. `None` advertises nothing.
    pub mcp_server_url: Option<String>,

    /// Per-request JSON-RPC timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout around each phase of send-with-recovery
    /// (ensure-session / set-model / send-message).
    #[serde(default = "default_phase_timeout")]
    pub phase_timeout_secs: u64,

    /// The prompt call returns to the HTTP caller as soon as either the
    /// agent replies or this many milliseconds elapse.
    #[serde(default = "default_prompt_race")]
    pub prompt_start_race_ms: u64,

    /// SIGTERM grace before SIGKILL on session destroy.
    #[serde(default = "default_term_grace")]
    pub term_grace_secs: u64,

    /// Debounce after `turn.ended` before the session counts as complete.
    #[serde(default = "default_completion_grace")]
    pub completion_grace_ms: u64,

    /// How often the reconciler scans for untracked running sessions.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Envelopes buffered per session while no subscriber is attached.
    /// Oldest entries are dropped past this cap.
    #[serde(default = "default_event_buffer_cap")]
    pub event_buffer_cap: usize,
}

fn default_request_timeout() -> u64 {
    120
}
fn default_phase_timeout() -> u64 {
    45
}
fn default_prompt_race() -> u64 {
    1500
}
fn default_term_grace() -> u64 {
    5
}
fn default_completion_grace() -> u64 {
    2000
}
fn default_reconcile_interval() -> u64 {
    15
}
fn default_event_buffer_cap() -> usize {
    1024
}

impl Default for AcpConfig {
    fn default() -> Self {
        Self {
            mcp_server_url: None,
            request_timeout_secs: default_request_timeout(),
            phase_timeout_secs: default_phase_timeout(),
            prompt_start_race_ms: default_prompt_race(),
            term_grace_secs: default_term_grace(),
            completion_grace_ms: default_completion_grace(),
            reconcile_interval_secs: default_reconcile_interval(),
            event_buffer_cap: default_event_buffer_cap(),
        }
    }
}

/// One installed agent, as advertised by `GET /agents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    pub name: String,
    /// Executable spawned per session (resolved via `PATH`).
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the subprocess.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Models this agent can be switched to via `POST /model`.
    #[serde(default)]
    pub models: Vec<ModelDefinition>,
}

/// A model the agent can run with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub default: bool,
}

impl GatewayConfig {
    /// Resolve the agent definition used for new sessions.
    pub fn default_agent(&self) -> Option<&AgentDefinition> {
        match &self.default_agent {
            Some(id) => self.agents.iter().find(|a| &a.id == id),
            None => self.agents.first(),
        }
    }

    /// Resolve the workspace root, expanding `~`.
    pub fn resolved_workspace_root(&self) -> PathBuf {
        match &self.workspace_root {
            Some(p) => expand_path(p),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("lab/workspaces"),
        }
    }
}

fn expand_path(p: &std::path::Path) -> PathBuf {
    let s = p.to_string_lossy();
    PathBuf::from(shellexpand::tilde(s.as_ref()).into_owned())
}

// ── Unit tests ────────────────────────────────────────────────────────────────
