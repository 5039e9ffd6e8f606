// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Gateway-side handlers for agent-initiated requests.
//!
//! The agent drives these over the same stdio channel it receives prompts
//! on: permission prompts are auto-approved by policy, `fs/*` touches the
//! session's workspace on the host filesystem, and `terminal/*` is backed by
//! the per-session [`TerminalRegistry`].

use std::{collections::HashMap, path::PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    connection::{ClientHandler, RpcError},
    terminal::TerminalRegistry,
};

/// Pick the permission option to auto-approve: prefer `allow_always`, then
/// `allow_once`. Returns the chosen `optionId`, or `None` when neither kind
/// is offered (the request is then answered with `outcome = cancelled`).
pub fn pick_permission_option(options: &[Value]) -> Option<&str> {
    for preferred in ["allow_always", "allow_once"] {
        if let Some(opt) = options
            .iter()
            .find(|o| o.get("kind").and_then(Value::as_str) == Some(preferred))
        {
            return opt.get("optionId").and_then(Value::as_str);
        }
    }
    None
}

/// The standard handler wired to every agent subprocess.
pub struct GatewayClientHandler {
    workspace_dir: PathBuf,
    terminals: TerminalRegistry,
}

impl GatewayClientHandler {
    pub fn new(workspace_dir: PathBuf) -> Self {
        Self { workspace_dir, terminals: TerminalRegistry::default() }
    }

    pub fn workspace_dir(&self) -> &PathBuf {
        &self.workspace_dir
    }

    async fn request_permission(&self, params: Value) -> Result<Value, RpcError> {
        let options = params
            .get("options")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(match pick_permission_option(&options) {
            Some(option_id) => {
                debug!(%option_id, "auto-approving permission request");
                json!({ "outcome": { "outcome": "selected", "optionId": option_id } })
            }
            None => json!({ "outcome": { "outcome": "cancelled" } }),
        })
    }

    async fn read_text_file(&self, params: Value) -> Result<Value, RpcError> {
        let path = required_str(&params, "path")?;
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RpcError::internal(format!("failed to read {path}: {e}")))?;
        Ok(json!({ "text": text }))
    }

    async fn write_text_file(&self, params: Value) -> Result<Value, RpcError> {
        let path = required_str(&params, "path")?;
        let content = required_str(&params, "content")?;
        if let Some(parent) = std::path::Path::new(path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RpcError::internal(format!("failed to create {}: {e}", parent.display())))?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|e| RpcError::internal(format!("failed to write {path}: {e}")))?;
        Ok(json!({}))
    }

    async fn terminal_create(&self, params: Value) -> Result<Value, RpcError> {
        let command = required_str(&params, "command")?;
        let args: Vec<String> = params
            .get("args")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let cwd = params
            .get("cwd")
            .and_then(Value::as_str)
            .unwrap_or_else(|| self.workspace_dir.to_str().unwrap_or("."));
        let env: HashMap<String, String> = params
            .get("env")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let id = self.terminals.create(command, &args, Some(cwd), &env).await?;
        Ok(json!({ "terminalId": id }))
    }
}

#[async_trait]
impl ClientHandler for GatewayClientHandler {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "session/request_permission" => self.request_permission(params).await,
            "fs/read_text_file" => self.read_text_file(params).await,
            "fs/write_text_file" => self.write_text_file(params).await,
            "terminal/create" => self.terminal_create(params).await,
            "terminal/output" => {
                self.terminals.output(required_str(&params, "terminalId")?).await
            }
            "terminal/wait_for_exit" => {
                self.terminals.wait_for_exit(required_str(&params, "terminalId")?).await
            }
            "terminal/release" => {
                self.terminals.release(required_str(&params, "terminalId")?).await?;
                Ok(json!({}))
            }
            "terminal/kill" => {
                self.terminals.kill(required_str(&params, "terminalId")?).await?;
                Ok(json!({}))
            }
            other => Err(RpcError::method_not_found(other)),
        }
    }
}

fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, RpcError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::invalid_params(format!("missing '{key}'")))
}

// ── Unit tests ────────────────────────────────────────────────────────────────
