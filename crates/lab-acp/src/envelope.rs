// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Helpers over raw JSON-RPC envelopes.
//!
//! Envelopes are deliberately kept as `serde_json::Value` end to end: the
//! event log stores them verbatim, the translator projects them, and typing
//! the full ACP surface would couple the gateway to every agent dialect.
//! These helpers are the one place that knows the envelope shapes.

use serde_json::{json, Value};

// ── Classification ────────────────────────────────────────────────────────────

/// A request: has both an `id` and a `method`.
pub fn is_request(v: &Value) -> bool {
    has_id(v) && v.get("method").and_then(Value::as_str).is_some()
}

/// A response: has an `id` and either `result` or `error`.
pub fn is_response(v: &Value) -> bool {
    has_id(v) && (v.get("result").is_some() || v.get("error").is_some())
}

/// A notification: has a `method` but no `id`.
pub fn is_notification(v: &Value) -> bool {
    !has_id(v) && v.get("method").and_then(Value::as_str).is_some()
}

fn has_id(v: &Value) -> bool {
    matches!(v.get("id"), Some(id) if !id.is_null())
}

pub fn method(v: &Value) -> Option<&str> {
    v.get("method").and_then(Value::as_str)
}

pub fn request_id(v: &Value) -> Option<u64> {
    v.get("id").and_then(Value::as_u64)
}

/// `result.stopReason` of a turn-terminating response.
pub fn stop_reason(v: &Value) -> Option<&str> {
    v.get("result")?.get("stopReason")?.as_str()
}

pub fn error_object(v: &Value) -> Option<&Value> {
    v.get("error")
}

/// Demux key of a `session/update` notification: `params.update.sessionUpdate`.
pub fn session_update_kind(v: &Value) -> Option<&str> {
    if method(v) != Some("session/update") {
        return None;
    }
    v.get("params")?.get("update")?.get("sessionUpdate")?.as_str()
}

/// The `params.update` payload of a `session/update` notification.
pub fn update_payload(v: &Value) -> Option<&Value> {
    if method(v) != Some("session/update") {
        return None;
    }
    v.get("params")?.get("update")
}

/// Host tool name carried by Claude Code tool events under
/// `params.update._meta.claudeCode.toolName`, normalized to lowercase.
pub fn claude_tool_name(v: &Value) -> Option<String> {
    let name = update_payload(v)?
        .get("_meta")?
        .get("claudeCode")?
        .get("toolName")?
        .as_str()?;
    Some(name.to_ascii_lowercase())
}

/// Gate for persisted `{sequence, eventData}` rows so downstream replay code
/// is total over whatever the log hands it.
pub fn is_event_record(v: &Value) -> bool {
    v.get("sequence").and_then(Value::as_i64).is_some() && v.get("eventData").is_some()
}

// ── Synthetic envelopes ───────────────────────────────────────────────────────
//
// The session manager injects these into the per-session stream so user text
// and turn terminators flow through the same persistence pipeline as wire
// envelopes. They are shaped exactly like the agent's own messages.

/// The user's message, emitted before the `prompt` call.
pub fn synthetic_user_message(text: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "session/update",
        "params": {
            "update": {
                "sessionUpdate": "user_message",
                "content": { "type": "text", "text": text },
            }
        }
    })
}

/// A turn terminator (`end_turn`, `cancelled`, …).
pub fn synthetic_stop(stop_reason: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "result": { "stopReason": stop_reason }
    })
}

/// A transport or agent failure surfaced into the event stream.
pub fn synthetic_error(message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "error": { "code": -32603, "message": message }
    })
}

// ── Unit tests ────────────────────────────────────────────────────────────────
