// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Envelope → domain event translation.
//!
//! One [`EventTranslator`] instance lives per session (or per client
//! stream); re-translating a persisted prefix through a fresh instance
//! reproduces the same event sequence. The state is serializable so replay
//! checkpoints can carry it.
//!
//! Item id scheme — stable across replay because every id is derived from
//! the turn counter and the envelope's log sequence:
//! - user messages:       `user-{turn}-{seq}`
//! - assistant messages:  `agent-{turn}-{seq}`
//! - tool calls:          the agent's `toolCallId`
//! - tool results:        `{toolCallId}-result`

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use lab_acp::envelope;

use crate::domain::{
    ContentPart, DomainEvent, EventPayload, Item, ItemKind, Role, ToolCallStatus,
};

/// Per-session translation state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventTranslator {
    turn: u32,
    in_turn: bool,
    active_item_id: Option<String>,
    emitted_tool_call_ids: HashSet<String>,
    /// Tool results whose call was never announced. Tolerated (partial
    /// replays produce them legitimately) but worth watching.
    orphan_tool_results: u64,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn orphan_tool_results(&self) -> u64 {
        self.orphan_tool_results
    }

    /// Translate one envelope into zero or more domain events, all stamped
    /// with `sequence`.
    pub fn translate(&mut self, sequence: i64, env: &Value) -> Vec<DomainEvent> {
        if let Some(reason) = envelope::stop_reason(env) {
            self.end_turn();
            return vec![DomainEvent::new(
                sequence,
                EventPayload::TurnEnded { stop_reason: reason.to_string() },
            )];
        }

        if let Some(err) = envelope::error_object(env) {
            self.end_turn();
            return vec![DomainEvent::new(
                sequence,
                EventPayload::Error { error: err.clone() },
            )];
        }

        if let Some(kind) = envelope::session_update_kind(env) {
            let update = envelope::update_payload(env).cloned().unwrap_or(Value::Null);
            return match kind {
                "user_message" => self.on_user_message(sequence, &update),
                "agent_message_chunk" => self.on_agent_chunk(sequence, &update),
                "tool_call" => self.on_tool_call(sequence, &update),
                "tool_call_update" => self.on_tool_call_update(sequence, &update),
                other => vec![DomainEvent::new(
                    sequence,
                    EventPayload::Passthrough { method: other.to_string(), data: update },
                )],
            };
        }

        if let Some(method) = envelope::method(env).filter(|_| envelope::is_notification(env)) {
            let data = env.get("params").cloned().unwrap_or(Value::Null);
            return vec![self.map_named_notification(sequence, method, data)];
        }

        // Plain responses and outbound request echoes carry no domain meaning.
        Vec::new()
    }

    fn end_turn(&mut self) {
        self.in_turn = false;
        self.active_item_id = None;
    }

    /// Open the turn if no assistant activity happened since the last
    /// terminator. Returns the `turn.started` event when it fires.
    fn open_turn(&mut self, sequence: i64) -> Option<DomainEvent> {
        if self.in_turn {
            return None;
        }
        self.in_turn = true;
        self.turn += 1;
        Some(DomainEvent::new(sequence, EventPayload::TurnStarted { turn: self.turn }))
    }

    fn on_user_message(&mut self, sequence: i64, update: &Value) -> Vec<DomainEvent> {
        let text = content_text(update).unwrap_or_default();
        // The user message initiates the *next* turn; the counter itself is
        // bumped when assistant activity opens it.
        let id = format!("user-{}-{}", self.turn + 1, sequence);
        let item = Item::message(id, Role::User, vec![ContentPart::text(text)]);
        vec![
            DomainEvent::new(sequence, EventPayload::ItemStarted { item: item.clone() }),
            DomainEvent::new(sequence, EventPayload::ItemCompleted { item }),
        ]
    }

    fn on_agent_chunk(&mut self, sequence: i64, update: &Value) -> Vec<DomainEvent> {
        let Some(text) = content_text(update) else {
            return Vec::new();
        };

        let mut events = Vec::new();
        events.extend(self.open_turn(sequence));

        if self.active_item_id.is_none() {
            let id = format!("agent-{}-{}", self.turn, sequence);
            let item = Item::message(id.clone(), Role::Assistant, Vec::new());
            self.active_item_id = Some(id);
            events.push(DomainEvent::new(sequence, EventPayload::ItemStarted { item }));
        }

        let item_id = self.active_item_id.clone().unwrap_or_default();
        events.push(DomainEvent::new(
            sequence,
            EventPayload::ItemDelta { item_id, delta: text },
        ));
        events
    }

    fn on_tool_call(&mut self, sequence: i64, update: &Value) -> Vec<DomainEvent> {
        let Some(call_id) = update.get("toolCallId").and_then(Value::as_str) else {
            return Vec::new();
        };
        // The agent re-announces calls as they progress; only the first
        // announcement produces an item.
        if !self.emitted_tool_call_ids.insert(call_id.to_string()) {
            return Vec::new();
        }

        let name = update
            .get("title")
            .and_then(Value::as_str)
            .or_else(|| {
                update
                    .get("_meta")
                    .and_then(|m| m.get("claudeCode"))
                    .and_then(|c| c.get("toolName"))
                    .and_then(Value::as_str)
            })
            .unwrap_or("tool")
            .to_string();
        let input = update
            .get("rawInput")
            .or_else(|| update.get("input"))
            .cloned()
            .unwrap_or(Value::Null);

        let part = ContentPart::ToolCall {
            id: call_id.to_string(),
            name,
            input,
            status: ToolCallStatus::InProgress,
        };

        let mut events = Vec::new();
        events.extend(self.open_turn(sequence));
        self.active_item_id = Some(call_id.to_string());
        events.push(DomainEvent::new(
            sequence,
            EventPayload::ItemStarted { item: Item::tool_call(call_id, part) },
        ));
        events
    }

    fn on_tool_call_update(&mut self, sequence: i64, update: &Value) -> Vec<DomainEvent> {
        let Some(call_id) = update.get("toolCallId").and_then(Value::as_str) else {
            return Vec::new();
        };

        let status = update.get("status").and_then(Value::as_str);
        let failed = matches!(status, Some("failed") | Some("error"));
        let terminal = failed || status == Some("completed");
        let output = collect_output(update);

        // Progress-only updates (no terminal status, no output) are noise.
        if !terminal && output.is_none() {
            return Vec::new();
        }

        if !self.emitted_tool_call_ids.contains(call_id) {
            self.orphan_tool_results += 1;
        }

        let part = ContentPart::ToolResult {
            tool_call_id: call_id.to_string(),
            output,
            error: failed.then(|| {
                update
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("tool call failed")
                    .to_string()
            }),
        };

        let result_id = format!("{call_id}-result");
        let item = Item::tool_result(result_id.clone(), part);
        self.active_item_id = Some(result_id);
        vec![
            DomainEvent::new(sequence, EventPayload::ItemStarted { item: item.clone() }),
            DomainEvent::new(sequence, EventPayload::ItemCompleted { item }),
        ]
    }

    /// Notifications whose method already matches a taxonomy name map onto
    /// it; everything else is forwarded verbatim.
    fn map_named_notification(&mut self, sequence: i64, method: &str, data: Value) -> DomainEvent {
        let id = data.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
        let payload = match method {
            "question.requested" => EventPayload::QuestionRequested { id, data },
            "question.resolved" => EventPayload::QuestionResolved { id },
            "permission.requested" => EventPayload::PermissionRequested { id, data },
            "permission.resolved" => EventPayload::PermissionResolved { id },
            "session.started" => EventPayload::SessionStarted,
            "session.ended" => EventPayload::SessionEnded,
            other => EventPayload::Passthrough { method: other.to_string(), data },
        };
        DomainEvent::new(sequence, payload)
    }
}

/// `update.content` can be a single `{type: "text", text}` block or an array
/// of them; either way we want the concatenated text.
fn content_text(update: &Value) -> Option<String> {
    match update.get("content") {
        Some(Value::Object(obj)) => obj.get("text").and_then(Value::as_str).map(String::from),
        Some(Value::Array(items)) => {
            let text: String = items
                .iter()
                .filter_map(|c| c.get("text").and_then(Value::as_str))
                .collect();
            if text.is_empty() {
                None
            } else {
                Some(text)
            }
        }
        _ => None,
    }
}

/// Tool output from a `tool_call_update`: the content array's text blocks,
/// or `rawOutput` verbatim.
fn collect_output(update: &Value) -> Option<Value> {
    if let Some(items) = update.get("content").and_then(Value::as_array) {
        let text: String = items
            .iter()
            .filter_map(|c| c.get("text").and_then(Value::as_str))
            .collect();
        if !text.is_empty() {
            return Some(Value::String(text));
        }
    }
    update.get("rawOutput").cloned()
}

// ── Unit tests ────────────────────────────────────────────────────────────────
