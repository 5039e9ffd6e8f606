// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The domain event taxonomy.
//!
//! Every event carries the log sequence of the envelope that produced it;
//! one envelope can fan out into several events (e.g. a `user_message`
//! becomes `item.started` + `item.completed`), all sharing that sequence.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A normalized projection of one envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub sequence: i64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl DomainEvent {
    pub fn new(sequence: i64, payload: EventPayload) -> Self {
        Self { sequence, payload }
    }

    /// The wire name of this event (`turn.started`, `item.delta`, …); for
    /// passthrough notifications this is the forwarded method.
    pub fn kind(&self) -> &str {
        match &self.payload {
            EventPayload::TurnStarted { .. } => "turn.started",
            EventPayload::TurnEnded { .. } => "turn.ended",
            EventPayload::ItemStarted { .. } => "item.started",
            EventPayload::ItemDelta { .. } => "item.delta",
            EventPayload::ItemCompleted { .. } => "item.completed",
            EventPayload::Error { .. } => "error",
            EventPayload::QuestionRequested { .. } => "question.requested",
            EventPayload::QuestionResolved { .. } => "question.resolved",
            EventPayload::PermissionRequested { .. } => "permission.requested",
            EventPayload::PermissionResolved { .. } => "permission.resolved",
            EventPayload::SessionStarted => "session.started",
            EventPayload::SessionEnded => "session.ended",
            EventPayload::Passthrough { method, .. } => method,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    #[serde(rename = "turn.started")]
    TurnStarted { turn: u32 },
    #[serde(rename = "turn.ended")]
    TurnEnded { stop_reason: String },
    #[serde(rename = "item.started")]
    ItemStarted { item: Item },
    #[serde(rename = "item.delta")]
    ItemDelta { item_id: String, delta: String },
    #[serde(rename = "item.completed")]
    ItemCompleted { item: Item },
    #[serde(rename = "error")]
    Error { error: Value },
    #[serde(rename = "question.requested")]
    QuestionRequested { id: String, data: Value },
    #[serde(rename = "question.resolved")]
    QuestionResolved { id: String },
    #[serde(rename = "permission.requested")]
    PermissionRequested { id: String, data: Value },
    #[serde(rename = "permission.resolved")]
    PermissionResolved { id: String },
    #[serde(rename = "session.started")]
    SessionStarted,
    #[serde(rename = "session.ended")]
    SessionEnded,
    /// Unrecognized notification, forwarded verbatim.
    #[serde(rename = "notification")]
    Passthrough { method: String, data: Value },
}

/// A structured sub-unit of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub kind: ItemKind,
    pub role: Role,
    #[serde(default)]
    pub content: Vec<ContentPart>,
}

impl Item {
    pub fn message(id: impl Into<String>, role: Role, content: Vec<ContentPart>) -> Self {
        Self { id: id.into(), kind: ItemKind::Message, role, content }
    }

    pub fn tool_call(id: impl Into<String>, part: ContentPart) -> Self {
        Self { id: id.into(), kind: ItemKind::ToolCall, role: Role::Assistant, content: vec![part] }
    }

    pub fn tool_result(id: impl Into<String>, part: ContentPart) -> Self {
        Self {
            id: id.into(),
            kind: ItemKind::ToolResult,
            role: Role::Assistant,
            content: vec![part],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Message,
    ToolCall,
    ToolResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One element of an item's (or message's) content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        input: Value,
        status: ToolCallStatus,
    },
    ToolResult {
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Reasoning {
        text: String,
    },
    FileRef {
        path: String,
    },
    Image {
        data: Value,
    },
    Status {
        text: String,
    },
}

impl ContentPart {
    pub fn text(t: impl Into<String>) -> Self {
        ContentPart::Text { text: t.into() }
    }

    /// Tool activity (call or result), as opposed to prose.
    pub fn is_tool(&self) -> bool {
        matches!(self, ContentPart::ToolCall { .. } | ContentPart::ToolResult { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    InProgress,
    Completed,
    Error,
}

/// An assembled chat message, the accumulator's output unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl Message {
    /// Concatenated text content, used for previews.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let ContentPart::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn event_kind_uses_dotted_names() {
        let ev = DomainEvent::new(0, EventPayload::TurnStarted { turn: 1 });
        assert_eq!(ev.kind(), "turn.started");
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "turn.started");
        assert_eq!(json["sequence"], 0);
    }

    #[test]
    fn passthrough_kind_is_the_method() {
        let ev = DomainEvent::new(
            3,
            EventPayload::Passthrough { method: "custom/thing".into(), data: json!({}) },
        );
        assert_eq!(ev.kind(), "custom/thing");
    }

    #[test]
    fn content_part_serializes_snake_case_tagged() {
        let part = ContentPart::ToolCall {
            id: "t1".into(),
            name: "Read".into(),
            input: json!({"path": "a"}),
            status: ToolCallStatus::InProgress,
        };
        let v = serde_json::to_value(&part).unwrap();
        assert_eq!(v["type"], "tool_call");
        assert_eq!(v["status"], "in_progress");
    }

    #[test]
    fn tool_result_omits_empty_fields() {
        let part = ContentPart::ToolResult {
            tool_call_id: "t1".into(),
            output: None,
            error: None,
        };
        let v = serde_json::to_value(&part).unwrap();
        assert!(v.get("output").is_none());
        assert!(v.get("error").is_none());
    }

    #[test]
    fn message_text_skips_tool_parts() {
        let m = Message {
            id: "m1".into(),
            role: Role::Assistant,
            parts: vec![
                ContentPart::text("Hello"),
                ContentPart::ToolResult { tool_call_id: "t".into(), output: None, error: None },
                ContentPart::text("!"),
            ],
        };
        assert_eq!(m.text(), "Hello!");
    }

    #[test]
    fn domain_event_round_trips() {
        let ev = DomainEvent::new(
            7,
            EventPayload::ItemDelta { item_id: "a".into(), delta: "chunk".into() },
        );
        let s = serde_json::to_string(&ev).unwrap();
        let back: DomainEvent = serde_json::from_str(&s).unwrap();
        assert_eq!(back, ev);
    }
}
