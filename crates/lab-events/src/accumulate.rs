// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Replay accumulator — folds an ordered domain-event stream into the
//! message list a chat view renders.
//!
//! The same reducer runs in two places with identical results: server-side
//! inside the session monitor (for previews and snapshots) and client-side
//! over `/history` + `/events`. Everything here is keyed on log sequences,
//! so feeding history and then the live tail produces byte-identical output
//! to feeding the concatenation, and re-feeding any prefix is a no-op.
//!
//! Assistant steps are split around tool activity: once a message's trailing
//! part is a tool call/result, the next text delta opens a continuation
//! message (`{itemId}-cont-{seq}`) and the trailing tool run moves into it,
//! so tool activity and its follow-up text render as one bubble while the
//! preceding prose stays in its own.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{
    ContentPart, DomainEvent, EventPayload, Item, ItemKind, Message, Role, ToolCallStatus,
};
use crate::translate::EventTranslator;

fn initial_sequence() -> i64 {
    -1
}

/// The reducer. Serializable: this is exactly what a replay checkpoint's
/// `replay_state` carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplayAccumulator {
    messages: Vec<Message>,
    item_to_message: HashMap<String, String>,
    current_assistant_id: Option<String>,
    #[serde(default = "initial_sequence")]
    last_sequence: i64,
    orphan_tool_results: u64,
}

impl Default for ReplayAccumulator {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            item_to_message: HashMap::new(),
            current_assistant_id: None,
            last_sequence: initial_sequence(),
            orphan_tool_results: 0,
        }
    }
}

impl ReplayAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last_sequence(&self) -> i64 {
        self.last_sequence
    }

    pub fn orphan_tool_results(&self) -> u64 {
        self.orphan_tool_results
    }

    /// Apply all events produced by one envelope. The whole batch shares the
    /// envelope's sequence; batches at or below `last_sequence` have already
    /// been applied and are skipped, which is what makes prefix re-feeds
    /// idempotent.
    pub fn ingest(&mut self, sequence: i64, events: &[DomainEvent]) {
        if sequence <= self.last_sequence {
            return;
        }
        self.last_sequence = sequence;
        for event in events {
            self.apply(event);
        }
    }

    fn apply(&mut self, event: &DomainEvent) {
        match &event.payload {
            EventPayload::TurnStarted { .. } => {
                self.current_assistant_id = None;
            }
            EventPayload::ItemStarted { item } => self.on_item_started(item),
            EventPayload::ItemDelta { item_id, delta } => {
                self.on_item_delta(event.sequence, item_id, delta)
            }
            EventPayload::ItemCompleted { item } => self.on_item_completed(item),
            // Terminators, errors and passthroughs don't shape the message
            // list; status handling lives in the monitor.
            _ => {}
        }
    }

    fn on_item_started(&mut self, item: &Item) {
        if self.item_to_message.contains_key(&item.id) {
            return;
        }

        match item.kind {
            ItemKind::Message => {
                if item.role == Role::Assistant {
                    self.current_assistant_id = Some(item.id.clone());
                }
                self.item_to_message.insert(item.id.clone(), item.id.clone());
                self.messages.push(Message {
                    id: item.id.clone(),
                    role: item.role,
                    parts: item.content.clone(),
                });
            }
            ItemKind::ToolCall | ItemKind::ToolResult => {
                let target = match &self.current_assistant_id {
                    // Tool activity with no assistant prose yet renders as
                    // its own assistant step.
                    None => {
                        let id = item.id.clone();
                        self.messages.push(Message {
                            id: id.clone(),
                            role: Role::Assistant,
                            parts: Vec::new(),
                        });
                        self.current_assistant_id = Some(id.clone());
                        id
                    }
                    Some(id) => id.clone(),
                };
                self.item_to_message.insert(item.id.clone(), target.clone());
                for part in &item.content {
                    self.push_part(&target, part.clone());
                }
                self.resolve_tool_statuses(&target);
            }
        }
    }

    fn on_item_delta(&mut self, sequence: i64, item_id: &str, delta: &str) {
        let target = match self.item_to_message.get(item_id) {
            Some(t) => t.clone(),
            None => {
                // A delta for an item we never saw started (partial replay).
                // Anchor it to the current assistant step, or open one.
                match &self.current_assistant_id {
                    Some(id) => {
                        self.item_to_message.insert(item_id.to_string(), id.clone());
                        id.clone()
                    }
                    None => {
                        self.messages.push(Message {
                            id: item_id.to_string(),
                            role: Role::Assistant,
                            parts: Vec::new(),
                        });
                        self.current_assistant_id = Some(item_id.to_string());
                        self.item_to_message
                            .insert(item_id.to_string(), item_id.to_string());
                        item_id.to_string()
                    }
                }
            }
        };

        let ends_with_tool = self
            .message(&target)
            .and_then(|m| m.parts.last())
            .is_some_and(ContentPart::is_tool);

        if ends_with_tool {
            self.split_after_tools(sequence, item_id, &target, delta);
        } else if let Some(msg) = self.message_mut(&target) {
            match msg.parts.last_mut() {
                Some(ContentPart::Text { text }) => text.push_str(delta),
                _ => msg.parts.push(ContentPart::text(delta)),
            }
        }
    }

    /// Start a continuation assistant step: the trailing run of tool parts
    /// moves into it, followed by the delta text.
    fn split_after_tools(&mut self, sequence: i64, raw_item_id: &str, target: &str, delta: &str) {
        let cont_id = format!("{raw_item_id}-cont-{sequence}");

        let mut moved = Vec::new();
        let mut source_empty = false;
        if let Some(msg) = self.message_mut(target) {
            while msg.parts.last().is_some_and(ContentPart::is_tool) {
                if let Some(part) = msg.parts.pop() {
                    moved.push(part);
                }
            }
            moved.reverse();
            source_empty = msg.parts.is_empty();
        }
        if source_empty {
            self.messages.retain(|m| m.id != target);
        }

        // Re-anchor the moved tool items so later deltas and result lookups
        // land on the continuation.
        for part in &moved {
            match part {
                ContentPart::ToolCall { id, .. } => {
                    self.item_to_message.insert(id.clone(), cont_id.clone());
                }
                ContentPart::ToolResult { tool_call_id, .. } => {
                    self.item_to_message
                        .insert(format!("{tool_call_id}-result"), cont_id.clone());
                }
                _ => {}
            }
        }
        self.item_to_message
            .insert(raw_item_id.to_string(), cont_id.clone());

        let mut parts = moved;
        parts.push(ContentPart::text(delta));
        self.messages.push(Message {
            id: cont_id.clone(),
            role: Role::Assistant,
            parts,
        });
        self.current_assistant_id = Some(cont_id.clone());
        self.resolve_tool_statuses(&cont_id);
    }

    fn on_item_completed(&mut self, item: &Item) {
        let Some(target) = self.item_to_message.get(&item.id).cloned() else {
            return;
        };
        if let Some(msg) = self.message_mut(&target) {
            if msg.parts.is_empty() {
                msg.parts = item.content.clone();
            }
        }
        self.resolve_tool_statuses(&target);
    }

    fn push_part(&mut self, target: &str, part: ContentPart) {
        if let ContentPart::ToolResult { tool_call_id, .. } = &part {
            let has_call = self.message(target).is_some_and(|m| {
                m.parts.iter().any(
                    |p| matches!(p, ContentPart::ToolCall { id, .. } if id == tool_call_id),
                )
            });
            if !has_call {
                self.orphan_tool_results += 1;
            }
        }
        if let Some(msg) = self.message_mut(target) {
            msg.parts.push(part);
        }
    }

    /// Set each `tool_call` part's status from its same-message result:
    /// `error` when the result carries one, else `completed`. Orphan results
    /// (no matching call in the message) render as errors.
    fn resolve_tool_statuses(&mut self, target: &str) {
        let Some(msg) = self.message_mut(target) else {
            return;
        };

        let mut outcomes: HashMap<String, bool> = HashMap::new();
        let mut calls: Vec<String> = Vec::new();
        for part in &msg.parts {
            match part {
                ContentPart::ToolResult { tool_call_id, error, .. } => {
                    outcomes.insert(tool_call_id.clone(), error.is_some());
                }
                ContentPart::ToolCall { id, .. } => calls.push(id.clone()),
                _ => {}
            }
        }

        for part in &mut msg.parts {
            match part {
                ContentPart::ToolCall { id, status, .. } => {
                    if let Some(is_error) = outcomes.get(id) {
                        *status = if *is_error {
                            ToolCallStatus::Error
                        } else {
                            ToolCallStatus::Completed
                        };
                    }
                }
                ContentPart::ToolResult { tool_call_id, error, .. } => {
                    if !calls.contains(tool_call_id) && error.is_none() {
                        *error = Some("no matching tool call".to_string());
                    }
                }
                _ => {}
            }
        }
    }

    fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }
}

// ── Projector ─────────────────────────────────────────────────────────────────

/// Translator + accumulator in one: feed raw `{sequence, envelope}` pairs,
/// read the assembled message list. This is the unit a replay checkpoint
/// serializes and the monitor's in-memory message projection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMessagesProjector {
    translator: EventTranslator,
    accumulator: ReplayAccumulator,
}

impl SessionMessagesProjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate and fold one envelope; returns the domain events it
    /// produced (already applied). Envelopes at or below the last applied
    /// sequence are skipped *before* translation — `/history` and `/events`
    /// may overlap on reconnect, and a duplicate passing through the
    /// translator would corrupt its turn framing.
    pub fn feed(&mut self, sequence: i64, envelope: &Value) -> Vec<DomainEvent> {
        if sequence <= self.accumulator.last_sequence() {
            return Vec::new();
        }
        let events = self.translator.translate(sequence, envelope);
        self.accumulator.ingest(sequence, &events);
        events
    }

    pub fn messages(&self) -> &[Message] {
        self.accumulator.messages()
    }

    pub fn last_sequence(&self) -> i64 {
        self.accumulator.last_sequence()
    }

    /// Text of the trailing assistant message, if any — the `last_message`
    /// preview stored in session metadata.
    pub fn assistant_preview(&self) -> Option<String> {
        self.accumulator
            .messages()
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(Message::text)
            .filter(|t| !t.is_empty())
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use lab_acp::envelope::{synthetic_stop, synthetic_user_message};

    use super::*;

    fn update(kind: &str, extra: Value) -> Value {
        let mut u = json!({ "sessionUpdate": kind });
        if let (Value::Object(dst), Value::Object(src)) = (&mut u, extra) {
            for (k, v) in src {
                dst.insert(k, v);
            }
        }
        json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": { "sessionId": "s", "update": u }
        })
    }

    fn chunk(text: &str) -> Value {
        update("agent_message_chunk", json!({ "content": { "type": "text", "text": text } }))
    }

    fn tool_call(id: &str, name: &str) -> Value {
        update("tool_call", json!({ "toolCallId": id, "title": name }))
    }

    fn tool_done(id: &str, output: &str) -> Value {
        update(
            "tool_call_update",
            json!({
                "toolCallId": id,
                "status": "completed",
                "content": [{ "type": "text", "text": output }],
            }),
        )
    }

    fn run(stream: &[Value]) -> SessionMessagesProjector {
        let mut p = SessionMessagesProjector::new();
        for (i, env) in stream.iter().enumerate() {
            p.feed(i as i64, env);
        }
        p
    }

    // ── Scenario 1: new session + one turn ───────────────────────────────────

    #[test]
    fn plain_turn_produces_user_and_assistant_messages() {
        let p = run(&[
            synthetic_user_message("hi"),
            chunk("Hello"),
            chunk("!"),
            synthetic_stop("end_turn"),
        ]);

        let messages = p.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert!(messages[0].id.starts_with("user-1-"));
        assert_eq!(messages[0].text(), "hi");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].text(), "Hello!");
        assert_eq!(p.assistant_preview().as_deref(), Some("Hello!"));
    }

    // ── Scenario 2: tool call flow ───────────────────────────────────────────

    #[test]
    fn tool_call_and_result_land_in_one_assistant_message() {
        let p = run(&[
            synthetic_user_message("read A"),
            tool_call("t1", "Read"),
            tool_done("t1", "file A"),
            synthetic_stop("end_turn"),
        ]);

        let messages = p.messages();
        assert_eq!(messages.len(), 2);
        let tools = &messages[1];
        assert_eq!(tools.parts.len(), 2);
        match &tools.parts[0] {
            ContentPart::ToolCall { id, name, status, .. } => {
                assert_eq!(id, "t1");
                assert_eq!(name, "Read");
                assert_eq!(*status, ToolCallStatus::Completed);
            }
            other => panic!("unexpected part {other:?}"),
        }
        match &tools.parts[1] {
            ContentPart::ToolResult { tool_call_id, output, error } => {
                assert_eq!(tool_call_id, "t1");
                assert_eq!(output.as_ref().unwrap(), "file A");
                assert!(error.is_none());
            }
            other => panic!("unexpected part {other:?}"),
        }
    }

    // ── Scenario 3: text-after-tools split ───────────────────────────────────

    #[test]
    fn text_after_tools_splits_into_a_continuation_step() {
        let p = run(&[
            chunk("working…"),
            tool_call("t1", "Read"),
            tool_done("t1", "ok"),
            chunk("done"),
        ]);

        let messages = p.messages();
        assert_eq!(messages.len(), 2, "prose and tool run must split: {messages:?}");

        assert_eq!(messages[0].text(), "working…");
        assert!(
            messages[0].parts.iter().all(|p| !p.is_tool()),
            "tool parts must move to the continuation"
        );

        let cont = &messages[1];
        assert!(cont.id.contains("-cont-"), "continuation id, got {}", cont.id);
        assert!(matches!(
            &cont.parts[0],
            ContentPart::ToolCall { status: ToolCallStatus::Completed, .. }
        ));
        assert!(matches!(&cont.parts[1], ContentPart::ToolResult { .. }));
        assert_eq!(cont.text(), "done");
    }

    #[test]
    fn streaming_after_a_split_extends_the_continuation_in_place() {
        let p = run(&[
            chunk("working"),
            tool_call("t1", "Read"),
            chunk("do"),
            chunk("ne"),
        ]);

        let messages = p.messages();
        assert_eq!(messages.len(), 2, "one split only: {messages:?}");
        assert_eq!(messages[1].text(), "done");
    }

    // ── Tool activity with no preceding prose ────────────────────────────────

    #[test]
    fn tool_activity_without_prose_is_its_own_step() {
        let p = run(&[tool_call("t1", "Bash"), tool_done("t1", "x")]);
        let messages = p.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[0].parts.len(), 2);
    }

    // ── Orphans ──────────────────────────────────────────────────────────────

    #[test]
    fn orphan_tool_result_is_kept_and_marked() {
        let p = run(&[tool_done("ghost", "out")]);
        let messages = p.messages();
        assert_eq!(messages.len(), 1);
        match &messages[0].parts[0] {
            ContentPart::ToolResult { error, .. } => {
                assert!(error.is_some(), "orphan results display as error");
            }
            other => panic!("unexpected part {other:?}"),
        }
    }

    // ── Idempotence / determinism properties ─────────────────────────────────

    fn sample_stream() -> Vec<Value> {
        vec![
            synthetic_user_message("hi"),
            chunk("thinking"),
            tool_call("t1", "Read"),
            tool_done("t1", "file A"),
            chunk("answer"),
            synthetic_stop("end_turn"),
            synthetic_user_message("next"),
            chunk("more"),
            synthetic_stop("end_turn"),
        ]
    }

    #[test]
    fn history_then_live_equals_concatenation() {
        let stream = sample_stream();
        let whole = run(&stream);

        for cut in 0..=stream.len() {
            let mut p = SessionMessagesProjector::new();
            for (i, env) in stream[..cut].iter().enumerate() {
                p.feed(i as i64, env);
            }
            for (i, env) in stream[cut..].iter().enumerate() {
                p.feed((cut + i) as i64, env);
            }
            assert_eq!(
                p.messages(),
                whole.messages(),
                "split at {cut} diverged from the whole-stream result"
            );
        }
    }

    #[test]
    fn refeeding_a_prefix_is_a_no_op() {
        let stream = sample_stream();
        let mut p = run(&stream);
        let before = p.messages().to_vec();

        // Reconnecting clients replay history that overlaps the live tail;
        // every duplicate must be dropped whole.
        for (i, env) in stream[..5].iter().enumerate() {
            let events = p.feed(i as i64, env);
            assert!(events.is_empty(), "duplicate envelope {i} produced events");
        }

        assert_eq!(p.messages(), before);
    }

    #[test]
    fn split_without_result_keeps_the_tool_call_in_progress() {
        let p = run(&[chunk("working…"), tool_call("t1", "Read"), chunk("done")]);

        let messages = p.messages();
        assert_eq!(messages.len(), 2);
        let cont = &messages[1];
        assert_eq!(cont.id, "t1-cont-2");
        assert!(matches!(
            &cont.parts[0],
            ContentPart::ToolCall { status: ToolCallStatus::InProgress, .. }
        ));
        assert_eq!(cont.text(), "done");
    }

    #[test]
    fn checkpoint_state_round_trips_and_resumes() {
        let stream = sample_stream();
        let mut p = SessionMessagesProjector::new();
        for (i, env) in stream[..4].iter().enumerate() {
            p.feed(i as i64, env);
        }

        // Serialize mid-stream (what a client checkpoint stores), restore,
        // and continue: the result must match an uninterrupted run.
        let state = serde_json::to_string(&p).unwrap();
        let mut restored: SessionMessagesProjector = serde_json::from_str(&state).unwrap();
        for (i, env) in stream[4..].iter().enumerate() {
            restored.feed((4 + i) as i64, env);
        }

        let whole = run(&stream);
        assert_eq!(restored.messages(), whole.messages());
        assert_eq!(restored.last_sequence(), whole.last_sequence());
    }

    #[test]
    fn empty_stream_yields_no_messages() {
        let p = SessionMessagesProjector::new();
        assert!(p.messages().is_empty());
        assert_eq!(p.last_sequence(), -1);
        assert!(p.assistant_preview().is_none());
    }
}
