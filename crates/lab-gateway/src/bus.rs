// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-session broadcast channels.
//!
//! The monitor publishes here after persistence; anything live (SSE streams,
//! future websockets) subscribes. Delivery is best-effort — a slow or gone
//! subscriber is dropped by the broadcast channel and recovers via
//! `/history`, never by blocking the monitor.

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;

use lab_events::Message;
use lab_store::{InferenceStatus, SessionTask};

/// One envelope with its assigned log sequence — the unit SSE streams.
#[derive(Debug, Clone)]
pub struct SequencedEnvelope {
    pub sequence: i64,
    pub envelope: Value,
}

/// Inference status transition, with the accumulated assistant preview for
/// the current turn.
#[derive(Debug, Clone)]
pub struct StatusDelta {
    pub status: InferenceStatus,
    pub preview: Option<String>,
}

struct SessionChannels {
    acp: broadcast::Sender<SequencedEnvelope>,
    status: broadcast::Sender<StatusDelta>,
    messages: broadcast::Sender<Vec<Message>>,
    tasks: broadcast::Sender<Vec<SessionTask>>,
    completed: broadcast::Sender<()>,
}

impl Default for SessionChannels {
    fn default() -> Self {
        // Capacities sized for bursts; laggards skip ahead and replay.
        Self {
            acp: broadcast::channel(1024).0,
            status: broadcast::channel(256).0,
            messages: broadcast::channel(64).0,
            tasks: broadcast::channel(64).0,
            completed: broadcast::channel(8).0,
        }
    }
}

/// Registry of per-session channels, created lazily on first touch.
#[derive(Default)]
pub struct SessionEventBus {
    sessions: DashMap<String, SessionChannels>,
}

impl SessionEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_acp(&self, session_id: &str) -> broadcast::Receiver<SequencedEnvelope> {
        self.channel(session_id, |c| c.acp.subscribe())
    }

    pub fn subscribe_status(&self, session_id: &str) -> broadcast::Receiver<StatusDelta> {
        self.channel(session_id, |c| c.status.subscribe())
    }

    pub fn subscribe_messages(&self, session_id: &str) -> broadcast::Receiver<Vec<Message>> {
        self.channel(session_id, |c| c.messages.subscribe())
    }

    pub fn subscribe_tasks(&self, session_id: &str) -> broadcast::Receiver<Vec<SessionTask>> {
        self.channel(session_id, |c| c.tasks.subscribe())
    }

    pub fn subscribe_completed(&self, session_id: &str) -> broadcast::Receiver<()> {
        self.channel(session_id, |c| c.completed.subscribe())
    }

    pub fn publish_acp(&self, session_id: &str, sequence: i64, envelope: Value) {
        self.channel(session_id, |c| {
            let _ = c.acp.send(SequencedEnvelope { sequence, envelope });
        })
    }

    pub fn publish_status(&self, session_id: &str, delta: StatusDelta) {
        self.channel(session_id, |c| {
            let _ = c.status.send(delta);
        })
    }

    pub fn publish_messages(&self, session_id: &str, messages: Vec<Message>) {
        self.channel(session_id, |c| {
            let _ = c.messages.send(messages);
        })
    }

    pub fn publish_tasks(&self, session_id: &str, tasks: Vec<SessionTask>) {
        self.channel(session_id, |c| {
            let _ = c.tasks.send(tasks);
        })
    }

    pub fn publish_completed(&self, session_id: &str) {
        self.channel(session_id, |c| {
            let _ = c.completed.send(());
        })
    }

    pub fn drop_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    fn channel<T>(&self, session_id: &str, f: impl FnOnce(&SessionChannels) -> T) -> T {
        let entry = self
            .sessions
            .entry(session_id.to_string())
            .or_default();
        f(&entry)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
