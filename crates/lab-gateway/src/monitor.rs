// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Session monitor — the authoritative serial line per session.
//!
//! One monitor task consumes a session's envelope stream and, strictly in
//! order: assigns the next dense sequence, appends to the event log,
//! applies the envelope to the message projection, mirrors task tool calls,
//! publishes on the live bus, and drives inference status with a completion
//! debounce. Nothing in here may kill the loop — every step is isolated and
//! logged, and a persistence failure merely drops that envelope from the
//! durable log (sequence allocation is retried on the next one).
//!
//! The [`MonitorHub`] owns the monitors and runs the reconciliation loop:
//! every tick it starts monitors for running sessions it doesn't track,
//! stops monitors whose session stopped running, and respawns agent
//! subprocesses for running sessions that have a persisted agent session id
//! but no live process (gateway restart, agent crash).

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use dashmap::DashMap;
use serde_json::Value;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use lab_events::SessionMessagesProjector;
use lab_store::{
    EventLog, InferenceStatus, MetadataStore, SessionTask, TaskStore,
};

use crate::{
    bus::{SessionEventBus, StatusDelta},
    manager::AgentSessionManager,
    tasks_map::{map_task_tool, TaskToolOp},
};

/// Shared dependencies for all monitors.
#[derive(Clone)]
pub struct MonitorDeps {
    pub log: EventLog,
    pub metadata: MetadataStore,
    pub tasks: TaskStore,
    pub bus: Arc<SessionEventBus>,
    pub completion_grace: Duration,
}

type CompletedSet = Arc<Mutex<HashSet<String>>>;

// ── Single-session monitor ────────────────────────────────────────────────────

pub struct SessionMonitor {
    session_id: String,
    deps: MonitorDeps,
    completed: CompletedSet,
    projector: SessionMessagesProjector,
    next_sequence: Option<i64>,
    status: InferenceStatus,
    turn_preview: String,
    last_stored_preview: Option<String>,
    debounce: Option<JoinHandle<()>>,
}

impl SessionMonitor {
    pub fn spawn(
        session_id: String,
        deps: MonitorDeps,
        completed: CompletedSet,
        mut rx: mpsc::UnboundedReceiver<Value>,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut monitor = SessionMonitor {
                session_id,
                deps,
                completed,
                projector: SessionMessagesProjector::new(),
                next_sequence: None,
                status: InferenceStatus::Idle,
                turn_preview: String::new(),
                last_stored_preview: None,
                debounce: None,
            };
            info!(session_id = %monitor.session_id, "session monitor started");
            loop {
                tokio::select! {
                    envelope = rx.recv() => {
                        let Some(envelope) = envelope else { break };
                        monitor.process(envelope).await;
                    }
                    changed = stop.changed() => {
                        // A dropped sender means the hub is gone; stop too.
                        if changed.is_err() || *stop.borrow() { break }
                    }
                }
            }
            if let Some(handle) = monitor.debounce.take() {
                handle.abort();
            }
            info!(session_id = %monitor.session_id, "session monitor stopped");
        })
    }

    async fn process(&mut self, envelope: Value) {
        // 1. Sequence allocation — lazy init from the log's high-water mark.
        let sequence = match self.next_sequence {
            Some(n) => n,
            None => match self.deps.log.max_sequence(&self.session_id).await {
                Ok(max) => max + 1,
                Err(e) => {
                    error!(session_id = %self.session_id, "sequence init failed: {e}");
                    return;
                }
            },
        };

        // 2. Durable append. On failure the envelope never reaches the live
        // broadcast with a sequence, and allocation restarts from the log on
        // the next envelope.
        if let Err(e) = self.deps.log.store(&self.session_id, sequence, &envelope).await {
            error!(session_id = %self.session_id, sequence, "event persist failed: {e}");
            self.next_sequence = None;
            return;
        }
        self.next_sequence = Some(sequence + 1);

        // 3. Message projection + preview.
        let events = self.projector.feed(sequence, &envelope);
        self.deps
            .bus
            .publish_messages(&self.session_id, self.projector.messages().to_vec());
        if let Some(preview) = self.projector.assistant_preview() {
            if self.last_stored_preview.as_deref() != Some(preview.as_str()) {
                if let Err(e) = self.deps.metadata.set_last_message(&self.session_id, &preview).await
                {
                    warn!(session_id = %self.session_id, "last_message update failed: {e}");
                }
                self.last_stored_preview = Some(preview);
            }
        }

        // 4. Live raw broadcast, sequence attached.
        self.deps
            .bus
            .publish_acp(&self.session_id, sequence, envelope.clone());

        // 5. Task tool mirroring.
        if let Some(tool) = lab_acp::envelope::claude_tool_name(&envelope) {
            if let Err(e) = self.apply_task_tool(&tool, &envelope).await {
                warn!(session_id = %self.session_id, %tool, "task mapping failed: {e}");
            }
        }

        // 6. Inference status + completion debounce.
        for event in &events {
            match event.kind() {
                "turn.started" | "item.started" => self.mark_generating(false).await,
                "item.delta" => {
                    if let lab_events::domain::EventPayload::ItemDelta { delta, .. } =
                        &event.payload
                    {
                        self.turn_preview.push_str(delta);
                    }
                    self.mark_generating(true).await;
                }
                "turn.ended" | "error" => self.mark_idle().await,
                _ => {}
            }
        }
    }

    async fn apply_task_tool(
        &mut self,
        tool: &str,
        envelope: &Value,
    ) -> Result<(), lab_store::StoreError> {
        let raw_input = lab_acp::envelope::update_payload(envelope)
            .and_then(|u| u.get("rawInput"))
            .cloned()
            .unwrap_or(Value::Null);
        let Some(op) = map_task_tool(tool, &raw_input) else {
            return Ok(());
        };

        match op {
            TaskToolOp::ReplaceAll(drafts) => {
                let rows = drafts
                    .into_iter()
                    .enumerate()
                    .map(|(i, d)| SessionTask {
                        id: format!("{}-todo-{i}", self.session_id),
                        session_id: self.session_id.clone(),
                        external_id: d.external_id,
                        content: d.content.unwrap_or_default(),
                        status: d.status.unwrap_or(lab_store::TaskStatus::Pending),
                        priority: d.priority,
                        position: d.position.unwrap_or(i as i64),
                        source_tool_name: d.source_tool_name,
                    })
                    .collect();
                self.deps.tasks.replace_all(&self.session_id, rows).await?;
            }
            TaskToolOp::Upsert(draft) => {
                // Merge over the existing row so partial updates don't
                // clobber fields the tool call left out.
                let existing = match &draft.external_id {
                    Some(ext) => self
                        .deps
                        .tasks
                        .list(&self.session_id)
                        .await?
                        .into_iter()
                        .find(|t| t.external_id.as_deref() == Some(ext.as_str())),
                    None => None,
                };
                let position = draft
                    .position
                    .or(existing.as_ref().map(|t| t.position))
                    .unwrap_or(0);
                let row = SessionTask {
                    id: existing
                        .as_ref()
                        .map(|t| t.id.clone())
                        .unwrap_or_else(|| {
                            format!(
                                "{}-task-{}",
                                self.session_id,
                                draft.external_id.clone().unwrap_or_default()
                            )
                        }),
                    session_id: self.session_id.clone(),
                    external_id: draft.external_id,
                    content: draft
                        .content
                        .or(existing.as_ref().map(|t| t.content.clone()))
                        .unwrap_or_default(),
                    status: draft
                        .status
                        .or(existing.as_ref().map(|t| t.status))
                        .unwrap_or(lab_store::TaskStatus::Pending),
                    priority: draft.priority.or(existing.as_ref().and_then(|t| t.priority.clone())),
                    position,
                    source_tool_name: draft.source_tool_name,
                };
                self.deps.tasks.upsert(row).await?;
            }
        }

        let snapshot = self.deps.tasks.list(&self.session_id).await?;
        self.deps.bus.publish_tasks(&self.session_id, snapshot);
        Ok(())
    }

    /// Agent activity: cancel any pending completion timer and report
    /// `generating`. Deltas always publish (the preview grows); the DB row
    /// is written only on an actual transition.
    async fn mark_generating(&mut self, is_delta: bool) {
        if let Some(handle) = self.debounce.take() {
            handle.abort();
        }
        let transitioned = self.status != InferenceStatus::Generating;
        self.status = InferenceStatus::Generating;
        if transitioned {
            if let Err(e) = self
                .deps
                .metadata
                .set_inference_status(&self.session_id, InferenceStatus::Generating)
                .await
            {
                warn!(session_id = %self.session_id, "status update failed: {e}");
            }
        }
        if transitioned || is_delta {
            self.deps.bus.publish_status(
                &self.session_id,
                StatusDelta {
                    status: InferenceStatus::Generating,
                    preview: (!self.turn_preview.is_empty()).then(|| self.turn_preview.clone()),
                },
            );
        }
    }

    /// Turn terminator: clear the preview, report `idle`, and start the
    /// completion grace timer. The timer fires at most once per session.
    async fn mark_idle(&mut self) {
        self.turn_preview.clear();
        let transitioned = self.status != InferenceStatus::Idle;
        self.status = InferenceStatus::Idle;
        if transitioned {
            if let Err(e) = self
                .deps
                .metadata
                .set_inference_status(&self.session_id, InferenceStatus::Idle)
                .await
            {
                warn!(session_id = %self.session_id, "status update failed: {e}");
            }
        }
        self.deps.bus.publish_status(
            &self.session_id,
            StatusDelta { status: InferenceStatus::Idle, preview: None },
        );

        if let Some(handle) = self.debounce.take() {
            handle.abort();
        }
        if self
            .completed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&self.session_id)
        {
            return;
        }
        let session_id = self.session_id.clone();
        let bus = self.deps.bus.clone();
        let completed = self.completed.clone();
        let grace = self.deps.completion_grace;
        self.debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let fresh = completed
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(session_id.clone());
            if fresh {
                debug!(%session_id, "completion debounce fired");
                bus.publish_completed(&session_id);
            }
        }));
    }
}

// ── Hub / reconciler ──────────────────────────────────────────────────────────

struct MonitorHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct MonitorHub {
    deps: MonitorDeps,
    manager: Arc<AgentSessionManager>,
    directory: lab_store::SessionDirectory,
    monitors: DashMap<String, MonitorHandle>,
    completed: CompletedSet,
    reconcile_interval: Duration,
}

impl MonitorHub {
    pub fn new(
        deps: MonitorDeps,
        manager: Arc<AgentSessionManager>,
        directory: lab_store::SessionDirectory,
        reconcile_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            deps,
            manager,
            directory,
            monitors: DashMap::new(),
            completed: Arc::new(Mutex::new(HashSet::new())),
            reconcile_interval,
        })
    }

    /// Start a monitor for this session unless one is already running.
    pub fn ensure(&self, session_id: &str) {
        if let Some(existing) = self.monitors.get(session_id) {
            if !existing.task.is_finished() {
                return;
            }
        }
        let rx = self.manager.subscribe(session_id);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = SessionMonitor::spawn(
            session_id.to_string(),
            self.deps.clone(),
            self.completed.clone(),
            rx,
            stop_rx,
        );
        self.monitors
            .insert(session_id.to_string(), MonitorHandle { stop: stop_tx, task });
    }

    pub fn stop(&self, session_id: &str) {
        if let Some((_, handle)) = self.monitors.remove(session_id) {
            let _ = handle.stop.send(true);
        }
    }

    /// One reconciliation pass (see module docs).
    pub async fn reconcile_once(self: &Arc<Self>) {
        let records = match self.directory.list_running().await {
            Ok(r) => r,
            Err(e) => {
                warn!("reconcile: could not list running sessions: {e}");
                return;
            }
        };

        let running: HashSet<String> =
            records.iter().map(|r| r.session_id.clone()).collect();

        for record in &records {
            self.ensure(&record.session_id);
            // A running session with a persisted agent id but no live
            // subprocess lost its agent (restart, crash): resume it.
            if record.agent_session_id.is_some()
                && !self.manager.has_live_session(&record.session_id)
            {
                if let Err(e) = self.manager.create_session(&record.session_id, None).await {
                    warn!(session_id = %record.session_id, "reconcile resume failed: {e}");
                }
            }
        }

        let stale: Vec<String> = self
            .monitors
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| !running.contains(id))
            .collect();
        for id in stale {
            debug!(session_id = %id, "stopping monitor for non-running session");
            self.stop(&id);
        }
    }

    /// The reconciliation loop. Runs until the process exits.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.reconcile_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.reconcile_once().await;
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
