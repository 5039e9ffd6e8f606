// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end gateway tests against a scripted shell agent: manager →
/// monitor → event log → replay, with no HTTP in between.
use std::{collections::HashMap, sync::Arc, time::Duration};

use lab_config::AgentDefinition;
use lab_events::SessionMessagesProjector;
use lab_gateway::{
    manager::{AgentSessionManager, ManagerConfig},
    monitor::{MonitorDeps, MonitorHub},
    SessionEventBus,
};
use lab_store::{Db, EventLog, InferenceStatus, MetadataStore, SessionDirectory, TaskStore};

/// Minimal ACP agent: request ids are deterministic per process
/// (initialize = 1, newSession = 2, prompt = 3).
const FAKE_AGENT: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":1,"result":{"agentCapabilities":{"loadSession":false}}}\n'
      ;;
    *'"method":"newSession"'*)
      printf '{"jsonrpc":"2.0","id":2,"result":{"sessionId":"agt-1"}}\n'
      ;;
    *'"method":"prompt"'*)
      printf '{"jsonrpc":"2.0","method":"session/update","params":{"sessionId":"agt-1","update":{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":"Hello"}}}}\n'
      printf '{"jsonrpc":"2.0","method":"session/update","params":{"sessionId":"agt-1","update":{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":"!"}}}}\n'
      printf '{"jsonrpc":"2.0","id":3,"result":{"stopReason":"end_turn"}}\n'
      ;;
  esac
done
"#;

struct Stack {
    manager: Arc<AgentSessionManager>,
    hub: Arc<MonitorHub>,
    log: EventLog,
    metadata: MetadataStore,
    bus: Arc<SessionEventBus>,
    _workdir: tempfile::TempDir,
}

fn stack() -> Stack {
    let workdir = tempfile::tempdir().unwrap();
    let db = Db::open_in_memory().unwrap();
    let log = EventLog::new(db.clone());
    let metadata = MetadataStore::new(db.clone());
    let tasks = TaskStore::new(db.clone());
    let directory = SessionDirectory::new(db);
    let bus = Arc::new(SessionEventBus::new());

    let manager = AgentSessionManager::new(
        ManagerConfig {
            agent: AgentDefinition {
                id: "fake".to_string(),
                name: "Fake".to_string(),
                command: "sh".to_string(),
                args: vec!["-c".to_string(), FAKE_AGENT.to_string()],
                env: HashMap::new(),
                models: Vec::new(),
            },
            workspace_root: workdir.path().to_path_buf(),
            mcp_server_url: None,
            request_timeout: Duration::from_secs(5),
            term_grace: Duration::from_millis(500),
            prompt_race: Duration::from_millis(1500),
            event_buffer_cap: 1024,
        },
        directory.clone(),
    );
    let hub = MonitorHub::new(
        MonitorDeps {
            log: log.clone(),
            metadata: metadata.clone(),
            tasks,
            bus: bus.clone(),
            completion_grace: Duration::from_millis(100),
        },
        manager.clone(),
        directory,
        Duration::from_secs(15),
    );

    Stack { manager, hub, log, metadata, bus, _workdir: workdir }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(400)).await;
}

#[tokio::test]
async fn one_turn_end_to_end() {
    let s = stack();
    s.hub.ensure("lab-1");
    let agent_id = s.manager.create_session("lab-1", None).await.unwrap();
    assert_eq!(agent_id, "agt-1");

    s.manager.send_message("lab-1", "hi", true).await.unwrap();
    settle().await;

    // The log holds the full turn with dense sequences.
    let events = s.log.events_after("lab-1", None).await.unwrap();
    assert!(events.len() >= 4, "user + 2 chunks + stop, got {events:?}");
    for (i, ev) in events.iter().enumerate() {
        assert_eq!(ev.sequence, i as i64);
    }

    // Replaying the log produces the rendered conversation.
    let mut projector = SessionMessagesProjector::new();
    for ev in &events {
        projector.feed(ev.sequence, &ev.envelope);
    }
    let messages = projector.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].text(), "hi");
    assert_eq!(messages[1].text(), "Hello!");

    // Metadata settled to idle with the assistant preview.
    let meta = s.metadata.get("lab-1").await.unwrap();
    assert_eq!(meta.inference_status, InferenceStatus::Idle);
    assert_eq!(meta.last_message.as_deref(), Some("Hello!"));

    s.manager.destroy_session("lab-1").await;
}

#[tokio::test]
async fn reconnect_replay_matches_live_accumulation() {
    let s = stack();
    s.hub.ensure("lab-1");
    s.manager.create_session("lab-1", None).await.unwrap();

    // Turn 1 happens while the client is away.
    s.manager.send_message("lab-1", "first", true).await.unwrap();
    settle().await;

    // The client reconnects: replays history, then follows live events.
    let history = s.log.events_after("lab-1", None).await.unwrap();
    let cut = history.len() as i64;
    let mut reconnecting = SessionMessagesProjector::new();
    for ev in &history {
        reconnecting.feed(ev.sequence, &ev.envelope);
    }
    let mut live = s.bus.subscribe_acp("lab-1");

    // Turn 2 streams live.
    s.manager.send_message("lab-1", "second", true).await.unwrap();
    settle().await;

    while let Ok(ev) = live.try_recv() {
        assert!(ev.sequence >= cut, "live events must continue after history");
        reconnecting.feed(ev.sequence, &ev.envelope);
    }

    // A full from-scratch replay must be byte-identical.
    let mut from_scratch = SessionMessagesProjector::new();
    for ev in s.log.events_after("lab-1", None).await.unwrap() {
        from_scratch.feed(ev.sequence, &ev.envelope);
    }
    assert_eq!(reconnecting.messages(), from_scratch.messages());
    assert_eq!(reconnecting.messages().len(), 4);

    s.manager.destroy_session("lab-1").await;
}

#[tokio::test]
async fn completion_debounce_fires_after_the_turn() {
    let s = stack();
    s.hub.ensure("lab-1");
    s.manager.create_session("lab-1", None).await.unwrap();
    let mut completed = s.bus.subscribe_completed("lab-1");

    s.manager.send_message("lab-1", "hi", true).await.unwrap();

    tokio::time::timeout(Duration::from_secs(3), completed.recv())
        .await
        .expect("completion never fired")
        .unwrap();

    s.manager.destroy_session("lab-1").await;
}
