// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Route handlers.

use std::{convert::Infallible, path::PathBuf, time::Duration};

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use lab_events::PARSER_VERSION;
use lab_store::{InferenceStatus, ReplayCheckpoint};

use crate::{
    files,
    recovery::{send_with_recovery, SendOptions},
};

use super::{ApiError, AppState, LabSessionId};

// ── Sessions ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    pub model: Option<String>,
}

/// `POST /sessions` — create or return the session's agent session id.
pub async fn create_session(
    State(state): State<AppState>,
    LabSessionId(session_id): LabSessionId,
    body: Option<Json<CreateSessionBody>>,
) -> Result<Json<Value>, ApiError> {
    let model = body.and_then(|b| b.0.model);
    // Monitor first: its subscription must be live before the agent can
    // produce anything worth persisting.
    state.hub.ensure(&session_id);
    let id = state.manager.create_session(&session_id, model).await?;
    Ok(Json(json!({ "id": id })))
}

/// `DELETE /sessions` — destroy the subprocess if present; always succeeds.
pub async fn delete_session(
    State(state): State<AppState>,
    LabSessionId(session_id): LabSessionId,
) -> Json<Value> {
    state.manager.destroy_session(&session_id).await;
    Json(json!({ "ok": true }))
}

// ── Messages ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessageBody {
    pub message: Option<String>,
    pub model: Option<String>,
}

/// `POST /messages` — forward a user message with bounded retry-with-reset.
pub async fn post_message(
    State(state): State<AppState>,
    LabSessionId(session_id): LabSessionId,
    Json(body): Json<PostMessageBody>,
) -> Result<Json<Value>, ApiError> {
    let message = body
        .message
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing 'message'".to_string()))?;

    state.hub.ensure(&session_id);
    state
        .metadata
        .set_inference_status(&session_id, InferenceStatus::Generating)
        .await?;
    // The user's text is the preview until the monitor replaces it with the
    // assistant's; written up front so it never clobbers that replacement.
    state.metadata.set_last_message(&session_id, &message).await?;

    let opts = SendOptions {
        model: body.model,
        phase_timeout: Duration::from_secs(state.config.acp.phase_timeout_secs),
    };
    let sent = send_with_recovery(&state.manager, &state.directory, &session_id, &message, opts)
        .await;

    if let Err(e) = sent {
        // The turn never started; don't leave the status stuck.
        let _ = state
            .metadata
            .set_inference_status(&session_id, InferenceStatus::Idle)
            .await;
        return Err(e.into());
    }

    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetModelBody {
    pub model: Option<String>,
}

/// `POST /model` — switch the agent's model, creating the session if needed.
pub async fn set_model(
    State(state): State<AppState>,
    LabSessionId(session_id): LabSessionId,
    Json(body): Json<SetModelBody>,
) -> Result<Json<Value>, ApiError> {
    let model = body
        .model
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing 'model'".to_string()))?;

    state.hub.ensure(&session_id);
    state.manager.create_session(&session_id, None).await?;
    state.manager.set_session_model(&session_id, &model).await?;
    Ok(Json(json!({ "ok": true })))
}

/// `POST /cancel` — cancel the in-flight prompt.
pub async fn cancel(
    State(state): State<AppState>,
    LabSessionId(session_id): LabSessionId,
) -> Result<Json<Value>, ApiError> {
    state.manager.cancel_prompt(&session_id).await?;
    Ok(Json(json!({ "ok": true })))
}

// ── Event streaming / history ─────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Advisory only: the stream always begins at `max(sequence) + 1`.
    pub offset: Option<i64>,
}

/// `GET /events` — live SSE stream; frame ids are log sequences.
pub async fn events(
    State(state): State<AppState>,
    LabSessionId(session_id): LabSessionId,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // Everything at or below this point is history and belongs to /history;
    // the live stream starts after it regardless of the client's offset.
    let start = state.log.max_sequence(&session_id).await? + 1;
    if let Some(offset) = query.offset {
        debug!(%session_id, offset, start, "client offset is advisory");
    }

    let mut rx = state.bus.subscribe_acp(&session_id);
    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(ev) if ev.sequence >= start => {
                    let data = match serde_json::to_string(&ev.envelope) {
                        Ok(d) => d,
                        Err(_) => continue,
                    };
                    yield Ok(Event::default().id(ev.sequence.to_string()).data(data));
                }
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    // The client replays the gap via /history.
                    debug!(n, "SSE subscriber lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// `GET /history` — the persisted envelope log, in order.
pub async fn history(
    State(state): State<AppState>,
    LabSessionId(session_id): LabSessionId,
) -> Result<Json<Value>, ApiError> {
    let events = state.log.events_after(&session_id, None).await?;
    let rows: Vec<Value> = events
        .into_iter()
        .map(|e| json!({ "sequence": e.sequence, "eventData": e.envelope }))
        .collect();
    Ok(Json(Value::Array(rows)))
}

// ── Files ─────────────────────────────────────────────────────────────────────

async fn workspace_dir(state: &AppState, session_id: &str) -> Result<PathBuf, ApiError> {
    if let Some(record) = state.directory.get(session_id).await? {
        if let Some(dir) = record.workspace_dir {
            return Ok(PathBuf::from(dir));
        }
    }
    Ok(state.config.resolved_workspace_root().join(session_id))
}

/// `GET /files/status` — changed files (git, falling back to tool events).
pub async fn files_status(
    State(state): State<AppState>,
    LabSessionId(session_id): LabSessionId,
) -> Result<Json<Value>, ApiError> {
    let workspace = workspace_dir(&state, &session_id).await?;
    let changes = files::file_status(&workspace, &state.log, &session_id).await?;
    Ok(Json(json!({ "files": changes })))
}

#[derive(Debug, Default, Deserialize)]
pub struct PathQuery {
    pub path: Option<String>,
}

/// `GET /files/list?path=` — workspace directory listing.
pub async fn files_list(
    State(state): State<AppState>,
    LabSessionId(session_id): LabSessionId,
    Query(query): Query<PathQuery>,
) -> Result<Json<Value>, ApiError> {
    let workspace = workspace_dir(&state, &session_id).await?;
    let entries = files::list_dir(&workspace, query.path.as_deref().unwrap_or("")).await?;
    Ok(Json(json!({ "entries": entries })))
}

/// `GET /files/read?path=` — workspace file contents.
pub async fn files_read(
    State(state): State<AppState>,
    LabSessionId(session_id): LabSessionId,
    Query(query): Query<PathQuery>,
) -> Result<Json<Value>, ApiError> {
    let path = query
        .path
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing 'path'".to_string()))?;
    let workspace = workspace_dir(&state, &session_id).await?;
    let content = files::read_file(&workspace, &path).await?;
    Ok(Json(json!({ "type": "text", "content": content, "patch": null })))
}

// ── Replay checkpoints ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointBody {
    pub parser_version: Option<u32>,
    pub last_sequence: Option<i64>,
    pub replay_state: Option<Value>,
}

/// `POST /replay-checkpoint` — save the client's replay position. Rejected
/// when the parser version doesn't match, so stale checkpoints die here
/// instead of poisoning a future replay.
pub async fn replay_checkpoint(
    State(state): State<AppState>,
    LabSessionId(session_id): LabSessionId,
    Json(body): Json<CheckpointBody>,
) -> Result<Json<Value>, ApiError> {
    let parser_version = body
        .parser_version
        .ok_or_else(|| ApiError::BadRequest("missing 'parserVersion'".to_string()))?;
    if parser_version != PARSER_VERSION {
        return Err(ApiError::BadRequest(
            "Unsupported replay parser version".to_string(),
        ));
    }
    let last_sequence = body
        .last_sequence
        .ok_or_else(|| ApiError::BadRequest("missing 'lastSequence'".to_string()))?;
    let replay_state = body
        .replay_state
        .ok_or_else(|| ApiError::BadRequest("missing 'replayState'".to_string()))?;

    state
        .checkpoints
        .upsert(
            &session_id,
            &ReplayCheckpoint { parser_version, last_sequence, replay_state },
        )
        .await?;
    Ok(Json(json!({ "ok": true })))
}

// ── Directory ─────────────────────────────────────────────────────────────────

/// `GET /agents` — installed agents and their models.
pub async fn agents(State(state): State<AppState>) -> Json<Value> {
    let agents: Vec<Value> = state
        .config
        .agents
        .iter()
        .map(|a| json!({ "id": a.id, "name": a.name, "models": a.models }))
        .collect();
    Json(json!({ "agents": agents }))
}

/// `GET /models` — models of the default agent.
pub async fn models(State(state): State<AppState>) -> Json<Value> {
    let models = state
        .config
        .default_agent()
        .map(|a| a.models.clone())
        .unwrap_or_default();
    Json(json!({ "models": models }))
}

// ── Question / permission stubs ───────────────────────────────────────────────

/// Wire-protocol placeholders: permissions are auto-approved server-side,
/// so replies are acknowledged and dropped.
pub async fn acknowledge(
    LabSessionId(_session_id): LabSessionId,
    Path(_id): Path<String>,
) -> Json<Value> {
    Json(json!({ "ok": true }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
        Router,
    };
    use http_body_util::BodyExt;
    use tokio_stream::StreamExt;
    use tower::ServiceExt;

    use lab_config::{AgentDefinition, GatewayConfig, ModelDefinition};
    use lab_store::{
        CheckpointStore, Db, EventLog, MetadataStore, SessionDirectory, TaskStore,
    };

    use crate::{
        bus::SessionEventBus,
        manager::{AgentSessionManager, ManagerConfig},
        monitor::{MonitorDeps, MonitorHub},
    };

    use super::super::{router, AppState, LAB_SESSION_HEADER};
    use super::*;

    /// Scripted ACP agent (see `manager::tests`): deterministic request ids,
    /// one streamed chunk per prompt.
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
      printf '{"jsonrpc":"2.0","method":"session/update","params":{"sessionId":"agt-1","update":{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":"Hello!"}}}}\n'
      printf '{"jsonrpc":"2.0","id":3,"result":{"stopReason":"end_turn"}}\n'
      ;;
  esac
done
"#;

    /// Fails the first prompt per marker file with a recoverable error,
    /// succeeds afterwards.
    const FLAKY_AGENT: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":1,"result":{"agentCapabilities":{"loadSession":false}}}\n'
      ;;
    *'"method":"newSession"'*)
      printf '{"jsonrpc":"2.0","id":2,"result":{"sessionId":"agt-1"}}\n'
      ;;
    *'"method":"prompt"'*)
      if [ ! -f "$LAB_TEST_MARKER" ]; then
        : > "$LAB_TEST_MARKER"
        printf '{"jsonrpc":"2.0","id":3,"error":{"code":-32603,"message":"Request failed with status 500"}}\n'
      else
        printf '{"jsonrpc":"2.0","method":"session/update","params":{"sessionId":"agt-1","update":{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":"Recovered"}}}}\n'
        printf '{"jsonrpc":"2.0","id":3,"result":{"stopReason":"end_turn"}}\n'
      fi
      ;;
  esac
done
"#;

    fn test_app(script: &str) -> (Router, AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut env = HashMap::new();
        env.insert(
            "LAB_TEST_MARKER".to_string(),
            dir.path().join("marker").display().to_string(),
        );

        let mut config = GatewayConfig::default();
        config.workspace_root = Some(dir.path().join("ws"));
        config.agents = vec![AgentDefinition {
            id: "fake".to_string(),
            name: "Fake Agent".to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env,
            models: vec![
                ModelDefinition {
                    id: "claude-sonnet".to_string(),
                    name: "Claude Sonnet".to_string(),
                    default: true,
                },
                ModelDefinition {
                    id: "claude-haiku".to_string(),
                    name: "Claude Haiku".to_string(),
                    default: false,
                },
            ],
        }];
        let config = Arc::new(config);

        let db = Db::open_in_memory().unwrap();
        let log = EventLog::new(db.clone());
        let metadata = MetadataStore::new(db.clone());
        let tasks = TaskStore::new(db.clone());
        let checkpoints = CheckpointStore::new(db.clone());
        let directory = SessionDirectory::new(db);
        let bus = Arc::new(SessionEventBus::new());

        let manager = AgentSessionManager::new(
            ManagerConfig {
                agent: config.agents[0].clone(),
                workspace_root: config.resolved_workspace_root(),
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
            directory.clone(),
            Duration::from_secs(15),
        );

        let state = AppState {
            manager,
            hub,
            bus,
            log,
            metadata,
            checkpoints,
            directory,
            config,
        };
        (router(state.clone()), state, dir)
    }

    fn request(method: &str, path: &str, session: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("/api/agent{path}"));
        if let Some(sid) = session {
            builder = builder.header(LAB_SESSION_HEADER, sid);
        }
        match body {
            Some(v) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn missing_session_header_is_a_400() {
        let (app, _state, _dir) = test_app(FAKE_AGENT);
        let response = app
            .oneshot(request("GET", "/history", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("X-Lab-Session-Id"));
    }

    #[tokio::test]
    async fn request_id_is_echoed() {
        let (app, _state, _dir) = test_app(FAKE_AGENT);
        let response = app
            .oneshot(request("GET", "/agents", Some("lab-1"), None))
            .await
            .unwrap();
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn create_session_returns_agent_id_idempotently() {
        let (app, _state, _dir) = test_app(FAKE_AGENT);

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/sessions",
                Some("lab-1"),
                Some(json!({ "model": "claude-sonnet" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["id"], "agt-1");

        let response = app
            .oneshot(request("POST", "/sessions", Some("lab-1"), None))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["id"], "agt-1");
    }

    #[tokio::test]
    async fn full_turn_lands_in_history_in_order() {
        let (app, state, _dir) = test_app(FAKE_AGENT);

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/messages",
                Some("lab-1"),
                Some(json!({ "message": "hi" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Give the monitor a moment to drain the stream.
        tokio::time::sleep(Duration::from_millis(400)).await;

        let response = app
            .oneshot(request("GET", "/history", Some("lab-1"), None))
            .await
            .unwrap();
        let rows = body_json(response).await;
        let rows = rows.as_array().unwrap();
        assert!(rows.len() >= 3, "expected user/chunk/stop, got {rows:?}");

        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row["sequence"], i as i64, "sequences must be dense");
        }
        assert_eq!(
            rows[0]["eventData"]["params"]["update"]["sessionUpdate"],
            "user_message"
        );
        assert_eq!(
            rows.last().unwrap()["eventData"]["result"]["stopReason"],
            "end_turn"
        );

        // Final state: idle, assistant preview stored.
        let meta = state.metadata.get("lab-1").await.unwrap();
        assert_eq!(meta.last_message.as_deref(), Some("Hello!"));
    }

    #[tokio::test]
    async fn recoverable_send_failure_retries_and_keeps_one_user_message() {
        let (app, _state, _dir) = test_app(FLAKY_AGENT);

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/messages",
                Some("lab-1"),
                Some(json!({ "message": "hi" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "second attempt must succeed");

        tokio::time::sleep(Duration::from_millis(400)).await;

        let response = app
            .oneshot(request("GET", "/history", Some("lab-1"), None))
            .await
            .unwrap();
        let rows = body_json(response).await;
        let user_messages = rows
            .as_array()
            .unwrap()
            .iter()
            .filter(|r| {
                r["eventData"]["params"]["update"]["sessionUpdate"] == "user_message"
            })
            .count();
        assert_eq!(user_messages, 1, "retries must not duplicate the user message");
    }

    #[tokio::test]
    async fn events_stream_ids_continue_after_history() {
        let (app, state, _dir) = test_app(FAKE_AGENT);

        // First turn populates history.
        app.clone()
            .oneshot(request(
                "POST",
                "/messages",
                Some("lab-1"),
                Some(json!({ "message": "hi" })),
            ))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        let history_len = state.log.max_sequence("lab-1").await.unwrap() + 1;
        assert!(history_len >= 3);

        // Open the live stream, then trigger a second turn.
        let response = app
            .clone()
            .oneshot(request("GET", "/events?offset=0", Some("lab-1"), None))
            .await
            .unwrap();
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        let mut body = response.into_body().into_data_stream();

        app.clone()
            .oneshot(request(
                "POST",
                "/messages",
                Some("lab-1"),
                Some(json!({ "message": "again" })),
            ))
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("no SSE frame")
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(&frame).into_owned();
        assert!(
            text.contains(&format!("id: {history_len}")),
            "first live frame must continue after history (wanted id {history_len}): {text}"
        );
    }

    #[tokio::test]
    async fn double_cancel_returns_200_twice() {
        let (app, _state, _dir) = test_app(FAKE_AGENT);
        app.clone()
            .oneshot(request("POST", "/sessions", Some("lab-1"), None))
            .await
            .unwrap();

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(request("POST", "/cancel", Some("lab-1"), None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn cancel_without_session_is_404() {
        let (app, _state, _dir) = test_app(FAKE_AGENT);
        let response = app
            .oneshot(request("POST", "/cancel", Some("ghost"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn checkpoint_version_mismatch_is_rejected() {
        let (app, _state, _dir) = test_app(FAKE_AGENT);
        let response = app
            .oneshot(request(
                "POST",
                "/replay-checkpoint",
                Some("lab-1"),
                Some(json!({
                    "parserVersion": PARSER_VERSION - 1,
                    "lastSequence": 10,
                    "replayState": {},
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Unsupported replay parser version");
    }

    #[tokio::test]
    async fn checkpoint_round_trips_at_current_version() {
        let (app, state, _dir) = test_app(FAKE_AGENT);
        let response = app
            .oneshot(request(
                "POST",
                "/replay-checkpoint",
                Some("lab-1"),
                Some(json!({
                    "parserVersion": PARSER_VERSION,
                    "lastSequence": 42,
                    "replayState": { "messages": [] },
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let stored = state.checkpoints.get("lab-1").await.unwrap().unwrap();
        assert_eq!(stored.last_sequence, 42);
        assert_eq!(stored.parser_version, PARSER_VERSION);
    }

    #[tokio::test]
    async fn agents_and_models_come_from_config() {
        let (app, _state, _dir) = test_app(FAKE_AGENT);

        let response = app
            .clone()
            .oneshot(request("GET", "/agents", Some("lab-1"), None))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["agents"][0]["id"], "fake");
        assert_eq!(body["agents"][0]["models"][0]["id"], "claude-sonnet");

        let response = app
            .oneshot(request("GET", "/models", Some("lab-1"), None))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["models"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn files_read_returns_text_payload() {
        let (app, state, _dir) = test_app(FAKE_AGENT);
        let workspace = state.config.resolved_workspace_root().join("lab-1");
        tokio::fs::create_dir_all(&workspace).await.unwrap();
        tokio::fs::write(workspace.join("main.rs"), "fn main() {}").await.unwrap();
        state
            .directory
            .create_if_absent("lab-1", &workspace.display().to_string())
            .await
            .unwrap();

        let response = app
            .oneshot(request("GET", "/files/read?path=main.rs", Some("lab-1"), None))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["type"], "text");
        assert_eq!(body["content"], "fn main() {}");
        assert_eq!(body["patch"], Value::Null);
    }

    #[tokio::test]
    async fn question_and_permission_stubs_acknowledge() {
        let (app, _state, _dir) = test_app(FAKE_AGENT);
        for path in ["/questions/q1/reply", "/questions/q1/reject", "/permissions/p1/reply"] {
            let response = app
                .clone()
                .oneshot(request("POST", path, Some("lab-1"), Some(json!({}))))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn delete_session_always_succeeds() {
        let (app, _state, _dir) = test_app(FAKE_AGENT);
        // Even for a session that never existed.
        let response = app
            .oneshot(request("DELETE", "/sessions", Some("never-created"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
