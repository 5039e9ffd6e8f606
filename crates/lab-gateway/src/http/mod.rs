// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! HTTP surface of the gateway.
//!
//! All routes live under the configured prefix and require the
//! `X-Lab-Session-Id` header — the gateway is mounted behind the workspace's
//! authenticating proxy, which scopes every request to one lab session.
//! Responses echo `X-Request-Id`; CORS is permissive (the proxy is the
//! security boundary, not this service).

mod routes;

use std::sync::Arc;

use axum::{
    async_trait,
    extract::{DefaultBodyLimit, FromRequestParts},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
};
use tracing::info;

use lab_config::GatewayConfig;
use lab_store::{CheckpointStore, EventLog, MetadataStore, SessionDirectory};

use crate::{bus::SessionEventBus, manager::AgentSessionManager, monitor::MonitorHub, GatewayError};

/// Everything the handlers need, cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<AgentSessionManager>,
    pub hub: Arc<MonitorHub>,
    pub bus: Arc<SessionEventBus>,
    pub log: EventLog,
    pub metadata: MetadataStore,
    pub checkpoints: CheckpointStore,
    pub directory: SessionDirectory,
    pub config: Arc<GatewayConfig>,
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// HTTP-facing error: `{error}` JSON with the matching status code.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            // Validation problems are the client's to fix, not ours to log.
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Internal(m) => {
                tracing::error!("request failed: {m}");
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::NoSession(id) => ApiError::NotFound(format!("no session for server {id}")),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<lab_store::StoreError> for ApiError {
    fn from(e: lab_store::StoreError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

// ── Session header extractor ──────────────────────────────────────────────────

pub const LAB_SESSION_HEADER: &str = "x-lab-session-id";

/// The lab session every request is scoped to.
pub struct LabSessionId(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for LabSessionId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(LAB_SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(|v| LabSessionId(v.to_string()))
            .ok_or_else(|| ApiError::BadRequest("missing X-Lab-Session-Id header".to_string()))
    }
}

// ── Router / server ───────────────────────────────────────────────────────────

/// Build the full application router (prefix, layers and all).
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/sessions",
            post(routes::create_session).delete(routes::delete_session),
        )
        .route("/messages", post(routes::post_message))
        .route("/model", post(routes::set_model))
        .route("/cancel", post(routes::cancel))
        .route("/events", get(routes::events))
        .route("/history", get(routes::history))
        .route("/files/status", get(routes::files_status))
        .route("/files/list", get(routes::files_list))
        .route("/files/read", get(routes::files_read))
        .route("/replay-checkpoint", post(routes::replay_checkpoint))
        .route("/agents", get(routes::agents))
        .route("/models", get(routes::models))
        .route("/questions/:id/reply", post(routes::acknowledge))
        .route("/questions/:id/reject", post(routes::acknowledge))
        .route("/permissions/:id/reply", post(routes::acknowledge))
        .with_state(state.clone());

    Router::new()
        .nest(&state.config.http.route_prefix, api)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(CorsLayer::permissive())
                .layer(DefaultBodyLimit::max(state.config.http.max_body_bytes)),
        )
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let bind = state.config.http.bind.clone();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, "gateway HTTP server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
