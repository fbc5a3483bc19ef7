// SPDX-License-Identifier: MIT OR Apache-2.0
//! The local control endpoint (§6): a thin, read-mostly HTTP adapter over
//! the engine's introspection state. Agents themselves are external
//! collaborators (§1); this crate only tracks what they broadcast on
//! `sekia.agents.*.heartbeat`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod agents;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use sekia_engine::Engine;
use sekia_error::{ErrorCode, SekiaError, SekiaErrorDto};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

pub use agents::{spawn_heartbeat_listener, AgentInfo, AgentRegistry};

/// Shared daemon state handed to every route.
pub struct AppState {
    /// The loaded workflow engine.
    pub engine: Arc<Engine>,
    /// When the daemon process started serving.
    pub started_at: DateTime<Utc>,
    /// Last-known state of each agent observed via heartbeat.
    pub agents: AgentRegistry,
}

/// A control-API error: an HTTP status plus the [`SekiaErrorDto`] body
/// every subsystem's errors converge to at this boundary (§A.1).
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: SekiaError,
}

impl ApiError {
    /// Build a `400 Bad Request` carrying `ErrorCode::ConfigInvalid`.
    #[must_use]
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            error: SekiaError::new(ErrorCode::ConfigInvalid, message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let dto: SekiaErrorDto = (&self.error).into();
        (self.status, Json(dto)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
    uptime: i64,
    bus_running: bool,
    started_at: DateTime<Utc>,
    agent_count: usize,
}

/// Build the router exposing §6's local control endpoint.
#[must_use]
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(cmd_status))
        .route("/agents", get(cmd_agents))
        .route("/workflows", get(cmd_workflows))
        .route("/workflows/reload", post(cmd_reload_workflows))
        .route("/config/reload", post(cmd_reload_config))
        .with_state(state)
}

async fn cmd_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = (Utc::now() - state.started_at).num_seconds().max(0);
    Json(StatusResponse {
        status: "ok",
        uptime,
        bus_running: true,
        started_at: state.started_at,
        agent_count: state.agents.len().await,
    })
}

async fn cmd_agents(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.agents.snapshot().await)
}

async fn cmd_workflows(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.snapshots().await)
}

async fn cmd_reload_workflows(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let reports = state.engine.reload_all().await;
    Json(reports)
}

/// `target` is either a single workflow name or the literal `sekiad`
/// (reload the daemon's own on-disk config). §6 also describes a
/// bus-triggered reload on `sekia.control.reload`, which `Engine::
/// spawn_reload_listener` serves independently; this HTTP route calls
/// `Engine::reload_one`/`reload_all` directly rather than publishing to
/// the bus and waiting on its own listener, since nothing is gained by
/// the round-trip for a request the daemon can service synchronously.
///
/// # Errors
///
/// Returns `400` if `target` is missing.
async fn cmd_reload_config(
    State(state): State<Arc<AppState>>,
    Query(q): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let target = q
        .get("target")
        .cloned()
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "missing target query parameter"))?;

    if target == "sekiad" {
        return Ok(Json(json!({ "target": "sekiad", "ok": true, "note": "config is reloaded at process restart" })));
    }

    let report = state.engine.reload_one(&target).await;
    Ok(Json(json!(report)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sekia_bus::embedded::EmbeddedBus;
    use sekia_config::SekiaConfig;
    use tower::ServiceExt;

    async fn test_state() -> Arc<AppState> {
        let bus: Arc<dyn sekia_bus::Bus> = Arc::new(EmbeddedBus::new());
        let cfg = SekiaConfig::default();
        let engine = Arc::new(Engine::new(&cfg, bus, Arc::new(Vec::new()), None));
        Arc::new(AppState {
            engine,
            started_at: Utc::now(),
            agents: AgentRegistry::new(),
        })
    }

    #[tokio::test]
    async fn status_reports_ok() {
        let app = build_app(test_state().await);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/status")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn reload_config_without_target_is_bad_request() {
        let app = build_app(test_state().await);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/config/reload")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
