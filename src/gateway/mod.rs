//! Agent gateway — the WebSocket upgrade endpoint and its HTTP fallback
//! surface for worker-node agents.
//!
//! Mirrors the teacher's gateway shape (a `GatewayState` injected into an
//! `axum::Router`, a nested `/api` sub-router, a `ServeDir` fallback is
//! intentionally dropped since there is no web UI here) but the state and
//! routes are generalized from the AI-agent chat domain to agent
//! registration/tasking.

pub mod auth;
pub mod connections;
pub mod rate_limit;
pub mod ws;

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, State},
    http::{header, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tokio::sync::RwLock;

use crate::agents::AgentRegistry;
use crate::dispatch::Dispatcher;
use crate::pipeline::ExecuteResult;
use crate::protocol::TaskResultData;
use crate::scheduler::Scheduler;
use crate::storage::Storage;
use crate::tokens::TokenService;

use connections::ConnectionRegistry;
use rate_limit::RateLimiter;

#[derive(Clone)]
pub struct GatewayState {
    pub storage: Arc<Storage>,
    pub agents: Arc<AgentRegistry>,
    pub tokens: Arc<TokenService>,
    pub dispatcher: Arc<Dispatcher>,
    pub scheduler: Arc<Scheduler>,
    pub connections: Arc<ConnectionRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub admin_token: String,
    pub agent_idle_threshold_secs: i64,
    pub update_bundle_dir: Arc<RwLock<PathBuf>>,
    pub latest_version: Arc<RwLock<String>>,
}

impl GatewayState {
    pub fn latest_agent_version(&self) -> String {
        self.latest_version
            .try_read()
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

/// Build the agent-facing router: the WebSocket upgrade plus the HTTP
/// fallback endpoints from §6. None of these routes sit behind
/// [`auth::admin_auth_middleware`] — agents authenticate with their own
/// token + machine id instead.
pub fn agent_router(state: GatewayState) -> Router {
    Router::new()
        .route("/agent/ws", get(ws::agent_ws_handler))
        .route("/agent/register", post(register_handler))
        .route("/agent/tasks", get(tasks_handler))
        .route("/agent/report", post(report_handler))
        .route("/agent/download", get(crate::update_server::download_handler))
        .route("/agent/version", get(crate::update_server::version_handler))
        .with_state(state)
}

/// Spawn the background sweeper that closes idle agent connections.
/// Intended to run for the lifetime of the server process.
pub fn spawn_sweeper(state: GatewayState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(ws::run_sweeper(state))
}

fn bearer_token(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::to_string)
}

async fn register_handler(
    State(state): State<GatewayState>,
    headers: axum::http::HeaderMap,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let Some(token) = bearer_token(&headers) else {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"error": "token-unknown"}))).into_response();
    };
    let machine_id = headers
        .get("X-Machine-ID")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| body.get("machine_id").and_then(|v| v.as_str()).map(str::to_string));
    let Some(machine_id) = machine_id else {
        return (StatusCode::BAD_REQUEST, Json(serde_json::json!({"error": "missing X-Machine-ID"}))).into_response();
    };

    match state.agents.register_by_token(&token, &machine_id, &addr.ip().to_string()) {
        Ok(outcome) => Json(serde_json::json!({
            "agent_id": outcome.agent.id,
            "token": outcome.agent.token,
            "message": if outcome.is_new { "registered" } else { "reused" },
        }))
        .into_response(),
        Err(e) => (StatusCode::FORBIDDEN, Json(serde_json::json!({"error": e.to_string()}))).into_response(),
    }
}

async fn tasks_handler(State(state): State<GatewayState>, headers: axum::http::HeaderMap) -> impl IntoResponse {
    let Some(token) = bearer_token(&headers) else {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"error": "token-unknown"}))).into_response();
    };
    let Ok(Some(agent)) = state.agents.get_by_token(&token) else {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"error": "token-unknown"}))).into_response();
    };
    let Ok(tasks) = state.storage.list_tasks_for_agent(agent.id) else {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": "storage-failure"}))).into_response();
    };
    Json(serde_json::json!({"agent_id": agent.id, "tasks": tasks})).into_response()
}

async fn report_handler(
    State(state): State<GatewayState>,
    headers: axum::http::HeaderMap,
    Json(body): Json<TaskResultData>,
) -> impl IntoResponse {
    let Some(token) = bearer_token(&headers) else {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"error": "token-unknown"}))).into_response();
    };
    let Ok(Some(agent)) = state.agents.get_by_token(&token) else {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"error": "token-unknown"}))).into_response();
    };

    let bound_ok = matches!(state.storage.get_task(body.task_id), Ok(t) if t.agent_id == Some(agent.id));
    if !bound_ok {
        return (StatusCode::FORBIDDEN, Json(serde_json::json!({"error": "agent-not-bound"}))).into_response();
    }

    let result = ExecuteResult {
        task_id: body.task_id,
        agent_id: Some(agent.id),
        command: body.command,
        output: body.output,
        status: body.status,
        duration_ms: body.duration,
        exit_code: body.exit_code,
        start_ts: body.start_time,
        end_ts: body.end_time,
    };
    match crate::pipeline::run(state.storage.clone(), result).await {
        Ok(_) => Json(serde_json::json!({"message": "recorded"})).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": e.to_string()}))).into_response(),
    }
}

/// Push `tasks` to a specific connected agent, e.g. after an admin edits
/// a bound task. No-op if the agent isn't currently connected.
pub async fn push_tasks_to_agent(state: &GatewayState, agent_id: i64) {
    let Ok(tasks) = state.storage.list_tasks_for_agent(agent_id) else {
        return;
    };
    let wire_tasks = tasks
        .into_iter()
        .map(|t| crate::protocol::TaskWire {
            id: t.id,
            name: t.name,
            command: t.command,
            schedule: t.schedule,
            timeout_minutes: t.timeout_minutes,
            work_dir: t.work_dir,
            env_ids: t.env_ids,
            enabled: t.enabled,
        })
        .collect();
    let msg = crate::protocol::Message::Tasks(crate::protocol::TasksData { tasks: wire_tasks });
    if let Ok(frame) = msg.into_frame() {
        state.connections.send_to(agent_id, frame).await;
    }
}

/// Force-push an `execute` command to an agent for a specific task id.
pub async fn push_execute(state: &GatewayState, agent_id: i64, task_id: i64) {
    let msg = crate::protocol::Message::Execute(crate::protocol::ExecuteData { task_id });
    if let Ok(frame) = msg.into_frame() {
        state.connections.send_to(agent_id, frame).await;
    }
}

/// Push an `enabled`/`disabled` agent-scope toggle.
pub async fn push_agent_toggle(state: &GatewayState, agent_id: i64, enabled: bool) {
    let msg = if enabled {
        crate::protocol::Message::Enabled
    } else {
        crate::protocol::Message::Disabled
    };
    if let Ok(frame) = msg.into_frame() {
        state.connections.send_to(agent_id, frame).await;
    }
}

/// Wrap `router` with the admin bearer-token layer. Thin helper so the
/// binary's router assembly doesn't need to name axum's middleware types.
pub fn with_admin_auth(router: Router, state: GatewayState) -> Router {
    router.layer(middleware::from_fn_with_state(state, auth::admin_auth_middleware))
}
