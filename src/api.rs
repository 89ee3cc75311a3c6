//! Admin HTTP API — the narrow REST surface an (out-of-scope) web UI would
//! consume: task/env/log/agent/token CRUD plus a manual trigger endpoint and
//! a live log tail over WebSocket.
//!
//! Mounted on the same `axum::Router` as the agent gateway, behind
//! [`crate::gateway::with_admin_auth`] — the same bearer-token middleware
//! shape as the teacher's own admin surface, generalized from "agent skill
//! token" to "admin bearer token".

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, patch, post, put},
    Json, Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::gateway::GatewayState;
use crate::storage::{NewTask, Retention, Task};

pub fn admin_router(state: GatewayState) -> Router {
    let router = Router::new()
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/:id", get(get_task).put(update_task).delete(delete_task))
        .route("/tasks/:id/trigger", post(trigger_task))
        .route("/tasks/:id/logs", get(list_logs_for_task))
        .route("/env", get(list_env).post(create_env))
        .route("/env/:id", delete(delete_env))
        .route("/logs/:id", get(get_log))
        .route("/agents", get(list_agents))
        .route("/agents/:id", patch(update_agent).delete(delete_agent))
        .route("/agents/:id/force-update", post(force_update_agent))
        .route("/tokens", get(list_tokens).post(create_token))
        .route("/tokens/:id", delete(delete_token))
        .with_state(state.clone());

    let router = router.route("/ws/logs", get(ws_logs_handler)).with_state(state.clone());

    crate::gateway::with_admin_auth(router, state)
}

fn err(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (status, Json(serde_json::json!({"error": message.into()}))).into_response()
}

// --- tasks -------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TaskBody {
    name: String,
    command: String,
    schedule: String,
    #[serde(default = "default_timeout_minutes")]
    timeout_minutes: i64,
    #[serde(default)]
    work_dir: String,
    #[serde(default)]
    env_ids: Vec<i64>,
    #[serde(default)]
    retention: Retention,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    agent_id: Option<i64>,
}

fn default_timeout_minutes() -> i64 {
    30
}
fn default_true() -> bool {
    true
}

impl From<TaskBody> for NewTask {
    fn from(b: TaskBody) -> Self {
        NewTask {
            name: b.name,
            command: b.command,
            schedule: b.schedule,
            timeout_minutes: b.timeout_minutes,
            work_dir: b.work_dir,
            env_ids: b.env_ids,
            retention: b.retention,
            enabled: b.enabled,
            agent_id: b.agent_id,
        }
    }
}

/// Re-sync the scheduler for a single task after a create/update/delete.
async fn resync_task(state: &GatewayState, task: Option<&Task>) {
    match task {
        Some(t) if t.agent_id.is_none() => {
            let scheduled = crate::scheduler::ScheduledTask {
                id: t.id,
                schedule: t.schedule.clone(),
                command: t.command.clone(),
                enabled: t.enabled,
            };
            if let Err(e) = state.scheduler.add_or_update(&scheduled).await {
                tracing::warn!(task_id = t.id, error = %e, "invalid-schedule: task not rescheduled");
            }
        }
        Some(t) => {
            // Remote-bound task: no local timer, but notify the agent so
            // it picks up the change on its own schedule diff.
            state.scheduler.remove(t.id).await;
            crate::gateway::push_tasks_to_agent(state, t.id).await;
        }
        None => {}
    }
}

async fn list_tasks(State(state): State<GatewayState>) -> impl IntoResponse {
    match state.storage.list_tasks() {
        Ok(tasks) => Json(tasks).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn create_task(State(state): State<GatewayState>, Json(body): Json<TaskBody>) -> impl IntoResponse {
    let new_task: NewTask = body.into();
    match state.storage.create_task(&new_task) {
        Ok(task) => {
            resync_task(&state, Some(&task)).await;
            if let Some(agent_id) = task.agent_id {
                crate::gateway::push_tasks_to_agent(&state, agent_id).await;
            }
            (StatusCode::CREATED, Json(task)).into_response()
        }
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn get_task(State(state): State<GatewayState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.storage.get_task(id) {
        Ok(task) => Json(task).into_response(),
        Err(e) => err(StatusCode::NOT_FOUND, e.to_string()),
    }
}

async fn update_task(
    State(state): State<GatewayState>,
    Path(id): Path<i64>,
    Json(body): Json<TaskBody>,
) -> impl IntoResponse {
    let new_task: NewTask = body.into();
    match state.storage.update_task(id, &new_task) {
        Ok(task) => {
            resync_task(&state, Some(&task)).await;
            if let Some(agent_id) = task.agent_id {
                crate::gateway::push_tasks_to_agent(&state, agent_id).await;
            }
            Json(task).into_response()
        }
        Err(e) => err(StatusCode::NOT_FOUND, e.to_string()),
    }
}

async fn delete_task(State(state): State<GatewayState>, Path(id): Path<i64>) -> impl IntoResponse {
    let agent_id = state.storage.get_task(id).ok().and_then(|t| t.agent_id);
    match state.storage.delete_task(id) {
        Ok(()) => {
            state.scheduler.remove(id).await;
            if let Some(agent_id) = agent_id {
                crate::gateway::push_tasks_to_agent(&state, agent_id).await;
            }
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => err(StatusCode::NOT_FOUND, e.to_string()),
    }
}

/// Manually fire a task — enqueues exactly as a cron fire would.
async fn trigger_task(State(state): State<GatewayState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.storage.get_task(id) {
        Ok(task) => {
            if let Some(agent_id) = task.agent_id {
                crate::gateway::push_execute(&state, agent_id, id).await;
            } else {
                state.dispatcher.enqueue(id).await;
            }
            Json(serde_json::json!({"message": "triggered"})).into_response()
        }
        Err(e) => err(StatusCode::NOT_FOUND, e.to_string()),
    }
}

// --- env vars ------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EnvVarBody {
    name: String,
    value: String,
    #[serde(default)]
    remark: Option<String>,
}

async fn list_env(State(state): State<GatewayState>) -> impl IntoResponse {
    match state.storage.list_env_vars() {
        Ok(vars) => Json(vars).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn create_env(State(state): State<GatewayState>, Json(body): Json<EnvVarBody>) -> impl IntoResponse {
    match state
        .storage
        .create_env_var(&body.name, &body.value, body.remark.as_deref())
    {
        Ok(var) => (StatusCode::CREATED, Json(var)).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn delete_env(State(state): State<GatewayState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.storage.delete_env_var(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// --- logs ------------------------------------------------------------

#[derive(Debug, Serialize)]
struct LogView {
    id: i64,
    task_id: i64,
    agent_id: Option<i64>,
    command: String,
    /// Base64-encoded gzip bytes. The database stores raw bytes; base64
    /// only happens here, at the API boundary, for JSON transport.
    output_gz_base64: String,
    status: String,
    duration_ms: i64,
    exit_code: i32,
    start_ts: String,
    end_ts: String,
}

impl From<crate::storage::TaskLog> for LogView {
    fn from(l: crate::storage::TaskLog) -> Self {
        LogView {
            id: l.id,
            task_id: l.task_id,
            agent_id: l.agent_id,
            command: l.command,
            output_gz_base64: base64::engine::general_purpose::STANDARD.encode(&l.output_gz),
            status: l.status,
            duration_ms: l.duration_ms,
            exit_code: l.exit_code,
            start_ts: l.start_ts,
            end_ts: l.end_ts,
        }
    }
}

async fn list_logs_for_task(State(state): State<GatewayState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.storage.list_logs_for_task(id) {
        Ok(logs) => Json(logs.into_iter().map(LogView::from).collect::<Vec<_>>()).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn get_log(State(state): State<GatewayState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.storage.get_log(id) {
        Ok(Some(log)) => Json(LogView::from(log)).into_response(),
        Ok(None) => err(StatusCode::NOT_FOUND, "task-not-found"),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// --- agents ------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AgentPatchBody {
    name: String,
    #[serde(default)]
    description: Option<String>,
    enabled: bool,
}

async fn list_agents(State(state): State<GatewayState>) -> impl IntoResponse {
    match state.agents.list() {
        Ok(agents) => Json(agents).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn update_agent(
    State(state): State<GatewayState>,
    Path(id): Path<i64>,
    Json(body): Json<AgentPatchBody>,
) -> impl IntoResponse {
    match state
        .agents
        .update(id, &body.name, body.description.as_deref(), body.enabled)
    {
        Ok(agent) => {
            crate::gateway::push_agent_toggle(&state, id, body.enabled).await;
            Json(agent).into_response()
        }
        Err(e) => err(StatusCode::NOT_FOUND, e.to_string()),
    }
}

async fn delete_agent(State(state): State<GatewayState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.agents.delete(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => err(StatusCode::CONFLICT, e.to_string()),
    }
}

async fn force_update_agent(State(state): State<GatewayState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.agents.set_force_update(id) {
        Ok(()) => Json(serde_json::json!({"message": "force-update scheduled"})).into_response(),
        Err(e) => err(StatusCode::NOT_FOUND, e.to_string()),
    }
}

// --- enrollment tokens --------------------------------------------------

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(default)]
    remark: Option<String>,
    #[serde(default)]
    max_uses: i64,
    #[serde(default)]
    expires_at: Option<String>,
}

async fn list_tokens(State(state): State<GatewayState>) -> impl IntoResponse {
    match state.tokens.list() {
        Ok(tokens) => Json(tokens).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn create_token(State(state): State<GatewayState>, Json(body): Json<TokenBody>) -> impl IntoResponse {
    match state
        .tokens
        .create(body.remark.as_deref(), body.max_uses, body.expires_at.as_deref())
    {
        Ok(token) => (StatusCode::CREATED, Json(token)).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn delete_token(State(state): State<GatewayState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.tokens.delete(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// --- live log tail -------------------------------------------------------

/// `GET /ws/logs` — streams broadcast tracing events as JSON text frames.
/// Operational convenience only; not part of the agent wire protocol.
async fn ws_logs_handler(ws: WebSocketUpgrade, State(_state): State<GatewayState>) -> impl IntoResponse {
    ws.on_upgrade(handle_log_stream)
}

async fn handle_log_stream(mut socket: WebSocket) {
    let Some(mut rx) = crate::logs::subscribe() else {
        let _ = socket.send(WsMessage::Close(None)).await;
        return;
    };
    loop {
        tokio::select! {
            line = rx.recv() => {
                match line {
                    Ok(line) => {
                        if socket.send(WsMessage::Text(line)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}
