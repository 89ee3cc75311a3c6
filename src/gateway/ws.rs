//! Agent WebSocket endpoint — upgrade, per-ip admission, registration,
//! displacement, and the bidirectional frame pumps.
//!
//! Structurally this follows the sibling example pack's node gateway: a
//! writer task draining a bounded outbound channel, a reader loop handling
//! inbound frames inline, and a central registry holding only an opaque
//! per-connection handle.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::connections::AgentHandle;
use super::rate_limit::Admission;
use super::GatewayState;
use crate::protocol::{self, ConnectedData, Frame, HeartbeatAckData, Message as ProtoMessage, TaskResultData, TasksData};

const PING_INTERVAL_SECS: u64 = 30;
const READ_IDLE_SECS: i64 = 90;
const SWEEP_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: String,
    pub machine_id: String,
}

pub async fn agent_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    Query(query): Query<WsQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let ip = addr.ip();

    match state.rate_limiter.check_and_record_attempt(ip) {
        Admission::Admit => {}
        Admission::RateBlocked { retry_after_secs } => {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({"error": format!("rate-blocked: retry in {retry_after_secs}s")})),
            )
                .into_response();
        }
        Admission::TooFrequent => {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({"error": "rate-limited: too-frequent"})),
            )
                .into_response();
        }
        Admission::TooManyActive => {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({"error": "rate-limited: too many active connections for this ip"})),
            )
                .into_response();
        }
    }

    let outcome = match state.agents.register_by_token(&query.token, &query.machine_id, &ip.to_string()) {
        Ok(outcome) => outcome,
        Err(e) => {
            state.rate_limiter.record_fail(ip);
            let status = match &e {
                crate::agents::AgentError::Token(_) => StatusCode::UNAUTHORIZED,
                _ => StatusCode::FORBIDDEN,
            };
            return (status, Json(serde_json::json!({"error": e.to_string()}))).into_response();
        }
    };

    if !outcome.agent.enabled {
        state.rate_limiter.record_fail(ip);
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({"error": "agent-disabled"})),
        )
            .into_response();
    }

    state.rate_limiter.record_success(ip);

    ws.on_upgrade(move |socket| handle_socket(socket, state, outcome.agent.id, outcome.is_new, query.machine_id, ip))
        .into_response()
}

async fn handle_socket(
    socket: WebSocket,
    state: GatewayState,
    agent_id: i64,
    is_new: bool,
    machine_id: String,
    ip: IpAddr,
) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(64);
    let last_ping = Arc::new(StdMutex::new(Utc::now()));
    let cancel = CancellationToken::new();

    if let Some(displaced) = state
        .connections
        .register(
            agent_id,
            AgentHandle {
                ip,
                sink: outbound_tx.clone(),
                last_ping: last_ping.clone(),
                cancel: cancel.clone(),
            },
        )
        .await
    {
        drop(displaced);
        tracing::info!(agent_id, "displaced prior connection for agent");
    }

    let name = match state.agents.get(agent_id) {
        Ok(a) => a.name,
        Err(_) => "unknown".to_string(),
    };
    let connected = ProtoMessage::Connected(ConnectedData {
        agent_id: agent_id.to_string(),
        name,
        is_new_agent: is_new,
        machine_id,
    });
    if let Ok(frame) = connected.into_frame() {
        let _ = outbound_tx.try_send(frame);
    }

    // The writer task is the sole owner of `ws_sink`, so it is also the
    // one that sends the WebSocket-level ping on its own ticker — a
    // second task could not send a raw `Message::Ping` without fighting
    // the writer for the sink.
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        ping_interval.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let Ok(text) = serde_json::to_string(&frame) else { continue };
                    if tokio::time::timeout(Duration::from_secs(10), ws_sink.send(Message::Text(text)))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if tokio::time::timeout(Duration::from_secs(10), ws_sink.send(Message::Ping(Vec::new())))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });

    loop {
        let idle = Utc::now() - *last_ping.lock().expect("last_ping poisoned");
        if idle.num_seconds() > READ_IDLE_SECS {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(agent_id, "connection displaced by a newer upgrade, closing");
                break;
            }
            read = tokio::time::timeout(Duration::from_secs(5), ws_stream.next()) => {
                match read {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        *last_ping.lock().expect("last_ping poisoned") = Utc::now();
                        handle_inbound(&state, agent_id, &text, &outbound_tx).await;
                    }
                    Ok(Some(Ok(Message::Pong(_)))) | Ok(Some(Ok(Message::Ping(_)))) => {
                        *last_ping.lock().expect("last_ping poisoned") = Utc::now();
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                    Ok(Some(Err(_))) => break,
                    Ok(Some(Ok(_))) => {}
                    Err(_) => continue, // read timeout tick, re-check idle/cancel above
                }
            }
        }
    }

    writer.abort();
    state.connections.remove(agent_id).await;
    state.rate_limiter.record_disconnect(ip);
    if let Err(e) = state.agents.mark_offline(agent_id) {
        tracing::debug!(agent_id, error = %e, "could not mark agent offline on disconnect");
    }
    tracing::info!(agent_id, "agent disconnected");
}

async fn handle_inbound(state: &GatewayState, agent_id: i64, text: &str, outbound: &mpsc::Sender<Frame>) {
    let msg = match ProtoMessage::from_json_text(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(agent_id, error = %e, "ignoring unparseable agent frame");
            return;
        }
    };

    match msg {
        ProtoMessage::Heartbeat(data) => {
            let Ok(agent) = state.agents.heartbeat(
                &agent_record_token(state, agent_id),
                &data.version,
                &data.build_time,
                &data.hostname,
                &data.os,
                &data.arch,
            ) else {
                return;
            };
            let latest_version = state.latest_agent_version();
            let need_update = !latest_version.is_empty() && latest_version != data.version;
            let force_update = state.agents.take_force_update(agent_id).unwrap_or(false);
            let ack = ProtoMessage::HeartbeatAck(HeartbeatAckData {
                agent_id: agent.id.to_string(),
                name: agent.name.clone(),
                need_update,
                force_update,
                latest_version,
            });
            if let Ok(frame) = ack.into_frame() {
                let _ = outbound.try_send(frame);
            }
        }
        ProtoMessage::FetchTasks => {
            send_task_set(state, agent_id, outbound).await;
        }
        ProtoMessage::TaskResult(result) => {
            handle_task_result(state, agent_id, result).await;
        }
        other => {
            tracing::debug!(agent_id, kind = other.kind(), "unhandled inbound frame kind");
        }
    }
}

fn agent_record_token(state: &GatewayState, agent_id: i64) -> String {
    state.agents.get(agent_id).map(|a| a.token).unwrap_or_default()
}

async fn send_task_set(state: &GatewayState, agent_id: i64, outbound: &mpsc::Sender<Frame>) {
    let Ok(tasks) = state.storage.list_tasks_for_agent(agent_id) else {
        return;
    };
    let wire_tasks = tasks
        .into_iter()
        .map(|t| protocol::TaskWire {
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
    let msg = ProtoMessage::Tasks(TasksData { tasks: wire_tasks });
    if let Ok(frame) = msg.into_frame() {
        let _ = outbound.try_send(frame);
    }
}

/// Persist an agent-reported execution result, hardened with a binding
/// check: the task must actually be bound to the reporting agent.
/// Unbound/mismatched results are rejected and never written, a
/// deliberate deviation recorded as a decision in the design notes.
async fn handle_task_result(state: &GatewayState, agent_id: i64, data: TaskResultData) {
    let bound_ok = match state.storage.get_task(data.task_id) {
        Ok(task) => task.agent_id == Some(agent_id),
        Err(_) => false,
    };
    if !bound_ok {
        tracing::warn!(agent_id, task_id = data.task_id, "agent-not-bound: rejecting task_result");
        return;
    }

    let result = crate::pipeline::ExecuteResult {
        task_id: data.task_id,
        agent_id: Some(agent_id),
        command: data.command,
        output: data.output,
        status: data.status,
        duration_ms: data.duration,
        exit_code: data.exit_code,
        start_ts: data.start_time,
        end_ts: data.end_time,
    };
    let storage = state.storage.clone();
    tokio::spawn(async move {
        if let Err(e) = crate::pipeline::run(storage, result).await {
            tracing::error!(error = %e, "storage-failure: failed to persist agent-reported result");
        }
    });
}

/// Periodic sweeper: closes connections idle longer than the configured
/// threshold, marks those agents offline, and garbage-collects rate
/// limiter state. Intended to be spawned once at startup.
pub async fn run_sweeper(state: GatewayState) {
    let mut interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
    loop {
        interval.tick().await;
        let stale = state.connections.sweep_stale(READ_IDLE_SECS).await;
        for agent_id in stale {
            let _ = state.agents.mark_offline(agent_id);
        }
        let _ = state.agents.sweep_offline(state.agent_idle_threshold_secs);
        state.rate_limiter.sweep();
    }
}
