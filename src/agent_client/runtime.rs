//! Agent session runtime — one WebSocket connection's worth of protocol
//! handling: heartbeats, task-set diffing against a local scheduler,
//! execution, and result reporting with an HTTP fallback.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::agent_client::config::AgentFileConfig;
use crate::agent_client::reconnect::{ReconnectBackoff, STEADY_STATE_RECONNECT};
use crate::agent_client::update;
use crate::cron::Clock;
use crate::executor::{self, ExecRequest};
use crate::protocol::{ExecuteData, HeartbeatData, Message, TaskResultData, TaskWire};
use crate::scheduler::{ScheduledTask, Scheduler};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub scripts_dir: PathBuf,
    pub demo_mode: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            scripts_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            demo_mode: false,
        }
    }
}

/// Run the agent forever: connect, serve the session until disconnect,
/// then reconnect. Growing backoff only applies before the first
/// successful connection; afterwards the reconnect delay is the fixed 5 s
/// the wire protocol documents.
pub async fn run(config: AgentFileConfig, opts: RuntimeOptions) -> anyhow::Result<()> {
    let machine_id = crate::identity::current();
    let backoff = ReconnectBackoff::default();
    let mut pre_connect_attempt: u32 = 0;
    let mut ever_connected = false;

    loop {
        if let Err(e) = connect_and_serve(&config, &machine_id, &opts, &mut ever_connected).await {
            tracing::warn!(error = %e, ever_connected, "agent session ended");
        }

        if ever_connected {
            tokio::time::sleep(STEADY_STATE_RECONNECT).await;
        } else {
            if backoff.should_give_up(pre_connect_attempt) {
                anyhow::bail!(
                    "could not reach {} after {pre_connect_attempt} attempts",
                    config.server_url
                );
            }
            tokio::time::sleep(backoff.delay_for_attempt(pre_connect_attempt)).await;
            pre_connect_attempt += 1;
        }
    }
}

async fn connect_and_serve(
    config: &AgentFileConfig,
    machine_id: &str,
    opts: &RuntimeOptions,
    ever_connected: &mut bool,
) -> anyhow::Result<()> {
    let url = config.ws_url(machine_id);
    let (ws_stream, _resp) = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::connect_async(&url))
        .await
        .context("handshake timed out")?
        .context("websocket handshake failed")?;
    *ever_connected = true;
    tracing::info!(%url, "connected to agent gateway");

    let (sink, mut stream) = ws_stream.split();
    let sink = Arc::new(Mutex::new(sink));

    let (fire_tx, mut fire_rx) = mpsc::unbounded_channel::<i64>();
    let tasks: Arc<Mutex<HashMap<i64, TaskWire>>> = Arc::new(Mutex::new(HashMap::new()));
    let scheduler = Arc::new(Scheduler::new(Clock::default(), move |task_id| {
        let _ = fire_tx.send(task_id);
    }));
    // Flips false on a server `disabled` frame: cancels the local schedule
    // and suppresses any further execution/`task_result` emission until a
    // matching `enabled` frame flips it back.
    let agent_enabled = Arc::new(AtomicBool::new(true));

    send_frame(&sink, heartbeat_message(config)).await.ok();
    send_frame(&sink, Message::FetchTasks).await.ok();

    let mut heartbeat_ticker = tokio::time::interval(Duration::from_secs(config.interval_secs));
    heartbeat_ticker.tick().await; // first tick fires immediately; the heartbeat above already covers it

    loop {
        tokio::select! {
            _ = heartbeat_ticker.tick() => {
                if let Err(e) = send_frame(&sink, heartbeat_message(config)).await {
                    tracing::warn!(error = %e, "heartbeat send failed");
                    return Ok(());
                }
            }
            Some(task_id) = fire_rx.recv() => {
                if agent_enabled.load(Ordering::SeqCst) {
                    run_task_if_known(task_id, &tasks, &sink, config, opts, &agent_enabled).await;
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_inbound(&text, &sink, &scheduler, &tasks, config, opts, &agent_enabled).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        tracing::info!("server closed the connection");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "websocket read error");
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn heartbeat_message(config: &AgentFileConfig) -> Message {
    Message::Heartbeat(HeartbeatData {
        version: env!("CARGO_PKG_VERSION").to_string(),
        build_time: String::new(),
        hostname: whoami_hostname(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        auto_update: config.auto_update,
    })
}

fn whoami_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

async fn send_frame(sink: &Arc<Mutex<WsSink>>, msg: Message) -> anyhow::Result<()> {
    let frame = msg.into_frame()?;
    let text = serde_json::to_string(&frame)?;
    let mut guard = sink.lock().await;
    tokio::time::timeout(WRITE_DEADLINE, guard.send(WsMessage::Text(text)))
        .await
        .context("write deadline exceeded")??;
    Ok(())
}

async fn handle_inbound(
    text: &str,
    sink: &Arc<Mutex<WsSink>>,
    scheduler: &Arc<Scheduler>,
    tasks: &Arc<Mutex<HashMap<i64, TaskWire>>>,
    config: &AgentFileConfig,
    opts: &RuntimeOptions,
    agent_enabled: &Arc<AtomicBool>,
) {
    let msg = match Message::from_json_text(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(error = %e, "malformed frame from server, ignoring");
            return;
        }
    };

    match msg {
        Message::Tasks(data) => diff_and_reschedule(tasks, scheduler, data.tasks).await,
        Message::Execute(ExecuteData { task_id }) => {
            if agent_enabled.load(Ordering::SeqCst) {
                run_task_if_known(task_id, tasks, sink, config, opts, agent_enabled).await;
            } else {
                tracing::debug!(task_id, "ignoring execute while agent is disabled");
            }
        }
        Message::HeartbeatAck(ack) => {
            if ack.need_update && (config.auto_update || ack.force_update) {
                spawn_update(config.clone());
            }
        }
        Message::Update => spawn_update(config.clone()),
        Message::Connected(data) => {
            tracing::info!(agent_id = %data.agent_id, new = data.is_new_agent, "registered");
        }
        Message::Enabled => {
            tracing::info!("agent enabled by server, re-fetching task set");
            agent_enabled.store(true, Ordering::SeqCst);
            if let Err(e) = send_frame(sink, Message::FetchTasks).await {
                tracing::warn!(error = %e, "failed to re-issue fetch_tasks after enable");
            }
        }
        Message::Disabled => {
            tracing::warn!("agent disabled by server, clearing local schedule");
            agent_enabled.store(false, Ordering::SeqCst);
            let mut guard = tasks.lock().await;
            for id in guard.keys().copied().collect::<Vec<_>>() {
                scheduler.remove(id).await;
            }
            guard.clear();
        }
        Message::FetchTasks | Message::TaskResult(_) | Message::Unknown(_) => {}
    }
}

async fn diff_and_reschedule(tasks: &Arc<Mutex<HashMap<i64, TaskWire>>>, scheduler: &Arc<Scheduler>, incoming: Vec<TaskWire>) {
    let mut guard = tasks.lock().await;
    let incoming_ids: HashSet<i64> = incoming.iter().map(|t| t.id).collect();

    let removed: Vec<i64> = guard.keys().filter(|id| !incoming_ids.contains(id)).copied().collect();
    for id in removed {
        guard.remove(&id);
        scheduler.remove(id).await;
    }

    for task in incoming {
        let changed = match guard.get(&task.id) {
            Some(existing) => existing.schedule != task.schedule || existing.command != task.command || existing.enabled != task.enabled,
            None => true,
        };
        if changed {
            let scheduled = ScheduledTask {
                id: task.id,
                schedule: task.schedule.clone(),
                command: task.command.clone(),
                enabled: task.enabled,
            };
            if let Err(e) = scheduler.add_or_update(&scheduled).await {
                tracing::warn!(task_id = task.id, error = %e, "invalid-schedule: task not rescheduled");
            }
        }
        guard.insert(task.id, task);
    }
}

async fn run_task_if_known(
    task_id: i64,
    tasks: &Arc<Mutex<HashMap<i64, TaskWire>>>,
    sink: &Arc<Mutex<WsSink>>,
    config: &AgentFileConfig,
    opts: &RuntimeOptions,
    agent_enabled: &Arc<AtomicBool>,
) {
    let task = {
        let guard = tasks.lock().await;
        guard.get(&task_id).cloned()
    };
    let Some(task) = task else {
        tracing::warn!(task_id, "fired/execute for unknown task id, ignoring");
        return;
    };
    spawn_execution(task, sink.clone(), config.clone(), opts.clone(), agent_enabled.clone());
}

fn spawn_execution(
    task: TaskWire,
    sink: Arc<Mutex<WsSink>>,
    config: AgentFileConfig,
    opts: RuntimeOptions,
    agent_enabled: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        let req = ExecRequest {
            task_id: task.id,
            command: task.command.clone(),
            timeout_minutes: task.timeout_minutes,
            work_dir: task.work_dir.clone(),
            env_vars: Vec::new(),
        };
        let outcome = executor::execute(&req, &opts.scripts_dir, opts.demo_mode).await;

        // The agent may have been disabled while the command was running;
        // a disabled agent must cease emitting task_result entirely, not
        // just stop scheduling new runs.
        if !agent_enabled.load(Ordering::SeqCst) {
            tracing::debug!(task_id = task.id, "suppressing task_result, agent disabled mid-execution");
            return;
        }

        let result = TaskResultData {
            task_id: outcome.task_id,
            command: outcome.command,
            output: outcome.output,
            status: outcome.status.to_string(),
            duration: outcome.duration_ms,
            exit_code: outcome.exit_code,
            start_time: outcome.start_ts,
            end_time: outcome.end_ts,
        };

        if send_frame(&sink, Message::TaskResult(result.clone())).await.is_err() {
            tracing::warn!(task_id = task.id, "task_result send failed, falling back to HTTP report");
            report_via_http(&config, &result).await;
        }
    });
}

async fn report_via_http(config: &AgentFileConfig, result: &TaskResultData) {
    let client = reqwest::Client::new();
    let url = format!("{}/api/agent/report", config.server_url);
    let machine_id = crate::identity::current();
    let outcome = client
        .post(&url)
        .bearer_auth(&config.token)
        .header("X-Machine-ID", machine_id)
        .json(result)
        .send()
        .await;
    match outcome {
        Ok(resp) if resp.status().is_success() => {}
        Ok(resp) => tracing::warn!(status = %resp.status(), "HTTP report fallback rejected"),
        Err(e) => tracing::warn!(error = %e, "HTTP report fallback failed"),
    }
}

fn spawn_update(config: AgentFileConfig) {
    tokio::spawn(async move {
        let machine_id = crate::identity::current();
        if let Err(e) = update::perform_update(
            &config.server_url,
            &config.token,
            &machine_id,
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
        .await
        {
            tracing::warn!(error = %e, "update-failure: self-update did not complete, prior binary remains in place");
        }
    });
}
