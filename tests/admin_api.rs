//! End-to-end coverage of the admin HTTP API: authentication boundary,
//! task CRUD, and a manual trigger producing a persisted log.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use baihu::agents::AgentRegistry;
use baihu::cron::Clock;
use baihu::dispatch::{DispatchConfig, Dispatcher};
use baihu::gateway::{connections::ConnectionRegistry, rate_limit::RateLimiter, GatewayState};
use baihu::scheduler::Scheduler;
use baihu::storage::Storage;
use baihu::tokens::TokenService;

const ADMIN_TOKEN: &str = "test-admin-token";

async fn spawn_test_server() -> SocketAddr {
    let storage = Arc::new(Storage::open_in_memory().unwrap());
    let tokens = Arc::new(TokenService::new(storage.clone()));
    let agents = Arc::new(AgentRegistry::new(storage.clone(), tokens.clone()));

    let dispatcher = {
        let storage = storage.clone();
        Arc::new(Dispatcher::new(
            DispatchConfig::default(),
            Arc::new(move |task_id: i64| {
                let storage = storage.clone();
                Box::pin(async move {
                    let Ok(task) = storage.get_task(task_id) else { return };
                    let req = baihu::executor::ExecRequest {
                        task_id: task.id,
                        command: task.command,
                        timeout_minutes: task.timeout_minutes,
                        work_dir: task.work_dir,
                        env_vars: vec![],
                    };
                    let outcome = baihu::executor::execute(&req, &std::env::temp_dir(), false).await;
                    let result = baihu::pipeline::ExecuteResult {
                        task_id: outcome.task_id,
                        agent_id: None,
                        command: outcome.command,
                        output: outcome.output,
                        status: outcome.status.to_string(),
                        duration_ms: outcome.duration_ms,
                        exit_code: outcome.exit_code,
                        start_ts: outcome.start_ts,
                        end_ts: outcome.end_ts,
                    };
                    let _ = baihu::pipeline::run(storage, result).await;
                })
            }),
        ))
    };

    let scheduler = Arc::new(Scheduler::new(Clock::default(), |_task_id| {}));

    let state = GatewayState {
        storage,
        agents,
        tokens,
        dispatcher,
        scheduler,
        connections: Arc::new(ConnectionRegistry::new()),
        rate_limiter: Arc::new(RateLimiter::new()),
        admin_token: ADMIN_TOKEN.to_string(),
        agent_idle_threshold_secs: 120,
        update_bundle_dir: Arc::new(RwLock::new(std::env::temp_dir())),
        latest_version: Arc::new(RwLock::new("0.0.0".to_string())),
    };

    let app = axum::Router::new()
        .nest("/api", baihu::gateway::agent_router(state.clone()))
        .nest("/api", baihu::api::admin_router(state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });
    // Give the listener a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(20)).await;
    addr
}

#[tokio::test]
async fn admin_api_rejects_requests_without_a_bearer_token() {
    let addr = spawn_test_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("http://{addr}/api/tasks"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_api_rejects_an_incorrect_bearer_token() {
    let addr = spawn_test_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("http://{addr}/api/tasks"))
        .bearer_auth("wrong-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn create_trigger_and_read_back_a_local_task() {
    let addr = spawn_test_server().await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}/api");

    let created: serde_json::Value = client
        .post(format!("{base}/tasks"))
        .bearer_auth(ADMIN_TOKEN)
        .json(&serde_json::json!({
            "name": "say hello",
            "command": "echo hello",
            "schedule": "0 0 0 1 1 *",
            "timeout_minutes": 1,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let task_id = created["id"].as_i64().unwrap();

    let trigger_resp = client
        .post(format!("{base}/tasks/{task_id}/trigger"))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(trigger_resp.status(), reqwest::StatusCode::OK);

    // The dispatch queue is async; poll briefly for the log to land.
    let mut logs: Vec<serde_json::Value> = Vec::new();
    for _ in 0..50 {
        logs = client
            .get(format!("{base}/tasks/{task_id}/logs"))
            .bearer_auth(ADMIN_TOKEN)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if !logs.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["status"], "success");
    assert_eq!(logs[0]["exit_code"], 0);
}

#[tokio::test]
async fn deleting_an_unknown_task_returns_not_found() {
    let addr = spawn_test_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .delete(format!("http://{addr}/api/tasks/999999"))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}
