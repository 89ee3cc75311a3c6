//! End-to-end coverage of agent enrollment over the HTTP fallback surface
//! (registration, task list fetch, and release-bundle metadata).

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

async fn spawn_test_server_with_bundle_dir(bundle_dir: std::path::PathBuf) -> (SocketAddr, Arc<TokenService>, Arc<Storage>) {
    let storage = Arc::new(Storage::open_in_memory().unwrap());
    let tokens = Arc::new(TokenService::new(storage.clone()));
    let agents = Arc::new(AgentRegistry::new(storage.clone(), tokens.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        DispatchConfig::default(),
        Arc::new(|_task_id: i64| Box::pin(async move {})),
    ));
    let scheduler = Arc::new(Scheduler::new(Clock::default(), |_task_id| {}));

    let state = GatewayState {
        storage: storage.clone(),
        agents,
        tokens: tokens.clone(),
        dispatcher,
        scheduler,
        connections: Arc::new(ConnectionRegistry::new()),
        rate_limiter: Arc::new(RateLimiter::new()),
        admin_token: "unused".to_string(),
        agent_idle_threshold_secs: 120,
        update_bundle_dir: Arc::new(RwLock::new(bundle_dir)),
        latest_version: Arc::new(RwLock::new("9.9.9".to_string())),
    };

    let app = axum::Router::new().nest("/api", baihu::gateway::agent_router(state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr, tokens, storage)
}

#[tokio::test]
async fn registering_twice_with_the_same_machine_id_reuses_the_agent() {
    let (addr, tokens, _storage) = spawn_test_server_with_bundle_dir(std::env::temp_dir()).await;
    let enrollment = tokens.create(None, 2, None).unwrap();
    let client = reqwest::Client::new();

    let first: serde_json::Value = client
        .post(format!("http://{addr}/api/agent/register"))
        .bearer_auth(&enrollment.token)
        .header("X-Machine-ID", "M1")
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["message"], "registered");
    let agent_id = first["agent_id"].as_i64().unwrap();

    let second: serde_json::Value = client
        .post(format!("http://{addr}/api/agent/register"))
        .bearer_auth(&enrollment.token)
        .header("X-Machine-ID", "M1")
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second["message"], "reused");
    assert_eq!(second["agent_id"], agent_id);
}

#[tokio::test]
async fn registering_with_an_unknown_token_is_rejected() {
    let (addr, _tokens, _storage) = spawn_test_server_with_bundle_dir(std::env::temp_dir()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/api/agent/register"))
        .bearer_auth("not-a-real-token")
        .header("X-Machine-ID", "M1")
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn version_endpoint_reports_bundle_metadata_from_disk() {
    let bundle_dir = tempfile::tempdir().unwrap();
    std::fs::write(bundle_dir.path().join("version.txt"), "1.2.3\n").unwrap();
    std::fs::write(bundle_dir.path().join("baihu-agent-linux-x86_64.tar.gz"), b"fake bundle").unwrap();

    let (addr, _tokens, _storage) = spawn_test_server_with_bundle_dir(bundle_dir.path().to_path_buf()).await;
    let client = reqwest::Client::new();

    let resp: serde_json::Value = client
        .get(format!("http://{addr}/api/agent/version"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["version"], "1.2.3");
    assert_eq!(resp["platforms"][0]["os"], "linux");
    assert_eq!(resp["platforms"][0]["arch"], "x86_64");
}
