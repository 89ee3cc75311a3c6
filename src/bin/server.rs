use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

use baihu::agents::AgentRegistry;
use baihu::config::Config;
use baihu::dispatch::{DispatchConfig, Dispatcher};
use baihu::gateway::{self, connections::ConnectionRegistry, rate_limit::RateLimiter, GatewayState};
use baihu::scheduler::{ScheduledTask, Scheduler};
use baihu::storage::Storage;
use baihu::tokens::TokenService;

#[derive(Debug, Parser)]
#[command(name = "baihu-server", version, about = "Self-hosted cron job manager")]
struct Cli {
    /// Path to config.yaml. Falls back to ./config.yaml, then the platform
    /// config directory, then built-in defaults.
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the server (the default when no subcommand is given).
    Serve,
    /// Load and validate the configuration, then exit.
    ConfigValidate,
    /// Print the server's build version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Version => {
            println!("baihu-server {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::ConfigValidate => {
            let config = Config::load(cli.config.as_deref()).await?;
            println!("configuration is valid:\n{config:#?}");
            Ok(())
        }
        Command::Serve => serve(cli.config).await,
    }
}

async fn serve(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();
    let logs_tx = baihu::logs::init_broadcast();
    let broadcast_layer = baihu::logs::BroadcastLayer::new(logs_tx);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(broadcast_layer)
        .init();

    let config = Config::load(config_path.as_deref()).await?;

    let storage = Arc::new(Storage::open(std::path::Path::new(&config.database_path))?);
    let tokens = Arc::new(TokenService::new(storage.clone()));
    let agents = Arc::new(AgentRegistry::new(storage.clone(), tokens.clone()));

    let dispatch_config = DispatchConfig {
        worker_count: config.worker_count,
        queue_capacity: config.queue_capacity,
        interval_ms: config.dispatch_interval_ms,
    };
    let dispatcher = {
        let storage = storage.clone();
        let scripts_dir = PathBuf::from(&config.scripts_dir);
        let demo_mode = config.demo_mode;
        Arc::new(Dispatcher::new(
            dispatch_config,
            Arc::new(move |task_id: i64| {
                let storage = storage.clone();
                let scripts_dir = scripts_dir.clone();
                Box::pin(async move {
                    run_local_task(storage, &scripts_dir, demo_mode, task_id).await;
                })
            }),
        ))
    };

    let clock = baihu::cron::Clock::new(config.resolved_timezone());
    let scheduler = {
        let dispatcher = dispatcher.clone();
        Arc::new(Scheduler::new(clock, move |task_id| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.enqueue(task_id).await });
        }))
    };

    let local_tasks: Vec<ScheduledTask> = storage
        .list_tasks()?
        .into_iter()
        .filter(|t| t.agent_id.is_none())
        .map(|t| ScheduledTask {
            id: t.id,
            schedule: t.schedule,
            command: t.command,
            enabled: t.enabled,
        })
        .collect();
    scheduler.resync(&local_tasks).await;

    let state = GatewayState {
        storage,
        agents,
        tokens,
        dispatcher,
        scheduler,
        connections: Arc::new(ConnectionRegistry::new()),
        rate_limiter: Arc::new(RateLimiter::new()),
        admin_token: config.admin_token.clone(),
        agent_idle_threshold_secs: config.agent_idle_threshold_secs,
        update_bundle_dir: Arc::new(RwLock::new(PathBuf::from(&config.update_bundle_dir))),
        latest_version: Arc::new(RwLock::new(env!("CARGO_PKG_VERSION").to_string())),
    };

    gateway::spawn_sweeper(state.clone());
    spawn_reload_on_sighup(config_path, state.storage.clone(), state.dispatcher.clone(), state.scheduler.clone());

    let app = axum::Router::new()
        .nest("/api", gateway::agent_router(state.clone()))
        .nest("/api", baihu::api::admin_router(state.clone()))
        .layer(tower_http::cors::CorsLayer::permissive());

    let addr: std::net::SocketAddr = config
        .bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("config-invalid: bind_addr '{}' is not a socket address: {e}", config.bind_addr))?;

    tracing::info!(%addr, "baihu-server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>()).await?;
    Ok(())
}

/// Reload configuration on SIGHUP: revalidate, push the worker pool's
/// share of it into the dispatcher, and re-sync the scheduler's view of
/// locally-executed tasks from storage.
fn spawn_reload_on_sighup(
    config_path: Option<PathBuf>,
    storage: Arc<Storage>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<Scheduler>,
) {
    let mut stream = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "could not install SIGHUP handler, config reload is admin-endpoint only");
            return;
        }
    };
    tokio::spawn(async move {
        loop {
            stream.recv().await;
            tracing::info!("received SIGHUP, reloading configuration");
            let config = match Config::load(config_path.as_deref()).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(error = %e, "config reload failed, keeping previous configuration");
                    continue;
                }
            };
            dispatcher
                .reload(DispatchConfig {
                    worker_count: config.worker_count,
                    queue_capacity: config.queue_capacity,
                    interval_ms: config.dispatch_interval_ms,
                })
                .await;
            match storage.list_tasks() {
                Ok(tasks) => {
                    let local_tasks: Vec<ScheduledTask> = tasks
                        .into_iter()
                        .filter(|t| t.agent_id.is_none())
                        .map(|t| ScheduledTask {
                            id: t.id,
                            schedule: t.schedule,
                            command: t.command,
                            enabled: t.enabled,
                        })
                        .collect();
                    scheduler.resync(&local_tasks).await;
                }
                Err(e) => tracing::warn!(error = %e, "failed to re-sync scheduler after reload"),
            }
        }
    });
}

/// Run a task bound to no agent directly on this host, then persist its
/// result through the same pipeline an agent's HTTP report goes through.
async fn run_local_task(storage: Arc<Storage>, scripts_dir: &std::path::Path, demo_mode: bool, task_id: i64) {
    let task = match storage.get_task(task_id) {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(task_id, error = %e, "could not load task for local execution");
            return;
        }
    };

    let env_vars = storage.get_env_vars(&task.env_ids).unwrap_or_default();
    let req = baihu::executor::ExecRequest {
        task_id: task.id,
        command: task.command.clone(),
        timeout_minutes: task.timeout_minutes,
        work_dir: task.work_dir.clone(),
        env_vars,
    };
    let outcome = baihu::executor::execute(&req, scripts_dir, demo_mode).await;

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
    if let Err(e) = baihu::pipeline::run(storage, result).await {
        tracing::warn!(task_id, error = %e, "failed to persist local execution result");
    }
}
