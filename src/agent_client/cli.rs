//! `baihu-agent` command line surface: run in the foreground, daemonize
//! into the background, or manage an installed systemd unit.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::agent_client::config::AgentFileConfig;
use crate::agent_client::runtime::{self, RuntimeOptions};
use crate::agent_client::{lock, systemd};

#[derive(Debug, Parser)]
#[command(name = "baihu-agent", version, about = "Remote worker agent for a baihu server")]
pub struct Cli {
    /// Path to the agent's config.ini.
    #[arg(short = 'c', long = "config", global = true, default_value = "./config.ini")]
    pub config: PathBuf,

    /// Path to the agent's pid file, used by start/stop/status.
    #[arg(short = 'p', long = "pid-file", global = true, default_value = "./baihu-agent.pid")]
    pub pid_file: PathBuf,

    /// Path to the log file used when daemonized.
    #[arg(short = 'l', long = "log-file", global = true, default_value = "./baihu-agent.log")]
    pub log_file: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the agent in the foreground.
    Run,
    /// Daemonize and run in the background.
    Start,
    /// Stop a daemonized agent started with `start`.
    Stop,
    /// Report whether a daemonized agent is running.
    Status,
    /// Fetch and print the task set currently bound to this agent.
    Tasks,
    /// Print the last lines of the agent's log file.
    Logs {
        /// Number of trailing lines to print.
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
    /// Print the systemd unit file for this agent to stdout.
    Install {
        /// User the unit runs as.
        #[arg(long, default_value = "baihu")]
        user: String,
        /// Working directory for the unit; defaults to the current directory.
        #[arg(long)]
        working_dir: Option<String>,
    },
    /// Print the commands needed to remove an installed unit.
    Uninstall,
    /// Print the agent's build version.
    Version,
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Run => run_foreground(&cli.config, Some(&cli.pid_file)).await,
        Command::Start => start_daemon(&cli),
        Command::Stop => stop_daemon(&cli.pid_file),
        Command::Status => report_status(&cli.pid_file),
        Command::Tasks => fetch_and_print_tasks(&cli.config).await,
        Command::Logs { lines } => print_log_tail(&cli.log_file, lines),
        Command::Install { user, working_dir } => {
            systemd::generate(&user, working_dir.as_deref(), &cli.config.display().to_string());
            Ok(())
        }
        Command::Uninstall => {
            println!("systemctl disable --now baihu-agent");
            println!("rm /etc/systemd/system/baihu-agent.service");
            println!("systemctl daemon-reload");
            Ok(())
        }
        Command::Version => {
            println!("baihu-agent {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run_foreground(config_path: &Path, pid_file: Option<&Path>) -> anyhow::Result<()> {
    let config = AgentFileConfig::load(config_path)?;
    // When daemonized, `daemonize::Daemonize` already holds its own lock on
    // the pid file; only take ours when running directly in the foreground.
    let _lock = match pid_file {
        Some(p) => Some(lock::write_pid_file(p)?),
        None => None,
    };
    runtime::run(config, RuntimeOptions::default()).await
}

const LOG_MAX_BYTES: u64 = 5 * 1024 * 1024;
const LOG_BACKUP_COUNT: u32 = 3;

/// Rotate `log_file` if it has grown past [`LOG_MAX_BYTES`], keeping up to
/// [`LOG_BACKUP_COUNT`] numbered backups (`agent.log.1` is most recent).
fn rotate_log_if_needed(log_file: &Path) -> anyhow::Result<()> {
    let needs_rotation = std::fs::metadata(log_file).map(|m| m.len() >= LOG_MAX_BYTES).unwrap_or(false);
    if !needs_rotation {
        return Ok(());
    }

    let oldest = log_file.with_extension(format!("log.{LOG_BACKUP_COUNT}"));
    let _ = std::fs::remove_file(&oldest);
    for n in (1..LOG_BACKUP_COUNT).rev() {
        let from = log_file.with_extension(format!("log.{n}"));
        let to = log_file.with_extension(format!("log.{}", n + 1));
        let _ = std::fs::rename(&from, &to);
    }
    std::fs::rename(log_file, log_file.with_extension("log.1"))?;
    Ok(())
}

fn start_daemon(cli: &Cli) -> anyhow::Result<()> {
    rotate_log_if_needed(&cli.log_file)?;
    let daemonize = daemonize::Daemonize::new()
        .pid_file(&cli.pid_file)
        .working_directory(std::env::current_dir()?)
        .stdout(std::fs::File::create(&cli.log_file)?)
        .stderr(std::fs::File::create(&cli.log_file)?);

    daemonize
        .start()
        .map_err(|e| anyhow::anyhow!("failed to daemonize: {e}"))?;

    let config_path = cli.config.clone();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move { run_foreground(&config_path, None).await })
}

fn stop_daemon(pid_file: &Path) -> anyhow::Result<()> {
    let Some(pid) = lock::read_pid(pid_file) else {
        println!("no pid file at {}; agent does not appear to be running", pid_file.display());
        return Ok(());
    };

    // SAFETY: pid comes from our own pid file, signal 15 is SIGTERM.
    let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if result != 0 {
        anyhow::bail!("failed to signal pid {pid}: {}", std::io::Error::last_os_error());
    }
    println!("sent SIGTERM to pid {pid}");
    Ok(())
}

fn report_status(pid_file: &Path) -> anyhow::Result<()> {
    match lock::read_pid(pid_file) {
        Some(pid) if process_alive(pid) => println!("running, pid {pid}"),
        Some(pid) => println!("stale pid file ({pid}); process not running"),
        None => println!("not running"),
    }
    Ok(())
}

fn process_alive(pid: u32) -> bool {
    // Signal 0 performs no-op existence/permission checks only.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

async fn fetch_and_print_tasks(config_path: &Path) -> anyhow::Result<()> {
    let config = AgentFileConfig::load(config_path)?;
    let client = reqwest::Client::new();
    let resp: serde_json::Value = client
        .get(format!("{}/api/agent/tasks", config.server_url))
        .bearer_auth(&config.token)
        .send()
        .await
        .context("failed to reach server")?
        .error_for_status()
        .context("server rejected the task request")?
        .json()
        .await
        .context("server returned an unparseable response")?;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    Ok(())
}

fn print_log_tail(log_file: &Path, lines: usize) -> anyhow::Result<()> {
    let contents = std::fs::read_to_string(log_file)
        .with_context(|| format!("failed to read log file: {}", log_file.display()))?;
    for line in contents.lines().rev().take(lines).collect::<Vec<_>>().into_iter().rev() {
        println!("{line}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_is_a_noop_under_the_size_threshold() {
        let tmp = tempfile::tempdir().unwrap();
        let log_file = tmp.path().join("baihu-agent.log");
        std::fs::write(&log_file, b"small").unwrap();
        rotate_log_if_needed(&log_file).unwrap();
        assert!(log_file.exists());
        assert!(!log_file.with_extension("log.1").exists());
    }

    #[test]
    fn rotation_shifts_backups_when_the_log_is_oversized() {
        let tmp = tempfile::tempdir().unwrap();
        let log_file = tmp.path().join("baihu-agent.log");
        std::fs::write(&log_file, vec![b'x'; LOG_MAX_BYTES as usize]).unwrap();
        std::fs::write(log_file.with_extension("log.1"), b"previous").unwrap();

        rotate_log_if_needed(&log_file).unwrap();

        assert!(!log_file.exists());
        assert!(log_file.with_extension("log.1").exists());
        assert!(log_file.with_extension("log.2").exists());
        assert_eq!(std::fs::read(log_file.with_extension("log.2")).unwrap(), b"previous");
    }
}
