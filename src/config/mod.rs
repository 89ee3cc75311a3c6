//! Server configuration — YAML, loaded with a fallback search order and
//! `#[serde(default)]` on every field so a missing file still produces a
//! usable configuration.
//!
//! Mirrors the teacher's config loader shape (fallback path search,
//! `serde_yaml_ng`, a `validate()` pass after deserialization) but the
//! fields are generalized from the AI-agent-platform domain (models,
//! channels, per-agent workspaces) to the scheduler/dispatcher/gateway
//! domain this crate actually runs.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from `config.yaml`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the admin API / agent gateway binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// IANA time zone name (e.g. `"Asia/Shanghai"`) all cron math uses.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Base directory local executions resolve relative/empty working
    /// directories against.
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: String,
    /// Fixed worker pool size.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Dispatch queue capacity before the direct-execution fallback kicks in.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Aggregate task-start interval shared by all workers, in milliseconds.
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
    /// Bearer token guarding the admin HTTP API.
    #[serde(default = "default_admin_token")]
    pub admin_token: String,
    /// Path to the SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Directory the update server reads release bundles and `version.txt` from.
    #[serde(default = "default_update_bundle_dir")]
    pub update_bundle_dir: String,
    /// Seconds of heartbeat silence before an agent is swept offline.
    #[serde(default = "default_agent_idle_threshold_secs")]
    pub agent_idle_threshold_secs: i64,
    /// When true, the local executor returns a synthetic success result
    /// without spawning a process. Does not affect remote execution.
    #[serde(default)]
    pub demo_mode: bool,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_timezone() -> String {
    "Asia/Shanghai".to_string()
}
fn default_scripts_dir() -> String {
    "./scripts".to_string()
}
fn default_worker_count() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    100
}
fn default_dispatch_interval_ms() -> u64 {
    200
}
fn default_admin_token() -> String {
    "changeme".to_string()
}
fn default_database_path() -> String {
    "./baihu.sqlite3".to_string()
}
fn default_update_bundle_dir() -> String {
    "./updates".to_string()
}
fn default_agent_idle_threshold_secs() -> i64 {
    120
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: default_bind_addr(),
            timezone: default_timezone(),
            scripts_dir: default_scripts_dir(),
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            admin_token: default_admin_token(),
            database_path: default_database_path(),
            update_bundle_dir: default_update_bundle_dir(),
            agent_idle_threshold_secs: default_agent_idle_threshold_secs(),
            demo_mode: false,
        }
    }
}

impl Config {
    /// Load configuration following the search order: explicit path (if
    /// given) → `./config.yaml` → platform config dir
    /// (`dirs::config_dir()/baihu/config.yaml`) → built-in defaults.
    ///
    /// A missing file at every step is not an error — it falls through to
    /// [`Config::default`]. A present-but-malformed file IS an error
    /// (`config-invalid`), since a mistyped field silently getting ignored
    /// would be worse than failing loudly at startup.
    pub async fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
        let candidates: Vec<PathBuf> = match explicit {
            Some(p) => vec![p.to_path_buf()],
            None => {
                let mut v = vec![PathBuf::from("config.yaml")];
                if let Some(dir) = dirs::config_dir() {
                    v.push(dir.join("baihu").join("config.yaml"));
                }
                v
            }
        };

        for candidate in &candidates {
            match tokio::fs::read_to_string(candidate).await {
                Ok(contents) => {
                    let config: Config = serde_yaml_ng::from_str(&contents)
                        .with_context(|| format!("config-invalid: {}", candidate.display()))?;
                    config.validate()?;
                    tracing::info!(path = %candidate.display(), "configuration loaded");
                    return Ok(config);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to read config file: {}", candidate.display())
                    })
                }
            }
        }

        tracing::info!("no config file found, using built-in defaults");
        Ok(Config::default())
    }

    /// Validate semantic constraints that serde cannot enforce.
    fn validate(&self) -> anyhow::Result<()> {
        if self.worker_count == 0 {
            anyhow::bail!("config-invalid: worker_count must be at least 1");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("config-invalid: queue_capacity must be at least 1");
        }
        if self.dispatch_interval_ms == 0 {
            anyhow::bail!("config-invalid: dispatch_interval_ms must be at least 1");
        }
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| anyhow::anyhow!("config-invalid: unknown timezone '{}'", self.timezone))?;
        Ok(())
    }

    /// Serialize and write the configuration back to a YAML file.
    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = serde_yaml_ng::to_string(self).context("serialize config YAML")?;
        tokio::fs::write(path, &contents)
            .await
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// The timezone parsed to a concrete [`chrono_tz::Tz`], falling back to
    /// the default if somehow invalid (validate() should have caught this).
    pub fn resolved_timezone(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or(chrono_tz::Tz::Asia__Shanghai)
    }
}
