//! `config.ini` loader for the agent binary.
//!
//! Keys are read case-sensitively under a single `[agent]` section, per
//! the documented on-disk layout: `server_url`, `name`, `token`,
//! `interval` (seconds, default 30), `auto_update` (bool, default false).

use std::path::Path;

use anyhow::Context;
use ini::Ini;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentFileConfig {
    pub server_url: String,
    pub name: String,
    pub token: String,
    pub interval_secs: u64,
    pub auto_update: bool,
}

const DEFAULT_INTERVAL_SECS: u64 = 30;

impl AgentFileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let ini = Ini::load_from_file(path)
            .with_context(|| format!("failed to read agent config: {}", path.display()))?;
        let section = ini
            .section(Some("agent"))
            .ok_or_else(|| anyhow::anyhow!("config-invalid: missing [agent] section in {}", path.display()))?;

        let server_url = section
            .get("server_url")
            .ok_or_else(|| anyhow::anyhow!("config-invalid: [agent] server_url is required"))?
            .trim_end_matches('/')
            .to_string();
        let token = section
            .get("token")
            .ok_or_else(|| anyhow::anyhow!("config-invalid: [agent] token is required"))?
            .to_string();
        let name = section.get("name").unwrap_or("").to_string();
        let interval_secs = section
            .get("interval")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_INTERVAL_SECS);
        let auto_update = section
            .get("auto_update")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(AgentFileConfig {
            server_url,
            name,
            token,
            interval_secs,
            auto_update,
        })
    }

    /// `ws://`/`wss://` URL for the agent WebSocket endpoint, with the
    /// bearer token and machine id query parameters attached.
    pub fn ws_url(&self, machine_id: &str) -> String {
        let base = self
            .server_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{base}/api/agent/ws?token={}&machine_id={machine_id}", self.token)
    }

    /// The contents of the `config.example.ini` bundled in every release tarball.
    pub fn example_ini() -> &'static str {
        "[agent]\n\
         server_url = http://localhost:8080\n\
         name = \n\
         token = \n\
         interval = 30\n\
         auto_update = false\n"
    }
}
