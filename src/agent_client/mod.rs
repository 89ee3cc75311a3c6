//! Agent client runtime — the out-of-process `baihu-agent` binary.
//!
//! Bootstraps from `config.ini`, opens a persistent WebSocket to the
//! server's agent gateway, runs a local cron scheduler fed by `tasks`
//! frame diffs, executes work with [`crate::executor`], and reports
//! results back. Mirrors the teacher pack's node-client shape (a
//! reconnecting WebSocket client plus a local task runner) rather than
//! the teacher repo's own (server-side only) architecture.

pub mod cli;
pub mod config;
pub mod lock;
pub mod reconnect;
pub mod runtime;
pub mod systemd;
pub mod update;

pub use config::AgentFileConfig;
