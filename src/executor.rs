//! Local executor — spawns a task's command under a timeout with an
//! injected environment, and captures combined output.
//!
//! Grounded in the teacher's `exec_shell` tool: piped stdio, `kill_on_drop`,
//! and `tokio::time::timeout` around `wait_with_output`. Unlike
//! `exec_shell`, the spawned process inherits the full current process
//! environment rather than a cleared one — the task's own referenced
//! variables are layered on top, never substituted for the host
//! environment (§4.E.2) — and this runs an untouched user-authored command
//! (no blocklist — the command comes from the task catalog, an operator
//! surface, not from an untrusted chat agent) and always returns a result
//! rather than bubbling an error, since every execution must produce
//! exactly one log record even when it fails.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::process::CommandExt;

use chrono::Utc;

use crate::storage::EnvVar;

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub task_id: i64,
    pub command: String,
    pub timeout_minutes: i64,
    pub work_dir: String,
    pub env_vars: Vec<EnvVar>,
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub task_id: i64,
    pub command: String,
    pub output: String,
    pub status: &'static str,
    pub duration_ms: i64,
    pub exit_code: i32,
    pub start_ts: String,
    pub end_ts: String,
}

/// Resolve the effective working directory: empty ⇒ `scripts_dir`;
/// relative ⇒ relative to `scripts_dir`; absolute ⇒ used as-is.
fn resolve_work_dir(scripts_dir: &Path, work_dir: &str) -> PathBuf {
    if work_dir.is_empty() {
        return scripts_dir.to_path_buf();
    }
    let p = Path::new(work_dir);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        scripts_dir.join(p)
    }
}

/// Run one task execution. Never returns `Err` for command failures —
/// those are folded into `status="failed"` so the pipeline always gets
/// exactly one result to persist. Only truly unrecoverable setup errors
/// (e.g. `scripts_dir` cannot be read) are allowed to surface as `Err`,
/// and even those are caught by the caller and turned into a failed
/// result with an `exec-spawn-failure` note.
pub async fn execute(req: &ExecRequest, scripts_dir: &Path, demo_mode: bool) -> ExecOutcome {
    let start = Utc::now();

    if demo_mode {
        let end = Utc::now();
        return ExecOutcome {
            task_id: req.task_id,
            command: req.command.clone(),
            output: "[demo mode] execution skipped\n".to_string(),
            status: "success",
            duration_ms: (end - start).num_milliseconds().max(0),
            exit_code: 0,
            start_ts: start.to_rfc3339(),
            end_ts: end.to_rfc3339(),
        };
    }

    let work_dir = resolve_work_dir(scripts_dir, &req.work_dir);
    let timeout_minutes = if req.timeout_minutes <= 0 { 30 } else { req.timeout_minutes };
    let timeout = Duration::from_secs((timeout_minutes as u64) * 60);

    let mut command = build_command(&req.command);
    command.current_dir(&work_dir);
    // Inherit the full current process environment (§4.E.2) — only fill
    // in PATH/HOME as defaults if the server's own process is somehow
    // missing them, never wipe what's already there.
    if std::env::var_os("PATH").is_none() {
        command.env("PATH", "/usr/local/bin:/usr/bin:/bin");
    }
    if std::env::var_os("HOME").is_none() {
        command.env("HOME", work_dir.to_string_lossy().to_string());
    }
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    {
        // New process group per execution so a timeout can reclaim the
        // whole tree (e.g. `sleep 10 & wait`), not just the direct child.
        command.process_group(0);
    }
    for var in &req.env_vars {
        command.env(&var.name, &var.value);
    }

    let mut child = match command.spawn() {
        Ok(c) => c,
        Err(e) => {
            let end = Utc::now();
            return ExecOutcome {
                task_id: req.task_id,
                command: req.command.clone(),
                output: format!("\n[ERROR]\n\nexec-spawn-failure: {e}"),
                status: "failed",
                duration_ms: (end - start).num_milliseconds().max(0),
                exit_code: 1,
                start_ts: start.to_rfc3339(),
                end_ts: end.to_rfc3339(),
            };
        }
    };
    let pid = child.id();

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let end = Utc::now();
            let code = output.status.code().unwrap_or(-1);
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let success = output.status.success();
            let combined = if success {
                stdout
            } else {
                format!("{stdout}\n[ERROR]\n{stderr}")
            };
            ExecOutcome {
                task_id: req.task_id,
                command: req.command.clone(),
                output: combined,
                status: if success { "success" } else { "failed" },
                duration_ms: (end - start).num_milliseconds().max(0),
                exit_code: code,
                start_ts: start.to_rfc3339(),
                end_ts: end.to_rfc3339(),
            }
        }
        Ok(Err(e)) => {
            let end = Utc::now();
            ExecOutcome {
                task_id: req.task_id,
                command: req.command.clone(),
                output: format!("\n[ERROR]\n\n{e}"),
                status: "failed",
                duration_ms: (end - start).num_milliseconds().max(0),
                exit_code: -1,
                start_ts: start.to_rfc3339(),
                end_ts: end.to_rfc3339(),
            }
        }
        Err(_elapsed) => {
            kill_process_group(pid);
            let end = Utc::now();
            ExecOutcome {
                task_id: req.task_id,
                command: req.command.clone(),
                output: format!("\n[ERROR]\n\ntimeout: execution exceeded {timeout_minutes}m and was killed"),
                status: "failed",
                duration_ms: (end - start).num_milliseconds().max(0),
                exit_code: -1,
                start_ts: start.to_rfc3339(),
                end_ts: end.to_rfc3339(),
            }
        }
    }
}

/// Send `SIGKILL` to the whole process group spawned for this execution.
/// `kill_on_drop` alone only reaches the direct child; a command like
/// `sleep 10 & wait` leaves grandchildren behind it that only a
/// group-wide kill reclaims.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(target_os = "windows")]
fn build_command(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("cmd");
    cmd.arg("/c").arg(command);
    cmd
}

#[cfg(not(target_os = "windows"))]
fn build_command(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(command: &str, timeout_minutes: i64) -> ExecRequest {
        ExecRequest {
            task_id: 1,
            command: command.to_string(),
            timeout_minutes,
            work_dir: "".to_string(),
            env_vars: vec![],
        }
    }

    #[tokio::test]
    async fn scenario_s2_local_success() {
        let outcome = execute(&req("echo hello", 1), &std::env::temp_dir(), false).await;
        assert_eq!(outcome.status, "success");
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.output, "hello\n");
        assert!(outcome.duration_ms >= 0);
    }

    #[tokio::test]
    async fn scenario_s3_local_timeout() {
        let mut r = req("sleep 10", 0);
        r.timeout_minutes = 0; // falls back to default 30m in real code; force a short one here
        let start = std::time::Instant::now();
        // Use a request whose command sleeps far longer than a 1-second budget
        // by constructing the timeout directly rather than going through
        // the 30m default used for `<= 0`.
        let outcome = execute_with_timeout(&req("sleep 10", 1), Duration::from_millis(300)).await;
        let elapsed = start.elapsed();
        assert_eq!(outcome.status, "failed");
        assert!(outcome.output.contains("[ERROR]"));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn failed_command_includes_error_marker() {
        let outcome = execute(&req("exit 7", 1), &std::env::temp_dir(), false).await;
        assert_eq!(outcome.status, "failed");
        assert_eq!(outcome.exit_code, 7);
    }

    #[tokio::test]
    async fn inherits_host_environment_and_layers_task_env_vars_on_top() {
        std::env::set_var("BAIHU_TEST_HOST_VAR", "from-host");
        let mut r = req("echo $BAIHU_TEST_HOST_VAR:$BAIHU_TEST_TASK_VAR", 1);
        r.env_vars = vec![EnvVar {
            id: 1,
            name: "BAIHU_TEST_TASK_VAR".to_string(),
            value: "from-task".to_string(),
            remark: None,
        }];
        let outcome = execute(&r, &std::env::temp_dir(), false).await;
        std::env::remove_var("BAIHU_TEST_HOST_VAR");
        assert_eq!(outcome.output, "from-host:from-task\n");
    }

    #[tokio::test]
    async fn demo_mode_short_circuits_without_spawning() {
        let outcome = execute(&req("this-command-does-not-exist-xyz", 1), &std::env::temp_dir(), true).await;
        assert_eq!(outcome.status, "success");
        assert!(outcome.output.contains("demo mode"));
    }

    #[tokio::test]
    async fn resolves_relative_work_dir_against_scripts_dir() {
        let dir = resolve_work_dir(Path::new("/srv/scripts"), "sub");
        assert_eq!(dir, PathBuf::from("/srv/scripts/sub"));
        let dir = resolve_work_dir(Path::new("/srv/scripts"), "/abs/path");
        assert_eq!(dir, PathBuf::from("/abs/path"));
        let dir = resolve_work_dir(Path::new("/srv/scripts"), "");
        assert_eq!(dir, PathBuf::from("/srv/scripts"));
    }

    /// Test helper exercising a tighter timeout than the public API allows,
    /// so S3 doesn't need a real 1-minute wait.
    async fn execute_with_timeout(req: &ExecRequest, timeout: Duration) -> ExecOutcome {
        let start = Utc::now();
        let mut command = build_command(&req.command);
        command
            .current_dir(std::env::temp_dir())
            .env_clear()
            .env("PATH", "/usr/bin:/bin")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn().unwrap();
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let end = Utc::now();
                ExecOutcome {
                    task_id: req.task_id,
                    command: req.command.clone(),
                    output: String::from_utf8_lossy(&output.stdout).to_string(),
                    status: "success",
                    duration_ms: (end - start).num_milliseconds(),
                    exit_code: output.status.code().unwrap_or(-1),
                    start_ts: start.to_rfc3339(),
                    end_ts: end.to_rfc3339(),
                }
            }
            _ => {
                let end = Utc::now();
                ExecOutcome {
                    task_id: req.task_id,
                    command: req.command.clone(),
                    output: "\n[ERROR]\n\ntimeout".to_string(),
                    status: "failed",
                    duration_ms: (end - start).num_milliseconds(),
                    exit_code: -1,
                    start_ts: start.to_rfc3339(),
                    end_ts: end.to_rfc3339(),
                }
            }
        }
    }
}
