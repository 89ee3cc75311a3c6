//! Log persistence pipeline — turns a completed execution into a durable,
//! retained log record.
//!
//! Replaces what would otherwise be a callback-list hung off the
//! executor with an explicit staged pipeline: `compress → persist →
//! update stats → apply retention`. Each stage is its own function so it's
//! independently testable; `run` is the only thing that needs to know the
//! order.

use std::io::Write;
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::storage::{Retention, Storage, TaskLog};

/// The outcome of one task execution, local or agent-reported, prior to
/// compression/persistence.
#[derive(Debug, Clone)]
pub struct ExecuteResult {
    pub task_id: i64,
    pub agent_id: Option<i64>,
    pub command: String,
    pub output: String,
    pub status: String,
    pub duration_ms: i64,
    pub exit_code: i32,
    pub start_ts: String,
    pub end_ts: String,
}

/// gzip `output`. Compression failure must never abort log creation — the
/// caller stores an empty body and logs a warning instead of propagating.
fn compress(output: &str) -> Option<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    if let Err(e) = encoder.write_all(output.as_bytes()) {
        tracing::warn!(error = %e, "compress-failure: gzip write failed, storing empty log body");
        return None;
    }
    match encoder.finish() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::warn!(error = %e, "compress-failure: gzip finish failed, storing empty log body");
            None
        }
    }
}

/// Run the full pipeline for one execution result: compress, persist,
/// bump the daily counter, and apply the task's retention policy. Runs on
/// its own task per result (callers should `tokio::spawn` this) so worker
/// threads are freed immediately after the process exits.
pub async fn run(storage: Arc<Storage>, result: ExecuteResult) -> anyhow::Result<i64> {
    tokio::task::spawn_blocking(move || run_blocking(&storage, &result)).await?
}

fn run_blocking(storage: &Storage, result: &ExecuteResult) -> anyhow::Result<i64> {
    let output_gz = compress(&result.output).unwrap_or_default();

    let log = TaskLog {
        id: 0,
        task_id: result.task_id,
        agent_id: result.agent_id,
        command: result.command.clone(),
        output_gz,
        status: result.status.clone(),
        duration_ms: result.duration_ms,
        exit_code: result.exit_code,
        start_ts: result.start_ts.clone(),
        end_ts: result.end_ts.clone(),
    };
    let log_id = storage.create_log(&log)?;

    storage.set_task_last_run(result.task_id, &result.end_ts)?;

    let day = result.end_ts.get(..10).unwrap_or(&result.end_ts).to_string();
    storage.bump_daily_stat(&day, &result.status)?;

    if let Ok(task) = storage.get_task(result.task_id) {
        match task.retention {
            Retention::ByAge { keep_days } if keep_days > 0 => {
                storage.apply_retention_by_age(task.id, keep_days)?;
            }
            Retention::ByCount { keep_last } if keep_last > 0 => {
                storage.apply_retention_by_count(task.id, keep_last)?;
            }
            _ => {}
        }
    }

    Ok(log_id)
}

/// Decompress a stored gzip body back to the original text output.
pub fn decompress(output_gz: &[u8]) -> anyhow::Result<String> {
    use flate2::read::GzDecoder;
    use std::io::Read;
    let mut decoder = GzDecoder::new(output_gz);
    let mut out = String::new();
    decoder.read_to_string(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NewTask;

    fn task_with_retention(storage: &Storage, retention: Retention) -> i64 {
        storage
            .create_task(&NewTask {
                name: "t".into(),
                command: "echo hi".into(),
                schedule: "0 * * * * *".into(),
                timeout_minutes: 1,
                work_dir: "".into(),
                env_ids: vec![],
                retention,
                enabled: true,
                agent_id: None,
            })
            .unwrap()
            .id
    }

    fn result_for(task_id: i64, end_ts: &str) -> ExecuteResult {
        ExecuteResult {
            task_id,
            agent_id: None,
            command: "echo hi".into(),
            output: "hello\n".into(),
            status: "success".into(),
            duration_ms: 5,
            exit_code: 0,
            start_ts: end_ts.to_string(),
            end_ts: end_ts.to_string(),
        }
    }

    #[tokio::test]
    async fn gzip_round_trips_to_original_output() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let task_id = task_with_retention(&storage, Retention::None);
        let log_id = run(storage.clone(), result_for(task_id, "2025-01-01T00:00:00+00:00"))
            .await
            .unwrap();
        let log = storage.get_log(log_id).unwrap().unwrap();
        assert_eq!(decompress(&log.output_gz).unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn retention_by_count_trims_after_pipeline_runs() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let task_id = task_with_retention(&storage, Retention::ByCount { keep_last: 2 });
        for i in 0..4 {
            run(
                storage.clone(),
                result_for(task_id, &format!("2025-01-0{}T00:00:00+00:00", i + 1)),
            )
            .await
            .unwrap();
        }
        let remaining = storage.list_logs_for_task(task_id).unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[tokio::test]
    async fn pipeline_updates_task_last_run() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let task_id = task_with_retention(&storage, Retention::None);
        run(storage.clone(), result_for(task_id, "2025-06-01T12:00:00+00:00"))
            .await
            .unwrap();
        let task = storage.get_task(task_id).unwrap();
        assert_eq!(task.last_run.as_deref(), Some("2025-06-01T12:00:00+00:00"));
    }
}
