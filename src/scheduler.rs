//! Scheduler registry — keeps one live timer per enabled task, in sync
//! with the task catalog, and enqueues a dispatch event on every fire.
//!
//! The teacher's original scheduler drove `tokio_cron_scheduler::Job`
//! closures that executed work inline. That doesn't fit here: firing
//! must only enqueue into the dispatch queue (§4.C), never run the
//! command itself, so the registry owns a lighter hand-rolled per-task
//! loop task built directly on [`crate::cron::Clock`] instead.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::cron::Clock;

/// Identifies whether two versions of the same task id need rescheduling:
/// only `schedule` and `command` participate, matching the registry's
/// documented dedup key.
fn schedule_hash(schedule: &str, command: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    schedule.hash(&mut hasher);
    command.hash(&mut hasher);
    hasher.finish()
}

struct Entry {
    hash: u64,
    handle: JoinHandle<()>,
    next_fire: Arc<Mutex<Option<chrono::DateTime<Utc>>>>,
}

/// Minimal view of a task the registry needs to schedule it, decoupled
/// from the full [`crate::storage::Task`] so tests don't need a database.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub id: i64,
    pub schedule: String,
    pub command: String,
    pub enabled: bool,
}

pub struct Scheduler {
    clock: Clock,
    entries: Mutex<HashMap<i64, Entry>>,
    on_fire: Arc<dyn Fn(i64) + Send + Sync>,
}

impl Scheduler {
    pub fn new(clock: Clock, on_fire: impl Fn(i64) + Send + Sync + 'static) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
            on_fire: Arc::new(on_fire),
        }
    }

    /// Add a new entry, replace a changed one, or no-op if `(schedule,
    /// command)` is unchanged for this task id. Disabled tasks are
    /// removed rather than scheduled.
    pub async fn add_or_update(&self, task: &ScheduledTask) -> Result<(), crate::cron::CronError> {
        if !task.enabled {
            self.remove(task.id).await;
            return Ok(());
        }

        let new_hash = schedule_hash(&task.schedule, &task.command);
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(&task.id) {
            if existing.hash == new_hash {
                return Ok(());
            }
            existing.handle.abort();
        }

        // Validate up front so a bad schedule never gets a spawned loop.
        self.clock.parse(&task.schedule)?;

        let task_id = task.id;
        let schedule = task.schedule.clone();
        let clock = self.clock;
        let on_fire = self.on_fire.clone();
        let next_fire = Arc::new(Mutex::new(None));
        let next_fire_for_task = next_fire.clone();

        let handle = tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next = match clock.next_fire(&schedule, now) {
                    Ok(Some(t)) => t,
                    _ => break,
                };
                *next_fire_for_task.lock().await = Some(next);

                let wait = (next - Utc::now()).to_std().unwrap_or(std::time::Duration::ZERO);
                tokio::time::sleep(wait).await;
                on_fire(task_id);
            }
        });

        entries.insert(
            task.id,
            Entry {
                hash: new_hash,
                handle,
                next_fire,
            },
        );
        Ok(())
    }

    pub async fn remove(&self, task_id: i64) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.remove(&task_id) {
            entry.handle.abort();
        }
    }

    pub async fn list_active(&self) -> HashMap<i64, Option<chrono::DateTime<Utc>>> {
        let entries = self.entries.lock().await;
        let mut out = HashMap::with_capacity(entries.len());
        for (id, entry) in entries.iter() {
            out.insert(*id, *entry.next_fire.lock().await);
        }
        out
    }

    /// Startup re-sync: schedule every currently-enabled task.
    pub async fn resync(&self, tasks: &[ScheduledTask]) {
        for task in tasks {
            if let Err(e) = self.add_or_update(task).await {
                tracing::warn!(task_id = task.id, error = %e, "invalid-schedule: skipping task at resync");
            }
        }
    }
}
