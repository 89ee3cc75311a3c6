//! Storage layer — a single SQLite database behind a connection mutex,
//! following the same shape as the teacher's `MemoryStore`: open-or-create,
//! `PRAGMA journal_mode=WAL`, idempotent `CREATE TABLE IF NOT EXISTS`
//! bootstrap, every access taking the mutex for the duration of one
//! statement or short transaction.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage-failure: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("task-not-found: {0}")]
    TaskNotFound(i64),
    #[error("agent-not-found: {0}")]
    AgentNotFound(i64),
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Retention {
    ByAge { keep_days: i64 },
    ByCount { keep_last: i64 },
    None,
}

impl Default for Retention {
    fn default() -> Self {
        Retention::None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub command: String,
    pub schedule: String,
    pub timeout_minutes: i64,
    pub work_dir: String,
    pub env_ids: Vec<i64>,
    pub retention: Retention,
    pub enabled: bool,
    pub agent_id: Option<i64>,
    pub last_run: Option<String>,
    pub next_run: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    pub command: String,
    pub schedule: String,
    pub timeout_minutes: i64,
    pub work_dir: String,
    pub env_ids: Vec<i64>,
    pub retention: Retention,
    pub enabled: bool,
    pub agent_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVar {
    pub id: i64,
    pub name: String,
    pub value: String,
    pub remark: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLog {
    pub id: i64,
    pub task_id: i64,
    pub agent_id: Option<i64>,
    pub command: String,
    /// Raw gzip bytes, as stored. Callers at the API/protocol boundary
    /// base64-encode this for JSON transport; the database never holds
    /// base64 text.
    pub output_gz: Vec<u8>,
    pub status: String,
    pub duration_ms: i64,
    pub exit_code: i32,
    pub start_ts: String,
    pub end_ts: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub token: String,
    pub machine_id: String,
    pub last_ip: Option<String>,
    pub hostname: Option<String>,
    pub os: Option<String>,
    pub arch: Option<String>,
    pub version: Option<String>,
    pub build_time: Option<String>,
    pub status: String,
    pub last_seen: Option<String>,
    pub enabled: bool,
    pub force_update: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentToken {
    pub id: i64,
    pub token: String,
    pub remark: Option<String>,
    pub max_uses: i64,
    pub used_count: i64,
    pub expires_at: Option<String>,
    pub enabled: bool,
}

/// `Mutex<Connection>` is the concrete, testable instance of `spec.md`'s
/// abstract "transactional kv/relational store".
pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Sqlite(rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
            })?;
        }
        let conn = Connection::open(db_path)?;
        Self::bootstrap(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::bootstrap(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn bootstrap(conn: &Connection) -> Result<()> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                name            TEXT NOT NULL,
                command         TEXT NOT NULL DEFAULT '',
                schedule        TEXT NOT NULL,
                timeout_minutes INTEGER NOT NULL DEFAULT 30,
                work_dir        TEXT NOT NULL DEFAULT '',
                env_ids         TEXT NOT NULL DEFAULT '[]',
                retention       TEXT NOT NULL DEFAULT '{\"kind\":\"none\"}',
                enabled         INTEGER NOT NULL DEFAULT 1,
                agent_id        INTEGER,
                last_run        TEXT,
                next_run        TEXT
            );

            CREATE TABLE IF NOT EXISTS env_vars (
                id     INTEGER PRIMARY KEY AUTOINCREMENT,
                name   TEXT NOT NULL,
                value  TEXT NOT NULL,
                remark TEXT
            );

            CREATE TABLE IF NOT EXISTS task_logs (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id      INTEGER NOT NULL,
                agent_id     INTEGER,
                command      TEXT NOT NULL,
                output_gz    BLOB NOT NULL DEFAULT x'',
                status       TEXT NOT NULL,
                duration_ms  INTEGER NOT NULL,
                exit_code    INTEGER NOT NULL,
                start_ts     TEXT NOT NULL,
                end_ts       TEXT NOT NULL,
                created_at   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_task_logs_task_id ON task_logs(task_id, id);

            CREATE TABLE IF NOT EXISTS agents (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                name         TEXT NOT NULL,
                description  TEXT,
                token        TEXT NOT NULL UNIQUE,
                machine_id   TEXT NOT NULL UNIQUE,
                last_ip      TEXT,
                hostname     TEXT,
                os           TEXT,
                arch         TEXT,
                version      TEXT,
                build_time   TEXT,
                status       TEXT NOT NULL DEFAULT 'offline',
                last_seen    TEXT,
                enabled      INTEGER NOT NULL DEFAULT 1,
                force_update INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS enrollment_tokens (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                token       TEXT NOT NULL UNIQUE,
                remark      TEXT,
                max_uses    INTEGER NOT NULL DEFAULT 0,
                used_count  INTEGER NOT NULL DEFAULT 0,
                expires_at  TEXT,
                enabled     INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS daily_stats (
                day    TEXT NOT NULL,
                status TEXT NOT NULL,
                count  INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (day, status)
            );",
        )?;
        Ok(())
    }

    // ---- tasks ----

    pub fn create_task(&self, t: &NewTask) -> Result<Task> {
        let conn = self.conn.lock().expect("storage db poisoned");
        let env_ids_json = serde_json::to_string(&t.env_ids).unwrap_or_else(|_| "[]".into());
        let retention_json = serde_json::to_string(&t.retention).unwrap_or_else(|_| "{\"kind\":\"none\"}".into());
        conn.execute(
            "INSERT INTO tasks (name, command, schedule, timeout_minutes, work_dir, env_ids, retention, enabled, agent_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                t.name,
                t.command,
                t.schedule,
                t.timeout_minutes,
                t.work_dir,
                env_ids_json,
                retention_json,
                t.enabled,
                t.agent_id,
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_task(id)
    }

    pub fn get_task(&self, id: i64) -> Result<Task> {
        let conn = self.conn.lock().expect("storage db poisoned");
        conn.query_row(
            "SELECT id, name, command, schedule, timeout_minutes, work_dir, env_ids, retention, enabled, agent_id, last_run, next_run
             FROM tasks WHERE id = ?1",
            params![id],
            row_to_task,
        )
        .optional()?
        .ok_or(StorageError::TaskNotFound(id))
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn.lock().expect("storage db poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, name, command, schedule, timeout_minutes, work_dir, env_ids, retention, enabled, agent_id, last_run, next_run
             FROM tasks ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_task)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn list_enabled_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.list_tasks()?.into_iter().filter(|t| t.enabled).collect())
    }

    pub fn list_tasks_for_agent(&self, agent_id: i64) -> Result<Vec<Task>> {
        Ok(self
            .list_tasks()?
            .into_iter()
            .filter(|t| t.agent_id == Some(agent_id) && t.enabled)
            .collect())
    }

    pub fn update_task(&self, id: i64, t: &NewTask) -> Result<Task> {
        let conn = self.conn.lock().expect("storage db poisoned");
        let env_ids_json = serde_json::to_string(&t.env_ids).unwrap_or_else(|_| "[]".into());
        let retention_json = serde_json::to_string(&t.retention).unwrap_or_else(|_| "{\"kind\":\"none\"}".into());
        let changed = conn.execute(
            "UPDATE tasks SET name=?1, command=?2, schedule=?3, timeout_minutes=?4, work_dir=?5,
             env_ids=?6, retention=?7, enabled=?8, agent_id=?9 WHERE id=?10",
            params![
                t.name,
                t.command,
                t.schedule,
                t.timeout_minutes,
                t.work_dir,
                env_ids_json,
                retention_json,
                t.enabled,
                t.agent_id,
                id,
            ],
        )?;
        drop(conn);
        if changed == 0 {
            return Err(StorageError::TaskNotFound(id));
        }
        self.get_task(id)
    }

    pub fn delete_task(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("storage db poisoned");
        conn.execute("DELETE FROM tasks WHERE id=?1", params![id])?;
        conn.execute("DELETE FROM task_logs WHERE task_id=?1", params![id])?;
        Ok(())
    }

    pub fn set_task_last_run(&self, id: i64, last_run: &str) -> Result<()> {
        let conn = self.conn.lock().expect("storage db poisoned");
        conn.execute(
            "UPDATE tasks SET last_run=?1 WHERE id=?2",
            params![last_run, id],
        )?;
        Ok(())
    }

    // ---- env vars ----

    pub fn create_env_var(&self, name: &str, value: &str, remark: Option<&str>) -> Result<EnvVar> {
        let conn = self.conn.lock().expect("storage db poisoned");
        conn.execute(
            "INSERT INTO env_vars (name, value, remark) VALUES (?1, ?2, ?3)",
            params![name, value, remark],
        )?;
        let id = conn.last_insert_rowid();
        Ok(EnvVar {
            id,
            name: name.to_string(),
            value: value.to_string(),
            remark: remark.map(str::to_string),
        })
    }

    pub fn list_env_vars(&self) -> Result<Vec<EnvVar>> {
        let conn = self.conn.lock().expect("storage db poisoned");
        let mut stmt = conn.prepare("SELECT id, name, value, remark FROM env_vars ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(EnvVar {
                id: row.get(0)?,
                name: row.get(1)?,
                value: row.get(2)?,
                remark: row.get(3)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn get_env_vars(&self, ids: &[i64]) -> Result<Vec<EnvVar>> {
        Ok(self
            .list_env_vars()?
            .into_iter()
            .filter(|e| ids.contains(&e.id))
            .collect())
    }

    pub fn delete_env_var(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("storage db poisoned");
        conn.execute("DELETE FROM env_vars WHERE id=?1", params![id])?;
        Ok(())
    }

    // ---- task logs ----

    pub fn create_log(&self, log: &TaskLog) -> Result<i64> {
        let conn = self.conn.lock().expect("storage db poisoned");
        let created_at = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO task_logs (task_id, agent_id, command, output_gz, status, duration_ms, exit_code, start_ts, end_ts, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                log.task_id,
                log.agent_id,
                log.command,
                log.output_gz,
                log.status,
                log.duration_ms,
                log.exit_code,
                log.start_ts,
                log.end_ts,
                created_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_log(&self, id: i64) -> Result<Option<TaskLog>> {
        let conn = self.conn.lock().expect("storage db poisoned");
        conn.query_row(
            "SELECT id, task_id, agent_id, command, output_gz, status, duration_ms, exit_code, start_ts, end_ts
             FROM task_logs WHERE id=?1",
            params![id],
            row_to_log,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_logs_for_task(&self, task_id: i64) -> Result<Vec<TaskLog>> {
        let conn = self.conn.lock().expect("storage db poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, task_id, agent_id, command, output_gz, status, duration_ms, exit_code, start_ts, end_ts
             FROM task_logs WHERE task_id=?1 ORDER BY id DESC",
        )?;
        let rows = stmt.query_map(params![task_id], row_to_log)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Delete logs for `task_id` older than `keep_days`.
    pub fn apply_retention_by_age(&self, task_id: i64, keep_days: i64) -> Result<usize> {
        let conn = self.conn.lock().expect("storage db poisoned");
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(keep_days)).to_rfc3339();
        let deleted = conn.execute(
            "DELETE FROM task_logs WHERE task_id=?1 AND created_at < ?2",
            params![task_id, cutoff],
        )?;
        Ok(deleted)
    }

    /// Keep only the `keep_last` most recent logs for `task_id`.
    pub fn apply_retention_by_count(&self, task_id: i64, keep_last: i64) -> Result<usize> {
        let conn = self.conn.lock().expect("storage db poisoned");
        let cutoff_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM task_logs WHERE task_id=?1 ORDER BY id DESC LIMIT 1 OFFSET ?2",
                params![task_id, keep_last.max(0)],
                |row| row.get(0),
            )
            .optional()?;
        let Some(cutoff_id) = cutoff_id else {
            return Ok(0);
        };
        let deleted = conn.execute(
            "DELETE FROM task_logs WHERE task_id=?1 AND id <= ?2",
            params![task_id, cutoff_id],
        )?;
        Ok(deleted)
    }

    pub fn bump_daily_stat(&self, day: &str, status: &str) -> Result<()> {
        let conn = self.conn.lock().expect("storage db poisoned");
        conn.execute(
            "INSERT INTO daily_stats (day, status, count) VALUES (?1, ?2, 1)
             ON CONFLICT(day, status) DO UPDATE SET count = count + 1",
            params![day, status],
        )?;
        Ok(())
    }

    // ---- agents ----

    pub fn get_agent(&self, id: i64) -> Result<Agent> {
        let conn = self.conn.lock().expect("storage db poisoned");
        conn.query_row(
            "SELECT id, name, description, token, machine_id, last_ip, hostname, os, arch, version, build_time, status, last_seen, enabled, force_update
             FROM agents WHERE id=?1",
            params![id],
            row_to_agent,
        )
        .optional()?
        .ok_or(StorageError::AgentNotFound(id))
    }

    pub fn get_agent_by_token(&self, token: &str) -> Result<Option<Agent>> {
        let conn = self.conn.lock().expect("storage db poisoned");
        conn.query_row(
            "SELECT id, name, description, token, machine_id, last_ip, hostname, os, arch, version, build_time, status, last_seen, enabled, force_update
             FROM agents WHERE token=?1",
            params![token],
            row_to_agent,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_agent_by_machine_id(&self, machine_id: &str) -> Result<Option<Agent>> {
        let conn = self.conn.lock().expect("storage db poisoned");
        conn.query_row(
            "SELECT id, name, description, token, machine_id, last_ip, hostname, os, arch, version, build_time, status, last_seen, enabled, force_update
             FROM agents WHERE machine_id=?1",
            params![machine_id],
            row_to_agent,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_agents(&self) -> Result<Vec<Agent>> {
        let conn = self.conn.lock().expect("storage db poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, name, description, token, machine_id, last_ip, hostname, os, arch, version, build_time, status, last_seen, enabled, force_update
             FROM agents ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_agent)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn create_agent(&self, name: &str, token: &str, machine_id: &str) -> Result<Agent> {
        let conn = self.conn.lock().expect("storage db poisoned");
        conn.execute(
            "INSERT INTO agents (name, token, machine_id, status, enabled) VALUES (?1, ?2, ?3, 'online', 1)",
            params![name, token, machine_id],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_agent(id)
    }

    pub fn update_agent_connection(
        &self,
        id: i64,
        token: &str,
        ip: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("storage db poisoned");
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE agents SET token=?1, last_ip=?2, status='online', last_seen=?3 WHERE id=?4",
            params![token, ip, now, id],
        )?;
        Ok(())
    }

    pub fn heartbeat_agent(
        &self,
        id: i64,
        version: &str,
        build_time: &str,
        hostname: &str,
        os: &str,
        arch: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("storage db poisoned");
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE agents SET
                version    = CASE WHEN ?1 != '' THEN ?1 ELSE version END,
                build_time = CASE WHEN ?2 != '' THEN ?2 ELSE build_time END,
                hostname   = CASE WHEN ?3 != '' THEN ?3 ELSE hostname END,
                os         = CASE WHEN ?4 != '' THEN ?4 ELSE os END,
                arch       = CASE WHEN ?5 != '' THEN ?5 ELSE arch END,
                status='online', last_seen=?6
             WHERE id=?7",
            params![version, build_time, hostname, os, arch, now, id],
        )?;
        Ok(())
    }

    pub fn update_agent_metadata(
        &self,
        id: i64,
        name: &str,
        description: Option<&str>,
        enabled: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("storage db poisoned");
        conn.execute(
            "UPDATE agents SET name=?1, description=?2, enabled=?3 WHERE id=?4",
            params![name, description, enabled, id],
        )?;
        Ok(())
    }

    pub fn delete_agent(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("storage db poisoned");
        let bound: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE agent_id=?1",
            params![id],
            |row| row.get(0),
        )?;
        if bound > 0 {
            return Err(StorageError::Sqlite(rusqlite::Error::ExecuteReturnedResults));
        }
        conn.execute("DELETE FROM agents WHERE id=?1", params![id])?;
        Ok(())
    }

    pub fn mark_agent_offline(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("storage db poisoned");
        conn.execute("UPDATE agents SET status='offline' WHERE id=?1", params![id])?;
        Ok(())
    }

    pub fn sweep_offline_agents(&self, idle_threshold_secs: i64) -> Result<usize> {
        let conn = self.conn.lock().expect("storage db poisoned");
        let cutoff = (chrono::Utc::now() - chrono::Duration::seconds(idle_threshold_secs)).to_rfc3339();
        let changed = conn.execute(
            "UPDATE agents SET status='offline' WHERE status='online' AND (last_seen IS NULL OR last_seen < ?1)",
            params![cutoff],
        )?;
        Ok(changed)
    }

    pub fn set_force_update(&self, id: i64, force: bool) -> Result<()> {
        let conn = self.conn.lock().expect("storage db poisoned");
        conn.execute(
            "UPDATE agents SET force_update=?1 WHERE id=?2",
            params![force, id],
        )?;
        Ok(())
    }

    /// Atomically read-and-clear the force-update flag; returns the value
    /// it had before clearing.
    pub fn take_force_update(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().expect("storage db poisoned");
        let prior: bool = conn.query_row(
            "SELECT force_update FROM agents WHERE id=?1",
            params![id],
            |row| row.get(0),
        )?;
        if prior {
            conn.execute("UPDATE agents SET force_update=0 WHERE id=?1", params![id])?;
        }
        Ok(prior)
    }

    // ---- enrollment tokens ----

    pub fn create_token(
        &self,
        token: &str,
        remark: Option<&str>,
        max_uses: i64,
        expires_at: Option<&str>,
    ) -> Result<EnrollmentToken> {
        let conn = self.conn.lock().expect("storage db poisoned");
        conn.execute(
            "INSERT INTO enrollment_tokens (token, remark, max_uses, expires_at, enabled) VALUES (?1, ?2, ?3, ?4, 1)",
            params![token, remark, max_uses, expires_at],
        )?;
        let id = conn.last_insert_rowid();
        Ok(EnrollmentToken {
            id,
            token: token.to_string(),
            remark: remark.map(str::to_string),
            max_uses,
            used_count: 0,
            expires_at: expires_at.map(str::to_string),
            enabled: true,
        })
    }

    pub fn get_token(&self, token: &str) -> Result<Option<EnrollmentToken>> {
        let conn = self.conn.lock().expect("storage db poisoned");
        conn.query_row(
            "SELECT id, token, remark, max_uses, used_count, expires_at, enabled FROM enrollment_tokens WHERE token=?1",
            params![token],
            row_to_token,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_tokens(&self) -> Result<Vec<EnrollmentToken>> {
        let conn = self.conn.lock().expect("storage db poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, token, remark, max_uses, used_count, expires_at, enabled FROM enrollment_tokens ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_token)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn delete_token(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("storage db poisoned");
        conn.execute("DELETE FROM enrollment_tokens WHERE id=?1", params![id])?;
        Ok(())
    }

    /// Atomically increment `used_count`, but only if doing so would not
    /// exceed `max_uses` (0 = unlimited). Returns whether the increment
    /// happened, so concurrent callers can never push `used_count` past
    /// `max_uses`.
    pub fn consume_token(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().expect("storage db poisoned");
        let changed = conn.execute(
            "UPDATE enrollment_tokens SET used_count = used_count + 1
             WHERE id=?1 AND (max_uses = 0 OR used_count < max_uses)",
            params![id],
        )?;
        Ok(changed > 0)
    }
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    let env_ids_json: String = row.get(6)?;
    let retention_json: String = row.get(7)?;
    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        command: row.get(2)?,
        schedule: row.get(3)?,
        timeout_minutes: row.get(4)?,
        work_dir: row.get(5)?,
        env_ids: serde_json::from_str(&env_ids_json).unwrap_or_default(),
        retention: serde_json::from_str(&retention_json).unwrap_or(Retention::None),
        enabled: row.get(8)?,
        agent_id: row.get(9)?,
        last_run: row.get(10)?,
        next_run: row.get(11)?,
    })
}

fn row_to_log(row: &rusqlite::Row) -> rusqlite::Result<TaskLog> {
    Ok(TaskLog {
        id: row.get(0)?,
        task_id: row.get(1)?,
        agent_id: row.get(2)?,
        command: row.get(3)?,
        output_gz: row.get(4)?,
        status: row.get(5)?,
        duration_ms: row.get(6)?,
        exit_code: row.get(7)?,
        start_ts: row.get(8)?,
        end_ts: row.get(9)?,
    })
}

fn row_to_agent(row: &rusqlite::Row) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        token: row.get(3)?,
        machine_id: row.get(4)?,
        last_ip: row.get(5)?,
        hostname: row.get(6)?,
        os: row.get(7)?,
        arch: row.get(8)?,
        version: row.get(9)?,
        build_time: row.get(10)?,
        status: row.get(11)?,
        last_seen: row.get(12)?,
        enabled: row.get(13)?,
        force_update: row.get(14)?,
    })
}

fn row_to_token(row: &rusqlite::Row) -> rusqlite::Result<EnrollmentToken> {
    Ok(EnrollmentToken {
        id: row.get(0)?,
        token: row.get(1)?,
        remark: row.get(2)?,
        max_uses: row.get(3)?,
        used_count: row.get(4)?,
        expires_at: row.get(5)?,
        enabled: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Storage {
        Storage::open_in_memory().unwrap()
    }

    fn sample_task() -> NewTask {
        NewTask {
            name: "ping".into(),
            command: "echo hi".into(),
            schedule: "0 * * * * *".into(),
            timeout_minutes: 1,
            work_dir: "".into(),
            env_ids: vec![],
            retention: Retention::None,
            enabled: true,
            agent_id: None,
        }
    }

    #[test]
    fn create_and_fetch_task_round_trips() {
        let storage = open();
        let created = storage.create_task(&sample_task()).unwrap();
        let fetched = storage.get_task(created.id).unwrap();
        assert_eq!(fetched.name, "ping");
        assert_eq!(fetched.schedule, "0 * * * * *");
    }

    #[test]
    fn missing_task_is_not_found() {
        let storage = open();
        assert!(matches!(storage.get_task(999), Err(StorageError::TaskNotFound(999))));
    }

    #[test]
    fn retention_by_count_keeps_exactly_n_newest() {
        let storage = open();
        let task = storage.create_task(&sample_task()).unwrap();
        for i in 0..5 {
            storage
                .create_log(&TaskLog {
                    id: 0,
                    task_id: task.id,
                    agent_id: None,
                    command: "echo hi".into(),
                    output_gz: vec![],
                    status: "success".into(),
                    duration_ms: 1,
                    exit_code: 0,
                    start_ts: format!("t{i}"),
                    end_ts: format!("t{i}"),
                })
                .unwrap();
        }
        storage.apply_retention_by_count(task.id, 3).unwrap();
        let remaining = storage.list_logs_for_task(task.id).unwrap();
        assert_eq!(remaining.len(), 3);
        let mut ids: Vec<i64> = remaining.iter().map(|l| l.id).collect();
        ids.sort();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn token_consumption_never_exceeds_max_uses() {
        let storage = open();
        let token = storage.create_token("tok123", None, 2, None).unwrap();
        assert!(storage.consume_token(token.id).unwrap());
        assert!(storage.consume_token(token.id).unwrap());
        assert!(!storage.consume_token(token.id).unwrap());
        let fetched = storage.get_token("tok123").unwrap().unwrap();
        assert_eq!(fetched.used_count, 2);
    }

    #[test]
    fn delete_agent_refuses_when_tasks_are_bound() {
        let storage = open();
        let agent = storage.create_agent("agent-1", "tok", "mid").unwrap();
        let mut task = sample_task();
        task.agent_id = Some(agent.id);
        storage.create_task(&task).unwrap();
        assert!(storage.delete_agent(agent.id).is_err());
    }

    #[test]
    fn register_reuse_keeps_same_agent_id() {
        let storage = open();
        let agent = storage.create_agent("agent-1", "tok-a", "mid-1").unwrap();
        storage.update_agent_connection(agent.id, "tok-b", "10.0.0.2").unwrap();
        let refetched = storage.get_agent_by_machine_id("mid-1").unwrap().unwrap();
        assert_eq!(refetched.id, agent.id);
        assert_eq!(refetched.token, "tok-b");
    }
}
