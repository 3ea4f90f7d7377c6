//! SQLite-backed reference implementation of the persistence gateway.
//!
//! Durable storage for agent schedules plus a run log: every execution
//! writes a row with its outcome. Deployments with a different relational
//! store implement `ScheduleStore` themselves; the dispatcher only ever
//! sees the trait.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tokio::sync::Mutex;
use tracing::info;

use pacer_core::{PersistedSchedule, Priority, RunRecord, ScheduleStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS agent_schedules (
    agent_id    TEXT PRIMARY KEY,
    job_id      TEXT,
    schedule    TEXT NOT NULL,
    priority    INTEGER,
    next_run    INTEGER,
    enabled     INTEGER NOT NULL DEFAULT 1,
    paused      INTEGER NOT NULL DEFAULT 0,
    last_status TEXT,
    updated_at  INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS run_log (
    id             TEXT PRIMARY KEY,
    agent_id       TEXT NOT NULL,
    fired_at       INTEGER NOT NULL,
    status         TEXT NOT NULL,
    output_summary TEXT,
    error          TEXT,
    duration_ms    INTEGER
);
CREATE INDEX IF NOT EXISTS run_log_agent_id ON run_log(agent_id);
"#;

pub struct SqliteScheduleStore {
    conn: Mutex<Connection>,
}

impl SqliteScheduleStore {
    /// Create or open a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).context("open schedule store")?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)
            .context("initialize schedule store schema")?;
        info!("schedule store opened at {:?}", path.as_ref());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Most recent run-log rows for an agent, newest first.
    pub async fn recent_runs(&self, agent_id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, fired_at, status, output_summary, error, duration_ms
             FROM run_log WHERE agent_id = ?1
             ORDER BY fired_at DESC LIMIT ?2",
        )?;
        let records = stmt
            .query_map(params![agent_id, limit as i64], |row| {
                Ok(RunRecord {
                    id: row.get(0)?,
                    agent_id: row.get(1)?,
                    fired_at: timestamp_to_utc(row.get(2)?),
                    status: row.get(3)?,
                    output_summary: row.get(4)?,
                    error: row.get(5)?,
                    duration_ms: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(records)
    }

    /// Prune run-log rows older than `max_age_secs`. Returns rows removed.
    pub async fn prune_runs(&self, max_age_secs: i64) -> Result<usize> {
        let cutoff = Utc::now().timestamp() - max_age_secs;
        let conn = self.conn.lock().await;
        let n = conn.execute("DELETE FROM run_log WHERE fired_at < ?1", params![cutoff])?;
        Ok(n)
    }
}

#[async_trait]
impl ScheduleStore for SqliteScheduleStore {
    async fn load_enabled(&self) -> Result<Vec<PersistedSchedule>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT agent_id, job_id, schedule, priority, paused, next_run
             FROM agent_schedules WHERE enabled = 1",
        )?;
        let schedules = stmt
            .query_map([], |row| {
                Ok(PersistedSchedule {
                    agent_id: row.get(0)?,
                    job_id: row.get(1)?,
                    cron_expression: row.get(2)?,
                    priority_hint: row.get::<_, Option<i64>>(3)?.and_then(priority_from_i64),
                    enabled: true,
                    is_paused: row.get::<_, i64>(4)? != 0,
                    next_run: row
                        .get::<_, Option<i64>>(5)?
                        .map(timestamp_to_utc),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(schedules)
    }

    async fn save_schedule(&self, schedule: &PersistedSchedule) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO agent_schedules
               (agent_id, job_id, schedule, priority, next_run, enabled, paused, updated_at)
               VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
               ON CONFLICT(agent_id) DO UPDATE SET
                 job_id=excluded.job_id,
                 schedule=excluded.schedule,
                 priority=excluded.priority,
                 next_run=excluded.next_run,
                 enabled=excluded.enabled,
                 paused=excluded.paused,
                 updated_at=excluded.updated_at"#,
            params![
                schedule.agent_id,
                schedule.job_id,
                schedule.cron_expression,
                schedule.priority_hint.map(|p| p as i64),
                schedule.next_run.map(|t| t.timestamp()),
                schedule.enabled as i64,
                schedule.is_paused as i64,
                Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    async fn set_paused(&self, agent_id: &str, paused: bool) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE agent_schedules SET paused = ?1, updated_at = ?2 WHERE agent_id = ?3",
            params![paused as i64, Utc::now().timestamp(), agent_id],
        )?;
        Ok(())
    }

    async fn clear_schedule(&self, agent_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM agent_schedules WHERE agent_id = ?1",
            params![agent_id],
        )?;
        Ok(())
    }

    async fn mark_terminal_failure(&self, agent_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE agent_schedules
             SET enabled = 0, last_status = 'terminal_failure', updated_at = ?1
             WHERE agent_id = ?2",
            params![Utc::now().timestamp(), agent_id],
        )?;
        Ok(())
    }

    async fn record_run(&self, record: &RunRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO run_log (id, agent_id, fired_at, status, output_summary, error, duration_ms)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                record.id,
                record.agent_id,
                record.fired_at.timestamp(),
                record.status,
                record.output_summary,
                record.error,
                record.duration_ms.map(|v| v as i64),
            ],
        )?;
        Ok(())
    }
}

fn timestamp_to_utc(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
}

fn priority_from_i64(v: i64) -> Option<Priority> {
    match v {
        1 => Some(Priority::Low),
        2 => Some(Priority::Normal),
        3 => Some(Priority::High),
        4 => Some(Priority::Critical),
        _ => None,
    }
}
