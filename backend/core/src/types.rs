use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Dispatch priority of a scheduled task. Higher values dispatch first.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Priority {
    /// Heuristic priority derived from a job identifier when no explicit
    /// priority is configured. Explicit configuration always wins.
    pub fn infer(job_id: &str) -> Self {
        let lower = job_id.to_ascii_lowercase();
        if lower.contains("critical") || lower.contains("incident") {
            Priority::Critical
        } else if lower.contains("watchdog") || lower.contains("monitor") || lower.contains("alert")
        {
            Priority::High
        } else if lower.contains("cleanup") || lower.contains("digest") || lower.contains("report")
        {
            Priority::Low
        } else {
            Priority::Normal
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// One scheduled agent job. Exactly one task exists per agent id; the task
/// is identified by its agent id, with `job_id` as a caller-facing label
/// for pause/resume requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub agent_id: String,
    pub job_id: String,
    /// 5-field cron expression, validated before the task enters the registry.
    pub cron_expression: String,
    pub priority: Priority,
    pub next_run: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// No retry is attempted before this instant. `None` when not in backoff.
    pub backoff_until: Option<DateTime<Utc>>,
    pub is_running: bool,
    pub is_paused: bool,
    pub paused_at: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u64,
}

impl ScheduledTask {
    pub fn new(
        agent_id: impl Into<String>,
        job_id: Option<String>,
        cron_expression: impl Into<String>,
        priority: Priority,
        next_run: DateTime<Utc>,
    ) -> Self {
        let agent_id = agent_id.into();
        let job_id = job_id.unwrap_or_else(|| agent_id.clone());
        Self {
            agent_id,
            job_id,
            cron_expression: cron_expression.into(),
            priority,
            next_run,
            retry_count: 0,
            last_error: None,
            backoff_until: None,
            is_running: false,
            is_paused: false,
            paused_at: None,
            last_run: None,
            run_count: 0,
        }
    }

    /// A task is due when its next run has passed and it is neither paused
    /// nor already executing.
    pub fn is_due(&self, as_of: DateTime<Utc>) -> bool {
        !self.is_paused && !self.is_running && self.next_run <= as_of
    }
}

/// Request to register (or replace) an agent schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub agent_id: String,
    /// Label for the schedule entry; defaults to the agent id.
    pub job_id: Option<String>,
    pub cron_expression: String,
    /// Explicit priority. When absent the job-id heuristic applies.
    pub priority: Option<Priority>,
    pub enabled: bool,
}

impl ScheduleRequest {
    pub fn new(agent_id: impl Into<String>, cron_expression: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            job_id: None,
            cron_expression: cron_expression.into(),
            priority: None,
            enabled: true,
        }
    }
}

/// A schedule row as persisted by the gateway, loaded at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSchedule {
    pub agent_id: String,
    pub job_id: Option<String>,
    pub cron_expression: String,
    pub priority_hint: Option<Priority>,
    pub enabled: bool,
    pub is_paused: bool,
    /// The next run recorded before the process last stopped. A past value
    /// marks a missed run that may be replayed on startup.
    pub next_run: Option<DateTime<Utc>>,
}

impl From<&ScheduledTask> for PersistedSchedule {
    fn from(task: &ScheduledTask) -> Self {
        Self {
            agent_id: task.agent_id.clone(),
            job_id: Some(task.job_id.clone()),
            cron_expression: task.cron_expression.clone(),
            priority_hint: Some(task.priority),
            enabled: true,
            is_paused: task.is_paused,
            next_run: Some(task.next_run),
        }
    }
}

/// One row of the durable run log, written after every execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub agent_id: String,
    pub fired_at: DateTime<Utc>,
    /// "ok" | "error"
    pub status: String,
    pub output_summary: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
}

impl RunRecord {
    pub fn ok(
        agent_id: impl Into<String>,
        fired_at: DateTime<Utc>,
        output_summary: Option<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            fired_at,
            status: "ok".to_string(),
            output_summary,
            error: None,
            duration_ms: Some(duration_ms),
        }
    }

    pub fn error(
        agent_id: impl Into<String>,
        fired_at: DateTime<Utc>,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            fired_at,
            status: "error".to_string(),
            output_summary: None,
            error: Some(error.into()),
            duration_ms: Some(duration_ms),
        }
    }
}

/// Result of a successful agent execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Short human-readable summary, recorded in the run log.
    pub summary: Option<String>,
}

/// Point-in-time snapshot of the scheduler, broadcast after every dispatch
/// cycle and returned by the stats management operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub scheduled_count: usize,
    pub running_count: usize,
    /// Tasks due but waiting for a free slot.
    pub queued_count: usize,
    pub paused_count: usize,
    pub max_concurrent: usize,
    pub is_running: bool,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn test_priority_heuristic() {
        assert_eq!(Priority::infer("incident-triage"), Priority::Critical);
        assert_eq!(Priority::infer("uptime-watchdog"), Priority::High);
        assert_eq!(Priority::infer("weekly-report"), Priority::Low);
        assert_eq!(Priority::infer("sync-inbox"), Priority::Normal);
    }

    #[test]
    fn test_job_id_defaults_to_agent_id() {
        let task = ScheduledTask::new("agent-1", None, "*/5 * * * *", Priority::Normal, Utc::now());
        assert_eq!(task.job_id, "agent-1");
        assert_eq!(task.retry_count, 0);
        assert!(!task.is_running);
        assert!(!task.is_paused);
    }

    #[test]
    fn test_due_excludes_paused_and_running() {
        let now = Utc::now();
        let past = now - chrono::Duration::minutes(1);
        let mut task = ScheduledTask::new("a", None, "* * * * *", Priority::Normal, past);
        assert!(task.is_due(now));
        task.is_paused = true;
        assert!(!task.is_due(now));
        task.is_paused = false;
        task.is_running = true;
        assert!(!task.is_due(now));
    }

    #[test]
    fn test_task_serialization_roundtrip() {
        let task = ScheduledTask::new(
            "agent-7",
            Some("nightly".into()),
            "0 3 * * *",
            Priority::High,
            Utc::now(),
        );
        let json = serde_json::to_string(&task).unwrap();
        let back: ScheduledTask = serde_json::from_str(&json).unwrap();
        assert_eq!(back.agent_id, "agent-7");
        assert_eq!(back.job_id, "nightly");
        assert_eq!(back.priority, Priority::High);
    }
}
