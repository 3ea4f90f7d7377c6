use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::event::{EventSink, SchedulerEvent};
use crate::types::{ExecutionOutcome, PersistedSchedule, RunRecord};

/// Handle given to an executor for one run: the target agent plus a
/// progress reporter that forwards straight to the event sink.
pub struct ExecutionContext {
    pub agent_id: String,
    events: Arc<dyn EventSink>,
}

impl ExecutionContext {
    pub fn new(agent_id: impl Into<String>, events: Arc<dyn EventSink>) -> Self {
        Self {
            agent_id: agent_id.into(),
            events,
        }
    }

    /// Report mid-flight progress. Forwarded to observers as-is.
    pub fn report_progress(&self, percent: u8, message: impl Into<String>) {
        self.events.emit(SchedulerEvent::Progress {
            agent_id: self.agent_id.clone(),
            percent: percent.min(100),
            message: message.into(),
            timestamp: Utc::now(),
        });
    }
}

/// The opaque business-logic collaborator that actually runs an agent job.
///
/// Errors are captured by the dispatcher and routed into retry handling;
/// they never propagate to management callers.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionOutcome>;
}

/// Narrow persistence contract the dispatcher loads from at startup and
/// writes schedule mutations through.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// All enabled schedules, including paused ones.
    async fn load_enabled(&self) -> Result<Vec<PersistedSchedule>>;

    /// Upsert the schedule row for an agent.
    async fn save_schedule(&self, schedule: &PersistedSchedule) -> Result<()>;

    /// Persist the pause flag so it survives a restart.
    async fn set_paused(&self, agent_id: &str, paused: bool) -> Result<()>;

    /// Drop the schedule row for an agent.
    async fn clear_schedule(&self, agent_id: &str) -> Result<()>;

    /// Record that the agent's schedule ended in terminal failure.
    async fn mark_terminal_failure(&self, agent_id: &str) -> Result<()>;

    /// Append one run-log row for a completed execution.
    async fn record_run(&self, record: &RunRecord) -> Result<()>;
}
