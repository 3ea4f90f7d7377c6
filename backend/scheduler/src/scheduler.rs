//! Scheduler engine: the periodic dispatch loop plus the management
//! surface (schedule/unschedule/pause/resume/stats).
//!
//! One tick loop drives all dispatch decisions; each dispatched job runs
//! in its own Tokio task that the loop never awaits. The registry lock is
//! released before the executor is invoked.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use pacer_core::{
    AgentExecutor, EventSink, ExecutionContext, ExecutionOutcome, PersistedSchedule, Priority,
    RunRecord, ScheduleRequest, ScheduleStore, ScheduledTask, SchedulerError, SchedulerEvent,
    SchedulerStats,
};

use crate::cron;
use crate::registry::TaskRegistry;
use crate::retry::{RetryDecision, RetryPolicy};

/// Scheduler configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the dispatch loop scans for due tasks.
    pub tick_interval: Duration,
    /// Ceiling on concurrently executing agent jobs.
    pub max_concurrent_agents: usize,
    pub retry: RetryPolicy,
    /// Replay schedules whose next run elapsed while the process was down.
    pub run_missed_on_startup: bool,
    /// Start the tick loop from `launch` without an explicit `start` call.
    pub auto_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            max_concurrent_agents: 4,
            retry: RetryPolicy::default(),
            run_missed_on_startup: true,
            auto_start: false,
        }
    }
}

/// The scheduler. Cheap to clone; clones share all runtime state.
///
/// Constructed once at process start with its collaborators passed in;
/// there is no global instance.
#[derive(Clone)]
pub struct Scheduler {
    config: SchedulerConfig,
    registry: Arc<TaskRegistry>,
    store: Arc<dyn ScheduleStore>,
    executor: Arc<dyn AgentExecutor>,
    events: Arc<dyn EventSink>,
    shutdown: Arc<Notify>,
    is_running: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn ScheduleStore>,
        executor: Arc<dyn AgentExecutor>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            registry: Arc::new(TaskRegistry::new()),
            store,
            executor,
            events,
            shutdown: Arc::new(Notify::new()),
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Construct and, when `auto_start` is configured, start immediately.
    pub async fn launch(
        config: SchedulerConfig,
        store: Arc<dyn ScheduleStore>,
        executor: Arc<dyn AgentExecutor>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, SchedulerError> {
        let scheduler = Self::new(config, store, executor, events);
        if scheduler.config.auto_start {
            scheduler.start().await?;
        }
        Ok(scheduler)
    }

    /// Load persisted schedules and spawn the tick loop.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!("scheduler already running");
            return Ok(());
        }
        self.load_schedules().await?;

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(scheduler.config.tick_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !scheduler.is_running.load(Ordering::SeqCst) {
                            break;
                        }
                        scheduler.tick(Utc::now()).await;
                    }
                    _ = scheduler.shutdown.notified() => {
                        info!("scheduler tick loop shutting down");
                        break;
                    }
                }
            }
        });

        info!(
            tick_secs = self.config.tick_interval.as_secs(),
            max_concurrent = self.config.max_concurrent_agents,
            "scheduler started"
        );
        Ok(())
    }

    /// Halt the tick loop. In-flight executions are not cancelled; they
    /// finish and update the registry, but nothing new dispatches.
    pub async fn stop(&self) {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        info!("scheduler stopped; in-flight executions left to finish");
    }

    pub fn is_active(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    // ── Management operations ─────────────────────────────────────────

    /// Register (or replace) an agent schedule. A malformed cron
    /// expression is rejected here and nothing is inserted anywhere.
    pub async fn schedule_agent(
        &self,
        req: ScheduleRequest,
    ) -> Result<ScheduledTask, SchedulerError> {
        let expr = cron::validate(&req.cron_expression)?;
        let now = Utc::now();
        let next_run = cron::next_run_after(&expr, now)?;
        let priority = req.priority.unwrap_or_else(|| {
            Priority::infer(req.job_id.as_deref().unwrap_or(&req.agent_id))
        });
        let task = ScheduledTask::new(req.agent_id, req.job_id, expr, priority, next_run);

        let mut row = PersistedSchedule::from(&task);
        row.enabled = req.enabled;
        self.store
            .save_schedule(&row)
            .await
            .map_err(|e| SchedulerError::StorageError(e.to_string()))?;
        if req.enabled {
            self.registry.upsert(task.clone()).await;
        } else {
            self.registry.remove(&task.agent_id).await;
        }

        info!(
            agent = %task.agent_id,
            schedule = %task.cron_expression,
            priority = %task.priority,
            next = %task.next_run,
            enabled = req.enabled,
            "agent scheduled"
        );
        Ok(task)
    }

    /// Remove an agent's schedule entirely.
    pub async fn unschedule_agent(&self, agent_id: &str) -> Result<ScheduledTask, SchedulerError> {
        let removed = self
            .registry
            .remove(agent_id)
            .await
            .ok_or_else(|| SchedulerError::TaskNotFound(agent_id.to_string()))?;
        self.store
            .clear_schedule(agent_id)
            .await
            .map_err(|e| SchedulerError::StorageError(e.to_string()))?;
        info!(agent = %agent_id, "agent unscheduled");
        Ok(removed)
    }

    /// Pause a job. Rejected with `TaskRunning` while an execution is in
    /// flight, leaving all state untouched.
    pub async fn pause_job(
        &self,
        agent_id: &str,
        job_id: Option<&str>,
    ) -> Result<ScheduledTask, SchedulerError> {
        let task = self.registry.pause(agent_id, job_id, Utc::now()).await?;
        self.store
            .set_paused(agent_id, true)
            .await
            .map_err(|e| SchedulerError::StorageError(e.to_string()))?;
        self.events.emit(SchedulerEvent::Paused {
            agent_id: task.agent_id.clone(),
            job_id: task.job_id.clone(),
            timestamp: Utc::now(),
        });
        info!(agent = %agent_id, job = %task.job_id, "job paused");
        Ok(task)
    }

    /// Resume a paused job. If its next run elapsed while paused it is
    /// recomputed, so a long pause does not fire immediately on resume.
    pub async fn resume_job(
        &self,
        agent_id: &str,
        job_id: Option<&str>,
    ) -> Result<ScheduledTask, SchedulerError> {
        let task = self.registry.resume(agent_id, job_id, Utc::now()).await?;
        self.store
            .save_schedule(&PersistedSchedule::from(&task))
            .await
            .map_err(|e| SchedulerError::StorageError(e.to_string()))?;
        self.events.emit(SchedulerEvent::Resumed {
            agent_id: task.agent_id.clone(),
            job_id: task.job_id.clone(),
            next_run: task.next_run,
            timestamp: Utc::now(),
        });
        info!(agent = %agent_id, job = %task.job_id, next = %task.next_run, "job resumed");
        Ok(task)
    }

    pub async fn list_paused_jobs(&self) -> Vec<(String, String)> {
        self.registry.paused_jobs().await
    }

    pub async fn get_task(&self, agent_id: &str) -> Option<ScheduledTask> {
        self.registry.get(agent_id).await
    }

    /// Snapshot of every scheduled task.
    pub async fn task_details(&self) -> Vec<ScheduledTask> {
        self.registry.snapshot().await
    }

    pub async fn stats(&self) -> SchedulerStats {
        self.build_stats(Utc::now()).await
    }

    // ── Dispatch internals ────────────────────────────────────────────

    async fn load_schedules(&self) -> Result<(), SchedulerError> {
        let persisted = self.store.load_enabled().await?;
        let now = Utc::now();
        let mut loaded = 0usize;
        for row in persisted {
            let expr = match cron::validate(&row.cron_expression) {
                Ok(expr) => expr,
                Err(e) => {
                    warn!(
                        agent = %row.agent_id,
                        error = %e,
                        "invalid persisted cron expression, skipping"
                    );
                    continue;
                }
            };
            let next_run = match row.next_run {
                // A stale next run is kept so the first tick replays it.
                Some(at) if at <= now && self.config.run_missed_on_startup => at,
                Some(at) if at > now => at,
                _ => cron::next_run_after(&expr, now)?,
            };
            let priority = row.priority_hint.unwrap_or_else(|| {
                Priority::infer(row.job_id.as_deref().unwrap_or(&row.agent_id))
            });
            let mut task = ScheduledTask::new(row.agent_id, row.job_id, expr, priority, next_run);
            task.is_paused = row.is_paused;
            self.registry.upsert(task).await;
            loaded += 1;
        }
        info!(count = loaded, "schedules loaded");
        Ok(())
    }

    /// One dispatch cycle: claim due tasks up to the free slots and launch
    /// them. Returns how many were dispatched.
    async fn tick(&self, now: DateTime<Utc>) -> usize {
        let running = self.registry.running_count().await;
        let slots = self.config.max_concurrent_agents.saturating_sub(running);
        let claimed = if slots == 0 {
            debug!(running, "at concurrency ceiling, skipping dispatch");
            Vec::new()
        } else {
            self.registry.claim_due(now, slots).await
        };

        let dispatched = claimed.len();
        for task in claimed {
            self.events.emit(SchedulerEvent::Started {
                agent_id: task.agent_id.clone(),
                job_id: task.job_id.clone(),
                priority: task.priority,
                timestamp: Utc::now(),
            });
            info!(agent = %task.agent_id, priority = %task.priority, "dispatching agent job");
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.execute_one(task).await;
            });
        }

        let stats = self.build_stats(now).await;
        self.events.emit(SchedulerEvent::Status(stats));
        dispatched
    }

    /// Run one claimed task to completion and route the outcome. Executor
    /// errors are captured here; they never reach a caller.
    async fn execute_one(&self, task: ScheduledTask) {
        let started = std::time::Instant::now();
        let fired_at = Utc::now();
        let ctx = ExecutionContext::new(task.agent_id.clone(), self.events.clone());
        let result = self.executor.execute(&ctx).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(outcome) => {
                self.handle_success(&task, outcome, fired_at, duration_ms)
                    .await
            }
            Err(e) => self.handle_failure(&task, e, fired_at, duration_ms).await,
        }
    }

    async fn handle_success(
        &self,
        task: &ScheduledTask,
        outcome: ExecutionOutcome,
        fired_at: DateTime<Utc>,
        duration_ms: u64,
    ) {
        let now = Utc::now();
        let next_run = match cron::next_run_after(&task.cron_expression, now) {
            Ok(at) => at,
            Err(e) => {
                // The expression was validated at registration; this is a
                // stale row edited out from under us.
                error!(agent = %task.agent_id, error = %e, "cannot recompute next run");
                self.registry.clear_running(&task.agent_id).await;
                return;
            }
        };
        match self.registry.finish_success(&task.agent_id, next_run).await {
            Some(updated) => {
                if let Err(e) = self
                    .store
                    .save_schedule(&PersistedSchedule::from(&updated))
                    .await
                {
                    warn!(agent = %task.agent_id, error = %e, "failed to persist schedule update");
                }
            }
            None => {
                debug!(agent = %task.agent_id, "task removed mid-flight, dropping outcome");
                return;
            }
        }
        if let Err(e) = self
            .store
            .record_run(&RunRecord::ok(
                task.agent_id.clone(),
                fired_at,
                outcome.summary,
                duration_ms,
            ))
            .await
        {
            warn!(agent = %task.agent_id, error = %e, "failed to record run");
        }
        self.events.emit(SchedulerEvent::Completed {
            agent_id: task.agent_id.clone(),
            duration_ms,
            timestamp: Utc::now(),
        });
        info!(agent = %task.agent_id, duration_ms, "agent job completed");
    }

    async fn handle_failure(
        &self,
        task: &ScheduledTask,
        err: anyhow::Error,
        fired_at: DateTime<Utc>,
        duration_ms: u64,
    ) {
        let message = err.to_string();
        warn!(agent = %task.agent_id, error = %message, "agent job failed");
        if let Err(e) = self
            .store
            .record_run(&RunRecord::error(
                task.agent_id.clone(),
                fired_at,
                message.clone(),
                duration_ms,
            ))
            .await
        {
            warn!(agent = %task.agent_id, error = %e, "failed to record run");
        }

        match self.config.retry.on_failure(task.retry_count) {
            RetryDecision::Retry { delay } => {
                let backoff_until =
                    Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                let Some(updated) = self
                    .registry
                    .record_failure(&task.agent_id, &message, backoff_until)
                    .await
                else {
                    debug!(agent = %task.agent_id, "task removed mid-flight, dropping failure");
                    return;
                };
                if let Err(e) = self
                    .store
                    .save_schedule(&PersistedSchedule::from(&updated))
                    .await
                {
                    warn!(agent = %task.agent_id, error = %e, "failed to persist backoff");
                }
                self.events.emit(SchedulerEvent::Failed {
                    agent_id: task.agent_id.clone(),
                    error: message,
                    retry_count: updated.retry_count,
                    terminal: false,
                    timestamp: Utc::now(),
                });
                info!(
                    agent = %task.agent_id,
                    retry_count = updated.retry_count,
                    backoff_until = %backoff_until,
                    "retry scheduled"
                );
            }
            RetryDecision::Terminal => {
                if self.registry.remove(&task.agent_id).await.is_none() {
                    debug!(agent = %task.agent_id, "task removed mid-flight, dropping failure");
                    return;
                }
                if let Err(e) = self.store.mark_terminal_failure(&task.agent_id).await {
                    warn!(agent = %task.agent_id, error = %e, "failed to persist terminal failure");
                }
                self.events.emit(SchedulerEvent::Failed {
                    agent_id: task.agent_id.clone(),
                    error: message,
                    retry_count: task.retry_count + 1,
                    terminal: true,
                    timestamp: Utc::now(),
                });
                error!(agent = %task.agent_id, "retry budget exhausted; task unscheduled");
            }
        }
    }

    async fn build_stats(&self, as_of: DateTime<Utc>) -> SchedulerStats {
        let (scheduled, running, queued, paused) = self.registry.counts(as_of).await;
        SchedulerStats {
            scheduled_count: scheduled,
            running_count: running,
            queued_count: queued,
            paused_count: paused,
            max_concurrent: self.config.max_concurrent_agents,
            is_running: self.is_running.load(Ordering::SeqCst),
            timestamp: Utc::now(),
        }
    }
}
