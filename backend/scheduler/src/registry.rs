//! In-memory task registry: the authoritative runtime view of what is
//! scheduled, keyed by agent id.
//!
//! All mutation funnels through these methods so the tick loop, management
//! calls, and completion callbacks never write fields directly. The lock is
//! held only for the duration of a read or mutation, never across an
//! executor or emitter call.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use pacer_core::{ScheduledTask, SchedulerError};

use crate::cron;

pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, ScheduledTask>>,
}

/// Dispatch order: descending priority, ties broken by earliest next run,
/// then by agent id for determinism.
fn dispatch_order(a: &ScheduledTask, b: &ScheduledTask) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.next_run.cmp(&b.next_run))
        .then_with(|| a.agent_id.cmp(&b.agent_id))
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Insert or replace the task for its agent id.
    pub async fn upsert(&self, task: ScheduledTask) {
        self.tasks.lock().await.insert(task.agent_id.clone(), task);
    }

    /// Remove the task for an agent, returning it if present.
    pub async fn remove(&self, agent_id: &str) -> Option<ScheduledTask> {
        self.tasks.lock().await.remove(agent_id)
    }

    pub async fn get(&self, agent_id: &str) -> Option<ScheduledTask> {
        self.tasks.lock().await.get(agent_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }

    /// Snapshot of every task, ordered by agent id.
    pub async fn snapshot(&self) -> Vec<ScheduledTask> {
        let mut all: Vec<ScheduledTask> = self.tasks.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        all
    }

    pub async fn running_count(&self) -> usize {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|t| t.is_running)
            .count()
    }

    /// (scheduled, running, queued, paused) counts for a stats snapshot.
    pub async fn counts(&self, as_of: DateTime<Utc>) -> (usize, usize, usize, usize) {
        let tasks = self.tasks.lock().await;
        let scheduled = tasks.len();
        let running = tasks.values().filter(|t| t.is_running).count();
        let queued = tasks.values().filter(|t| t.is_due(as_of)).count();
        let paused = tasks.values().filter(|t| t.is_paused).count();
        (scheduled, running, queued, paused)
    }

    /// All due tasks in dispatch order.
    pub async fn due(&self, as_of: DateTime<Utc>) -> Vec<ScheduledTask> {
        let tasks = self.tasks.lock().await;
        let mut due: Vec<ScheduledTask> = tasks
            .values()
            .filter(|t| t.is_due(as_of))
            .cloned()
            .collect();
        due.sort_by(dispatch_order);
        due
    }

    /// Atomically claim up to `max` due tasks in dispatch order, marking
    /// each as running so the next tick cannot dispatch it again.
    pub async fn claim_due(&self, as_of: DateTime<Utc>, max: usize) -> Vec<ScheduledTask> {
        if max == 0 {
            return Vec::new();
        }
        let mut tasks = self.tasks.lock().await;
        let mut due: Vec<String> = {
            let mut eligible: Vec<&ScheduledTask> =
                tasks.values().filter(|t| t.is_due(as_of)).collect();
            eligible.sort_by(|a, b| dispatch_order(a, b));
            eligible
                .into_iter()
                .take(max)
                .map(|t| t.agent_id.clone())
                .collect()
        };
        let mut claimed = Vec::with_capacity(due.len());
        for agent_id in due.drain(..) {
            if let Some(task) = tasks.get_mut(&agent_id) {
                task.is_running = true;
                task.last_run = Some(as_of);
                task.run_count += 1;
                claimed.push(task.clone());
            }
        }
        claimed
    }

    /// Record a successful execution: counters reset, next run recomputed
    /// by the caller from the cron expression.
    pub async fn finish_success(
        &self,
        agent_id: &str,
        next_run: DateTime<Utc>,
    ) -> Option<ScheduledTask> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks.get_mut(agent_id)?;
        task.retry_count = 0;
        task.last_error = None;
        task.backoff_until = None;
        task.next_run = next_run;
        task.is_running = false;
        Some(task.clone())
    }

    /// Record a failed execution that will be retried: the retry count
    /// increments and the task becomes eligible again once the backoff
    /// window has passed.
    pub async fn record_failure(
        &self,
        agent_id: &str,
        error: &str,
        backoff_until: DateTime<Utc>,
    ) -> Option<ScheduledTask> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks.get_mut(agent_id)?;
        task.retry_count += 1;
        task.last_error = Some(error.to_string());
        task.backoff_until = Some(backoff_until);
        task.next_run = backoff_until;
        task.is_running = false;
        Some(task.clone())
    }

    /// Clear the running flag without touching anything else. Used when a
    /// task was removed mid-flight and the outcome no longer applies.
    pub async fn clear_running(&self, agent_id: &str) {
        if let Some(task) = self.tasks.lock().await.get_mut(agent_id) {
            task.is_running = false;
        }
    }

    /// Pause a task. Rejected while an execution is in flight; the caller
    /// gets the rejection immediately and the registry is left unchanged.
    pub async fn pause(
        &self,
        agent_id: &str,
        job_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ScheduledTask, SchedulerError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(agent_id)
            .ok_or_else(|| SchedulerError::TaskNotFound(agent_id.to_string()))?;
        if let Some(job_id) = job_id {
            if task.job_id != job_id {
                return Err(SchedulerError::TaskNotFound(format!(
                    "{}/{}",
                    agent_id, job_id
                )));
            }
        }
        if task.is_running {
            return Err(SchedulerError::TaskRunning(agent_id.to_string()));
        }
        task.is_paused = true;
        task.paused_at = Some(now);
        Ok(task.clone())
    }

    /// Resume a paused task. If its next run elapsed while paused, a fresh
    /// one is computed from the cron expression so a long pause does not
    /// trigger an immediate storm.
    pub async fn resume(
        &self,
        agent_id: &str,
        job_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ScheduledTask, SchedulerError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(agent_id)
            .ok_or_else(|| SchedulerError::TaskNotFound(agent_id.to_string()))?;
        if let Some(job_id) = job_id {
            if task.job_id != job_id {
                return Err(SchedulerError::TaskNotFound(format!(
                    "{}/{}",
                    agent_id, job_id
                )));
            }
        }
        if !task.is_paused {
            return Err(SchedulerError::NotPaused(agent_id.to_string()));
        }
        task.is_paused = false;
        task.paused_at = None;
        if task.next_run <= now {
            task.next_run = cron::next_run_after(&task.cron_expression, now)?;
        }
        Ok(task.clone())
    }

    /// Snapshot of paused (agent_id, job_id) pairs.
    pub async fn paused_jobs(&self) -> Vec<(String, String)> {
        let tasks = self.tasks.lock().await;
        let mut paused: Vec<(String, String)> = tasks
            .values()
            .filter(|t| t.is_paused)
            .map(|t| (t.agent_id.clone(), t.job_id.clone()))
            .collect();
        paused.sort();
        paused
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pacer_core::Priority;

    fn task(agent_id: &str, priority: Priority, next_run: DateTime<Utc>) -> ScheduledTask {
        ScheduledTask::new(agent_id, None, "*/5 * * * *", priority, next_run)
    }

    #[tokio::test]
    async fn test_upsert_get_remove() {
        let registry = TaskRegistry::new();
        let now = Utc::now();
        registry.upsert(task("a", Priority::Normal, now)).await;
        assert_eq!(registry.len().await, 1);
        assert!(registry.get("a").await.is_some());
        assert!(registry.remove("a").await.is_some());
        assert!(registry.remove("a").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_due_ordering() {
        let registry = TaskRegistry::new();
        let now = Utc::now();
        let earlier = now - Duration::minutes(10);
        let later = now - Duration::minutes(5);

        registry.upsert(task("b-normal", Priority::Normal, later)).await;
        registry.upsert(task("a-critical", Priority::Critical, later)).await;
        registry.upsert(task("c-high-early", Priority::High, earlier)).await;
        registry.upsert(task("d-high-late", Priority::High, later)).await;
        // Not due: in the future.
        registry
            .upsert(task("e-future", Priority::Critical, now + Duration::minutes(5)))
            .await;

        let due = registry.due(now).await;
        let ids: Vec<&str> = due.iter().map(|t| t.agent_id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["a-critical", "c-high-early", "d-high-late", "b-normal"]
        );
    }

    #[tokio::test]
    async fn test_due_tie_broken_by_agent_id() {
        let registry = TaskRegistry::new();
        let now = Utc::now();
        let at = now - Duration::minutes(1);
        registry.upsert(task("beta", Priority::Normal, at)).await;
        registry.upsert(task("alpha", Priority::Normal, at)).await;
        let due = registry.due(now).await;
        assert_eq!(due[0].agent_id, "alpha");
        assert_eq!(due[1].agent_id, "beta");
    }

    #[tokio::test]
    async fn test_claim_due_marks_running_and_caps() {
        let registry = TaskRegistry::new();
        let now = Utc::now();
        let past = now - Duration::minutes(1);
        registry.upsert(task("a", Priority::Critical, past)).await;
        registry.upsert(task("b", Priority::Normal, past)).await;
        registry.upsert(task("c", Priority::Low, past)).await;

        let claimed = registry.claim_due(now, 2).await;
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].agent_id, "a");
        assert!(claimed.iter().all(|t| t.is_running));
        assert_eq!(registry.running_count().await, 2);

        // Claimed tasks are no longer due; the remaining one is.
        let second = registry.claim_due(now, 10).await;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].agent_id, "c");
        assert_eq!(second[0].run_count, 1);
    }

    #[tokio::test]
    async fn test_finish_success_resets_failure_state() {
        let registry = TaskRegistry::new();
        let now = Utc::now();
        let mut t = task("a", Priority::Normal, now - Duration::minutes(1));
        t.retry_count = 2;
        t.last_error = Some("boom".into());
        t.backoff_until = Some(now);
        t.is_running = true;
        registry.upsert(t).await;

        let next = now + Duration::minutes(5);
        let updated = registry.finish_success("a", next).await.unwrap();
        assert_eq!(updated.retry_count, 0);
        assert!(updated.last_error.is_none());
        assert!(updated.backoff_until.is_none());
        assert!(!updated.is_running);
        assert_eq!(updated.next_run, next);
    }

    #[tokio::test]
    async fn test_record_failure_backs_off() {
        let registry = TaskRegistry::new();
        let now = Utc::now();
        let mut t = task("a", Priority::Normal, now - Duration::minutes(1));
        t.is_running = true;
        registry.upsert(t).await;

        let backoff = now + Duration::seconds(2);
        let updated = registry.record_failure("a", "boom", backoff).await.unwrap();
        assert_eq!(updated.retry_count, 1);
        assert_eq!(updated.last_error.as_deref(), Some("boom"));
        assert_eq!(updated.backoff_until, Some(backoff));
        assert_eq!(updated.next_run, backoff);
        assert!(!updated.is_running);
        // Not due until the backoff window passes.
        assert!(registry.due(now).await.is_empty());
        assert_eq!(registry.due(backoff).await.len(), 1);
    }

    #[tokio::test]
    async fn test_pause_rejects_running_task() {
        let registry = TaskRegistry::new();
        let now = Utc::now();
        let mut t = task("a", Priority::Normal, now);
        t.is_running = true;
        registry.upsert(t).await;

        let err = registry.pause("a", None, now).await.unwrap_err();
        assert!(matches!(err, SchedulerError::TaskRunning(_)));
        // State unchanged.
        let task = registry.get("a").await.unwrap();
        assert!(!task.is_paused);
        assert!(task.is_running);
    }

    #[tokio::test]
    async fn test_pause_unknown_agent_or_job() {
        let registry = TaskRegistry::new();
        let now = Utc::now();
        registry.upsert(task("a", Priority::Normal, now)).await;

        assert!(matches!(
            registry.pause("missing", None, now).await.unwrap_err(),
            SchedulerError::TaskNotFound(_)
        ));
        assert!(matches!(
            registry.pause("a", Some("other-job"), now).await.unwrap_err(),
            SchedulerError::TaskNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_paused_excluded_from_due() {
        let registry = TaskRegistry::new();
        let now = Utc::now();
        registry
            .upsert(task("a", Priority::Normal, now - Duration::minutes(1)))
            .await;
        registry.pause("a", None, now).await.unwrap();
        assert!(registry.due(now).await.is_empty());
        assert_eq!(registry.paused_jobs().await, vec![("a".into(), "a".into())]);
    }

    #[tokio::test]
    async fn test_resume_recomputes_elapsed_next_run() {
        let registry = TaskRegistry::new();
        let now = Utc::now();
        registry
            .upsert(task("a", Priority::Normal, now - Duration::hours(2)))
            .await;
        registry.pause("a", None, now).await.unwrap();

        let resumed = registry.resume("a", None, now).await.unwrap();
        assert!(!resumed.is_paused);
        assert!(resumed.next_run > now);
    }

    #[tokio::test]
    async fn test_resume_keeps_future_next_run() {
        let registry = TaskRegistry::new();
        let now = Utc::now();
        let future = now + Duration::minutes(30);
        registry.upsert(task("a", Priority::Normal, future)).await;
        registry.pause("a", None, now).await.unwrap();

        let resumed = registry.resume("a", None, now).await.unwrap();
        assert_eq!(resumed.next_run, future);
    }

    #[tokio::test]
    async fn test_resume_requires_paused() {
        let registry = TaskRegistry::new();
        let now = Utc::now();
        registry.upsert(task("a", Priority::Normal, now)).await;
        assert!(matches!(
            registry.resume("a", None, now).await.unwrap_err(),
            SchedulerError::NotPaused(_)
        ));
    }
}
