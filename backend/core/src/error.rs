use thiserror::Error;

/// Top-level error type for the Pacer scheduling runtime.
///
/// Validation errors are returned synchronously to management callers and
/// never mutate registry state. `ExecutionFailure` and `RetryExhausted`
/// stay inside the dispatch path and are observable only through events.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid schedule expression: {0}")]
    InvalidScheduleExpression(String),

    #[error("no scheduled task for agent: {0}")]
    TaskNotFound(String),

    #[error("task is currently executing: {0}")]
    TaskRunning(String),

    #[error("task is not paused: {0}")]
    NotPaused(String),

    #[error("execution failed for agent {agent_id}: {message}")]
    ExecutionFailure { agent_id: String, message: String },

    #[error("retry budget exhausted for agent: {0}")]
    RetryExhausted(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
