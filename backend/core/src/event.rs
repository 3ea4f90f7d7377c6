use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{Priority, SchedulerStats};

/// Default buffer size for the broadcast event channel.
const DEFAULT_CAPACITY: usize = 256;

/// Lifecycle notifications produced by the dispatcher for observers.
///
/// The transport that carries these to clients is out of scope; anything
/// implementing [`EventSink`] can receive them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    Started {
        agent_id: String,
        job_id: String,
        priority: Priority,
        timestamp: DateTime<Utc>,
    },
    Progress {
        agent_id: String,
        percent: u8,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Completed {
        agent_id: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    Failed {
        agent_id: String,
        error: String,
        retry_count: u32,
        /// True when the retry budget is exhausted and the task was removed.
        terminal: bool,
        timestamp: DateTime<Utc>,
    },
    Paused {
        agent_id: String,
        job_id: String,
        timestamp: DateTime<Utc>,
    },
    Resumed {
        agent_id: String,
        job_id: String,
        next_run: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    Status(SchedulerStats),
}

impl SchedulerEvent {
    /// Event kind as a stable snake_case name, for logging and filtering.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerEvent::Started { .. } => "started",
            SchedulerEvent::Progress { .. } => "progress",
            SchedulerEvent::Completed { .. } => "completed",
            SchedulerEvent::Failed { .. } => "failed",
            SchedulerEvent::Paused { .. } => "paused",
            SchedulerEvent::Resumed { .. } => "resumed",
            SchedulerEvent::Status(_) => "status",
        }
    }

    /// The agent this event concerns, if any (`status` is scheduler-wide).
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            SchedulerEvent::Started { agent_id, .. }
            | SchedulerEvent::Progress { agent_id, .. }
            | SchedulerEvent::Completed { agent_id, .. }
            | SchedulerEvent::Failed { agent_id, .. }
            | SchedulerEvent::Paused { agent_id, .. }
            | SchedulerEvent::Resumed { agent_id, .. } => Some(agent_id),
            SchedulerEvent::Status(_) => None,
        }
    }
}

/// Capability the dispatcher emits lifecycle events through.
///
/// Implementations must not block: emission happens on the dispatch path,
/// outside the registry lock but before slow work is awaited.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SchedulerEvent);
}

/// Fan-out sink backed by a tokio broadcast channel. Observers subscribe
/// and receive every event; lagging observers drop the oldest entries.
pub struct BroadcastEmitter {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl BroadcastEmitter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for BroadcastEmitter {
    fn emit(&self, event: SchedulerEvent) {
        // send only fails when no observer is subscribed; that is fine.
        if self.tx.send(event).is_err() {
            debug!("event emitted with no subscribers");
        }
    }
}
