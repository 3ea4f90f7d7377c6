pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use error::SchedulerError;
pub use event::{BroadcastEmitter, EventSink, SchedulerEvent};
pub use traits::{AgentExecutor, ExecutionContext, ScheduleStore};
pub use types::{
    ExecutionOutcome, PersistedSchedule, Priority, RunRecord, ScheduleRequest, ScheduledTask,
    SchedulerStats,
};
