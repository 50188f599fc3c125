mod task_id;
pub use task_id::{RequestId, TaskId};

mod task_status;
pub use task_status::TaskStatus;

mod priority;
pub use priority::{MAX_PRIORITY, PriorityLevel};

mod task_info;
pub use task_info::{AttemptOutcome, AttemptRecord, PriorityTask};

mod task_query;
pub use task_query::{TaskPage, TaskQuery};

mod stats;
pub use stats::SchedulerStats;

mod event;
pub use event::{EventKind, Subscribe, TaskEvent};

mod lock_info;
pub use lock_info::LockInfo;

mod decision;
pub use decision::RateLimitDecision;

mod record;
pub use record::{IdempotencyRecord, RecordStatus};

mod error;
pub use error::ModelError;

/// Milliseconds since the Unix epoch.
///
/// Every timestamp in the model uses this unit so that records written by one process can be compared by another.
pub type EpochMs = u64;

/// Duration in milliseconds.
pub type TimeoutMs = u64;
