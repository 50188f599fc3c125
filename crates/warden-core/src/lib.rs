//! Coordination and admission-control primitives over a shared coordination store.
//!
//! - [`DistributedLock`]: owner-guarded mutual exclusion with optional reentrancy and auto-renew.
//! - [`RateLimiter`]: fixed window, sliding window, token bucket and leaky bucket admission.
//! - [`PriorityTaskScheduler`]: bounded, prioritized, retrying task queue with starvation aging.
//! - [`IdempotencyGuard`]: deduplicates and coalesces identical operations.
//!
//! All four are independent and take their [`CoordinationStore`] (and [`Clock`]) by injection.

pub mod clock;
pub use clock::{Clock, ManualClock, SystemClock};

pub mod error;
pub use error::{CoordinationError, CoordinationResult};

pub mod store;
pub use store::{CoordinationStore, MemoryStore, StoreError, StoreResult};

mod system;
pub use system::{hostname_or_unknown, process_owner_id};

pub mod lock;
pub use lock::{DistributedLock, Lock, LockOptions};

pub mod limiter;
pub use limiter::{RateLimitOptions, RateLimiter};

pub mod scheduler;
pub use scheduler::{
    EnqueueOptions, FailureCallback, HandlerFn, PriorityTaskScheduler, SchedulerConfig, TaskContext, TaskError,
    TaskHandler,
};

pub mod idempotency;
pub use idempotency::{IdempotencyGuard, IdempotencyOptions, IdempotencyOutcome};
