use serde::{Deserialize, Serialize};

/// Point-in-time counters of one scheduler instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    /// Tasks in the heap.
    pub pending: usize,
    /// Pending tasks waiting out a retry delay.
    pub delayed: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Lifetime counters; not reset by `drain`.
    pub total_enqueued: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_retries: u64,
    pub paused: bool,
}
