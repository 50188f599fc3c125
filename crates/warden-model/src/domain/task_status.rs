use serde::{Deserialize, Serialize};

/// Lifecycle state of a scheduled task.
///
/// ```text
/// pending -> processing -> completed
///                       -> failed
///                       -> pending (retry)
/// pending -> cancelled
/// processing -> cancelled (result discarded once the handler settles)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    /// Waiting in the heap or waiting out a retry delay.
    Pending,
    /// Dequeued and owned by a worker or manual consumer.
    Processing,
    /// Acknowledged successfully.
    Completed,
    /// Exhausted its attempts.
    Failed,
    /// Explicitly cancelled.
    Cancelled,
}

impl TaskStatus {
    /// Returns `true` if the task is in a terminal state (won't transition further).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Returns `true` if the task is still active (pending or processing).
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Processing)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Pending)
                | (Processing, Cancelled)
        )
    }
}
