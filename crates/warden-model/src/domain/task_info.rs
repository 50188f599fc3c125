use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{EpochMs, MAX_PRIORITY, PriorityLevel, TaskId, TaskStatus};

/// A prioritized, retryable unit of work owned by one scheduler instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityTask {
    /// Unique task identifier.
    pub id: TaskId,
    /// Handler name the task is dispatched to.
    pub name: String,
    /// Opaque handler input.
    pub payload: Value,
    /// Priority requested at enqueue time (0-100).
    pub priority: u8,
    /// Priority after starvation aging; equals `priority` until the task has waited past the threshold.
    pub effective_priority: u8,
    /// Band of `priority`.
    pub level: PriorityLevel,
    pub created_at: EpochMs,
    /// When the task last entered the heap; aging measures the wait from here.
    pub queued_at: EpochMs,
    /// Earliest time a retried task may run again.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<EpochMs>,
    pub status: TaskStatus,
    /// Number of times the task has been dequeued.
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<EpochMs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<EpochMs>,
    /// Handler output of the successful attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error of the most recent failed attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// One entry per settled attempt, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<AttemptRecord>,
}

impl PriorityTask {
    pub fn new(
        name: impl Into<String>,
        payload: Value,
        priority: u8,
        max_attempts: u32,
        now: EpochMs,
    ) -> Self {
        let priority = priority.min(MAX_PRIORITY);
        Self {
            id: TaskId::generate(),
            name: name.into(),
            payload,
            priority,
            effective_priority: priority,
            level: PriorityLevel::from_priority(priority),
            created_at: now,
            queued_at: now,
            not_before: None,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            tags: Vec::new(),
            started_at: None,
            finished_at: None,
            result: None,
            last_error: None,
            history: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Whether another failure would still leave an attempt to retry with.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Number of failed attempts recorded so far.
    pub fn failures(&self) -> usize {
        self.history
            .iter()
            .filter(|a| matches!(a.outcome, AttemptOutcome::Failed))
            .count()
    }
}

/// How a single attempt settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

/// Record of one settled attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    pub started_at: EpochMs,
    pub finished_at: EpochMs,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Backoff applied before the next attempt, if one was scheduled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
}
