use serde::{Deserialize, Serialize};

use crate::{EpochMs, TaskId};

/// Kind of scheduler lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    // admission
    TaskEnqueued,
    EnqueueRejected,
    // lifecycle
    TaskStarting,
    TaskCompleted,
    TaskFailed,
    TimeoutHit,
    RetryScheduled,
    PriorityAged,
    // terminal
    TaskExhausted,
    TaskCancelled,
    ResultDiscarded,
    // control
    SchedulerPaused,
    SchedulerResumed,
    SchedulerStopped,
}

/// One scheduler lifecycle event, delivered to every [`Subscribe`] implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub kind: EventKind,
    /// Queue name of the emitting scheduler.
    pub queue: String,
    pub at: EpochMs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TaskEvent {
    pub fn new(kind: EventKind, queue: impl Into<String>, at: EpochMs) -> Self {
        Self {
            kind,
            queue: queue.into(),
            at,
            task: None,
            name: None,
            attempt: None,
            delay_ms: None,
            timeout_ms: None,
            priority: None,
            reason: None,
        }
    }

    pub fn with_task(mut self, id: &TaskId, name: &str) -> Self {
        self.task = Some(id.clone());
        self.name = Some(name.to_string());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Receiver of scheduler events.
///
/// Called synchronously on the scheduler's state-transition path, so implementations must not block.
pub trait Subscribe: Send + Sync {
    fn on_event(&self, event: &TaskEvent);

    /// Subscriber name used in logs.
    fn name(&self) -> &'static str {
        "subscriber"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_optional_fields() {
        let id = TaskId::from("t-1");
        let ev = TaskEvent::new(EventKind::RetryScheduled, "jobs", 10)
            .with_task(&id, "email")
            .with_attempt(2)
            .with_delay_ms(400)
            .with_reason("boom");

        assert_eq!(ev.task.as_ref(), Some(&id));
        assert_eq!(ev.name.as_deref(), Some("email"));
        assert_eq!(ev.attempt, Some(2));
        assert_eq!(ev.delay_ms, Some(400));
        assert!(ev.timeout_ms.is_none());

        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"kind\":\"retryScheduled\""));
        assert!(!json.contains("timeoutMs"));
    }
}
