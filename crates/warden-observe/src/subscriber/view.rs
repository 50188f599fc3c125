use std::borrow::Borrow;

use tracing::{debug, error, info, trace, warn};
use warden_model::{EventKind, TaskEvent};

/// Field accessors with placeholders for absent values.
pub trait View {
    fn kind(&self) -> EventKind;
    fn queue(&self) -> &str;
    fn task_id(&self) -> &str;
    fn task_name(&self) -> &str;
    fn reason(&self) -> &str;
    fn attempt(&self) -> u32;
    fn delay_ms(&self) -> u64;
    fn timeout_ms(&self) -> u64;
    fn priority(&self) -> u8;
}

impl<T> View for T
where
    T: Borrow<TaskEvent>,
{
    #[inline]
    fn kind(&self) -> EventKind {
        self.borrow().kind
    }
    #[inline]
    fn queue(&self) -> &str {
        &self.borrow().queue
    }
    #[inline]
    fn task_id(&self) -> &str {
        self.borrow().task.as_ref().map_or("unknown", |id| id.as_str())
    }
    #[inline]
    fn task_name(&self) -> &str {
        self.borrow().name.as_deref().unwrap_or("unknown")
    }
    #[inline]
    fn reason(&self) -> &str {
        self.borrow().reason.as_deref().unwrap_or("unknown")
    }
    #[inline]
    fn attempt(&self) -> u32 {
        self.borrow().attempt.unwrap_or(0)
    }
    #[inline]
    fn delay_ms(&self) -> u64 {
        self.borrow().delay_ms.unwrap_or(0)
    }
    #[inline]
    fn timeout_ms(&self) -> u64 {
        self.borrow().timeout_ms.unwrap_or(0)
    }
    #[inline]
    fn priority(&self) -> u8 {
        self.borrow().priority.unwrap_or(0)
    }
}

#[inline]
pub fn message_for(kind: EventKind) -> &'static str {
    match kind {
        // admission
        EventKind::TaskEnqueued => "task enqueued",
        EventKind::EnqueueRejected => "enqueue rejected",

        // lifecycle
        EventKind::TaskStarting => "task is starting",
        EventKind::TaskCompleted => "task completed",
        EventKind::TaskFailed => "task attempt failed",
        EventKind::TimeoutHit => "task exceeded its timeout",
        EventKind::RetryScheduled => "retry scheduled",
        EventKind::PriorityAged => "waiting task priority raised",

        // terminal
        EventKind::TaskExhausted => "task exhausted its attempts",
        EventKind::TaskCancelled => "task cancelled",
        EventKind::ResultDiscarded => "result of cancelled task discarded",

        // control
        EventKind::SchedulerPaused => "scheduler paused",
        EventKind::SchedulerResumed => "scheduler resumed",
        EventKind::SchedulerStopped => "scheduler stopped",
    }
}

#[inline]
pub fn log_event<E: View>(e: E) {
    let msg = message_for(e.kind());
    let queue = e.queue();

    match e.kind() {
        // admission
        EventKind::TaskEnqueued => trace!(
            queue,
            task = e.task_id(),
            name = e.task_name(),
            priority = e.priority(),
            "{msg}"
        ),
        EventKind::EnqueueRejected => {
            warn!(queue, name = e.task_name(), reason = e.reason(), "{msg}")
        }

        // lifecycle
        EventKind::TaskStarting => debug!(
            queue,
            task = e.task_id(),
            name = e.task_name(),
            attempt = e.attempt(),
            "{msg}"
        ),
        EventKind::TaskCompleted => debug!(queue, task = e.task_id(), attempt = e.attempt(), "{msg}"),
        EventKind::TaskFailed => warn!(
            queue,
            task = e.task_id(),
            name = e.task_name(),
            attempt = e.attempt(),
            reason = e.reason(),
            "{msg}"
        ),
        EventKind::TimeoutHit => warn!(
            queue,
            task = e.task_id(),
            timeout_ms = e.timeout_ms(),
            "{msg}"
        ),
        EventKind::RetryScheduled => debug!(
            queue,
            task = e.task_id(),
            attempt = e.attempt(),
            delay_ms = e.delay_ms(),
            "{msg}"
        ),
        EventKind::PriorityAged => trace!(
            queue,
            task = e.task_id(),
            priority = e.priority(),
            reason = e.reason(),
            "{msg}"
        ),

        // terminal
        EventKind::TaskExhausted => error!(
            queue,
            task = e.task_id(),
            name = e.task_name(),
            attempt = e.attempt(),
            reason = e.reason(),
            "{msg}"
        ),
        EventKind::TaskCancelled => info!(queue, task = e.task_id(), "{msg}"),
        EventKind::ResultDiscarded => debug!(queue, task = e.task_id(), "{msg}"),

        // control
        EventKind::SchedulerPaused | EventKind::SchedulerResumed | EventKind::SchedulerStopped => {
            info!(queue, "{msg}")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    use warden_model::TaskId;

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture(f: impl FnOnce()) -> String {
        let out = Captured::default();
        let writer = out.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = out.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn exhausted_task_logs_error_with_reason() {
        let ev = TaskEvent::new(EventKind::TaskExhausted, "billing", 0)
            .with_task(&TaskId::from("t-9"), "charge")
            .with_attempt(3)
            .with_reason("card declined");

        let line = capture(|| log_event(&ev));
        assert!(line.contains("ERROR"));
        assert!(line.contains("task exhausted its attempts"));
        assert!(line.contains("task=\"t-9\""));
        assert!(line.contains("attempt=3"));
        assert!(line.contains("reason=\"card declined\""));
    }

    #[test]
    fn missing_fields_use_placeholders() {
        let ev = TaskEvent::new(EventKind::TaskCancelled, "q", 0);
        assert_eq!(ev.task_id(), "unknown");
        assert_eq!(ev.attempt(), 0);

        let line = capture(|| log_event(ev));
        assert!(line.contains("INFO"));
        assert!(line.contains("task=\"unknown\""));
    }

    #[test]
    fn subscriber_logs_control_events() {
        use warden_model::Subscribe;

        let sub = crate::LogSubscriber::new();
        let line = capture(|| sub.on_event(&TaskEvent::new(EventKind::SchedulerPaused, "jobs", 0)));
        assert!(line.contains("scheduler paused"));
        assert!(line.contains("queue=\"jobs\""));
        assert_eq!(sub.name(), "log");
    }
}
