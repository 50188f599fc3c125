use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use warden_model::{
    AttemptOutcome, AttemptRecord, EpochMs, EventKind, PriorityTask, SchedulerStats, TaskEvent,
    TaskId, TaskPage, TaskQuery, TaskStatus,
};

use super::queue::TaskQueue;
use crate::error::{CoordinationError, CoordinationResult};

/// A dequeued task and the token its handler watches.
struct Running {
    task: PriorityTask,
    cancel: CancellationToken,
    /// `cancel` was called; the outcome is discarded when the attempt settles.
    cancel_requested: bool,
}

/// Where a processing task ended up after `ack`/`nack`.
#[derive(Debug, Clone)]
pub(super) enum Settled {
    Completed(PriorityTask),
    Retrying(PriorityTask),
    Exhausted(PriorityTask),
    Discarded(PriorityTask),
}

impl Settled {
    pub fn into_task(self) -> PriorityTask {
        match self {
            Settled::Completed(t)
            | Settled::Retrying(t)
            | Settled::Exhausted(t)
            | Settled::Discarded(t) => t,
        }
    }
}

#[derive(Default)]
struct Totals {
    enqueued: u64,
    completed: u64,
    failed: u64,
    retries: u64,
}

/// Every task of one scheduler, in exactly one of: queue, delayed-retry set, processing map, or a
/// terminal history list.
///
/// Mutators append the lifecycle events they cause to `out`; the caller publishes them after releasing
/// its lock.
pub(super) struct SchedulerState {
    queue_name: String,
    max_history: usize,
    queue: TaskQueue,
    delayed: HashMap<TaskId, PriorityTask>,
    processing: HashMap<TaskId, Running>,
    completed: VecDeque<PriorityTask>,
    failed: VecDeque<PriorityTask>,
    cancelled: VecDeque<PriorityTask>,
    totals: Totals,
}

impl SchedulerState {
    pub fn new(queue_name: impl Into<String>, max_history: usize) -> Self {
        Self {
            queue_name: queue_name.into(),
            max_history,
            queue: TaskQueue::default(),
            delayed: HashMap::new(),
            processing: HashMap::new(),
            completed: VecDeque::new(),
            failed: VecDeque::new(),
            cancelled: VecDeque::new(),
            totals: Totals::default(),
        }
    }

    fn event(&self, kind: EventKind, task: &PriorityTask, now: EpochMs) -> TaskEvent {
        TaskEvent::new(kind, &self.queue_name, now).with_task(&task.id, &task.name)
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len() + self.delayed.len()
    }

    pub fn enqueue(
        &mut self,
        task: PriorityTask,
        capacity: usize,
        now: EpochMs,
        out: &mut Vec<TaskEvent>,
    ) -> CoordinationResult<PriorityTask> {
        if self.pending_len() >= capacity {
            out.push(
                self.event(EventKind::EnqueueRejected, &task, now)
                    .with_priority(task.priority)
                    .with_reason(format!("queue at capacity ({capacity})")),
            );
            return Err(CoordinationError::CapacityExceeded {
                resource: format!("scheduler queue '{}'", self.queue_name),
                limit: capacity,
            });
        }

        out.push(self.event(EventKind::TaskEnqueued, &task, now).with_priority(task.priority));
        self.totals.enqueued += 1;
        self.queue.push(task.clone());
        Ok(task)
    }

    /// Move retries whose backoff has elapsed back into the queue.
    fn promote_due(&mut self, now: EpochMs) {
        let due: Vec<TaskId> = self
            .delayed
            .iter()
            .filter(|(_, t)| t.not_before.is_none_or(|at| at <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in due {
            if let Some(mut task) = self.delayed.remove(&id) {
                task.not_before = None;
                task.queued_at = now;
                self.queue.push(task);
            }
        }
    }

    /// Earliest time a delayed retry becomes due.
    pub fn next_due(&self) -> Option<EpochMs> {
        self.delayed.values().filter_map(|t| t.not_before).min()
    }

    /// Promote, age, pop and mark the winner processing.
    pub fn dequeue(
        &mut self,
        now: EpochMs,
        starvation_threshold: Duration,
        aging_factor: u32,
        out: &mut Vec<TaskEvent>,
    ) -> Option<(PriorityTask, CancellationToken)> {
        self.promote_due(now);

        let threshold_ms = starvation_threshold.as_millis() as u64;
        for aged in self.queue.age(now, threshold_ms, aging_factor) {
            out.push(
                TaskEvent::new(EventKind::PriorityAged, &self.queue_name, now)
                    .with_task(&aged.id, &aged.name)
                    .with_priority(aged.to)
                    .with_reason(format!("raised from {}", aged.from)),
            );
        }

        let mut task = self.queue.pop()?;
        task.status = TaskStatus::Processing;
        task.attempts += 1;
        task.started_at = Some(now);
        task.finished_at = None;

        let cancel = CancellationToken::new();
        out.push(
            self.event(EventKind::TaskStarting, &task, now)
                .with_attempt(task.attempts)
                .with_priority(task.effective_priority),
        );
        self.processing.insert(
            task.id.clone(),
            Running {
                task: task.clone(),
                cancel: cancel.clone(),
                cancel_requested: false,
            },
        );
        Some((task, cancel))
    }

    fn take_running(&mut self, id: &TaskId) -> CoordinationResult<Running> {
        self.processing
            .remove(id)
            .ok_or_else(|| CoordinationError::not_found("processing task", id.as_str()))
    }

    fn record(task: &mut PriorityTask, outcome: AttemptOutcome, error: Option<String>, now: EpochMs) {
        task.history.push(AttemptRecord {
            attempt: task.attempts,
            started_at: task.started_at.unwrap_or(now),
            finished_at: now,
            outcome,
            error,
            retry_delay_ms: None,
        });
    }

    fn discard(&mut self, mut task: PriorityTask, now: EpochMs, out: &mut Vec<TaskEvent>) -> Settled {
        Self::record(&mut task, AttemptOutcome::Cancelled, None, now);
        task.status = TaskStatus::Cancelled;
        task.finished_at = Some(now);
        out.push(
            self.event(EventKind::ResultDiscarded, &task, now)
                .with_attempt(task.attempts),
        );
        push_bounded(&mut self.cancelled, task.clone(), self.max_history);
        Settled::Discarded(task)
    }

    pub fn ack(
        &mut self,
        id: &TaskId,
        result: Value,
        now: EpochMs,
        out: &mut Vec<TaskEvent>,
    ) -> CoordinationResult<Settled> {
        let Running {
            mut task,
            cancel_requested,
            ..
        } = self.take_running(id)?;
        if cancel_requested {
            return Ok(self.discard(task, now, out));
        }

        Self::record(&mut task, AttemptOutcome::Succeeded, None, now);
        task.status = TaskStatus::Completed;
        task.finished_at = Some(now);
        task.result = Some(result);
        self.totals.completed += 1;

        out.push(
            self.event(EventKind::TaskCompleted, &task, now)
                .with_attempt(task.attempts),
        );
        push_bounded(&mut self.completed, task.clone(), self.max_history);
        Ok(Settled::Completed(task))
    }

    /// Record a failed attempt: back off and retry while attempts remain, otherwise fail terminally.
    pub fn nack(
        &mut self,
        id: &TaskId,
        error: String,
        backoff: Duration,
        now: EpochMs,
        out: &mut Vec<TaskEvent>,
    ) -> CoordinationResult<Settled> {
        let Running {
            mut task,
            cancel_requested,
            ..
        } = self.take_running(id)?;
        if cancel_requested {
            return Ok(self.discard(task, now, out));
        }

        Self::record(&mut task, AttemptOutcome::Failed, Some(error.clone()), now);
        task.last_error = Some(error.clone());
        out.push(
            self.event(EventKind::TaskFailed, &task, now)
                .with_attempt(task.attempts)
                .with_reason(error.clone()),
        );

        if task.can_retry() {
            let delay_ms = backoff.as_millis() as u64;
            if let Some(last) = task.history.last_mut() {
                last.retry_delay_ms = Some(delay_ms);
            }
            task.status = TaskStatus::Pending;
            task.not_before = Some(now.saturating_add(delay_ms));
            task.effective_priority = task.priority;
            self.totals.retries += 1;

            out.push(
                self.event(EventKind::RetryScheduled, &task, now)
                    .with_attempt(task.attempts)
                    .with_delay_ms(delay_ms),
            );
            self.delayed.insert(task.id.clone(), task.clone());
            return Ok(Settled::Retrying(task));
        }

        task.status = TaskStatus::Failed;
        task.finished_at = Some(now);
        self.totals.failed += 1;
        out.push(
            self.event(EventKind::TaskExhausted, &task, now)
                .with_attempt(task.attempts)
                .with_reason(error),
        );
        push_bounded(&mut self.failed, task.clone(), self.max_history);
        Ok(Settled::Exhausted(task))
    }

    /// Cancel a pending or running task. `Ok(false)` when it already settled.
    pub fn cancel(
        &mut self,
        id: &TaskId,
        now: EpochMs,
        out: &mut Vec<TaskEvent>,
    ) -> CoordinationResult<bool> {
        let pending = self.queue.remove(id).or_else(|| self.delayed.remove(id));
        if let Some(mut task) = pending {
            task.status = TaskStatus::Cancelled;
            task.finished_at = Some(now);
            task.not_before = None;
            out.push(self.event(EventKind::TaskCancelled, &task, now));
            push_bounded(&mut self.cancelled, task, self.max_history);
            return Ok(true);
        }

        if let Some(running) = self.processing.get_mut(id) {
            if running.cancel_requested {
                return Ok(false);
            }
            running.cancel_requested = true;
            running.cancel.cancel();
            let ev = TaskEvent::new(EventKind::TaskCancelled, &self.queue_name, now)
                .with_task(&running.task.id, &running.task.name)
                .with_attempt(running.task.attempts)
                .with_reason("cancelled while running");
            out.push(ev);
            return Ok(true);
        }

        if self.settled(id).is_some() {
            return Ok(false);
        }
        Err(CoordinationError::not_found("task", id.as_str()))
    }

    /// Drop every pending task (queued and delayed). Returns how many were removed.
    pub fn clear_pending(&mut self) -> usize {
        let queued = self.queue.drain().len();
        let delayed = self.delayed.len();
        self.delayed.clear();
        queued + delayed
    }

    /// Forget settled tasks. Returns how many were removed.
    pub fn drain(&mut self) -> usize {
        let n = self.completed.len() + self.failed.len() + self.cancelled.len();
        self.completed.clear();
        self.failed.clear();
        self.cancelled.clear();
        n
    }

    fn settled(&self, id: &TaskId) -> Option<&PriorityTask> {
        self.completed
            .iter()
            .chain(self.failed.iter())
            .chain(self.cancelled.iter())
            .find(|t| &t.id == id)
    }

    pub fn get(&self, id: &TaskId) -> Option<PriorityTask> {
        self.queue
            .get(id)
            .or_else(|| self.delayed.get(id))
            .or_else(|| self.processing.get(id).map(|r| &r.task))
            .or_else(|| self.settled(id))
            .cloned()
    }

    fn all(&self) -> impl Iterator<Item = &PriorityTask> {
        self.queue
            .tasks()
            .chain(self.delayed.values())
            .chain(self.processing.values().map(|r| &r.task))
            .chain(self.completed.iter())
            .chain(self.failed.iter())
            .chain(self.cancelled.iter())
    }

    pub fn stats(&self, paused: bool) -> SchedulerStats {
        SchedulerStats {
            pending: self.queue.len(),
            delayed: self.delayed.len(),
            processing: self.processing.len(),
            completed: self.completed.len(),
            failed: self.failed.len(),
            cancelled: self.cancelled.len(),
            total_enqueued: self.totals.enqueued,
            total_completed: self.totals.completed,
            total_failed: self.totals.failed,
            total_retries: self.totals.retries,
            paused,
        }
    }

    /// Filter, order by creation, paginate.
    ///
    /// `total` counts matches before pagination.
    pub fn query(&self, q: &TaskQuery) -> TaskPage<PriorityTask> {
        let mut filtered: Vec<&PriorityTask> = self
            .all()
            .filter(|t| q.status.is_none_or(|s| t.status == s))
            .filter(|t| q.tag.as_deref().is_none_or(|tag| t.has_tag(tag)))
            .filter(|t| q.name.as_deref().is_none_or(|name| t.name == name))
            .collect();
        filtered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let total = filtered.len();
        let items = filtered
            .into_iter()
            .skip(q.offset)
            .take(q.limit)
            .cloned()
            .collect();
        TaskPage { items, total }
    }
}

fn push_bounded(list: &mut VecDeque<PriorityTask>, task: PriorityTask, max: usize) {
    list.push_back(task);
    while list.len() > max {
        list.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    fn state() -> SchedulerState {
        SchedulerState::new("jobs", 10)
    }

    fn task(name: &str, priority: u8, max_attempts: u32) -> PriorityTask {
        PriorityTask::new(name, Value::Null, priority, max_attempts, 0)
    }

    fn kinds(out: &[TaskEvent]) -> Vec<EventKind> {
        out.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn task_lives_in_exactly_one_place() {
        let mut st = state();
        let mut out = Vec::new();
        let t = st.enqueue(task("a", 50, 2), 10, 0, &mut out).unwrap();

        let (running, _) = st.dequeue(0, 30 * SECOND, 1, &mut out).unwrap();
        assert_eq!(running.status, TaskStatus::Processing);
        assert_eq!(st.pending_len(), 0);
        assert_eq!(st.stats(false).processing, 1);

        let settled = st.nack(&t.id, "boom".into(), SECOND, 10, &mut out).unwrap();
        assert!(matches!(settled, Settled::Retrying(_)));
        assert_eq!(st.stats(false).processing, 0);
        assert_eq!(st.stats(false).delayed, 1);
        assert_eq!(st.get(&t.id).unwrap().not_before, Some(1_010));

        // not due yet
        assert!(st.dequeue(1_009, 30 * SECOND, 1, &mut out).is_none());
        let (retry, _) = st.dequeue(1_010, 30 * SECOND, 1, &mut out).unwrap();
        assert_eq!(retry.attempts, 2);

        let settled = st.nack(&t.id, "boom again".into(), SECOND, 1_020, &mut out).unwrap();
        let failed = settled.into_task();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.history.len(), 2);
        assert_eq!(failed.history[0].retry_delay_ms, Some(1_000));
        assert_eq!(failed.last_error.as_deref(), Some("boom again"));

        let stats = st.stats(false);
        assert_eq!((stats.pending, stats.delayed, stats.processing, stats.failed), (0, 0, 0, 1));
        assert_eq!(stats.total_retries, 1);
    }

    #[test]
    fn capacity_counts_delayed_retries() {
        let mut st = state();
        let mut out = Vec::new();
        let t = st.enqueue(task("a", 50, 3), 1, 0, &mut out).unwrap();
        st.dequeue(0, 30 * SECOND, 1, &mut out).unwrap();
        st.enqueue(task("b", 50, 3), 1, 0, &mut out).unwrap();
        st.nack(&t.id, "boom".into(), SECOND, 0, &mut out).unwrap();

        let err = st.enqueue(task("c", 50, 3), 2, 0, &mut out).unwrap_err();
        assert!(matches!(err, CoordinationError::CapacityExceeded { limit: 2, .. }));
        assert_eq!(out.last().map(|e| e.kind), Some(EventKind::EnqueueRejected));
    }

    #[test]
    fn cancel_running_discards_outcome() {
        let mut st = state();
        let mut out = Vec::new();
        let t = st.enqueue(task("a", 50, 3), 10, 0, &mut out).unwrap();
        let (_, token) = st.dequeue(0, 30 * SECOND, 1, &mut out).unwrap();

        assert!(st.cancel(&t.id, 5, &mut out).unwrap());
        assert!(token.is_cancelled());
        assert!(!st.cancel(&t.id, 5, &mut out).unwrap());

        out.clear();
        let settled = st.ack(&t.id, Value::Bool(true), 6, &mut out).unwrap();
        let task = settled.into_task();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.result.is_none());
        assert_eq!(kinds(&out), vec![EventKind::ResultDiscarded]);
        assert!(!st.cancel(&t.id, 7, &mut out).unwrap());
    }

    #[test]
    fn cancel_unknown_is_not_found() {
        let mut st = state();
        let err = st.cancel(&TaskId::from("nope"), 0, &mut Vec::new()).unwrap_err();
        assert!(matches!(err, CoordinationError::NotFound { kind: "task", .. }));
        assert!(st.ack(&TaskId::from("nope"), Value::Null, 0, &mut Vec::new()).is_err());
    }

    #[test]
    fn history_is_bounded() {
        let mut st = SchedulerState::new("jobs", 2);
        let mut out = Vec::new();
        for i in 0..3 {
            let t = st.enqueue(task(&format!("t{i}"), 50, 1), 10, i, &mut out).unwrap();
            st.dequeue(i, 30 * SECOND, 1, &mut out).unwrap();
            st.ack(&t.id, Value::Null, i, &mut out).unwrap();
        }
        let stats = st.stats(false);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.total_completed, 3);
        assert_eq!(st.drain(), 2);
    }

    #[test]
    fn query_filters_and_paginates() {
        let mut st = state();
        let mut out = Vec::new();
        for i in 0..5u64 {
            let mut t = PriorityTask::new("mail", Value::Null, 50, 1, i);
            if i % 2 == 0 {
                t = t.with_tags(vec!["billing".into()]);
            }
            st.enqueue(t, 10, i, &mut out).unwrap();
        }
        st.enqueue(task("report", 50, 1), 10, 9, &mut out).unwrap();

        let page = st.query(&TaskQuery::new().with_tag("billing").with_limit(2));
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].created_at, 0);

        let page = st.query(&TaskQuery::new().with_name("report"));
        assert_eq!(page.total, 1);

        let page = st.query(&TaskQuery::new().with_status(TaskStatus::Completed));
        assert_eq!(page.total, 0);

        let page = st.query(&TaskQuery::new().with_offset(4));
        assert_eq!(page.total, 6);
        assert_eq!(page.items.len(), 2);
    }
}
