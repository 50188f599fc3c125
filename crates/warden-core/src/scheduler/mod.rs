//! Named, bounded, prioritized task queue with retries and starvation aging.
//!
//! Tasks are ordered by effective priority, then age. A task that waits past the starvation threshold gains
//! priority every second, so low-priority work is eventually served under a constant stream of urgent work.
//! Failed attempts are retried with capped exponential backoff; exhausted tasks land in the failed list and are
//! reported to subscribers and the failure callback.
//!
//! The queue is process-local: each process runs its own scheduler over its own tasks.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use serde_json::Value;
use tokio::{
    sync::{Notify, Semaphore},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use warden_model::{
    EventKind, PriorityTask, SchedulerStats, Subscribe, TaskEvent, TaskId, TaskPage, TaskQuery,
};

use crate::{
    clock::{Clock, ClockRef, system},
    error::{CoordinationError, CoordinationResult},
};

mod config;
mod handler;
mod queue;
mod state;

pub use config::{EnqueueOptions, SchedulerConfig};
pub use handler::{HandlerFn, TaskContext, TaskError, TaskHandler};
use state::{SchedulerState, Settled};

/// Called once for every task that exhausts its attempts.
pub type FailureCallback = Arc<dyn Fn(&PriorityTask) + Send + Sync>;

/// Handle to one scheduler. Clones share the same queue.
#[derive(Clone)]
pub struct PriorityTaskScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    clock: ClockRef,
    state: Mutex<SchedulerState>,
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    subscribers: RwLock<Vec<Arc<dyn Subscribe>>>,
    on_failure: RwLock<Option<FailureCallback>>,
    paused: AtomicBool,
    /// Wakes the dispatcher on enqueue and resume.
    wake: Notify,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl PriorityTaskScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_clock(config, system())
    }

    pub fn with_clock(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedulerState::new(&config.name, config.max_history)),
                config,
                clock,
                handlers: RwLock::new(HashMap::new()),
                subscribers: RwLock::new(Vec::new()),
                on_failure: RwLock::new(None),
                paused: AtomicBool::new(false),
                wake: Notify::new(),
                permits: Arc::new(Semaphore::new(concurrency)),
                shutdown: CancellationToken::new(),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Bind `handler` to tasks named `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, handler: impl TaskHandler + 'static) {
        let name = name.into();
        debug!(queue = %self.inner.config.name, handler = %name, "task handler registered");
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(handler));
    }

    pub fn subscribe(&self, subscriber: Arc<dyn Subscribe>) {
        debug!(queue = %self.inner.config.name, subscriber = subscriber.name(), "subscriber attached");
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscriber);
    }

    /// Set the callback invoked for every task that exhausts its attempts.
    pub fn on_failure<F>(&self, callback: F)
    where
        F: Fn(&PriorityTask) + Send + Sync + 'static,
    {
        *self
            .inner
            .on_failure
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Add a task. Fails with `CapacityExceeded` when the pending count is at capacity.
    pub fn enqueue(
        &self,
        name: impl Into<String>,
        payload: Value,
        priority: u8,
        opts: EnqueueOptions,
    ) -> CoordinationResult<PriorityTask> {
        let now = self.inner.clock.now_ms();
        let task = PriorityTask::new(name, payload, priority, opts.max_attempts, now)
            .with_tags(opts.tags);

        let task = self
            .inner
            .with_state(|st, out| st.enqueue(task, self.inner.config.capacity, now, out))?;
        debug!(queue = %self.inner.config.name, task = %task.id, priority = task.priority, "task enqueued");
        self.inner.wake.notify_one();
        Ok(task)
    }

    /// Pop the next task by effective priority and mark it processing. Retries that are due are promoted and
    /// waiting tasks aged first.
    pub fn dequeue(&self) -> Option<PriorityTask> {
        self.inner.dequeue().map(|(task, _)| task)
    }

    /// Settle a processing task as completed.
    pub fn ack(&self, id: &TaskId, result: Value) -> CoordinationResult<PriorityTask> {
        self.inner.ack(id, result).map(Settled::into_task)
    }

    /// Settle a processing task as failed; it is retried after backoff while attempts remain.
    pub fn nack(&self, id: &TaskId, error: impl Into<String>) -> CoordinationResult<PriorityTask> {
        self.inner.nack(id, error.into()).map(Settled::into_task)
    }

    /// Cancel a pending or running task. Running handlers see their token fire and their outcome is discarded.
    /// `Ok(false)` when the task had already settled.
    pub fn cancel(&self, id: &TaskId) -> CoordinationResult<bool> {
        let now = self.inner.clock.now_ms();
        self.inner.with_state(|st, out| st.cancel(id, now, out))
    }

    pub fn pause(&self) {
        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            info!(queue = %self.inner.config.name, "scheduler paused");
            self.inner.publish_control(EventKind::SchedulerPaused);
        }
    }

    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::SeqCst) {
            info!(queue = %self.inner.config.name, "scheduler resumed");
            self.inner.publish_control(EventKind::SchedulerResumed);
            self.inner.wake.notify_one();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Forget completed, failed and cancelled tasks. The pending queue is untouched.
    pub fn drain(&self) -> usize {
        let n = self.inner.lock_state().drain();
        debug!(queue = %self.inner.config.name, removed = n, "history drained");
        n
    }

    /// Drop every pending task, queued or waiting out a retry delay.
    pub fn clear_pending(&self) -> usize {
        let n = self.inner.lock_state().clear_pending();
        warn!(queue = %self.inner.config.name, removed = n, "pending tasks cleared");
        n
    }

    pub fn get_task(&self, id: &TaskId) -> Option<PriorityTask> {
        self.inner.lock_state().get(id)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.lock_state().stats(self.is_paused())
    }

    pub fn list(&self, query: &TaskQuery) -> TaskPage<PriorityTask> {
        self.inner.lock_state().query(query)
    }

    /// Dequeue and run a single task inline. Returns the task as it settled, or `None` when paused or idle.
    pub async fn run_once(&self) -> Option<PriorityTask> {
        if self.is_paused() {
            return None;
        }
        let (task, cancel) = self.inner.dequeue()?;
        self.inner.execute(task, cancel).await
    }

    /// Start the worker loop. Returns `false` if it is already running or the scheduler was shut down.
    pub fn start(&self) -> bool {
        if self.inner.shutdown.is_cancelled() {
            return false;
        }
        let mut slot = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        info!(
            queue = %self.inner.config.name,
            concurrency = self.inner.config.concurrency,
            "scheduler started"
        );
        *slot = Some(tokio::spawn(dispatch_loop(Arc::clone(&self.inner))));
        true
    }

    /// Stop dispatching and wait for running handlers to settle. Pending tasks stay queued.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();

        let dispatcher = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = dispatcher
            && let Err(e) = handle.await
        {
            warn!(queue = %self.inner.config.name, error = %e, "dispatcher task ended abnormally");
        }

        let all = self.inner.config.concurrency.max(1) as u32;
        if let Ok(permits) = self.inner.permits.acquire_many(all).await {
            drop(permits);
        }
        self.inner.publish_control(EventKind::SchedulerStopped);
        info!(queue = %self.inner.config.name, "scheduler stopped");
    }
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` under the state lock, then publish the events it produced.
    fn with_state<T>(&self, f: impl FnOnce(&mut SchedulerState, &mut Vec<TaskEvent>) -> T) -> T {
        let mut out = Vec::new();
        let res = {
            let mut st = self.lock_state();
            f(&mut st, &mut out)
        };
        self.publish(&out);
        res
    }

    fn publish(&self, events: &[TaskEvent]) {
        if events.is_empty() {
            return;
        }
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for ev in events {
            for sub in &subscribers {
                sub.on_event(ev);
            }
        }
    }

    fn publish_control(&self, kind: EventKind) {
        let ev = TaskEvent::new(kind, &self.config.name, self.clock.now_ms());
        self.publish(std::slice::from_ref(&ev));
    }

    fn dequeue(&self) -> Option<(PriorityTask, CancellationToken)> {
        let now = self.clock.now_ms();
        self.with_state(|st, out| {
            st.dequeue(
                now,
                self.config.starvation_threshold,
                self.config.aging_factor,
                out,
            )
        })
    }

    fn ack(&self, id: &TaskId, result: Value) -> CoordinationResult<Settled> {
        let now = self.clock.now_ms();
        let settled = self.with_state(|st, out| st.ack(id, result, now, out))?;
        if let Settled::Completed(task) = &settled {
            debug!(queue = %self.config.name, task = %task.id, attempts = task.attempts, "task completed");
        }
        Ok(settled)
    }

    fn nack(&self, id: &TaskId, error: String) -> CoordinationResult<Settled> {
        let now = self.clock.now_ms();
        let settled = self.with_state(|st, out| {
            let attempts = st.get(id).map_or(1, |t| t.attempts);
            st.nack(id, error, self.config.backoff(attempts), now, out)
        })?;

        match &settled {
            Settled::Retrying(task) => debug!(
                queue = %self.config.name,
                task = %task.id,
                attempt = task.attempts,
                not_before = task.not_before,
                "task failed; retry scheduled"
            ),
            Settled::Exhausted(task) => {
                warn!(
                    queue = %self.config.name,
                    task = %task.id,
                    attempts = task.attempts,
                    error = task.last_error.as_deref().unwrap_or_default(),
                    "task failed permanently"
                );
                let callback = self
                    .on_failure
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                if let Some(cb) = callback {
                    cb(task);
                }
            }
            Settled::Completed(_) | Settled::Discarded(_) => {}
        }
        Ok(settled)
    }

    /// Run the handler for one dequeued task and settle it.
    #[instrument(level = "debug", skip_all, fields(queue = %self.config.name, task = %task.id, name = %task.name))]
    async fn execute(&self, task: PriorityTask, cancel: CancellationToken) -> Option<PriorityTask> {
        let id = task.id.clone();
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&task.name)
            .cloned();

        let outcome = match handler {
            None => Err(TaskError::NoHandler(task.name.clone())),
            Some(handler) => {
                let timeout = self.config.timeout;
                let ctx = TaskContext {
                    task,
                    cancel: cancel.clone(),
                };
                tokio::select! {
                    _ = cancel.cancelled() => Err(TaskError::Canceled),
                    res = tokio::time::timeout(timeout, handler.handle(ctx)) => match res {
                        Ok(res) => res,
                        Err(_) => {
                            cancel.cancel();
                            let timeout_ms = timeout.as_millis() as u64;
                            let snapshot = self.lock_state().get(&id);
                            if let Some(task) = snapshot {
                                let ev = TaskEvent::new(EventKind::TimeoutHit, &self.config.name, self.clock.now_ms())
                                    .with_task(&task.id, &task.name)
                                    .with_attempt(task.attempts)
                                    .with_timeout_ms(timeout_ms);
                                self.publish(std::slice::from_ref(&ev));
                            }
                            Err(TaskError::Timeout { timeout_ms })
                        }
                    },
                }
            }
        };

        let settled = match outcome {
            Ok(value) => self.ack(&id, value),
            Err(e) => self.nack(&id, e.to_string()),
        };
        match settled {
            Ok(s) => Some(s.into_task()),
            Err(e) => {
                // Settled by a manual ack/nack while the handler ran.
                warn!(error = %e, "task settled elsewhere while its handler ran");
                self.lock_state().get(&id)
            }
        }
    }

    /// How long the idle dispatcher may sleep before a delayed retry becomes due.
    fn idle_wait(&self) -> Duration {
        let now = self.clock.now_ms();
        let poll = self.config.poll_interval;
        match self.lock_state().next_due() {
            Some(due) => Duration::from_millis(due.saturating_sub(now)).min(poll),
            None => poll,
        }
    }
}

async fn dispatch_loop(inner: Arc<Inner>) {
    let stop = inner.shutdown.clone();
    loop {
        if inner.paused.load(Ordering::SeqCst) {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = inner.wake.notified() => continue,
            }
        }

        let permit = tokio::select! {
            _ = stop.cancelled() => break,
            permit = Arc::clone(&inner.permits).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        match inner.dequeue() {
            Some((task, cancel)) => {
                let worker = Arc::clone(&inner);
                tokio::spawn(async move {
                    worker.execute(task, cancel).await;
                    drop(permit);
                });
            }
            None => {
                drop(permit);
                let wait = inner.idle_wait();
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = inner.wake.notified() => {}
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
    }
    debug!(queue = %inner.config.name, "dispatcher exited");
}
