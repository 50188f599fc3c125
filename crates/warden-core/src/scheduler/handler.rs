use std::{future::Future, marker::PhantomData};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use warden_model::PriorityTask;

/// Why a single attempt did not succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("{reason}")]
    Fail { reason: String },
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("cancelled")]
    Canceled,
    #[error("no handler registered for '{0}'")]
    NoHandler(String),
}

impl TaskError {
    pub fn fail(reason: impl Into<String>) -> Self {
        TaskError::Fail {
            reason: reason.into(),
        }
    }
}

/// What a handler gets for one attempt.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Snapshot of the task as it was dequeued.
    pub task: PriorityTask,
    /// Fired when the task is cancelled while running.
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn payload(&self) -> &Value {
        &self.task.payload
    }

    /// 1-based number of this attempt.
    pub fn attempt(&self) -> u32 {
        self.task.attempts
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Work bound to a task name.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: TaskContext) -> Result<Value, TaskError>;
}

/// Adapter turning an async closure into a [`TaskHandler`].
///
/// ```ignore
/// scheduler.register("email", HandlerFn::new(|ctx: TaskContext| async move {
///     send(ctx.payload()).await.map_err(|e| TaskError::fail(e.to_string()))
/// }));
/// ```
pub struct HandlerFn<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> HandlerFn<F, Fut>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _fut: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for HandlerFn<F, Fut>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    async fn handle(&self, ctx: TaskContext) -> Result<Value, TaskError> {
        (self.f)(ctx).await
    }
}
