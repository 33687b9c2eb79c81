use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use thiserror::Error;

pub type TaskId = u64;

/// Why a task produced no value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(String),
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("task was discarded before it started")]
    Discarded,
}

impl TaskError {
    pub fn failed(msg: impl Into<String>) -> Self {
        TaskError::Failed(msg.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
}

/// Diagnostic record of a finished task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub pool: String,
    pub label: String,
    pub priority: i32,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub(crate) type ResultSlot<T> = Rc<RefCell<Option<Result<T, TaskError>>>>;

/// Result of a submitted task.
///
/// Awaiting the handle suspends the caller until the task finishes.
/// Dropping it does not cancel the task.
pub struct TaskHandle<T> {
    id: TaskId,
    slot: ResultSlot<T>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(id: TaskId, slot: ResultSlot<T>) -> Self {
        Self { id, slot }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Take the result if the task has finished. Returns `None` before that,
    /// and after the result was taken once.
    pub fn try_take(&self) -> Option<Result<T, TaskError>> {
        self.slot.borrow_mut().take()
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.slot.borrow_mut().take() {
            Some(result) => Poll::Ready(result),
            None => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
}

/// Explicit suspension point: returns control to the driver once.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
