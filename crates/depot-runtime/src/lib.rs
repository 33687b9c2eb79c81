//! Cooperative task scheduling and event delivery for Depot.
//!
//! This crate implements the single-threaded execution layer: a `Scheduler`
//! with named, bounded-concurrency pools ordered by priority then submission
//! sequence, `TaskHandle` futures for awaiting results, explicit suspension
//! via `yield_now`, and a deferred, tick-drained `EventBus` with a bounded
//! replay history.

pub mod bus;
pub mod scheduler;
pub mod task;

pub use bus::{Event, EventBus, SubscriptionId};
pub use scheduler::{PoolStats, Scheduler};
pub use task::{yield_now, TaskError, TaskHandle, TaskId, TaskRecord, TaskState, YieldNow};

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("no pool named '{0}'")]
    UnknownPool(String),
    #[error("scheduler is shutting down")]
    ShuttingDown,
    #[error("future cannot complete: scheduler is idle")]
    Stalled,
    #[error("block_on called from inside a running task")]
    Reentrant,
}
