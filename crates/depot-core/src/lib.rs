//! Storage orchestration for Depot.
//!
//! This crate ties the adapter layer, the cooperative scheduler, the event
//! bus and the item index together: `Context` builds the shared services
//! from configuration, `discover` wraps every reachable container, and
//! `StorageService` serves withdraw, deposit, rebuild and consolidation on
//! top of them. `OperationGate` keeps full rescans from interleaving with
//! in-flight moves.

pub mod concurrency;
pub mod context;
pub mod discovery;
pub mod service;

pub use concurrency::{install_signal_handler, shutdown_requested, OperationGate};
pub use context::{Context, TASK_HISTORY};
pub use discovery::{discover, Discovery};
pub use service::{
    AdapterInfo, RebuildReport, ServiceStats, StorageService, PRIORITY_DEPOSIT,
    PRIORITY_MAINTENANCE, PRIORITY_SCAN, PRIORITY_WITHDRAW,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config error: {0}")]
    Config(#[from] depot_schema::ConfigError),
    #[error("adapter error: {0}")]
    Adapter(#[from] depot_adapter::AdapterError),
    #[error("runtime error: {0}")]
    Runtime(#[from] depot_runtime::RuntimeError),
    #[error("task error: {0}")]
    Task(#[from] depot_runtime::TaskError),
}
