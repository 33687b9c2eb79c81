use crate::CoreError;
use depot_runtime::{EventBus, Scheduler};
use depot_schema::{parse_config_file, ServiceConfig};
use std::future::Future;
use std::path::Path;
use std::rc::Rc;
use tracing::info;

/// Finished-task records kept by the scheduler for diagnostics.
pub const TASK_HISTORY: usize = 64;

/// Shared services, built once and handed to every component.
pub struct Context {
    pub config: ServiceConfig,
    pub bus: Rc<EventBus>,
    pub scheduler: Rc<Scheduler>,
}

impl Context {
    pub fn new(config: ServiceConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let bus = Rc::new(EventBus::new(config.events.history));
        let scheduler = Rc::new(Scheduler::new(Rc::clone(&bus), &config.pools, TASK_HISTORY));
        info!(
            "context ready: pools {:?}, event history {}",
            config.pools, config.events.history
        );
        Ok(Self {
            config,
            bus,
            scheduler,
        })
    }

    pub fn from_config_file(path: &Path) -> Result<Self, CoreError> {
        info!("loading config from {}", path.display());
        Self::new(parse_config_file(path)?)
    }

    /// Drive `future` on the scheduler until it completes.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output, CoreError> {
        Ok(self.scheduler.block_on(future)?)
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.scheduler.run_until_idle();
    }
}
