use crate::types::ContainerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const POOL_IO: &str = "io";
pub const POOL_INDEX: &str = "index";
pub const POOL_NET: &str = "net";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("pool '{0}' must have a capacity of at least 1")]
    InvalidPool(String),
    #[error("required pool '{0}' is not configured")]
    MissingPool(String),
    #[error("events.history must be at least 1")]
    InvalidHistory,
    #[error("storage.input and storage.output must differ (both are '{0}')")]
    InputIsOutput(String),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(default = "default_pools")]
    pub pools: BTreeMap<String, usize>,
    #[serde(default)]
    pub events: EventsSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub adapters: BTreeMap<String, AdapterSection>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            pools: default_pools(),
            events: EventsSection::default(),
            storage: StorageSection::default(),
            adapters: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EventsSection {
    #[serde(default = "default_history")]
    pub history: usize,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            history: default_history(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StorageSection {
    /// Container drained by `deposit()`.
    #[serde(default)]
    pub input: Option<ContainerId>,
    /// Container that receives withdrawn items.
    #[serde(default)]
    pub output: Option<ContainerId>,
    /// Containers that are never wrapped or indexed.
    #[serde(default)]
    pub ignore: Vec<ContainerId>,
    #[serde(default)]
    pub rebuild_interval_secs: Option<u64>,
    #[serde(default = "default_scan_yield_every")]
    pub scan_yield_every: usize,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            input: None,
            output: None,
            ignore: Vec::new(),
            rebuild_interval_secs: None,
            scan_yield_every: default_scan_yield_every(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AdapterSection {
    #[serde(default)]
    pub priority: Option<i32>,
}

fn default_pools() -> BTreeMap<String, usize> {
    BTreeMap::from([
        (POOL_IO.to_owned(), 4),
        (POOL_INDEX.to_owned(), 2),
        (POOL_NET.to_owned(), 2),
    ])
}

fn default_history() -> usize {
    100
}

fn default_scan_yield_every() -> usize {
    16
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for required in [POOL_IO, POOL_INDEX] {
            if !self.pools.contains_key(required) {
                return Err(ConfigError::MissingPool(required.to_owned()));
            }
        }
        if let Some((name, _)) = self.pools.iter().find(|(_, cap)| **cap == 0) {
            return Err(ConfigError::InvalidPool(name.clone()));
        }
        if self.events.history == 0 {
            return Err(ConfigError::InvalidHistory);
        }
        if let (Some(input), Some(output)) = (&self.storage.input, &self.storage.output) {
            if input == output {
                return Err(ConfigError::InputIsOutput(input.to_string()));
            }
        }
        Ok(())
    }

    /// Configured priority for a container, if any.
    pub fn priority_for(&self, id: &ContainerId) -> Option<i32> {
        self.adapters.get(id.as_str()).and_then(|a| a.priority)
    }

    pub fn is_ignored(&self, id: &ContainerId) -> bool {
        self.storage.ignore.contains(id)
    }
}

pub fn parse_config_str(input: &str) -> Result<ServiceConfig, ConfigError> {
    let config: ServiceConfig = toml::from_str(input)?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config_file(path: impl AsRef<Path>) -> Result<ServiceConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config_str(&content)
}
