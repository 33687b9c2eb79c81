//! Item identity, container identifiers, and service configuration for Depot.
//!
//! This crate defines the schema layer shared by every other crate: the exact
//! item identity (`ItemKey`) used to index stock, the physical `ItemStack`
//! found in a slot, string newtypes for container and item names, and the TOML
//! service configuration (`ServiceConfig`) with its validation rules.

pub mod config;
pub mod item;
pub mod types;

pub use config::{
    parse_config_file, parse_config_str, AdapterSection, ConfigError, EventsSection,
    ServiceConfig, StorageSection, POOL_INDEX, POOL_IO, POOL_NET,
};
pub use item::{ItemKey, ItemStack};
pub use types::{ContainerId, ItemName};
