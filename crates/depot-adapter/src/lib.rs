//! Backing container adapters for Depot.
//!
//! This crate normalizes heterogeneous containers into one `StorageAdapter`
//! surface: the raw `Inventory` API with explicit "unsupported" results, the
//! closed set of adapter variants (generic, tiered-capacity, upgradeable,
//! network-aggregated) chosen by type tag in `wrap`, the shared greedy
//! consolidation pass, and `MemoryHost`, an in-memory container host used by
//! tests and the stress harness.

pub mod adapter;
pub mod consolidate;
pub mod generic;
pub mod memory;
pub mod native;
pub mod network;
pub mod tiered;
pub mod upgradeable;

pub use adapter::{
    wrap, AdapterKind, CapacitySnapshot, Capabilities, StorageAdapter, WrapOptions,
};
pub use consolidate::consolidate_slots;
pub use generic::GenericAdapter;
pub use memory::{ContainerSpec, MemoryHost};
pub use native::{ContainerHost, Inventory, NativeError, NetworkCapacity};
pub use network::{NetworkAdapter, VIRTUAL_SLOT_CEILING};
pub use tiered::{Tier, TieredAdapter};
pub use upgradeable::UpgradeableAdapter;

use depot_schema::ContainerId;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    #[error("adapter unavailable for '{id}': {reason}")]
    Unavailable { id: ContainerId, reason: String },
    #[error("'{op}' is not supported by '{id}'")]
    Unsupported { id: ContainerId, op: &'static str },
    #[error("native call failed on '{id}': {source}")]
    Native {
        id: ContainerId,
        #[source]
        source: NativeError,
    },
}

impl AdapterError {
    pub(crate) fn from_native(id: &ContainerId, err: NativeError) -> Self {
        match err {
            NativeError::Unsupported(op) => AdapterError::Unsupported { id: id.clone(), op },
            other => AdapterError::Native {
                id: id.clone(),
                source: other,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_native_maps_to_unsupported() {
        let id = ContainerId::new("minecraft:chest_0");
        let err = AdapterError::from_native(&id, NativeError::Unsupported("list"));
        assert!(matches!(err, AdapterError::Unsupported { op: "list", .. }));
    }

    #[test]
    fn other_native_errors_keep_source() {
        let id = ContainerId::new("minecraft:chest_0");
        let err = AdapterError::from_native(&id, NativeError::Detached("x".to_owned()));
        let msg = err.to_string();
        assert!(msg.contains("minecraft:chest_0"));
        assert!(msg.contains("detached"));
    }

    #[test]
    fn unavailable_display_names_container() {
        let e = AdapterError::Unavailable {
            id: ContainerId::new("ae2:me_interface_1"),
            reason: "no such peripheral".to_owned(),
        };
        assert!(e.to_string().contains("ae2:me_interface_1"));
    }
}
