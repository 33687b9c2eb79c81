//! The raw, capability-inconsistent API of a backing container.
//!
//! Every operation a container may lack has a default body returning
//! [`NativeError::Unsupported`], so adapters probe by calling rather than by
//! asking which methods exist.

use depot_schema::{ContainerId, ItemKey, ItemStack};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NativeError {
    #[error("operation '{0}' is not supported by this container")]
    Unsupported(&'static str),
    #[error("container '{0}' is detached")]
    Detached(String),
    #[error("no container named '{0}'")]
    NotFound(String),
    #[error("slot {slot} is out of range (size {size})")]
    SlotOutOfRange { slot: usize, size: usize },
}

impl NativeError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, NativeError::Unsupported(_))
    }
}

/// Item totals of a network-aggregated container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCapacity {
    pub used: u64,
    pub total: u64,
}

impl NetworkCapacity {
    pub fn free(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }
}

pub trait Inventory {
    /// Discovered type tag, e.g. `minecraft:chest` or `ae2:me_interface`.
    fn type_tag(&self) -> Result<String, NativeError>;

    fn size(&self) -> Result<usize, NativeError>;

    fn list(&self) -> Result<BTreeMap<usize, ItemStack>, NativeError> {
        Err(NativeError::Unsupported("list"))
    }

    fn item_detail(&self, slot: usize) -> Result<Option<ItemStack>, NativeError>;

    /// Per-slot limit expressed for a 64-stackable item.
    fn item_limit(&self, _slot: usize) -> Result<u32, NativeError> {
        Err(NativeError::Unsupported("getItemLimit"))
    }

    /// Move up to `limit` items from `from_slot` into the container `to`.
    fn push_items(
        &self,
        to: &ContainerId,
        from_slot: usize,
        limit: u32,
        to_slot: Option<usize>,
    ) -> Result<u32, NativeError>;

    /// Move up to `limit` items from slot `from_slot` of `from` into this container.
    fn pull_items(
        &self,
        from: &ContainerId,
        from_slot: usize,
        limit: u32,
        to_slot: Option<usize>,
    ) -> Result<u32, NativeError>;

    fn locked_slots(&self) -> Result<BTreeMap<usize, ItemKey>, NativeError> {
        Err(NativeError::Unsupported("getLockedSlots"))
    }

    fn set_slot_lock(&self, _slot: usize, _key: Option<ItemKey>) -> Result<(), NativeError> {
        Err(NativeError::Unsupported("setSlotLock"))
    }

    fn voids_overflow(&self) -> Result<bool, NativeError> {
        Err(NativeError::Unsupported("isVoiding"))
    }

    fn priority(&self) -> Result<i32, NativeError> {
        Err(NativeError::Unsupported("getPriority"))
    }

    fn stack_multiplier(&self) -> Result<u32, NativeError> {
        Err(NativeError::Unsupported("getStackMultiplier"))
    }

    fn network_items(&self) -> Result<Vec<ItemStack>, NativeError> {
        Err(NativeError::Unsupported("listItems"))
    }

    fn export_item(
        &self,
        _key: &ItemKey,
        _limit: u32,
        _to: &ContainerId,
        _to_slot: Option<usize>,
    ) -> Result<u32, NativeError> {
        Err(NativeError::Unsupported("exportItem"))
    }

    fn network_capacity(&self) -> Result<NetworkCapacity, NativeError> {
        Err(NativeError::Unsupported("getCapacity"))
    }
}

/// Source of backing containers reachable from the coordinating process.
pub trait ContainerHost {
    fn container_ids(&self) -> Vec<ContainerId>;

    fn open(&self, id: &ContainerId) -> Result<Rc<dyn Inventory>, NativeError>;
}
