use crate::consolidate::consolidate_slots;
use crate::generic::GenericAdapter;
use crate::native::{ContainerHost, Inventory, NativeError};
use crate::network::NetworkAdapter;
use crate::tiered::{Tier, TieredAdapter};
use crate::upgradeable::UpgradeableAdapter;
use crate::AdapterError;
use depot_schema::{ContainerId, ItemKey, ItemStack};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterKind {
    Generic,
    Tiered,
    Upgradeable,
    Network,
}

impl AdapterKind {
    /// Pick the variant for a discovered type tag (`namespace:path`).
    pub fn detect(type_tag: &str) -> Self {
        let (namespace, path) = type_tag.split_once(':').unwrap_or(("minecraft", type_tag));
        match namespace {
            "ae2" | "refinedstorage" => AdapterKind::Network,
            "functionalstorage" | "storagedrawers" | "sophisticatedstorage" => {
                AdapterKind::Upgradeable
            }
            _ if Tier::from_path(path).is_some() => AdapterKind::Tiered,
            _ => AdapterKind::Generic,
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterKind::Generic => write!(f, "generic"),
            AdapterKind::Tiered => write!(f, "tiered"),
            AdapterKind::Upgradeable => write!(f, "upgradeable"),
            AdapterKind::Network => write!(f, "network"),
        }
    }
}

/// Which operations the backing container supports natively. Everything
/// else is emulated or reported as unsupported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub bulk_list: bool,
    pub item_limit: bool,
    pub slot_locking: bool,
    pub void_overflow: bool,
    pub item_identity: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacitySnapshot {
    pub total_slots: usize,
    pub used_slots: usize,
    pub stored_items: u64,
    /// Item ceiling for containers that count items rather than slots.
    pub max_items: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WrapOptions {
    /// Overrides the container's own priority when set.
    pub priority: Option<i32>,
}

/// Uniform surface over one backing container.
///
/// Moves never return errors: a refused or failed native call is logged and
/// reported as `0` moved so callers fall through to their next candidate.
pub trait StorageAdapter {
    fn id(&self) -> &ContainerId;

    fn kind(&self) -> AdapterKind;

    fn capabilities(&self) -> Capabilities;

    /// Placement tie-break; higher wins.
    fn priority(&self) -> i32;

    /// Factor applied to an item's stack size to get the per-slot limit.
    fn stack_multiplier(&self) -> u32 {
        1
    }

    fn slot_count(&self) -> Result<usize, AdapterError>;

    fn list_occupied_slots(&self) -> Result<BTreeMap<usize, ItemStack>, AdapterError>;

    fn slot_detail(&self, slot: usize) -> Result<Option<ItemStack>, AdapterError>;

    /// How many items with stack size `max_stack` fit in `slot`.
    fn slot_limit(&self, slot: usize, max_stack: u32) -> Result<u32, AdapterError>;

    fn move_out(
        &self,
        dest: &ContainerId,
        from_slot: usize,
        limit: u32,
        to_slot: Option<usize>,
    ) -> u32;

    fn move_in(
        &self,
        src: &ContainerId,
        from_slot: usize,
        limit: u32,
        to_slot: Option<usize>,
    ) -> u32;

    fn capacity_snapshot(&self) -> Result<CapacitySnapshot, AdapterError> {
        let total_slots = self.slot_count()?;
        let occupied = self.list_occupied_slots()?;
        Ok(CapacitySnapshot {
            total_slots,
            used_slots: occupied.len(),
            stored_items: occupied.values().map(|s| u64::from(s.count)).sum(),
            max_items: None,
        })
    }

    fn find_by_key(&self, key: &ItemKey) -> Result<Vec<(usize, u32)>, AdapterError> {
        Ok(self
            .list_occupied_slots()?
            .into_iter()
            .filter(|(_, stack)| stack.key == *key)
            .map(|(slot, stack)| (slot, stack.count))
            .collect())
    }

    /// Merge partial stacks of identical keys. Returns the number of moves.
    fn consolidate(&self) -> usize {
        consolidate_slots(self)
    }

    fn locked_slots(&self) -> BTreeMap<usize, ItemKey> {
        BTreeMap::new()
    }

    fn lock_slot(&self, _slot: usize, _key: Option<ItemKey>) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported {
            id: self.id().clone(),
            op: "setSlotLock",
        })
    }

    fn voids_overflow(&self) -> bool {
        false
    }

    /// Stable virtual slot standing for `key` in item-identity adapters.
    fn virtual_slot(&self, _key: &ItemKey) -> Option<usize> {
        None
    }
}

/// Wrap one container in the adapter variant matching its type tag.
pub fn wrap(
    host: &dyn ContainerHost,
    id: &ContainerId,
    options: &WrapOptions,
) -> Result<Box<dyn StorageAdapter>, AdapterError> {
    let native = host.open(id).map_err(|e| unavailable(id, &e))?;
    let tag = native.type_tag().map_err(|e| unavailable(id, &e))?;
    let kind = AdapterKind::detect(&tag);
    debug!("wrapping {id} ({tag}) as {kind} adapter");

    let adapter: Box<dyn StorageAdapter> = match kind {
        AdapterKind::Generic => Box::new(GenericAdapter::probe(id.clone(), native, options)?),
        AdapterKind::Tiered => {
            let tier = tag
                .split_once(':')
                .and_then(|(_, path)| Tier::from_path(path))
                .or_else(|| Tier::from_path(&tag))
                .unwrap_or(Tier::Copper);
            Box::new(TieredAdapter::new(id.clone(), native, tier, options)?)
        }
        AdapterKind::Upgradeable => {
            Box::new(UpgradeableAdapter::new(id.clone(), native, options)?)
        }
        AdapterKind::Network => Box::new(NetworkAdapter::new(id.clone(), native, options)?),
    };
    Ok(adapter)
}

pub(crate) fn unavailable(id: &ContainerId, err: &NativeError) -> AdapterError {
    AdapterError::Unavailable {
        id: id.clone(),
        reason: err.to_string(),
    }
}

/// List occupied slots, falling back to per-slot detail queries when the
/// container has no bulk listing.
pub(crate) fn list_slots(
    native: &dyn Inventory,
    bulk_list: bool,
) -> Result<BTreeMap<usize, ItemStack>, NativeError> {
    if bulk_list {
        return native.list();
    }
    let size = native.size()?;
    let mut slots = BTreeMap::new();
    for slot in 0..size {
        if let Some(stack) = native.item_detail(slot)? {
            if !stack.is_empty() {
                slots.insert(slot, stack);
            }
        }
    }
    Ok(slots)
}

/// Collapse a native move result into a moved count.
pub(crate) fn settle_move(id: &ContainerId, op: &str, result: Result<u32, NativeError>) -> u32 {
    match result {
        Ok(moved) => moved,
        Err(e) => {
            warn!("{op} on {id} failed: {e}");
            0
        }
    }
}
