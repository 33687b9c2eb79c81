use crate::adapter::{
    settle_move, unavailable, AdapterKind, CapacitySnapshot, Capabilities, StorageAdapter,
    WrapOptions,
};
use crate::native::Inventory;
use crate::AdapterError;
use depot_schema::{ContainerId, ItemKey, ItemStack};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, warn};

/// Advertised slot count of a network adapter. The real number of distinct
/// items may exceed it, in which case the slot count grows with them.
pub const VIRTUAL_SLOT_CEILING: usize = 4096;

/// One whole remote storage network presented as a virtual slot space.
///
/// Virtual slots are assigned per item key on first sight and never reused,
/// so an index location stays valid for as long as the adapter lives.
pub struct NetworkAdapter {
    id: ContainerId,
    native: Rc<dyn Inventory>,
    priority: i32,
    slots: RefCell<SlotMap>,
}

#[derive(Default)]
struct SlotMap {
    by_key: BTreeMap<ItemKey, usize>,
    by_slot: BTreeMap<usize, ItemKey>,
}

impl SlotMap {
    fn assign(&mut self, key: &ItemKey) -> usize {
        if let Some(slot) = self.by_key.get(key) {
            return *slot;
        }
        let slot = self.by_key.len();
        self.by_key.insert(key.clone(), slot);
        self.by_slot.insert(slot, key.clone());
        slot
    }
}

impl NetworkAdapter {
    pub fn new(
        id: ContainerId,
        native: Rc<dyn Inventory>,
        options: &WrapOptions,
    ) -> Result<Self, AdapterError> {
        let capacity = native
            .network_capacity()
            .map_err(|e| unavailable(&id, &e))?;
        debug!("{id}: network with {}/{} items", capacity.used, capacity.total);
        Ok(Self {
            id,
            native,
            priority: options.priority.unwrap_or(0),
            slots: RefCell::new(SlotMap::default()),
        })
    }

    fn native_err(&self, e: crate::native::NativeError) -> AdapterError {
        AdapterError::from_native(&self.id, e)
    }

    fn key_for(&self, slot: usize) -> Option<ItemKey> {
        self.slots.borrow().by_slot.get(&slot).cloned()
    }

    fn stock(&self) -> Result<Vec<ItemStack>, AdapterError> {
        let items = self.native.network_items().map_err(|e| self.native_err(e))?;
        let mut slots = self.slots.borrow_mut();
        for stack in &items {
            slots.assign(&stack.key);
        }
        Ok(items)
    }
}

impl StorageAdapter for NetworkAdapter {
    fn id(&self) -> &ContainerId {
        &self.id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Network
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            bulk_list: true,
            item_identity: true,
            ..Capabilities::default()
        }
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn slot_count(&self) -> Result<usize, AdapterError> {
        Ok(VIRTUAL_SLOT_CEILING.max(self.slots.borrow().by_key.len()))
    }

    fn list_occupied_slots(&self) -> Result<BTreeMap<usize, ItemStack>, AdapterError> {
        let items = self.stock()?;
        let slots = self.slots.borrow();
        Ok(items
            .into_iter()
            .filter(|s| !s.is_empty())
            .filter_map(|s| slots.by_key.get(&s.key).map(|slot| (*slot, s)))
            .collect())
    }

    fn slot_detail(&self, slot: usize) -> Result<Option<ItemStack>, AdapterError> {
        let Some(key) = self.key_for(slot) else {
            return Ok(None);
        };
        Ok(self
            .stock()?
            .into_iter()
            .find(|s| s.key == key && !s.is_empty()))
    }

    /// A virtual slot holds whatever the network has room for.
    fn slot_limit(&self, slot: usize, _max_stack: u32) -> Result<u32, AdapterError> {
        let capacity = self
            .native
            .network_capacity()
            .map_err(|e| self.native_err(e))?;
        let current = self.slot_detail(slot)?.map_or(0, |s| u64::from(s.count));
        Ok((capacity.free() + current).min(u64::from(u32::MAX)) as u32)
    }

    fn move_out(
        &self,
        dest: &ContainerId,
        from_slot: usize,
        limit: u32,
        to_slot: Option<usize>,
    ) -> u32 {
        let Some(key) = self.key_for(from_slot) else {
            warn!("{}: no item is mapped to virtual slot {from_slot}", self.id);
            return 0;
        };
        settle_move(
            &self.id,
            "exportItem",
            self.native.export_item(&key, limit, dest, to_slot),
        )
    }

    fn move_in(
        &self,
        src: &ContainerId,
        from_slot: usize,
        limit: u32,
        _to_slot: Option<usize>,
    ) -> u32 {
        settle_move(
            &self.id,
            "pullItems",
            self.native.pull_items(src, from_slot, limit, None),
        )
    }

    fn capacity_snapshot(&self) -> Result<CapacitySnapshot, AdapterError> {
        let capacity = self
            .native
            .network_capacity()
            .map_err(|e| self.native_err(e))?;
        let kinds = self.stock()?.iter().filter(|s| !s.is_empty()).count();
        Ok(CapacitySnapshot {
            total_slots: self.slot_count()?,
            used_slots: kinds,
            stored_items: capacity.used,
            max_items: Some(capacity.total),
        })
    }

    fn find_by_key(&self, key: &ItemKey) -> Result<Vec<(usize, u32)>, AdapterError> {
        let count = self
            .stock()?
            .into_iter()
            .filter(|s| s.key == *key)
            .map(|s| s.count)
            .sum::<u32>();
        if count == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![(self.slots.borrow_mut().assign(key), count)])
    }

    /// Networks store by identity; there is nothing to merge.
    fn consolidate(&self) -> usize {
        0
    }

    fn virtual_slot(&self, key: &ItemKey) -> Option<usize> {
        Some(self.slots.borrow_mut().assign(key))
    }
}
