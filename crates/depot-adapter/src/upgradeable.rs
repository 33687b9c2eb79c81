use crate::adapter::{AdapterKind, Capabilities, StorageAdapter, WrapOptions};
use crate::generic::Slotted;
use crate::native::Inventory;
use crate::AdapterError;
use depot_schema::{ContainerId, ItemKey, ItemStack};
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, warn};

/// Drawer/barrel style container with stack upgrades, slot locking,
/// void-on-overflow and its own placement priority.
pub struct UpgradeableAdapter {
    core: Slotted,
    priority: i32,
    multiplier: u32,
    voids: bool,
}

impl UpgradeableAdapter {
    pub fn new(
        id: ContainerId,
        native: Rc<dyn Inventory>,
        options: &WrapOptions,
    ) -> Result<Self, AdapterError> {
        let mut core = Slotted::probe(id, native)?;
        let native = Rc::clone(&core.native);

        let priority = options
            .priority
            .or_else(|| native.priority().ok())
            .unwrap_or(0);
        let multiplier = native.stack_multiplier().unwrap_or(1).max(1);
        let voids = native.voids_overflow().unwrap_or(false);
        core.caps.slot_locking = native.locked_slots().is_ok();
        core.caps.void_overflow = voids;
        debug!(
            "{}: upgradeable x{multiplier}, priority {priority}, voids={voids}",
            core.id
        );

        Ok(Self {
            core,
            priority,
            multiplier,
            voids,
        })
    }
}

impl StorageAdapter for UpgradeableAdapter {
    fn id(&self) -> &ContainerId {
        &self.core.id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Upgradeable
    }

    fn capabilities(&self) -> Capabilities {
        self.core.caps
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn stack_multiplier(&self) -> u32 {
        self.multiplier
    }

    fn slot_count(&self) -> Result<usize, AdapterError> {
        self.core.slot_count()
    }

    fn list_occupied_slots(&self) -> Result<BTreeMap<usize, ItemStack>, AdapterError> {
        self.core.list()
    }

    fn slot_detail(&self, slot: usize) -> Result<Option<ItemStack>, AdapterError> {
        self.core.detail(slot)
    }

    fn slot_limit(&self, _slot: usize, max_stack: u32) -> Result<u32, AdapterError> {
        Ok(max_stack.saturating_mul(self.multiplier))
    }

    fn move_out(
        &self,
        dest: &ContainerId,
        from_slot: usize,
        limit: u32,
        to_slot: Option<usize>,
    ) -> u32 {
        self.core.move_out(dest, from_slot, limit, to_slot)
    }

    fn move_in(
        &self,
        src: &ContainerId,
        from_slot: usize,
        limit: u32,
        to_slot: Option<usize>,
    ) -> u32 {
        self.core.move_in(src, from_slot, limit, to_slot)
    }

    fn locked_slots(&self) -> BTreeMap<usize, ItemKey> {
        if !self.core.caps.slot_locking {
            return BTreeMap::new();
        }
        match self.core.native.locked_slots() {
            Ok(locked) => locked,
            Err(e) => {
                warn!("reading slot locks on {} failed: {e}", self.core.id);
                BTreeMap::new()
            }
        }
    }

    fn lock_slot(&self, slot: usize, key: Option<ItemKey>) -> Result<(), AdapterError> {
        self.core
            .native
            .set_slot_lock(slot, key)
            .map_err(|e| AdapterError::from_native(&self.core.id, e))
    }

    fn voids_overflow(&self) -> bool {
        self.voids
    }
}
