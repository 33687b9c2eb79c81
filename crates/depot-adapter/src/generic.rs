use crate::adapter::{
    list_slots, settle_move, unavailable, AdapterKind, Capabilities, StorageAdapter, WrapOptions,
};
use crate::native::Inventory;
use crate::AdapterError;
use depot_schema::{ContainerId, ItemStack};
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::debug;

/// Slot-addressed container state shared by the generic, tiered and
/// upgradeable variants.
pub(crate) struct Slotted {
    pub(crate) id: ContainerId,
    pub(crate) native: Rc<dyn Inventory>,
    pub(crate) caps: Capabilities,
}

impl Slotted {
    /// Open the minimal primitive (`size`) and probe optional operations.
    pub(crate) fn probe(id: ContainerId, native: Rc<dyn Inventory>) -> Result<Self, AdapterError> {
        let size = native.size().map_err(|e| unavailable(&id, &e))?;
        let bulk_list = !matches!(native.list(), Err(e) if e.is_unsupported());
        let item_limit = size > 0 && !matches!(native.item_limit(0), Err(e) if e.is_unsupported());
        debug!("{id}: {size} slots, bulk_list={bulk_list}, item_limit={item_limit}");
        Ok(Self {
            id,
            native,
            caps: Capabilities {
                bulk_list,
                item_limit,
                ..Capabilities::default()
            },
        })
    }

    pub(crate) fn slot_count(&self) -> Result<usize, AdapterError> {
        self.native
            .size()
            .map_err(|e| AdapterError::from_native(&self.id, e))
    }

    pub(crate) fn list(&self) -> Result<BTreeMap<usize, ItemStack>, AdapterError> {
        list_slots(self.native.as_ref(), self.caps.bulk_list)
            .map_err(|e| AdapterError::from_native(&self.id, e))
    }

    pub(crate) fn detail(&self, slot: usize) -> Result<Option<ItemStack>, AdapterError> {
        self.native
            .item_detail(slot)
            .map(|s| s.filter(|s| !s.is_empty()))
            .map_err(|e| AdapterError::from_native(&self.id, e))
    }

    pub(crate) fn move_out(
        &self,
        dest: &ContainerId,
        from_slot: usize,
        limit: u32,
        to_slot: Option<usize>,
    ) -> u32 {
        settle_move(
            &self.id,
            "pushItems",
            self.native.push_items(dest, from_slot, limit, to_slot),
        )
    }

    pub(crate) fn move_in(
        &self,
        src: &ContainerId,
        from_slot: usize,
        limit: u32,
        to_slot: Option<usize>,
    ) -> u32 {
        settle_move(
            &self.id,
            "pullItems",
            self.native.pull_items(src, from_slot, limit, to_slot),
        )
    }
}

/// Plain container; emulates missing operations from per-slot queries.
pub struct GenericAdapter {
    core: Slotted,
    priority: i32,
}

impl GenericAdapter {
    pub fn probe(
        id: ContainerId,
        native: Rc<dyn Inventory>,
        options: &WrapOptions,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            core: Slotted::probe(id, native)?,
            priority: options.priority.unwrap_or(0),
        })
    }
}

impl StorageAdapter for GenericAdapter {
    fn id(&self) -> &ContainerId {
        &self.core.id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Generic
    }

    fn capabilities(&self) -> Capabilities {
        self.core.caps
    }

    fn priority(&self) -> i32 {
        self.priority
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

    /// The native limit is reported for 64-stackable items, so it is scaled
    /// to the item's own stack size.
    fn slot_limit(&self, slot: usize, max_stack: u32) -> Result<u32, AdapterError> {
        if !self.core.caps.item_limit {
            return Ok(max_stack);
        }
        let native_limit = self
            .core
            .native
            .item_limit(slot)
            .map_err(|e| AdapterError::from_native(&self.core.id, e))?;
        let scaled = u64::from(native_limit) * u64::from(max_stack) / 64;
        Ok(scaled.clamp(1, u64::from(u32::MAX)) as u32)
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ContainerSpec, MemoryHost};
    use crate::native::ContainerHost;

    fn generic(host: &MemoryHost, id: &str) -> GenericAdapter {
        let id = ContainerId::new(id);
        let native = host.open(&id).unwrap();
        GenericAdapter::probe(id, native, &WrapOptions::default()).unwrap()
    }

    #[test]
    fn probes_native_capabilities() {
        let host = MemoryHost::new();
        host.add_container("full", ContainerSpec::chest(27));
        host.add_container(
            "bare",
            ContainerSpec::chest(9).without_bulk_list().without_item_limit(),
        );

        let full = generic(&host, "full");
        assert!(full.capabilities().bulk_list);
        assert!(full.capabilities().item_limit);

        let bare = generic(&host, "bare");
        assert!(!bare.capabilities().bulk_list);
        assert!(!bare.capabilities().item_limit);
    }

    #[test]
    fn emulated_listing_matches_bulk_listing() {
        let host = MemoryHost::new();
        host.add_container("bare", ContainerSpec::chest(9).without_bulk_list());
        host.put("bare", 2, ItemStack::new("minecraft:stone", 12, 64));
        host.put("bare", 8, ItemStack::new("minecraft:torch", 40, 64));

        let bare = generic(&host, "bare");
        let slots = bare.list_occupied_slots().unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[&2].count, 12);
        assert_eq!(slots[&8].key.name, "minecraft:torch");
    }

    #[test]
    fn slot_limit_scales_with_stack_size() {
        let host = MemoryHost::new();
        host.add_container("c", ContainerSpec::chest(9));
        host.add_container("nolimit", ContainerSpec::chest(9).without_item_limit());
        let c = generic(&host, "c");
        assert_eq!(c.slot_limit(0, 64).unwrap(), 64);
        assert_eq!(c.slot_limit(0, 16).unwrap(), 16);
        assert_eq!(c.slot_limit(0, 1).unwrap(), 1);

        let nolimit = generic(&host, "nolimit");
        assert_eq!(nolimit.slot_limit(0, 16).unwrap(), 16);
    }

    #[test]
    fn moves_between_containers() {
        let host = MemoryHost::new();
        host.add_container("a", ContainerSpec::chest(9));
        host.add_container("b", ContainerSpec::chest(9));
        host.put("a", 0, ItemStack::new("minecraft:stone", 20, 64));

        let a = generic(&host, "a");
        let b = generic(&host, "b");
        assert_eq!(a.move_out(&ContainerId::new("b"), 0, 5, None), 5);
        assert_eq!(b.move_in(&ContainerId::new("a"), 0, 5, Some(3)), 5);
        assert_eq!(host.stack_at("a", 0).unwrap().count, 10);
        assert_eq!(host.count_in("b", &"minecraft:stone".into()), 10);
        assert_eq!(host.stack_at("b", 3).unwrap().count, 5);
    }

    #[test]
    fn failed_move_reports_zero() {
        let host = MemoryHost::new();
        host.add_container("a", ContainerSpec::chest(9));
        host.put("a", 0, ItemStack::new("minecraft:stone", 20, 64));
        let a = generic(&host, "a");
        assert_eq!(a.move_out(&ContainerId::new("missing"), 0, 5, None), 0);
        assert_eq!(host.stack_at("a", 0).unwrap().count, 20);
    }
}
