//! In-memory container host.
//!
//! Simulates a set of backing containers (plain chests, tiered chests,
//! upgradeable drawers, storage networks) with the same capability gaps and
//! move semantics as real ones. Used by tests and the stress harness.

use crate::native::{ContainerHost, Inventory, NativeError, NetworkCapacity};
use crate::tiered::Tier;
use depot_schema::{ContainerId, ItemKey, ItemStack};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub type_tag: String,
    pub size: usize,
    pub bulk_list: bool,
    pub item_limit: bool,
    pub stack_multiplier: u32,
    pub upgradeable: bool,
    pub void_overflow: bool,
    pub priority: Option<i32>,
    /// Item capacity; `Some` makes this a storage network.
    pub network_capacity: Option<u64>,
}

impl ContainerSpec {
    pub fn chest(size: usize) -> Self {
        Self {
            type_tag: "minecraft:chest".to_owned(),
            size,
            bulk_list: true,
            item_limit: true,
            stack_multiplier: 1,
            upgradeable: false,
            void_overflow: false,
            priority: None,
            network_capacity: None,
        }
    }

    pub fn tiered(type_tag: &str, size: usize) -> Self {
        let path = type_tag.split_once(':').map_or(type_tag, |(_, p)| p);
        Self {
            type_tag: type_tag.to_owned(),
            stack_multiplier: Tier::from_path(path).map_or(1, Tier::multiplier),
            ..Self::chest(size)
        }
    }

    pub fn upgradeable(type_tag: &str, size: usize, stack_multiplier: u32) -> Self {
        Self {
            type_tag: type_tag.to_owned(),
            stack_multiplier,
            upgradeable: true,
            ..Self::chest(size)
        }
    }

    pub fn network(capacity: u64) -> Self {
        Self {
            type_tag: "ae2:me_interface".to_owned(),
            size: 0,
            bulk_list: false,
            item_limit: false,
            network_capacity: Some(capacity),
            ..Self::chest(0)
        }
    }

    #[must_use]
    pub fn with_tag(mut self, type_tag: &str) -> Self {
        type_tag.clone_into(&mut self.type_tag);
        self
    }

    #[must_use]
    pub fn without_bulk_list(mut self) -> Self {
        self.bulk_list = false;
        self
    }

    #[must_use]
    pub fn without_item_limit(mut self) -> Self {
        self.item_limit = false;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn voiding(mut self) -> Self {
        self.void_overflow = true;
        self
    }
}

#[derive(Debug)]
enum Contents {
    Slots {
        slots: Vec<Option<ItemStack>>,
        locks: BTreeMap<usize, ItemKey>,
    },
    Network {
        items: BTreeMap<ItemKey, (u64, u32)>,
        capacity: u64,
    },
}

#[derive(Debug)]
struct Container {
    spec: ContainerSpec,
    contents: Contents,
    attached: bool,
    refusing: bool,
}

impl Container {
    fn new(spec: ContainerSpec) -> Self {
        let contents = match spec.network_capacity {
            Some(capacity) => Contents::Network {
                items: BTreeMap::new(),
                capacity,
            },
            None => Contents::Slots {
                slots: vec![None; spec.size],
                locks: BTreeMap::new(),
            },
        };
        Self {
            spec,
            contents,
            attached: true,
            refusing: false,
        }
    }

    /// Store up to `stack.count` items. Returns how many items the
    /// container took, including any it voided.
    fn insert(&mut self, stack: &ItemStack, to_slot: Option<usize>) -> Result<u32, NativeError> {
        let multiplier = self.spec.stack_multiplier;
        let voids = self.spec.void_overflow;
        match &mut self.contents {
            Contents::Network { items, capacity } => {
                let used: u64 = items.values().map(|(c, _)| *c).sum();
                let room = capacity.saturating_sub(used);
                let stored = u64::from(stack.count).min(room);
                if stored > 0 {
                    let entry = items
                        .entry(stack.key.clone())
                        .or_insert((0, stack.max_stack));
                    entry.0 += stored;
                }
                Ok(stored as u32)
            }
            Contents::Slots { slots, locks } => {
                let cap = stack.max_stack.saturating_mul(multiplier);
                let accepts = |slot: usize, current: &Option<ItemStack>| -> bool {
                    if locks.get(&slot).is_some_and(|k| *k != stack.key) {
                        return false;
                    }
                    current.as_ref().map_or(true, |c| c.key == stack.key)
                };

                let order: Vec<usize> = match to_slot {
                    Some(slot) => {
                        if slot >= slots.len() {
                            return Err(NativeError::SlotOutOfRange {
                                slot,
                                size: slots.len(),
                            });
                        }
                        vec![slot]
                    }
                    None => {
                        let partials = (0..slots.len()).filter(|s| {
                            slots[*s].as_ref().is_some_and(|c| c.key == stack.key)
                        });
                        let empties = (0..slots.len()).filter(|s| slots[*s].is_none());
                        partials.chain(empties).collect()
                    }
                };

                let mut remaining = stack.count;
                let mut matched = false;
                for slot in order {
                    if remaining == 0 {
                        break;
                    }
                    if !accepts(slot, &slots[slot]) {
                        continue;
                    }
                    matched = true;
                    let current = slots[slot].as_ref().map_or(0, |c| c.count);
                    let put = cap.saturating_sub(current).min(remaining);
                    if put == 0 {
                        continue;
                    }
                    slots[slot] = Some(ItemStack {
                        key: stack.key.clone(),
                        count: current + put,
                        max_stack: stack.max_stack,
                    });
                    remaining -= put;
                }

                if voids && matched {
                    Ok(stack.count)
                } else {
                    Ok(stack.count - remaining)
                }
            }
        }
    }

    fn take_from_slot(&mut self, slot: usize, amount: u32) {
        if let Contents::Slots { slots, .. } = &mut self.contents {
            if let Some(Some(stack)) = slots.get_mut(slot) {
                stack.count -= amount.min(stack.count);
                if stack.count == 0 {
                    slots[slot] = None;
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct World {
    containers: BTreeMap<ContainerId, Container>,
}

impl World {
    fn get(&self, id: &ContainerId) -> Result<&Container, NativeError> {
        let c = self
            .containers
            .get(id)
            .ok_or_else(|| NativeError::NotFound(id.to_string()))?;
        if !c.attached {
            return Err(NativeError::Detached(id.to_string()));
        }
        Ok(c)
    }

    fn get_mut(&mut self, id: &ContainerId) -> Result<&mut Container, NativeError> {
        let c = self
            .containers
            .get_mut(id)
            .ok_or_else(|| NativeError::NotFound(id.to_string()))?;
        if !c.attached {
            return Err(NativeError::Detached(id.to_string()));
        }
        Ok(c)
    }

    fn transfer(
        &mut self,
        src: &ContainerId,
        from_slot: usize,
        dst: &ContainerId,
        to_slot: Option<usize>,
        limit: u32,
    ) -> Result<u32, NativeError> {
        let source = self.get(src)?;
        let refused = source.refusing || self.get(dst)?.refusing;
        let stack = match &source.contents {
            Contents::Slots { slots, .. } => match slots.get(from_slot) {
                Some(Some(stack)) => stack.clone(),
                Some(None) => return Ok(0),
                None => {
                    return Err(NativeError::SlotOutOfRange {
                        slot: from_slot,
                        size: slots.len(),
                    })
                }
            },
            Contents::Network { .. } => return Err(NativeError::Unsupported("pushItems")),
        };
        if refused || limit == 0 || (src == dst && to_slot == Some(from_slot)) {
            return Ok(0);
        }

        let offered = ItemStack {
            count: limit.min(stack.count),
            ..stack
        };
        let accepted = self.get_mut(dst)?.insert(&offered, to_slot)?;
        self.get_mut(src)?.take_from_slot(from_slot, accepted);
        Ok(accepted)
    }

    fn export(
        &mut self,
        src: &ContainerId,
        key: &ItemKey,
        limit: u32,
        dst: &ContainerId,
        to_slot: Option<usize>,
    ) -> Result<u32, NativeError> {
        let source = self.get(src)?;
        let refused = source.refusing || self.get(dst)?.refusing;
        let Contents::Network { items, .. } = &source.contents else {
            return Err(NativeError::Unsupported("exportItem"));
        };
        let Some((available, max_stack)) = items.get(key).copied() else {
            return Ok(0);
        };
        if refused {
            return Ok(0);
        }

        let offered = ItemStack {
            key: key.clone(),
            count: u64::from(limit).min(available) as u32,
            max_stack,
        };
        let accepted = self.get_mut(dst)?.insert(&offered, to_slot)?;
        if let Contents::Network { items, .. } = &mut self.get_mut(src)?.contents {
            if let Some(entry) = items.get_mut(key) {
                entry.0 -= u64::from(accepted).min(entry.0);
                if entry.0 == 0 {
                    items.remove(key);
                }
            }
        }
        Ok(accepted)
    }
}

/// In-memory [`ContainerHost`]. Cloning shares the same world.
#[derive(Debug, Clone, Default)]
pub struct MemoryHost {
    world: Rc<RefCell<World>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_container(&self, id: impl Into<ContainerId>, spec: ContainerSpec) {
        self.world
            .borrow_mut()
            .containers
            .insert(id.into(), Container::new(spec));
    }

    pub fn remove_container(&self, id: &str) {
        self.world
            .borrow_mut()
            .containers
            .remove(&ContainerId::new(id));
    }

    /// Overwrite one slot. Panics on unknown containers or slots; test setup only.
    pub fn put(&self, id: &str, slot: usize, stack: ItemStack) {
        let mut world = self.world.borrow_mut();
        let container = world
            .containers
            .get_mut(&ContainerId::new(id))
            .unwrap_or_else(|| panic!("no container '{id}'"));
        match &mut container.contents {
            Contents::Slots { slots, .. } => slots[slot] = (!stack.is_empty()).then_some(stack),
            Contents::Network { .. } => panic!("'{id}' is a network; use put_network"),
        }
    }

    /// Add items to a network. Panics on non-network containers; test setup only.
    pub fn put_network(&self, id: &str, stack: ItemStack) {
        let mut world = self.world.borrow_mut();
        let container = world
            .containers
            .get_mut(&ContainerId::new(id))
            .unwrap_or_else(|| panic!("no container '{id}'"));
        match &mut container.contents {
            Contents::Network { items, .. } => {
                let entry = items.entry(stack.key).or_insert((0, stack.max_stack));
                entry.0 += u64::from(stack.count);
            }
            Contents::Slots { .. } => panic!("'{id}' is not a network"),
        }
    }

    pub fn clear_slot(&self, id: &str, slot: usize) {
        let mut world = self.world.borrow_mut();
        if let Some(Container {
            contents: Contents::Slots { slots, .. },
            ..
        }) = world.containers.get_mut(&ContainerId::new(id))
        {
            if let Some(s) = slots.get_mut(slot) {
                *s = None;
            }
        }
    }

    pub fn stack_at(&self, id: &str, slot: usize) -> Option<ItemStack> {
        let world = self.world.borrow();
        match &world.containers.get(&ContainerId::new(id))?.contents {
            Contents::Slots { slots, .. } => slots.get(slot).cloned().flatten(),
            Contents::Network { .. } => None,
        }
    }

    pub fn count_in(&self, id: &str, key: &ItemKey) -> u64 {
        let world = self.world.borrow();
        world
            .containers
            .get(&ContainerId::new(id))
            .map_or(0, |c| count_key(c, key))
    }

    /// Physical totals per key across every container not in `exclude`.
    pub fn totals(&self, exclude: &[&str]) -> BTreeMap<ItemKey, u64> {
        let world = self.world.borrow();
        let mut totals = BTreeMap::new();
        for (id, container) in &world.containers {
            if exclude.contains(&id.as_str()) {
                continue;
            }
            match &container.contents {
                Contents::Slots { slots, .. } => {
                    for stack in slots.iter().flatten() {
                        *totals.entry(stack.key.clone()).or_insert(0) += u64::from(stack.count);
                    }
                }
                Contents::Network { items, .. } => {
                    for (key, (count, _)) in items {
                        *totals.entry(key.clone()).or_insert(0) += count;
                    }
                }
            }
        }
        totals
    }

    /// Make every move touching `id` report zero without failing.
    pub fn set_refusing(&self, id: &str, refusing: bool) {
        if let Some(c) = self
            .world
            .borrow_mut()
            .containers
            .get_mut(&ContainerId::new(id))
        {
            c.refusing = refusing;
        }
    }

    pub fn detach(&self, id: &str) {
        if let Some(c) = self
            .world
            .borrow_mut()
            .containers
            .get_mut(&ContainerId::new(id))
        {
            c.attached = false;
        }
    }

    pub fn attach(&self, id: &str) {
        if let Some(c) = self
            .world
            .borrow_mut()
            .containers
            .get_mut(&ContainerId::new(id))
        {
            c.attached = true;
        }
    }
}

fn count_key(container: &Container, key: &ItemKey) -> u64 {
    match &container.contents {
        Contents::Slots { slots, .. } => slots
            .iter()
            .flatten()
            .filter(|s| s.key == *key)
            .map(|s| u64::from(s.count))
            .sum(),
        Contents::Network { items, .. } => items.get(key).map_or(0, |(c, _)| *c),
    }
}

impl ContainerHost for MemoryHost {
    fn container_ids(&self) -> Vec<ContainerId> {
        self.world.borrow().containers.keys().cloned().collect()
    }

    fn open(&self, id: &ContainerId) -> Result<Rc<dyn Inventory>, NativeError> {
        self.world.borrow().get(id)?;
        Ok(Rc::new(MemoryInventory {
            id: id.clone(),
            world: Rc::clone(&self.world),
        }))
    }
}

struct MemoryInventory {
    id: ContainerId,
    world: Rc<RefCell<World>>,
}

impl MemoryInventory {
    fn with<T>(
        &self,
        f: impl FnOnce(&Container) -> Result<T, NativeError>,
    ) -> Result<T, NativeError> {
        let world = self.world.borrow();
        f(world.get(&self.id)?)
    }

    fn with_mut<T>(
        &self,
        f: impl FnOnce(&mut Container) -> Result<T, NativeError>,
    ) -> Result<T, NativeError> {
        let mut world = self.world.borrow_mut();
        f(world.get_mut(&self.id)?)
    }
}

impl Inventory for MemoryInventory {
    fn type_tag(&self) -> Result<String, NativeError> {
        self.with(|c| Ok(c.spec.type_tag.clone()))
    }

    fn size(&self) -> Result<usize, NativeError> {
        self.with(|c| match &c.contents {
            Contents::Slots { slots, .. } => Ok(slots.len()),
            Contents::Network { .. } => Err(NativeError::Unsupported("size")),
        })
    }

    fn list(&self) -> Result<BTreeMap<usize, ItemStack>, NativeError> {
        self.with(|c| match &c.contents {
            Contents::Slots { slots, .. } if c.spec.bulk_list => Ok(slots
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.clone().map(|s| (i, s)))
                .collect()),
            _ => Err(NativeError::Unsupported("list")),
        })
    }

    fn item_detail(&self, slot: usize) -> Result<Option<ItemStack>, NativeError> {
        self.with(|c| match &c.contents {
            Contents::Slots { slots, .. } => {
                slots
                    .get(slot)
                    .cloned()
                    .ok_or(NativeError::SlotOutOfRange {
                        slot,
                        size: slots.len(),
                    })
            }
            Contents::Network { .. } => Err(NativeError::Unsupported("getItemDetail")),
        })
    }

    fn item_limit(&self, slot: usize) -> Result<u32, NativeError> {
        self.with(|c| match &c.contents {
            Contents::Slots { slots, .. } if c.spec.item_limit => {
                if slot >= slots.len() {
                    return Err(NativeError::SlotOutOfRange {
                        slot,
                        size: slots.len(),
                    });
                }
                Ok(64 * c.spec.stack_multiplier)
            }
            _ => Err(NativeError::Unsupported("getItemLimit")),
        })
    }

    fn push_items(
        &self,
        to: &ContainerId,
        from_slot: usize,
        limit: u32,
        to_slot: Option<usize>,
    ) -> Result<u32, NativeError> {
        self.world
            .borrow_mut()
            .transfer(&self.id, from_slot, to, to_slot, limit)
    }

    fn pull_items(
        &self,
        from: &ContainerId,
        from_slot: usize,
        limit: u32,
        to_slot: Option<usize>,
    ) -> Result<u32, NativeError> {
        self.world
            .borrow_mut()
            .transfer(from, from_slot, &self.id, to_slot, limit)
    }

    fn locked_slots(&self) -> Result<BTreeMap<usize, ItemKey>, NativeError> {
        self.with(|c| match &c.contents {
            Contents::Slots { locks, .. } if c.spec.upgradeable => Ok(locks.clone()),
            _ => Err(NativeError::Unsupported("getLockedSlots")),
        })
    }

    fn set_slot_lock(&self, slot: usize, key: Option<ItemKey>) -> Result<(), NativeError> {
        self.with_mut(|c| {
            let upgradeable = c.spec.upgradeable;
            match &mut c.contents {
                Contents::Slots { slots, locks } if upgradeable => {
                    if slot >= slots.len() {
                        return Err(NativeError::SlotOutOfRange {
                            slot,
                            size: slots.len(),
                        });
                    }
                    match key {
                        Some(key) => locks.insert(slot, key),
                        None => locks.remove(&slot),
                    };
                    Ok(())
                }
                _ => Err(NativeError::Unsupported("setSlotLock")),
            }
        })
    }

    fn voids_overflow(&self) -> Result<bool, NativeError> {
        self.with(|c| {
            if c.spec.upgradeable {
                Ok(c.spec.void_overflow)
            } else {
                Err(NativeError::Unsupported("isVoiding"))
            }
        })
    }

    fn priority(&self) -> Result<i32, NativeError> {
        self.with(|c| {
            if c.spec.upgradeable {
                Ok(c.spec.priority.unwrap_or(0))
            } else {
                Err(NativeError::Unsupported("getPriority"))
            }
        })
    }

    fn stack_multiplier(&self) -> Result<u32, NativeError> {
        self.with(|c| {
            if c.spec.upgradeable {
                Ok(c.spec.stack_multiplier)
            } else {
                Err(NativeError::Unsupported("getStackMultiplier"))
            }
        })
    }

    fn network_items(&self) -> Result<Vec<ItemStack>, NativeError> {
        self.with(|c| match &c.contents {
            Contents::Network { items, .. } => Ok(items
                .iter()
                .map(|(key, (count, max_stack))| ItemStack {
                    key: key.clone(),
                    count: (*count).min(u64::from(u32::MAX)) as u32,
                    max_stack: *max_stack,
                })
                .collect()),
            Contents::Slots { .. } => Err(NativeError::Unsupported("listItems")),
        })
    }

    fn export_item(
        &self,
        key: &ItemKey,
        limit: u32,
        to: &ContainerId,
        to_slot: Option<usize>,
    ) -> Result<u32, NativeError> {
        self.world
            .borrow_mut()
            .export(&self.id, key, limit, to, to_slot)
    }

    fn network_capacity(&self) -> Result<NetworkCapacity, NativeError> {
        self.with(|c| match &c.contents {
            Contents::Network { items, capacity } => Ok(NetworkCapacity {
                used: items.values().map(|(count, _)| *count).sum(),
                total: *capacity,
            }),
            Contents::Slots { .. } => Err(NativeError::Unsupported("getCapacity")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ContainerId {
        ContainerId::new(s)
    }

    #[test]
    fn undirected_insert_fills_partials_first() {
        let host = MemoryHost::new();
        host.add_container("src", ContainerSpec::chest(1));
        host.add_container("dst", ContainerSpec::chest(3));
        host.put("dst", 2, ItemStack::new("minecraft:stone", 60, 64));
        host.put("src", 0, ItemStack::new("minecraft:stone", 10, 64));

        let src = host.open(&id("src")).unwrap();
        assert_eq!(src.push_items(&id("dst"), 0, 10, None).unwrap(), 10);
        assert_eq!(host.stack_at("dst", 2).unwrap().count, 64);
        assert_eq!(host.stack_at("dst", 0).unwrap().count, 6);
    }

    #[test]
    fn directed_insert_respects_stack_size() {
        let host = MemoryHost::new();
        host.add_container("src", ContainerSpec::chest(1));
        host.add_container("dst", ContainerSpec::chest(1));
        host.put("src", 0, ItemStack::new("minecraft:ender_pearl", 16, 16));
        host.put("dst", 0, ItemStack::new("minecraft:ender_pearl", 10, 16));

        let src = host.open(&id("src")).unwrap();
        assert_eq!(src.push_items(&id("dst"), 0, 16, Some(0)).unwrap(), 6);
        assert_eq!(host.stack_at("src", 0).unwrap().count, 10);
    }

    #[test]
    fn occupied_slot_rejects_other_key() {
        let host = MemoryHost::new();
        host.add_container("src", ContainerSpec::chest(1));
        host.add_container("dst", ContainerSpec::chest(1));
        host.put("src", 0, ItemStack::new("minecraft:stone", 5, 64));
        host.put("dst", 0, ItemStack::new("minecraft:dirt", 5, 64));
        let src = host.open(&id("src")).unwrap();
        assert_eq!(src.push_items(&id("dst"), 0, 5, Some(0)).unwrap(), 0);
    }

    #[test]
    fn refusing_container_moves_nothing() {
        let host = MemoryHost::new();
        host.add_container("src", ContainerSpec::chest(1));
        host.add_container("dst", ContainerSpec::chest(1));
        host.put("src", 0, ItemStack::new("minecraft:stone", 5, 64));
        host.set_refusing("dst", true);
        let src = host.open(&id("src")).unwrap();
        assert_eq!(src.push_items(&id("dst"), 0, 5, None).unwrap(), 0);
        host.set_refusing("dst", false);
        assert_eq!(src.push_items(&id("dst"), 0, 5, None).unwrap(), 5);
    }

    #[test]
    fn detached_container_errors() {
        let host = MemoryHost::new();
        host.add_container("c", ContainerSpec::chest(1));
        let c = host.open(&id("c")).unwrap();
        host.detach("c");
        assert!(matches!(c.size(), Err(NativeError::Detached(_))));
        host.attach("c");
        assert_eq!(c.size().unwrap(), 1);
    }

    #[test]
    fn removed_container_is_gone() {
        let host = MemoryHost::new();
        host.add_container("a", ContainerSpec::chest(1));
        host.add_container("b", ContainerSpec::chest(1));
        let b = host.open(&id("b")).unwrap();
        host.remove_container("b");
        assert_eq!(host.container_ids(), vec![id("a")]);
        assert!(matches!(host.open(&id("b")), Err(NativeError::NotFound(_))));
        assert!(matches!(b.size(), Err(NativeError::NotFound(_))));
    }

    #[test]
    fn network_respects_capacity() {
        let host = MemoryHost::new();
        host.add_container("me", ContainerSpec::network(50));
        host.add_container("src", ContainerSpec::chest(1));
        host.put("src", 0, ItemStack::new("minecraft:stone", 64, 64));
        let me = host.open(&id("me")).unwrap();
        assert_eq!(me.pull_items(&id("src"), 0, 64, None).unwrap(), 50);
        assert_eq!(host.stack_at("src", 0).unwrap().count, 14);
        assert_eq!(me.network_capacity().unwrap().free(), 0);
    }

    #[test]
    fn totals_skip_excluded_containers() {
        let host = MemoryHost::new();
        host.add_container("a", ContainerSpec::chest(2));
        host.add_container("b", ContainerSpec::chest(2));
        host.add_container("me", ContainerSpec::network(1_000));
        host.put("a", 0, ItemStack::new("minecraft:stone", 5, 64));
        host.put("b", 0, ItemStack::new("minecraft:stone", 7, 64));
        host.put_network("me", ItemStack::new("minecraft:stone", 100, 64));
        let totals = host.totals(&["b"]);
        assert_eq!(totals[&ItemKey::new("minecraft:stone")], 105);
    }
}
