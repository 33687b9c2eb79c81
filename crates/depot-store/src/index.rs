use depot_schema::{ContainerId, ItemKey, ItemStack};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// One stack of an item in one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub container: ContainerId,
    pub slot: usize,
    pub count: u32,
    /// Most this slot can hold of the item.
    pub limit: u32,
}

impl Location {
    pub fn free(&self) -> u32 {
        self.limit.saturating_sub(self.count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: ItemKey,
    pub total: u64,
    pub stack_size: u32,
    /// Ordered by container, then slot.
    pub locations: Vec<Location>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSummary {
    pub key: ItemKey,
    pub total: u64,
    pub stack_size: u32,
}

/// Placement facts about one container, captured by its last scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub slot_count: usize,
    pub priority: i32,
    pub stack_multiplier: u32,
    /// Slots are per-item virtual slots rather than physical ones.
    pub virtual_slots: bool,
    /// Remaining item capacity for containers that count items.
    pub free_items: Option<u64>,
    pub locked: BTreeMap<usize, ItemKey>,
    pub voids_overflow: bool,
}

/// Confirmed change to one slot, produced by a finished move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotDelta {
    pub container: ContainerId,
    pub slot: usize,
    pub key: ItemKey,
    pub change: i64,
    pub stack_size: u32,
    pub limit: u32,
}

/// A delta that disagreed with the recorded slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub container: ContainerId,
    pub slot: usize,
    pub key: ItemKey,
    pub recorded: u32,
    pub change: i64,
}

/// Immutable aggregated view of every indexed container.
///
/// Snapshots are never mutated in place: a rebuild produces a fresh index
/// through [`IndexBuilder`], and confirmed moves produce a new index through
/// [`ItemIndex::with_deltas`]. For every entry `total` equals the sum of its
/// location counts, and no entry has a zero total.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemIndex {
    entries: BTreeMap<ItemKey, IndexEntry>,
    occupancy: BTreeMap<ContainerId, BTreeMap<usize, ItemKey>>,
    containers: BTreeMap<ContainerId, ContainerInfo>,
}

impl ItemIndex {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Every indexed item ordered by key.
    pub fn items(&self) -> Vec<ItemSummary> {
        self.entries
            .values()
            .map(|e| ItemSummary {
                key: e.key.clone(),
                total: e.total,
                stack_size: e.stack_size,
            })
            .collect()
    }

    pub fn get(&self, key: &ItemKey) -> Option<&IndexEntry> {
        self.entries.get(key)
    }

    pub fn total(&self, key: &ItemKey) -> u64 {
        self.entries.get(key).map_or(0, |e| e.total)
    }

    pub fn total_items(&self) -> u64 {
        self.entries.values().map(|e| e.total).sum()
    }

    /// Locations of `key`, fullest first, then by container and slot.
    pub fn withdraw_candidates(&self, key: &ItemKey) -> Vec<Location> {
        let Some(entry) = self.entries.get(key) else {
            return Vec::new();
        };
        let mut locations = entry.locations.clone();
        locations.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.container.cmp(&b.container))
                .then(a.slot.cmp(&b.slot))
        });
        locations
    }

    /// Locations of `key` with free room, highest container priority first,
    /// then fullest first.
    pub fn partial_stacks(&self, key: &ItemKey) -> Vec<Location> {
        let Some(entry) = self.entries.get(key) else {
            return Vec::new();
        };
        let mut partials: Vec<Location> = entry
            .locations
            .iter()
            .filter(|l| l.free() > 0)
            .cloned()
            .collect();
        partials.sort_by(|a, b| {
            self.priority_of(&b.container)
                .cmp(&self.priority_of(&a.container))
                .then(b.count.cmp(&a.count))
                .then_with(|| a.container.cmp(&b.container))
                .then(a.slot.cmp(&b.slot))
        });
        partials
    }

    /// Physical slots of `container` holding nothing. Containers with
    /// virtual slots never report empty slots.
    pub fn empty_slots(&self, container: &ContainerId) -> Vec<usize> {
        let Some(info) = self.containers.get(container) else {
            return Vec::new();
        };
        if info.virtual_slots {
            return Vec::new();
        }
        let occupied = self.occupancy.get(container);
        (0..info.slot_count)
            .filter(|slot| occupied.map_or(true, |o| !o.contains_key(slot)))
            .collect()
    }

    pub fn containers(&self) -> &BTreeMap<ContainerId, ContainerInfo> {
        &self.containers
    }

    pub fn container(&self, id: &ContainerId) -> Option<&ContainerInfo> {
        self.containers.get(id)
    }

    /// Item recorded in one slot, with its location.
    pub fn slot(&self, container: &ContainerId, slot: usize) -> Option<&Location> {
        let key = self.occupancy.get(container)?.get(&slot)?;
        self.entries
            .get(key)?
            .locations
            .iter()
            .find(|l| l.container == *container && l.slot == slot)
    }

    /// Every location recorded for `container`, with its key.
    pub fn locations_in(&self, container: &ContainerId) -> Vec<(ItemKey, Location)> {
        let Some(slots) = self.occupancy.get(container) else {
            return Vec::new();
        };
        slots
            .iter()
            .filter_map(|(slot, key)| {
                let entry = self.entries.get(key)?;
                entry
                    .locations
                    .iter()
                    .find(|l| l.container == *container && l.slot == *slot)
                    .map(|l| (key.clone(), l.clone()))
            })
            .collect()
    }

    fn priority_of(&self, container: &ContainerId) -> i32 {
        self.containers.get(container).map_or(0, |c| c.priority)
    }

    /// Apply confirmed slot changes, returning the new index and every delta
    /// that contradicted it. Negative results clamp to zero.
    pub fn with_deltas(&self, deltas: &[SlotDelta]) -> (ItemIndex, Vec<Discrepancy>) {
        let mut next = self.clone();
        let mut discrepancies = Vec::new();

        for delta in deltas {
            if delta.change == 0 {
                continue;
            }
            let occupant = next
                .occupancy
                .get(&delta.container)
                .and_then(|o| o.get(&delta.slot))
                .cloned();
            if occupant.as_ref().is_some_and(|k| *k != delta.key) {
                let recorded = next.slot(&delta.container, delta.slot).map_or(0, |l| l.count);
                warn!(
                    "{}[{}] holds another item than {}",
                    delta.container, delta.slot, delta.key
                );
                discrepancies.push(Discrepancy {
                    container: delta.container.clone(),
                    slot: delta.slot,
                    key: delta.key.clone(),
                    recorded,
                    change: delta.change,
                });
                continue;
            }

            let recorded = next.slot(&delta.container, delta.slot).map_or(0, |l| l.count);
            let mut count = i64::from(recorded) + delta.change;
            if count < 0 {
                warn!(
                    "{}[{}] recorded {recorded} of {} but lost {}",
                    delta.container,
                    delta.slot,
                    delta.key,
                    -delta.change
                );
                discrepancies.push(Discrepancy {
                    container: delta.container.clone(),
                    slot: delta.slot,
                    key: delta.key.clone(),
                    recorded,
                    change: delta.change,
                });
                count = 0;
            }
            next.set_slot(delta, count.min(i64::from(u32::MAX)) as u32);

            if let Some(info) = next.containers.get_mut(&delta.container) {
                if let Some(free) = info.free_items {
                    let change = delta.change.unsigned_abs();
                    info.free_items = Some(if delta.change > 0 {
                        free.saturating_sub(change)
                    } else {
                        free + change
                    });
                }
            }
        }
        (next, discrepancies)
    }

    fn set_slot(&mut self, delta: &SlotDelta, count: u32) {
        let entry = self
            .entries
            .entry(delta.key.clone())
            .or_insert_with(|| IndexEntry {
                key: delta.key.clone(),
                total: 0,
                stack_size: delta.stack_size,
                locations: Vec::new(),
            });
        let pos = entry
            .locations
            .iter()
            .position(|l| l.container == delta.container && l.slot == delta.slot);

        match (pos, count) {
            (Some(i), 0) => {
                entry.locations.remove(i);
            }
            (Some(i), _) => {
                let loc = &mut entry.locations[i];
                loc.count = count;
                if delta.limit > 0 {
                    loc.limit = delta.limit;
                }
            }
            (None, 0) => {}
            (None, _) => {
                let at = entry
                    .locations
                    .partition_point(|l| (&l.container, l.slot) < (&delta.container, delta.slot));
                entry.locations.insert(
                    at,
                    Location {
                        container: delta.container.clone(),
                        slot: delta.slot,
                        count,
                        limit: delta.limit.max(count),
                    },
                );
            }
        }
        entry.total = entry.locations.iter().map(|l| u64::from(l.count)).sum();
        if entry.locations.is_empty() {
            self.entries.remove(&delta.key);
        }

        if count == 0 {
            if let Some(slots) = self.occupancy.get_mut(&delta.container) {
                slots.remove(&delta.slot);
                if slots.is_empty() {
                    self.occupancy.remove(&delta.container);
                }
            }
        } else {
            self.occupancy
                .entry(delta.container.clone())
                .or_default()
                .insert(delta.slot, delta.key.clone());
        }
    }

    /// Returns every key whose total differs from the sum of its locations.
    pub fn check_totals(&self) -> Vec<ItemKey> {
        self.entries
            .values()
            .filter(|e| e.total != e.locations.iter().map(|l| u64::from(l.count)).sum::<u64>())
            .map(|e| e.key.clone())
            .collect()
    }
}

/// Accumulates scan results into a fresh index, separate from the live one.
#[derive(Debug, Default)]
pub struct IndexBuilder {
    index: ItemIndex,
    slots_recorded: usize,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_container(&mut self, id: ContainerId, info: ContainerInfo) {
        self.index.containers.insert(id, info);
    }

    /// Record one scanned slot. A second record for the same slot replaces
    /// the first.
    pub fn record_slot(&mut self, container: &ContainerId, slot: usize, stack: &ItemStack, limit: u32) {
        if stack.is_empty() {
            return;
        }
        let previous = self
            .index
            .occupancy
            .get(container)
            .and_then(|o| o.get(&slot))
            .cloned();
        if let Some(old_key) = previous {
            if let Some(entry) = self.index.entries.get_mut(&old_key) {
                entry
                    .locations
                    .retain(|l| !(l.container == *container && l.slot == slot));
                if entry.locations.is_empty() {
                    self.index.entries.remove(&old_key);
                }
            }
        }

        let entry = self
            .index
            .entries
            .entry(stack.key.clone())
            .or_insert_with(|| IndexEntry {
                key: stack.key.clone(),
                total: 0,
                stack_size: stack.max_stack,
                locations: Vec::new(),
            });
        entry.locations.push(Location {
            container: container.clone(),
            slot,
            count: stack.count,
            limit: limit.max(stack.count),
        });
        self.index
            .occupancy
            .entry(container.clone())
            .or_default()
            .insert(slot, stack.key.clone());
        self.slots_recorded += 1;
    }

    /// Copy everything `old` knew about `container` into the new index.
    /// Used when a container could not be scanned.
    pub fn carry_over(&mut self, container: &ContainerId, old: &ItemIndex) {
        if let Some(info) = old.containers.get(container) {
            self.index.containers.insert(container.clone(), info.clone());
        }
        for (key, loc) in old.locations_in(container) {
            let stack_size = old.get(&key).map_or(64, |e| e.stack_size);
            let stack = ItemStack {
                key,
                count: loc.count,
                max_stack: stack_size,
            };
            self.record_slot(container, loc.slot, &stack, loc.limit);
        }
    }

    pub fn slots_recorded(&self) -> usize {
        self.slots_recorded
    }

    pub fn finish(mut self) -> ItemIndex {
        for entry in self.index.entries.values_mut() {
            entry
                .locations
                .sort_by(|a, b| a.container.cmp(&b.container).then(a.slot.cmp(&b.slot)));
            entry.total = entry.locations.iter().map(|l| u64::from(l.count)).sum();
        }
        self.index.entries.retain(|_, e| e.total > 0);
        self.index
    }
}
