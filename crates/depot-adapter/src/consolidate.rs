use crate::adapter::StorageAdapter;
use depot_schema::ItemKey;
use std::collections::BTreeMap;
use tracing::{debug, warn};

struct Member {
    slot: usize,
    count: u32,
    limit: u32,
}

/// Merge partial stacks of identical keys into the fewest slots.
///
/// Per key, members are sorted by count ascending; the emptiest slot is
/// drained into the fullest slot that still has room, until the two
/// cursors meet. Returns the number of moves that transferred items.
pub fn consolidate_slots<A: StorageAdapter + ?Sized>(adapter: &A) -> usize {
    let occupied = match adapter.list_occupied_slots() {
        Ok(slots) => slots,
        Err(e) => {
            warn!("consolidate: cannot list {}: {e}", adapter.id());
            return 0;
        }
    };

    let mut groups: BTreeMap<ItemKey, Vec<Member>> = BTreeMap::new();
    for (slot, stack) in occupied {
        let limit = adapter
            .slot_limit(slot, stack.max_stack)
            .unwrap_or_else(|_| stack.max_stack.saturating_mul(adapter.stack_multiplier()));
        groups.entry(stack.key).or_default().push(Member {
            slot,
            count: stack.count,
            limit,
        });
    }

    let id = adapter.id().clone();
    let mut moves = 0;
    for (key, mut members) in groups {
        if members.len() < 2 {
            continue;
        }
        members.sort_by(|a, b| a.count.cmp(&b.count).then(a.slot.cmp(&b.slot)));

        let (mut src, mut dst) = (0, members.len() - 1);
        while src < dst {
            if members[src].count == 0 {
                src += 1;
                continue;
            }
            let room = members[dst].limit.saturating_sub(members[dst].count);
            if room == 0 {
                dst -= 1;
                continue;
            }
            let want = room.min(members[src].count);
            let moved = adapter.move_out(&id, members[src].slot, want, Some(members[dst].slot));
            if moved == 0 {
                debug!(
                    "consolidate {key} on {id}: slot {} refused, skipping",
                    members[src].slot
                );
                src += 1;
                continue;
            }
            members[src].count -= moved.min(members[src].count);
            members[dst].count += moved;
            moves += 1;
        }
    }

    if moves > 0 {
        debug!("consolidated {id} in {moves} moves");
    }
    moves
}

#[cfg(test)]
mod tests {
    use crate::adapter::{wrap, WrapOptions};
    use crate::memory::{ContainerSpec, MemoryHost};
    use depot_schema::{ContainerId, ItemKey, ItemStack};

    #[test]
    fn merges_two_partials_in_one_move() {
        let host = MemoryHost::new();
        host.add_container("c", ContainerSpec::chest(2));
        host.put("c", 0, ItemStack::new("minecraft:stone", 3, 64));
        host.put("c", 1, ItemStack::new("minecraft:stone", 61, 64));

        let adapter = wrap(&host, &ContainerId::new("c"), &WrapOptions::default()).unwrap();
        assert_eq!(adapter.consolidate(), 1);
        assert!(host.stack_at("c", 0).is_none());
        assert_eq!(host.stack_at("c", 1).unwrap().count, 64);
    }

    #[test]
    fn leaves_distinct_keys_alone() {
        let host = MemoryHost::new();
        host.add_container("c", ContainerSpec::chest(3));
        host.put("c", 0, ItemStack::new("minecraft:stone", 3, 64));
        host.put("c", 1, ItemStack::new("minecraft:dirt", 3, 64));
        host.put(
            "c",
            2,
            ItemStack::new(ItemKey::new("minecraft:stone").with_signature("polished"), 3, 64),
        );

        let adapter = wrap(&host, &ContainerId::new("c"), &WrapOptions::default()).unwrap();
        assert_eq!(adapter.consolidate(), 0);
    }

    #[test]
    fn spreads_small_sources_over_fullest_targets() {
        let host = MemoryHost::new();
        host.add_container("c", ContainerSpec::chest(4));
        host.put("c", 0, ItemStack::new("minecraft:stone", 10, 64));
        host.put("c", 1, ItemStack::new("minecraft:stone", 60, 64));
        host.put("c", 2, ItemStack::new("minecraft:stone", 50, 64));
        host.put("c", 3, ItemStack::new("minecraft:stone", 5, 64));

        let adapter = wrap(&host, &ContainerId::new("c"), &WrapOptions::default()).unwrap();
        let moves = adapter.consolidate();
        assert!(moves >= 2);
        assert_eq!(host.count_in("c", &"minecraft:stone".into()), 125);
        let occupied = (0..4).filter(|s| host.stack_at("c", *s).is_some()).count();
        assert_eq!(occupied, 2);
    }

    #[test]
    fn tiered_limits_are_respected() {
        let host = MemoryHost::new();
        host.add_container("t", ContainerSpec::tiered("ironchest:copper_chest", 2));
        host.put("t", 0, ItemStack::new("minecraft:stone", 100, 64));
        host.put("t", 1, ItemStack::new("minecraft:stone", 20, 64));

        let adapter = wrap(&host, &ContainerId::new("t"), &WrapOptions::default()).unwrap();
        assert_eq!(adapter.consolidate(), 1);
        assert_eq!(host.stack_at("t", 0).unwrap().count, 120);
        assert!(host.stack_at("t", 1).is_none());
    }
}
