//! Storage service: the aggregated item index and the operations that keep
//! it in step with the backing containers.
//!
//! Every physical move runs as a scheduler task; the service awaits the
//! confirmed counts and then replaces the live index in one step through
//! [`ItemIndex::with_deltas`]. Rebuilds scan into a separate
//! [`IndexBuilder`] and swap the whole snapshot when every scan is in.

use crate::concurrency::OperationGate;
use crate::context::Context;
use crate::discovery::Discovery;
use chrono::{DateTime, Utc};
use depot_adapter::{AdapterKind, Capabilities, StorageAdapter};
use depot_runtime::{yield_now, EventBus, Scheduler, TaskError, TaskHandle};
use depot_schema::{ContainerId, ItemKey, ItemStack, POOL_INDEX, POOL_IO, POOL_NET};
use depot_store::{
    ContainerInfo, Discrepancy, IndexBuilder, IndexEntry, ItemIndex, ItemSummary, Location,
    Reservations, SlotClaim, SlotDelta,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const PRIORITY_WITHDRAW: i32 = 10;
pub const PRIORITY_DEPOSIT: i32 = 5;
pub const PRIORITY_SCAN: i32 = 5;
pub const PRIORITY_MAINTENANCE: i32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub withdrawn: u64,
    pub deposited: u64,
    pub moves: u64,
    pub short_moves: u64,
    pub discrepancies: u64,
    pub rebuilds: u64,
    pub last_rebuild: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterInfo {
    pub id: ContainerId,
    pub kind: AdapterKind,
    pub priority: i32,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildReport {
    pub containers: usize,
    pub slots: usize,
    pub items: usize,
    pub total_items: u64,
    /// Containers whose scan failed; their previous locations were kept.
    pub failed: Vec<ContainerId>,
}

struct ScanResult {
    info: ContainerInfo,
    records: Vec<(usize, ItemStack, u32)>,
}

/// Where a deposit may put items of one key.
struct Target {
    adapter: Rc<dyn StorageAdapter>,
    slot: usize,
    /// Items the target will accept.
    room: u64,
    /// Items the index can record; below `room` only for voiding targets.
    free: u64,
    limit: u32,
    voids: bool,
    _claim: SlotClaim,
}

/// Result of one withdraw move.
#[derive(Debug, Clone, Copy)]
struct Withdrawal {
    moved: u32,
    /// The slot held something other than the index recorded.
    stale: bool,
}

struct Inner {
    bus: Rc<EventBus>,
    scheduler: Rc<Scheduler>,
    adapters: BTreeMap<ContainerId, Rc<dyn StorageAdapter>>,
    input: Option<Rc<dyn StorageAdapter>>,
    output: Option<ContainerId>,
    index: RefCell<Rc<ItemIndex>>,
    reservations: Reservations,
    gate: OperationGate,
    dirty: Cell<bool>,
    rebuild_interval: Option<Duration>,
    scan_yield_every: usize,
    has_net_pool: bool,
    stats: RefCell<ServiceStats>,
}

/// Handle to the storage service. Clones share the same state.
#[derive(Clone)]
pub struct StorageService {
    inner: Rc<Inner>,
}

impl StorageService {
    pub fn new(ctx: &Context, discovery: Discovery) -> Self {
        let adapters = discovery
            .adapters
            .into_iter()
            .map(|a| (a.id().clone(), Rc::from(a)))
            .collect();
        let rebuild_interval = ctx
            .config
            .storage
            .rebuild_interval_secs
            .map(Duration::from_secs);

        Self {
            inner: Rc::new(Inner {
                bus: Rc::clone(&ctx.bus),
                scheduler: Rc::clone(&ctx.scheduler),
                adapters,
                input: discovery.input.map(Rc::from),
                output: discovery.output,
                index: RefCell::new(Rc::new(ItemIndex::default())),
                reservations: Reservations::new(),
                gate: OperationGate::new(),
                dirty: Cell::new(false),
                rebuild_interval,
                scan_yield_every: ctx.config.storage.scan_yield_every,
                has_net_pool: ctx.config.pools.contains_key(POOL_NET),
                stats: RefCell::new(ServiceStats::default()),
            }),
        }
    }

    pub fn items(&self) -> Vec<ItemSummary> {
        self.snapshot().items()
    }

    pub fn find(&self, key: &ItemKey) -> Option<IndexEntry> {
        self.snapshot().get(key).cloned()
    }

    /// The live index. Later operations replace it rather than mutate it.
    pub fn snapshot(&self) -> Rc<ItemIndex> {
        Rc::clone(&self.inner.index.borrow())
    }

    pub fn stats(&self) -> ServiceStats {
        self.inner.stats.borrow().clone()
    }

    pub fn adapters(&self) -> Vec<AdapterInfo> {
        self.inner
            .adapters
            .values()
            .map(|a| AdapterInfo {
                id: a.id().clone(),
                kind: a.kind(),
                priority: a.priority(),
                capabilities: a.capabilities(),
            })
            .collect()
    }

    pub fn reservations(&self) -> &Reservations {
        &self.inner.reservations
    }

    /// True before the first rebuild, after a discrepancy, or once the
    /// configured rebuild interval has elapsed.
    pub fn needs_rebuild(&self) -> bool {
        if self.inner.dirty.get() {
            return true;
        }
        let Some(last) = self.inner.stats.borrow().last_rebuild else {
            return true;
        };
        self.inner
            .rebuild_interval
            .is_some_and(|interval| {
                (Utc::now() - last)
                    .to_std()
                    .is_ok_and(|elapsed| elapsed >= interval)
            })
    }

    pub async fn rebuild_if_due(&self) -> Option<RebuildReport> {
        if self.needs_rebuild() {
            Some(self.rebuild_index().await)
        } else {
            None
        }
    }

    /// Move up to `count` items of `key` into the output container.
    /// Returns how many actually moved; shortfall is not an error.
    pub async fn withdraw(&self, key: &ItemKey, count: u32) -> u32 {
        if count == 0 {
            return 0;
        }
        let Some(output) = self.inner.output.clone() else {
            warn!("withdraw {key}: no output container configured");
            return 0;
        };
        let _shared = self.inner.gate.shared().await;

        let mut candidates: VecDeque<Location> =
            self.snapshot().withdraw_candidates(key).into();
        let mut reserved = VecDeque::new();
        let mut planned: u64 = 0;
        while planned < u64::from(count) {
            let Some(loc) = candidates.pop_front() else { break };
            if let Some(claim) = self.inner.reservations.claim(&loc.container, loc.slot) {
                planned += u64::from(loc.count);
                reserved.push_back((loc, claim));
            } else {
                debug!("withdraw {key}: {}[{}] is claimed", loc.container, loc.slot);
            }
        }
        debug!(
            "withdraw {count} x {key}: {} locations reserved for {planned}",
            reserved.len()
        );

        let stack_size = self.find(key).map_or(64, |e| e.stack_size);
        let mut held = Vec::new();
        let mut deltas = Vec::new();
        let mut remaining = count;

        while remaining > 0 {
            let next = match reserved.pop_front() {
                Some(next) => Some(next),
                None => self.claim_next(&mut candidates),
            };
            let Some((loc, claim)) = next else { break };
            let Some(adapter) = self.inner.adapters.get(&loc.container).cloned() else {
                continue;
            };

            let indexed = self.indexed_count(key, &loc.container, loc.slot);
            if indexed == 0 {
                debug!("withdraw {key}: {}[{}] emptied meanwhile", loc.container, loc.slot);
                continue;
            }
            let want = remaining.min(indexed);
            let dest = output.clone();
            let slot = loc.slot;
            let wanted = key.clone();
            let outcome = self
                .run_move(
                    self.pool_for(adapter.as_ref()),
                    PRIORITY_WITHDRAW,
                    format!("withdraw {key} from {}[{slot}]", loc.container),
                    move || checked_move_out(adapter.as_ref(), &dest, slot, &wanted, want, indexed),
                    Withdrawal { moved: 0, stale: true },
                )
                .await;
            let moved = outcome.moved;

            if moved > 0 {
                deltas.push(SlotDelta {
                    container: loc.container.clone(),
                    slot,
                    key: key.clone(),
                    change: -i64::from(moved),
                    stack_size,
                    limit: loc.limit,
                });
                remaining -= moved.min(remaining);
            }
            if outcome.stale {
                self.stale_slot(&loc.container, slot, key, want, moved);
            } else if moved < want {
                debug!("{}[{slot}]: moved {moved}/{want} x {key}, output full or refused", loc.container);
                self.inner.stats.borrow_mut().short_moves += 1;
            }
            held.push(claim);
        }

        self.apply(&deltas);
        drop(held);

        let withdrawn = count - remaining;
        self.inner.stats.borrow_mut().withdrawn += u64::from(withdrawn);
        info!("withdrew {withdrawn}/{count} x {key}");
        self.inner.bus.publish(
            "storage.withdraw",
            json!({ "key": key, "requested": count, "moved": withdrawn }),
        );
        withdrawn
    }

    /// Drain the input container into storage. Returns the number of items
    /// stored.
    pub async fn deposit(&self) -> u64 {
        let Some(input) = self.inner.input.clone() else {
            warn!("deposit: no input container configured");
            return 0;
        };
        let _shared = self.inner.gate.shared().await;

        let lister = Rc::clone(&input);
        let listing = self
            .inner
            .scheduler
            .submit_labeled(POOL_IO, PRIORITY_DEPOSIT, "scan input", async move {
                yield_now().await;
                lister
                    .list_occupied_slots()
                    .map_err(|e| TaskError::failed(e.to_string()))
            });
        let occupied = match listing {
            Ok(handle) => match handle.await {
                Ok(slots) => slots,
                Err(e) => {
                    warn!("deposit: scanning {} failed: {e}", input.id());
                    return 0;
                }
            },
            Err(e) => {
                warn!("deposit: {e}");
                return 0;
            }
        };

        let mut groups: BTreeMap<ItemKey, (u32, Vec<(usize, u32)>)> = BTreeMap::new();
        for (slot, stack) in occupied {
            let group = groups
                .entry(stack.key)
                .or_insert_with(|| (stack.max_stack, Vec::new()));
            group.1.push((slot, stack.count));
        }

        let snapshot = self.snapshot();
        let input_id = input.id().clone();
        let mut jobs = Vec::new();
        for (key, (stack_size, sources)) in groups {
            let needed: u64 = sources.iter().map(|(_, c)| u64::from(*c)).sum();
            let targets = self.plan_targets(&snapshot, &key, stack_size, needed);
            if targets.is_empty() {
                warn!("deposit: no room for {needed} x {key}");
                continue;
            }
            debug!("deposit {needed} x {key} into {} targets", targets.len());
            let plan: Vec<(Rc<dyn StorageAdapter>, usize, u64)> = targets
                .iter()
                .map(|t| (Rc::clone(&t.adapter), t.slot, t.room))
                .collect();
            let from = input_id.clone();
            let handle = self.inner.scheduler.submit_labeled(
                POOL_IO,
                PRIORITY_DEPOSIT,
                format!("deposit {key}"),
                async move { Ok(fill_targets(&from, plan, sources).await) },
            );
            match handle {
                Ok(handle) => jobs.push((key, stack_size, targets, handle)),
                Err(e) => warn!("deposit {key}: {e}"),
            }
        }

        let mut deltas = Vec::new();
        let mut stored = 0u64;
        for (key, stack_size, targets, handle) in jobs {
            let landed = await_moves(handle).await;
            for (i, moved) in landed.into_iter().enumerate() {
                if moved == 0 {
                    continue;
                }
                let target = &targets[i];
                let recorded = moved.min(target.free);
                if target.voids && moved > target.free {
                    debug!(
                        "deposit: {} voided {} x {key}",
                        target.adapter.id(),
                        moved - target.free
                    );
                    self.inner.dirty.set(true);
                }
                stored += moved;
                if recorded > 0 {
                    deltas.push(SlotDelta {
                        container: target.adapter.id().clone(),
                        slot: target.slot,
                        key: key.clone(),
                        change: i64::try_from(recorded).unwrap_or(i64::MAX),
                        stack_size,
                        limit: target.limit,
                    });
                }
            }
        }

        self.apply(&deltas);
        self.inner.stats.borrow_mut().deposited += stored;
        info!("deposited {stored} items from {input_id}");
        self.inner.bus.publish(
            "storage.deposit",
            json!({ "input": input_id, "moved": stored }),
        );
        stored
    }

    /// Rescan every adapter into a fresh index and swap it in.
    pub async fn rebuild_index(&self) -> RebuildReport {
        let _exclusive = self.inner.gate.exclusive().await;
        self.rebuild_locked().await
    }

    /// Merge partial stacks inside every adapter, then rebuild. Returns the
    /// number of moves performed.
    pub async fn consolidate(&self) -> usize {
        let _exclusive = self.inner.gate.exclusive().await;

        let mut handles = Vec::new();
        for (id, adapter) in &self.inner.adapters {
            let adapter = Rc::clone(adapter);
            let submitted = self.inner.scheduler.submit_labeled(
                self.pool_for(adapter.as_ref()),
                PRIORITY_MAINTENANCE,
                format!("consolidate {id}"),
                async move {
                    yield_now().await;
                    Ok(adapter.consolidate())
                },
            );
            match submitted {
                Ok(handle) => handles.push((id.clone(), handle)),
                Err(e) => warn!("consolidate {id}: {e}"),
            }
        }

        let mut moves = 0;
        for (id, handle) in handles {
            match handle.await {
                Ok(n) => moves += n,
                Err(e) => warn!("consolidate {id} failed: {e}"),
            }
        }

        let report = self.rebuild_locked().await;
        info!("consolidated in {moves} moves, {} items indexed", report.items);
        self.inner
            .bus
            .publish("storage.consolidated", json!({ "moves": moves }));
        moves
    }

    async fn rebuild_locked(&self) -> RebuildReport {
        let old = self.snapshot();
        let mut report = RebuildReport {
            containers: self.inner.adapters.len(),
            ..RebuildReport::default()
        };
        let mut builder = IndexBuilder::new();
        let mut pending = Vec::new();

        for (id, adapter) in &self.inner.adapters {
            let adapter = Rc::clone(adapter);
            let every = self.inner.scan_yield_every;
            let submitted = self.inner.scheduler.submit_labeled(
                POOL_INDEX,
                PRIORITY_SCAN,
                format!("scan {id}"),
                async move { scan_container(adapter, every).await },
            );
            match submitted {
                Ok(handle) => pending.push((id.clone(), handle)),
                Err(e) => {
                    self.scan_failed(&mut builder, &old, id, &e.to_string());
                    report.failed.push(id.clone());
                }
            }
        }

        let total = pending.len();
        let mut done = 0;
        while !pending.is_empty() {
            let mut waiting = Vec::with_capacity(pending.len());
            for (id, handle) in pending {
                match handle.try_take() {
                    None => waiting.push((id, handle)),
                    Some(Ok(scan)) => {
                        done += 1;
                        let slots = scan.records.len();
                        builder.record_container(id.clone(), scan.info);
                        for (slot, stack, limit) in &scan.records {
                            builder.record_slot(&id, *slot, stack, *limit);
                        }
                        debug!("scanned {id}: {slots} occupied slots");
                        self.inner.bus.publish(
                            "index.update",
                            json!({
                                "container": id,
                                "slots": slots,
                                "done": done,
                                "total": total,
                            }),
                        );
                    }
                    Some(Err(e)) => {
                        done += 1;
                        self.scan_failed(&mut builder, &old, &id, &e.to_string());
                        report.failed.push(id);
                    }
                }
            }
            pending = waiting;
            if !pending.is_empty() {
                yield_now().await;
            }
        }

        report.slots = builder.slots_recorded();
        let index = builder.finish();
        report.items = index.len();
        report.total_items = index.total_items();
        *self.inner.index.borrow_mut() = Rc::new(index);
        self.inner.dirty.set(false);
        {
            let mut stats = self.inner.stats.borrow_mut();
            stats.rebuilds += 1;
            stats.last_rebuild = Some(Utc::now());
        }

        info!(
            "index rebuilt: {} items ({} total) across {} containers, {} failed",
            report.items,
            report.total_items,
            report.containers,
            report.failed.len()
        );
        self.inner.bus.publish(
            "index.rebuilt",
            json!({
                "items": report.items,
                "total_items": report.total_items,
                "containers": report.containers,
                "failed": report.failed,
            }),
        );
        report
    }

    fn scan_failed(
        &self,
        builder: &mut IndexBuilder,
        old: &ItemIndex,
        id: &ContainerId,
        reason: &str,
    ) {
        warn!("scan of {id} failed, keeping previous locations: {reason}");
        builder.carry_over(id, old);
        self.inner.bus.publish(
            "index.scan_failed",
            json!({ "container": id, "reason": reason }),
        );
    }

    /// Replace the live index with `deltas` applied, in one step.
    fn apply(&self, deltas: &[SlotDelta]) {
        if deltas.is_empty() {
            return;
        }
        let current = self.snapshot();
        let (next, problems) = current.with_deltas(deltas);
        *self.inner.index.borrow_mut() = Rc::new(next);
        self.inner.stats.borrow_mut().moves += deltas.len() as u64;
        for problem in problems {
            self.discrepancy(&problem);
        }
    }

    fn discrepancy(&self, problem: &Discrepancy) {
        self.inner.dirty.set(true);
        self.inner.stats.borrow_mut().discrepancies += 1;
        self.inner.bus.publish(
            "index.discrepancy",
            json!({
                "container": problem.container,
                "slot": problem.slot,
                "key": problem.key,
                "recorded": problem.recorded,
                "change": problem.change,
            }),
        );
    }

    /// The source slot no longer matched the index: note it and ask for a
    /// rebuild.
    fn stale_slot(&self, container: &ContainerId, slot: usize, key: &ItemKey, want: u32, moved: u32) {
        warn!("{container}[{slot}] disagrees with the index for {key}: moved {moved}/{want}");
        self.inner.dirty.set(true);
        {
            let mut stats = self.inner.stats.borrow_mut();
            stats.short_moves += 1;
            stats.discrepancies += 1;
        }
        self.inner.bus.publish(
            "index.discrepancy",
            json!({
                "container": container,
                "slot": slot,
                "key": key,
                "requested": want,
                "moved": moved,
            }),
        );
    }

    /// Count the live index records for `key` in one slot.
    fn indexed_count(&self, key: &ItemKey, container: &ContainerId, slot: usize) -> u32 {
        self.snapshot().get(key).map_or(0, |entry| {
            entry
                .locations
                .iter()
                .find(|l| &l.container == container && l.slot == slot)
                .map_or(0, |l| l.count)
        })
    }

    fn claim_next(&self, candidates: &mut VecDeque<Location>) -> Option<(Location, SlotClaim)> {
        while let Some(loc) = candidates.pop_front() {
            if let Some(claim) = self.inner.reservations.claim(&loc.container, loc.slot) {
                return Some((loc, claim));
            }
        }
        None
    }

    fn pool_for(&self, adapter: &dyn StorageAdapter) -> &'static str {
        if adapter.kind() == AdapterKind::Network && self.inner.has_net_pool {
            POOL_NET
        } else {
            POOL_IO
        }
    }

    /// Submit one move and wait for its result. A failed or unsubmitted
    /// task yields `failed`.
    async fn run_move<T: 'static>(
        &self,
        pool: &str,
        priority: i32,
        label: String,
        op: impl FnOnce() -> T + 'static,
        failed: T,
    ) -> T {
        let submitted = self
            .inner
            .scheduler
            .submit_labeled(pool, priority, label, async move {
                yield_now().await;
                Ok(op())
            });
        match submitted {
            Ok(handle) => handle.await.unwrap_or_else(|e| {
                warn!("move task failed: {e}");
                failed
            }),
            Err(e) => {
                warn!("move not submitted: {e}");
                failed
            }
        }
    }

    /// Choose and claim deposit targets for `needed` items of `key`:
    /// partial stacks first, then empty slots by container priority, then
    /// voiding containers that already hold the key.
    fn plan_targets(
        &self,
        index: &ItemIndex,
        key: &ItemKey,
        stack_size: u32,
        needed: u64,
    ) -> Vec<Target> {
        let mut targets = Vec::new();
        let mut planned = 0u64;

        for loc in index.partial_stacks(key) {
            if planned >= needed {
                return targets;
            }
            let Some(info) = index.container(&loc.container) else { continue };
            let room = if info.virtual_slots {
                info.free_items.unwrap_or(0)
            } else {
                u64::from(loc.free())
            };
            if let Some(t) = self.target(&loc.container, loc.slot, room, loc.limit, info.voids_overflow) {
                planned += t.room;
                targets.push(t);
            }
        }

        let mut containers: Vec<(&ContainerId, &ContainerInfo)> = index.containers().iter().collect();
        containers.sort_by(|a, b| b.1.priority.cmp(&a.1.priority).then_with(|| a.0.cmp(b.0)));

        for (id, info) in &containers {
            if planned >= needed {
                return targets;
            }
            let Some(adapter) = self.inner.adapters.get(*id) else { continue };
            if info.virtual_slots {
                if index.get(key).is_some_and(|e| e.locations.iter().any(|l| l.container == **id)) {
                    continue;
                }
                let free = info.free_items.unwrap_or(0);
                if let Some(slot) = adapter.virtual_slot(key) {
                    let limit = free.min(u64::from(u32::MAX)) as u32;
                    if let Some(t) = self.target(id, slot, free, limit, false) {
                        planned += t.room;
                        targets.push(t);
                    }
                }
                continue;
            }

            let fallback = stack_size.saturating_mul(info.stack_multiplier.max(1));
            let mut empties: Vec<usize> = index
                .empty_slots(id)
                .into_iter()
                .filter(|slot| info.locked.get(slot).map_or(true, |k| k == key))
                .collect();
            empties.sort_by_key(|slot| (!info.locked.contains_key(slot), *slot));
            for slot in empties {
                if planned >= needed {
                    return targets;
                }
                let limit = adapter.slot_limit(slot, stack_size).unwrap_or(fallback);
                if let Some(t) = self.target(id, slot, u64::from(limit), limit, info.voids_overflow) {
                    planned += t.room;
                    targets.push(t);
                }
            }
        }

        if planned >= needed {
            return targets;
        }
        let overflow = needed - planned;
        if let Some(t) = targets.iter_mut().find(|t| t.voids) {
            t.room += overflow;
            return targets;
        }
        if let Some(entry) = index.get(key) {
            for loc in &entry.locations {
                let voids = index
                    .container(&loc.container)
                    .is_some_and(|c| c.voids_overflow);
                if !voids {
                    continue;
                }
                if let Some(mut t) = self.target(&loc.container, loc.slot, overflow, loc.limit, true) {
                    t.free = 0;
                    targets.push(t);
                    break;
                }
            }
        }
        targets
    }

    fn target(
        &self,
        container: &ContainerId,
        slot: usize,
        room: u64,
        limit: u32,
        voids: bool,
    ) -> Option<Target> {
        if room == 0 {
            return None;
        }
        let adapter = self.inner.adapters.get(container)?;
        let claim = self.inner.reservations.claim(container, slot)?;
        Some(Target {
            adapter: Rc::clone(adapter),
            slot,
            room,
            free: room,
            limit,
            voids,
            _claim: claim,
        })
    }
}

/// Move `sources` (input slot, count) into `targets` in order. Returns the
/// count that landed in each target.
async fn fill_targets(
    input: &ContainerId,
    targets: Vec<(Rc<dyn StorageAdapter>, usize, u64)>,
    mut sources: Vec<(usize, u32)>,
) -> Vec<u64> {
    let mut landed = vec![0u64; targets.len()];
    for (i, (adapter, slot, room)) in targets.iter().enumerate() {
        let mut room = *room;
        for (from_slot, left) in &mut sources {
            if room == 0 {
                break;
            }
            if *left == 0 {
                continue;
            }
            let want = u64::from(*left).min(room) as u32;
            yield_now().await;
            let moved = adapter.move_in(input, *from_slot, want, Some(*slot));
            *left -= moved.min(*left);
            room = room.saturating_sub(u64::from(moved));
            landed[i] += u64::from(moved);
            if moved < want {
                break;
            }
        }
    }
    landed
}

async fn await_moves(handle: TaskHandle<Vec<u64>>) -> Vec<u64> {
    handle.await.unwrap_or_else(|e| {
        warn!("deposit task failed: {e}");
        Vec::new()
    })
}

async fn scan_container(
    adapter: Rc<dyn StorageAdapter>,
    yield_every: usize,
) -> Result<ScanResult, TaskError> {
    let fail = |e: depot_adapter::AdapterError| TaskError::failed(e.to_string());
    yield_now().await;

    let slot_count = adapter.slot_count().map_err(fail)?;
    let caps = adapter.capabilities();
    let occupied: Vec<(usize, ItemStack)> = if caps.bulk_list {
        adapter.list_occupied_slots().map_err(fail)?.into_iter().collect()
    } else {
        let mut found = Vec::new();
        for slot in 0..slot_count {
            if yield_every > 0 && slot > 0 && slot % yield_every == 0 {
                yield_now().await;
            }
            if let Some(stack) = adapter.slot_detail(slot).map_err(fail)? {
                found.push((slot, stack));
            }
        }
        found
    };

    let multiplier = adapter.stack_multiplier().max(1);
    let mut records = Vec::with_capacity(occupied.len());
    for (i, (slot, stack)) in occupied.into_iter().enumerate() {
        if caps.bulk_list && yield_every > 0 && i > 0 && i % yield_every == 0 {
            yield_now().await;
        }
        let limit = adapter
            .slot_limit(slot, stack.max_stack)
            .unwrap_or_else(|_| stack.max_stack.saturating_mul(multiplier));
        records.push((slot, stack, limit));
    }

    let capacity = adapter.capacity_snapshot().map_err(fail)?;
    let info = ContainerInfo {
        slot_count,
        priority: adapter.priority(),
        stack_multiplier: multiplier,
        virtual_slots: adapter.kind() == AdapterKind::Network,
        free_items: capacity
            .max_items
            .map(|max| max.saturating_sub(capacity.stored_items)),
        locked: adapter.locked_slots(),
        voids_overflow: adapter.voids_overflow(),
    };
    Ok(ScanResult { info, records })
}

/// Move up to `want` of `key` out of `slot`, reading the slot before and
/// after so a swapped or changed stack is never moved and never goes
/// unnoticed.
fn checked_move_out(
    adapter: &dyn StorageAdapter,
    dest: &ContainerId,
    slot: usize,
    key: &ItemKey,
    want: u32,
    indexed: u32,
) -> Withdrawal {
    let held = match adapter.slot_detail(slot) {
        Ok(Some(stack)) if &stack.key == key => stack.count,
        Ok(found) => {
            debug!(
                "{}[{slot}]: expected {key}, found {:?}",
                adapter.id(),
                found.map(|s| s.key)
            );
            return Withdrawal { moved: 0, stale: true };
        }
        Err(e) => {
            warn!("{}[{slot}]: {e}", adapter.id());
            return Withdrawal { moved: 0, stale: true };
        }
    };
    let moved = adapter.move_out(dest, slot, want.min(held), None);
    let after = adapter
        .slot_detail(slot)
        .map(|s| s.filter(|s| &s.key == key).map_or(0, |s| s.count));
    Withdrawal {
        moved,
        stale: held != indexed || after.ok() != Some(held.saturating_sub(moved)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::discover;
    use depot_adapter::{ContainerSpec, MemoryHost};
    use depot_schema::parse_config_str;

    const CONFIG: &str = r#"
[storage]
input = "input"
output = "output"
"#;

    fn stone() -> ItemKey {
        ItemKey::new("minecraft:stone")
    }

    fn setup(host: &MemoryHost) -> (Context, StorageService) {
        host.add_container("input", ContainerSpec::chest(9));
        host.add_container("output", ContainerSpec::chest(27));
        let ctx = Context::new(parse_config_str(CONFIG).unwrap()).unwrap();
        let found = discover(&ctx, host);
        let service = StorageService::new(&ctx, found);
        (ctx, service)
    }

    #[test]
    fn rebuild_indexes_every_adapter() {
        let host = MemoryHost::new();
        host.add_container("a", ContainerSpec::chest(9));
        host.add_container("b", ContainerSpec::chest(9).without_bulk_list());
        host.put("a", 0, ItemStack::new("minecraft:stone", 30, 64));
        host.put("b", 4, ItemStack::new("minecraft:stone", 12, 64));
        let (ctx, service) = setup(&host);

        assert!(service.needs_rebuild());
        let report = ctx.block_on(service.rebuild_index()).unwrap();
        assert_eq!(report.containers, 2);
        assert_eq!(report.slots, 2);
        assert!(report.failed.is_empty());
        assert_eq!(service.find(&stone()).unwrap().total, 42);
        assert!(!service.needs_rebuild());

        let topics: Vec<String> = ctx.bus.recent_events(100).into_iter().map(|e| e.topic).collect();
        assert_eq!(topics.iter().filter(|t| *t == "index.update").count(), 2);
        assert!(topics.iter().any(|t| t == "index.rebuilt"));
    }

    #[test]
    fn readers_see_old_snapshot_until_swap() {
        let host = MemoryHost::new();
        host.add_container("a", ContainerSpec::chest(9));
        host.put("a", 0, ItemStack::new("minecraft:stone", 5, 64));
        let (ctx, service) = setup(&host);
        ctx.block_on(service.rebuild_index()).unwrap();

        let before = service.snapshot();
        host.put("a", 1, ItemStack::new("minecraft:stone", 5, 64));
        ctx.block_on(service.rebuild_index()).unwrap();
        assert_eq!(before.total(&stone()), 5);
        assert_eq!(service.snapshot().total(&stone()), 10);
    }

    #[test]
    fn failed_scan_keeps_previous_locations() {
        let host = MemoryHost::new();
        host.add_container("a", ContainerSpec::chest(9));
        host.add_container("b", ContainerSpec::chest(9));
        host.put("a", 0, ItemStack::new("minecraft:stone", 5, 64));
        host.put("b", 0, ItemStack::new("minecraft:stone", 7, 64));
        let (ctx, service) = setup(&host);
        ctx.block_on(service.rebuild_index()).unwrap();

        host.detach("b");
        let report = ctx.block_on(service.rebuild_index()).unwrap();
        assert_eq!(report.failed, vec![ContainerId::new("b")]);
        assert_eq!(service.find(&stone()).unwrap().total, 12);
        assert!(ctx
            .bus
            .recent_events(100)
            .iter()
            .any(|e| e.topic == "index.scan_failed"));
    }

    #[test]
    fn withdraw_takes_fullest_first() {
        let host = MemoryHost::new();
        host.add_container("a", ContainerSpec::chest(9));
        host.put("a", 0, ItemStack::new("minecraft:stone", 10, 64));
        host.put("a", 1, ItemStack::new("minecraft:stone", 50, 64));
        let (ctx, service) = setup(&host);
        ctx.block_on(service.rebuild_index()).unwrap();

        let moved = ctx.block_on(service.withdraw(&stone(), 40)).unwrap();
        assert_eq!(moved, 40);
        assert_eq!(host.stack_at("a", 1).unwrap().count, 10);
        assert_eq!(host.stack_at("a", 0).unwrap().count, 10);
        assert_eq!(service.find(&stone()).unwrap().total, 20);
        assert!(service.reservations().is_empty());
    }

    #[test]
    fn withdraw_without_stock_returns_zero() {
        let host = MemoryHost::new();
        host.add_container("a", ContainerSpec::chest(9));
        let (ctx, service) = setup(&host);
        ctx.block_on(service.rebuild_index()).unwrap();
        assert_eq!(ctx.block_on(service.withdraw(&stone(), 5)).unwrap(), 0);
        assert_eq!(service.stats().withdrawn, 0);
    }

    #[test]
    fn refused_move_falls_through_without_dirtying() {
        let host = MemoryHost::new();
        host.add_container("a", ContainerSpec::chest(9));
        host.add_container("b", ContainerSpec::chest(9));
        host.put("a", 0, ItemStack::new("minecraft:stone", 6, 64));
        host.put("b", 0, ItemStack::new("minecraft:stone", 4, 64));
        let (ctx, service) = setup(&host);
        ctx.block_on(service.rebuild_index()).unwrap();

        host.set_refusing("a", true);
        let moved = ctx.block_on(service.withdraw(&stone(), 8)).unwrap();
        assert_eq!(moved, 4);
        assert!(!service.needs_rebuild());
        assert_eq!(service.stats().short_moves, 1);
        assert_eq!(service.stats().discrepancies, 0);
        assert_eq!(service.find(&stone()).unwrap().total, 6);
        assert!(!ctx
            .bus
            .recent_events(100)
            .iter()
            .any(|e| e.topic == "index.discrepancy"));
    }

    #[test]
    fn swapped_slot_is_not_withdrawn() {
        let host = MemoryHost::new();
        host.add_container("a", ContainerSpec::chest(9));
        host.put("a", 0, ItemStack::new("minecraft:stone", 10, 64));
        let (ctx, service) = setup(&host);
        ctx.block_on(service.rebuild_index()).unwrap();

        host.put("a", 0, ItemStack::new("minecraft:dirt", 10, 64));
        let moved = ctx.block_on(service.withdraw(&stone(), 5)).unwrap();
        assert_eq!(moved, 0);
        assert_eq!(host.stack_at("a", 0).unwrap().count, 10);
        assert!(host.stack_at("output", 0).is_none());
        assert!(service.needs_rebuild());
        assert_eq!(service.stats().discrepancies, 1);
    }

    #[test]
    fn removed_container_is_kept_until_rebuild_and_never_moved() {
        let host = MemoryHost::new();
        host.add_container("a", ContainerSpec::chest(9));
        host.add_container("b", ContainerSpec::chest(9));
        host.put("a", 0, ItemStack::new("minecraft:stone", 5, 64));
        host.put("b", 0, ItemStack::new("minecraft:stone", 30, 64));
        let (ctx, service) = setup(&host);
        ctx.block_on(service.rebuild_index()).unwrap();

        host.remove_container("b");
        let moved = ctx.block_on(service.withdraw(&stone(), 10)).unwrap();
        assert_eq!(moved, 5);
        assert!(service.needs_rebuild());

        let report = ctx.block_on(service.rebuild_index()).unwrap();
        assert_eq!(report.failed, vec![ContainerId::new("b")]);
        assert_eq!(service.find(&stone()).unwrap().total, 30);
    }

    #[test]
    fn deposit_prefers_partial_stacks() {
        let host = MemoryHost::new();
        host.add_container("a", ContainerSpec::chest(9));
        host.put("a", 3, ItemStack::new("minecraft:stone", 20, 64));
        let (ctx, service) = setup(&host);
        ctx.block_on(service.rebuild_index()).unwrap();

        host.put("input", 0, ItemStack::new("minecraft:stone", 10, 64));
        let stored = ctx.block_on(service.deposit()).unwrap();
        assert_eq!(stored, 10);
        assert_eq!(host.stack_at("a", 3).unwrap().count, 30);
        assert!(host.stack_at("input", 0).is_none());
        let entry = service.find(&stone()).unwrap();
        assert_eq!(entry.total, 30);
        assert_eq!(entry.locations.len(), 1);
    }

    #[test]
    fn deposit_respects_priority_and_locks() {
        let host = MemoryHost::new();
        host.add_container("low", ContainerSpec::chest(9));
        host.add_container(
            "high",
            ContainerSpec::upgradeable("storagedrawers:drawer", 2, 1).with_priority(5),
        );
        let (ctx, service) = setup(&host);
        let drawer = service
            .inner
            .adapters
            .get(&ContainerId::new("high"))
            .cloned()
            .unwrap();
        drawer.lock_slot(0, Some(ItemKey::new("minecraft:dirt"))).unwrap();
        ctx.block_on(service.rebuild_index()).unwrap();

        host.put("input", 0, ItemStack::new("minecraft:stone", 10, 64));
        ctx.block_on(service.deposit()).unwrap();
        assert!(host.stack_at("high", 0).is_none());
        assert_eq!(host.stack_at("high", 1).unwrap().count, 10);
        assert_eq!(host.count_in("low", &stone()), 0);
    }

    #[test]
    fn deposit_into_network() {
        let host = MemoryHost::new();
        host.add_container("me", ContainerSpec::network(1_000));
        host.put_network("me", ItemStack::new("minecraft:stone", 100, 64));
        let (ctx, service) = setup(&host);
        ctx.block_on(service.rebuild_index()).unwrap();

        host.put("input", 0, ItemStack::new("minecraft:stone", 64, 64));
        host.put("input", 1, ItemStack::new("minecraft:coal", 16, 64));
        let stored = ctx.block_on(service.deposit()).unwrap();
        assert_eq!(stored, 80);
        assert_eq!(host.count_in("me", &stone()), 164);
        assert_eq!(service.find(&stone()).unwrap().total, 164);
        assert_eq!(service.find(&ItemKey::new("minecraft:coal")).unwrap().total, 16);
        let free = service.snapshot().container(&ContainerId::new("me")).unwrap().free_items;
        assert_eq!(free, Some(820));
    }

    #[test]
    fn consolidate_merges_and_reindexes() {
        let host = MemoryHost::new();
        host.add_container("a", ContainerSpec::chest(2));
        host.put("a", 0, ItemStack::new("minecraft:stone", 3, 64));
        host.put("a", 1, ItemStack::new("minecraft:stone", 61, 64));
        let (ctx, service) = setup(&host);
        ctx.block_on(service.rebuild_index()).unwrap();

        assert_eq!(ctx.block_on(service.consolidate()).unwrap(), 1);
        let entry = service.find(&stone()).unwrap();
        assert_eq!(entry.total, 64);
        assert_eq!(entry.locations.len(), 1);
        assert_eq!(service.stats().rebuilds, 2);
    }

    #[test]
    fn adapters_lists_registered_containers() {
        let host = MemoryHost::new();
        host.add_container("a", ContainerSpec::chest(9));
        host.add_container("me", ContainerSpec::network(10));
        let (_ctx, service) = setup(&host);
        let ids: Vec<String> = service.adapters().into_iter().map(|a| a.id.to_string()).collect();
        assert_eq!(ids, vec!["a", "me"]);
    }

    #[test]
    fn rebuild_if_due_respects_interval() {
        let host = MemoryHost::new();
        host.add_container("a", ContainerSpec::chest(9));
        let (ctx, service) = setup(&host);
        assert!(ctx.block_on(service.rebuild_if_due()).unwrap().is_some());
        assert!(ctx.block_on(service.rebuild_if_due()).unwrap().is_none());
    }
}
