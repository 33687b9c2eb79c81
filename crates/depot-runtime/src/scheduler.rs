//! Single-threaded cooperative scheduler with named bounded pools.
//!
//! Pools are lanes, not threads. Each `tick` starts queued tasks while a pool
//! has free capacity (highest priority first, then submission order), polls
//! every running task once, refills freed capacity, and finally drains the
//! event bus. A task only gives up control at an `.await` that is pending,
//! such as [`yield_now`](crate::yield_now) or a [`TaskHandle`].

use crate::bus::EventBus;
use crate::task::{ResultSlot, TaskError, TaskHandle, TaskId, TaskRecord, TaskState};
use crate::RuntimeError;
use futures::task::noop_waker_ref;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::{pin, Pin};
use std::rc::Rc;
use std::task::{Context, Poll};
use tracing::{debug, info, warn};

/// Consecutive polls of a `block_on` future with nothing else runnable
/// before it is declared stalled.
const STALL_LIMIT: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub active: usize,
    pub queued: usize,
}

struct Task {
    id: TaskId,
    seq: u64,
    priority: i32,
    label: String,
    future: Pin<Box<dyn Future<Output = Result<(), TaskError>>>>,
    fail: Box<dyn FnOnce(TaskError)>,
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    /// Max-heap order: higher priority first, then lower sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Pool {
    capacity: usize,
    active: usize,
    queue: BinaryHeap<Task>,
    running: Vec<Task>,
}

enum Outcome {
    Pending(Task),
    Done(TaskRecord),
}

pub struct Scheduler {
    bus: Rc<EventBus>,
    pools: RefCell<BTreeMap<String, Pool>>,
    next_id: Cell<u64>,
    /// States of tasks that have not finished yet.
    live: RefCell<BTreeMap<TaskId, TaskState>>,
    history: RefCell<VecDeque<TaskRecord>>,
    history_cap: usize,
    shutting_down: Cell<bool>,
    ticking: Cell<bool>,
}

impl Scheduler {
    pub fn new(bus: Rc<EventBus>, pools: &BTreeMap<String, usize>, history: usize) -> Self {
        let pools = pools
            .iter()
            .map(|(name, capacity)| {
                (
                    name.clone(),
                    Pool {
                        capacity: (*capacity).max(1),
                        active: 0,
                        queue: BinaryHeap::new(),
                        running: Vec::new(),
                    },
                )
            })
            .collect();
        Self {
            bus,
            pools: RefCell::new(pools),
            next_id: Cell::new(1),
            live: RefCell::new(BTreeMap::new()),
            history: RefCell::new(VecDeque::with_capacity(history)),
            history_cap: history,
            shutting_down: Cell::new(false),
            ticking: Cell::new(false),
        }
    }

    pub fn bus(&self) -> &Rc<EventBus> {
        &self.bus
    }

    pub fn submit<T, F>(
        &self,
        pool: &str,
        priority: i32,
        body: F,
    ) -> Result<TaskHandle<T>, RuntimeError>
    where
        T: 'static,
        F: Future<Output = Result<T, TaskError>> + 'static,
    {
        self.submit_labeled(pool, priority, "task", body)
    }

    pub fn submit_labeled<T, F>(
        &self,
        pool: &str,
        priority: i32,
        label: impl Into<String>,
        body: F,
    ) -> Result<TaskHandle<T>, RuntimeError>
    where
        T: 'static,
        F: Future<Output = Result<T, TaskError>> + 'static,
    {
        if self.shutting_down.get() {
            return Err(RuntimeError::ShuttingDown);
        }
        let mut pools = self.pools.borrow_mut();
        let lane = pools
            .get_mut(pool)
            .ok_or_else(|| RuntimeError::UnknownPool(pool.to_owned()))?;

        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let slot: ResultSlot<T> = Rc::new(RefCell::new(None));
        let out = Rc::clone(&slot);
        let future = Box::pin(async move {
            let result = body.await;
            let status = match &result {
                Ok(_) => Ok(()),
                Err(e) => Err(e.clone()),
            };
            *out.borrow_mut() = Some(result);
            status
        });
        let failed = Rc::clone(&slot);
        let fail = Box::new(move |e: TaskError| {
            *failed.borrow_mut() = Some(Err(e));
        });

        let label = label.into();
        debug!("submit #{id} '{label}' to {pool} at priority {priority}");
        lane.queue.push(Task {
            id,
            seq: id,
            priority,
            label,
            future,
            fail,
        });
        self.live.borrow_mut().insert(id, TaskState::Queued);
        Ok(TaskHandle::new(id, slot))
    }

    /// One driver step. Returns whether any task was started or polled.
    pub fn tick(&self) -> bool {
        if self.ticking.replace(true) {
            return false;
        }
        let names: Vec<String> = self.pools.borrow().keys().cloned().collect();
        let mut progressed = false;

        for name in &names {
            progressed |= self.fill(name);

            let running = match self.pools.borrow_mut().get_mut(name) {
                Some(pool) => std::mem::take(&mut pool.running),
                None => continue,
            };
            if running.is_empty() {
                continue;
            }
            progressed = true;

            let mut still_running = Vec::with_capacity(running.len());
            let mut finished = Vec::new();
            for task in running {
                match poll_task(name, task) {
                    Outcome::Pending(task) => still_running.push(task),
                    Outcome::Done(record) => finished.push(record),
                }
            }

            if let Some(pool) = self.pools.borrow_mut().get_mut(name) {
                pool.active -= finished.len();
                pool.running.extend(still_running);
            }
            for record in finished {
                self.finish(record);
            }
            self.fill(name);
        }

        self.ticking.set(false);
        self.bus.dispatch();
        progressed
    }

    /// Tick until no task is queued or running and the bus is drained.
    /// Returns the number of ticks taken.
    pub fn run_until_idle(&self) -> usize {
        let mut ticks = 0;
        while !self.is_idle() {
            self.tick();
            ticks += 1;
        }
        ticks
    }

    /// Drive `future` to completion, ticking the pools in between polls.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output, RuntimeError> {
        if self.ticking.get() {
            return Err(RuntimeError::Reentrant);
        }
        let mut future = pin!(future);
        let mut cx = Context::from_waker(noop_waker_ref());
        let mut idle_polls = 0;
        loop {
            if let Poll::Ready(out) = future.as_mut().poll(&mut cx) {
                self.bus.dispatch();
                return Ok(out);
            }
            if self.is_idle() {
                idle_polls += 1;
                if idle_polls > STALL_LIMIT {
                    return Err(RuntimeError::Stalled);
                }
            } else {
                idle_polls = 0;
            }
            self.tick();
        }
    }

    pub fn is_idle(&self) -> bool {
        let pools = self.pools.borrow();
        pools.values().all(|p| p.active == 0 && p.queue.is_empty()) && self.bus.pending() == 0
    }

    pub fn pools(&self) -> BTreeMap<String, PoolStats> {
        self.pools
            .borrow()
            .iter()
            .map(|(name, p)| {
                (
                    name.clone(),
                    PoolStats {
                        capacity: p.capacity,
                        active: p.active,
                        queued: p.queue.len(),
                    },
                )
            })
            .collect()
    }

    /// Where task `id` stands. `None` once a finished task has dropped out
    /// of the history, or for ids never issued.
    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        if let Some(state) = self.live.borrow().get(&id) {
            return Some(*state);
        }
        self.history
            .borrow()
            .iter()
            .rev()
            .find(|r| r.id == id)
            .map(|r| r.state)
    }

    /// Up to `n` most recently finished tasks, oldest first.
    pub fn recent_tasks(&self, n: usize) -> Vec<TaskRecord> {
        let history = self.history.borrow();
        let skip = history.len().saturating_sub(n);
        history.iter().skip(skip).cloned().collect()
    }

    /// Stop accepting work and discard everything still queued. Running
    /// tasks keep going on later ticks.
    pub fn shutdown(&self) {
        if self.shutting_down.replace(true) {
            return;
        }
        let mut discarded = Vec::new();
        for (name, pool) in self.pools.borrow_mut().iter_mut() {
            for task in pool.queue.drain() {
                discarded.push((name.clone(), task));
            }
        }
        info!("scheduler shutting down, {} queued tasks discarded", discarded.len());
        for (pool, task) in discarded {
            (task.fail)(TaskError::Discarded);
            self.record(TaskRecord {
                id: task.id,
                pool,
                label: task.label,
                priority: task.priority,
                state: TaskState::Failed,
                error: Some(TaskError::Discarded.to_string()),
            });
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.get()
    }

    fn fill(&self, name: &str) -> bool {
        let mut pools = self.pools.borrow_mut();
        let Some(pool) = pools.get_mut(name) else {
            return false;
        };
        let mut started = false;
        while pool.active < pool.capacity {
            let Some(task) = pool.queue.pop() else { break };
            debug!("start #{} '{}' on {name}", task.id, task.label);
            pool.active += 1;
            self.live.borrow_mut().insert(task.id, TaskState::Running);
            pool.running.push(task);
            started = true;
        }
        started
    }

    fn finish(&self, record: TaskRecord) {
        if let Some(error) = &record.error {
            warn!(
                "task #{} '{}' on {} failed: {error}",
                record.id, record.label, record.pool
            );
            self.bus.publish(
                "task.failed",
                json!({
                    "id": record.id,
                    "pool": record.pool,
                    "label": record.label,
                    "error": error,
                }),
            );
        }
        self.record(record);
    }

    fn record(&self, record: TaskRecord) {
        self.live.borrow_mut().remove(&record.id);
        if self.history_cap == 0 {
            return;
        }
        let mut history = self.history.borrow_mut();
        while history.len() >= self.history_cap {
            history.pop_front();
        }
        history.push_back(record);
    }
}

fn poll_task(pool: &str, mut task: Task) -> Outcome {
    let mut cx = Context::from_waker(noop_waker_ref());
    let polled = catch_unwind(AssertUnwindSafe(|| task.future.as_mut().poll(&mut cx)));
    let error = match polled {
        Ok(Poll::Pending) => return Outcome::Pending(task),
        Ok(Poll::Ready(Ok(()))) => None,
        Ok(Poll::Ready(Err(e))) => Some(e),
        Err(panic) => {
            let e = TaskError::Panicked(panic_message(panic.as_ref()));
            (task.fail)(e.clone());
            Some(e)
        }
    };
    Outcome::Done(TaskRecord {
        id: task.id,
        pool: pool.to_owned(),
        label: task.label,
        priority: task.priority,
        state: if error.is_some() {
            TaskState::Failed
        } else {
            TaskState::Completed
        },
        error: error.map(|e| e.to_string()),
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::yield_now;

    fn scheduler(pools: &[(&str, usize)]) -> Scheduler {
        let pools = pools.iter().map(|(n, c)| ((*n).to_owned(), *c)).collect();
        Scheduler::new(Rc::new(EventBus::new(100)), &pools, 64)
    }

    #[test]
    fn capacity_bound_holds_and_all_complete() {
        let sched = scheduler(&[("io", 3)]);
        let active = Rc::new(Cell::new(0usize));
        let peak = Rc::new(Cell::new(0usize));
        let mut handles = Vec::new();

        for i in 0..10u32 {
            let active = Rc::clone(&active);
            let peak = Rc::clone(&peak);
            let handle = sched
                .submit("io", 0, async move {
                    active.set(active.get() + 1);
                    peak.set(peak.get().max(active.get()));
                    for _ in 0..3 {
                        yield_now().await;
                    }
                    active.set(active.get() - 1);
                    Ok(i)
                })
                .unwrap();
            handles.push(handle);
        }
        assert_eq!(sched.pools()["io"].queued, 10);

        sched.tick();
        assert_eq!(sched.pools()["io"].active, 3);
        sched.run_until_idle();

        assert!(peak.get() <= 3);
        assert_eq!(peak.get(), 3);
        let results: Vec<u32> = handles.iter().map(|h| h.try_take().unwrap().unwrap()).collect();
        assert_eq!(results, (0..10).collect::<Vec<_>>());
        assert_eq!(sched.pools()["io"], PoolStats { capacity: 3, active: 0, queued: 0 });
    }

    #[test]
    fn higher_priority_starts_first_once_a_slot_frees() {
        let sched = scheduler(&[("io", 1)]);
        let order = Rc::new(RefCell::new(Vec::new()));

        let blocker_log = Rc::clone(&order);
        sched
            .submit("io", 0, async move {
                blocker_log.borrow_mut().push(0);
                yield_now().await;
                Ok(())
            })
            .unwrap();
        sched.tick();

        for priority in [1, 9] {
            let log = Rc::clone(&order);
            sched
                .submit("io", priority, async move {
                    log.borrow_mut().push(priority);
                    Ok(())
                })
                .unwrap();
        }
        sched.run_until_idle();
        assert_eq!(*order.borrow(), vec![0, 9, 1]);
    }

    #[test]
    fn equal_priority_is_fifo() {
        let sched = scheduler(&[("io", 1)]);
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..5 {
            let log = Rc::clone(&order);
            sched
                .submit("io", 4, async move {
                    log.borrow_mut().push(i);
                    Ok(())
                })
                .unwrap();
        }
        sched.run_until_idle();
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn failure_is_isolated_and_published() {
        let sched = scheduler(&[("io", 1)]);
        let bad = sched
            .submit_labeled("io", 0, "bad", async { Err::<u32, _>(TaskError::failed("boom")) })
            .unwrap();
        let good = sched.submit("io", 0, async { Ok(5u32) }).unwrap();
        sched.run_until_idle();

        assert_eq!(bad.try_take(), Some(Err(TaskError::Failed("boom".to_owned()))));
        assert_eq!(good.try_take(), Some(Ok(5)));

        let failed: Vec<_> = sched
            .bus()
            .recent_events(10)
            .into_iter()
            .filter(|e| e.topic == "task.failed")
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].payload["label"], "bad");

        let records = sched.recent_tasks(10);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].state, TaskState::Failed);
        assert_eq!(records[1].state, TaskState::Completed);
    }

    #[test]
    fn panic_is_caught_at_pool_boundary() {
        let sched = scheduler(&[("io", 1)]);
        let crashing = sched
            .submit("io", 0, async {
                yield_now().await;
                if true {
                    panic!("kaboom");
                }
                Ok(())
            })
            .unwrap();
        let after = sched.submit("io", 0, async { Ok("still running") }).unwrap();
        sched.run_until_idle();

        assert_eq!(
            crashing.try_take(),
            Some(Err(TaskError::Panicked("kaboom".to_owned())))
        );
        assert_eq!(after.try_take(), Some(Ok("still running")));
    }

    #[test]
    fn pools_do_not_starve_each_other() {
        let sched = scheduler(&[("io", 1), ("index", 1)]);
        let spinner = sched
            .submit("io", 0, async {
                for _ in 0..50 {
                    yield_now().await;
                }
                Ok(())
            })
            .unwrap();
        let scan = sched.submit("index", 0, async { Ok(1) }).unwrap();
        sched.tick();
        assert!(scan.is_finished());
        assert!(!spinner.is_finished());
    }

    #[test]
    fn shutdown_discards_queued_and_rejects_new_work() {
        let sched = scheduler(&[("io", 1)]);
        let running = sched
            .submit("io", 0, async {
                yield_now().await;
                Ok(1)
            })
            .unwrap();
        let queued = sched.submit("io", 0, async { Ok(2) }).unwrap();
        sched.tick();
        sched.shutdown();

        assert_eq!(queued.try_take(), Some(Err(TaskError::Discarded)));
        assert_eq!(
            sched.submit("io", 0, async { Ok(3) }).err(),
            Some(RuntimeError::ShuttingDown)
        );
        sched.run_until_idle();
        assert_eq!(running.try_take(), Some(Ok(1)));
    }

    #[test]
    fn unknown_pool_is_rejected() {
        let sched = scheduler(&[("io", 1)]);
        let err = sched.submit("gpu", 0, async { Ok(()) }).err();
        assert_eq!(err, Some(RuntimeError::UnknownPool("gpu".to_owned())));
    }

    #[test]
    fn block_on_awaits_handles_and_joins() {
        let sched = scheduler(&[("io", 2)]);
        let a = sched
            .submit("io", 0, async {
                yield_now().await;
                Ok(2)
            })
            .unwrap();
        let b = sched.submit("io", 0, async { Ok(3) }).unwrap();
        let (a, b) = sched.block_on(futures::future::join(a, b)).unwrap();
        assert_eq!(a.unwrap() + b.unwrap(), 5);
    }

    #[test]
    fn block_on_reports_stall() {
        let sched = scheduler(&[("io", 1)]);
        let result = sched.block_on(futures::future::pending::<()>());
        assert_eq!(result, Err(RuntimeError::Stalled));
    }

    #[test]
    fn task_can_await_another_task() {
        let sched = Rc::new(scheduler(&[("io", 2), ("index", 1)]));
        let inner = Rc::clone(&sched);
        let outer = sched
            .submit("index", 0, async move {
                let child = inner
                    .submit("io", 0, async { Ok(20) })
                    .map_err(|e| TaskError::failed(e.to_string()))?;
                let v = child.await?;
                Ok(v + 1)
            })
            .unwrap();
        assert_eq!(sched.block_on(outer).unwrap(), Ok(21));
    }

    #[test]
    fn history_is_bounded() {
        let pools = [("io".to_owned(), 4)].into_iter().collect();
        let sched = Scheduler::new(Rc::new(EventBus::new(10)), &pools, 3);
        for _ in 0..6 {
            sched.submit("io", 0, async { Ok(()) }).unwrap();
        }
        sched.run_until_idle();
        assert_eq!(sched.recent_tasks(10).len(), 3);
        assert_eq!(sched.recent_tasks(10)[2].id, 6);
        assert_eq!(sched.task_state(1), None);
        assert_eq!(sched.task_state(6), Some(TaskState::Completed));
    }

    #[test]
    fn task_state_follows_the_lifecycle() {
        let sched = scheduler(&[("io", 1)]);
        let first = sched
            .submit("io", 0, async {
                yield_now().await;
                Ok(())
            })
            .unwrap();
        let second = sched
            .submit("io", 0, async { Err::<(), _>(TaskError::failed("no")) })
            .unwrap();
        assert_eq!(sched.task_state(first.id()), Some(TaskState::Queued));
        assert_eq!(sched.task_state(second.id()), Some(TaskState::Queued));

        sched.tick();
        assert_eq!(sched.task_state(first.id()), Some(TaskState::Running));
        assert_eq!(sched.task_state(second.id()), Some(TaskState::Queued));

        sched.run_until_idle();
        assert_eq!(sched.task_state(first.id()), Some(TaskState::Completed));
        assert_eq!(sched.task_state(second.id()), Some(TaskState::Failed));
        assert_eq!(sched.task_state(99), None);
    }

    #[test]
    fn discarded_task_state_is_failed() {
        let sched = scheduler(&[("io", 1)]);
        let queued = sched.submit("io", 0, async { Ok(()) }).unwrap();
        sched.shutdown();
        assert_eq!(sched.task_state(queued.id()), Some(TaskState::Failed));
    }
}
