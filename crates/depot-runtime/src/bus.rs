//! Topic-based publish/subscribe with deferred delivery.
//!
//! `publish` only queues; handlers run when the scheduler calls `dispatch`
//! once per tick. Every published event is also kept in a bounded history
//! ring, where the oldest entries are evicted first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use tracing::{trace, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    All,
    /// Namespace prefix including the trailing dot.
    Prefix(String),
    Exact(String),
}

impl Pattern {
    fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            Pattern::All
        } else if let Some(ns) = pattern.strip_suffix('*').filter(|p| p.ends_with('.')) {
            Pattern::Prefix(ns.to_owned())
        } else {
            Pattern::Exact(pattern.to_owned())
        }
    }

    fn matches(&self, topic: &str) -> bool {
        match self {
            Pattern::All => true,
            Pattern::Prefix(ns) => topic.len() > ns.len() && topic.starts_with(ns.as_str()),
            Pattern::Exact(t) => t == topic,
        }
    }
}

type Handler = Rc<RefCell<dyn FnMut(&Event)>>;

struct Subscriber {
    id: SubscriptionId,
    pattern: Pattern,
    handler: Handler,
}

pub struct EventBus {
    queue: RefCell<VecDeque<Event>>,
    history: RefCell<VecDeque<Event>>,
    capacity: usize,
    subscribers: RefCell<Vec<Subscriber>>,
    next_id: Cell<u64>,
    dispatching: Cell<bool>,
}

impl EventBus {
    pub fn new(history: usize) -> Self {
        Self {
            queue: RefCell::new(VecDeque::new()),
            history: RefCell::new(VecDeque::with_capacity(history)),
            capacity: history,
            subscribers: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
            dispatching: Cell::new(false),
        }
    }

    pub fn publish(&self, topic: impl Into<String>, payload: Value) {
        let event = Event {
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
        };
        trace!("publish {}", event.topic);

        if self.capacity > 0 {
            let mut history = self.history.borrow_mut();
            while history.len() >= self.capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        self.queue.borrow_mut().push_back(event);
    }

    /// Register `handler` for topics matching `pattern`: an exact topic,
    /// a namespace such as `storage.*`, or `*` for everything.
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: impl FnMut(&Event) + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.subscribers.borrow_mut().push(Subscriber {
            id,
            pattern: Pattern::parse(pattern),
            handler: Rc::new(RefCell::new(handler)),
        });
        id
    }

    /// Returns whether a subscription was removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.borrow_mut();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Up to `n` most recent events, oldest first.
    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        let history = self.history.borrow();
        let skip = history.len().saturating_sub(n);
        history.iter().skip(skip).cloned().collect()
    }

    /// Events queued but not yet delivered.
    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Deliver every event queued before this call. Events published by
    /// handlers wait for the next dispatch. Returns the number of events
    /// delivered; a nested call from inside a handler delivers nothing.
    pub fn dispatch(&self) -> usize {
        if self.dispatching.replace(true) {
            return 0;
        }
        let _reset = DispatchGuard(&self.dispatching);

        let batch: Vec<Event> = self.queue.borrow_mut().drain(..).collect();
        for event in &batch {
            let handlers: Vec<Handler> = self
                .subscribers
                .borrow()
                .iter()
                .filter(|s| s.pattern.matches(&event.topic))
                .map(|s| Rc::clone(&s.handler))
                .collect();

            for handler in handlers {
                let Ok(mut f) = handler.try_borrow_mut() else {
                    continue;
                };
                if catch_unwind(AssertUnwindSafe(|| (*f)(event))).is_err() {
                    warn!("subscriber panicked while handling '{}'", event.topic);
                }
            }
        }
        batch.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

struct DispatchGuard<'a>(&'a Cell<bool>);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collector(bus: &EventBus, pattern: &str) -> Rc<RefCell<Vec<String>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        bus.subscribe(pattern, move |e| sink.borrow_mut().push(e.topic.clone()));
        seen
    }

    #[test]
    fn delivery_is_deferred_until_dispatch() {
        let bus = EventBus::new(10);
        let seen = collector(&bus, "storage.withdraw");
        bus.publish("storage.withdraw", json!({"count": 5}));
        assert!(seen.borrow().is_empty());
        assert_eq!(bus.pending(), 1);

        assert_eq!(bus.dispatch(), 1);
        assert_eq!(*seen.borrow(), vec!["storage.withdraw"]);
        assert_eq!(bus.pending(), 0);
    }

    #[test]
    fn patterns_match_exact_namespace_and_all() {
        let bus = EventBus::new(10);
        let exact = collector(&bus, "index.update");
        let ns = collector(&bus, "storage.*");
        let all = collector(&bus, "*");

        bus.publish("index.update", Value::Null);
        bus.publish("storage.move", Value::Null);
        bus.publish("storage", Value::Null);
        bus.publish("storagex.move", Value::Null);
        bus.dispatch();

        assert_eq!(*exact.borrow(), vec!["index.update"]);
        assert_eq!(*ns.borrow(), vec!["storage.move"]);
        assert_eq!(all.borrow().len(), 4);
    }

    #[test]
    fn handler_publish_waits_for_next_dispatch() {
        let bus = Rc::new(EventBus::new(10));
        let inner = Rc::clone(&bus);
        bus.subscribe("a", move |_| inner.publish("b", Value::Null));
        let seen = collector(&bus, "b");

        bus.publish("a", Value::Null);
        assert_eq!(bus.dispatch(), 1);
        assert!(seen.borrow().is_empty());
        assert_eq!(bus.pending(), 1);
        assert_eq!(bus.dispatch(), 1);
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn nested_dispatch_is_a_no_op() {
        let bus = Rc::new(EventBus::new(10));
        let inner = Rc::clone(&bus);
        let nested = Rc::new(Cell::new(usize::MAX));
        let out = Rc::clone(&nested);
        bus.subscribe("a", move |_| out.set(inner.dispatch()));
        bus.publish("a", Value::Null);
        bus.dispatch();
        assert_eq!(nested.get(), 0);
    }

    #[test]
    fn history_ring_evicts_oldest() {
        let bus = EventBus::new(3);
        for i in 0..5 {
            bus.publish(format!("t.{i}"), json!(i));
        }
        let recent: Vec<String> = bus.recent_events(10).into_iter().map(|e| e.topic).collect();
        assert_eq!(recent, vec!["t.2", "t.3", "t.4"]);
        let last = bus.recent_events(1);
        assert_eq!(last[0].payload, json!(4));
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new(10);
        let seen = Rc::new(RefCell::new(0));
        let sink = Rc::clone(&seen);
        let id = bus.subscribe("*", move |_| *sink.borrow_mut() += 1);
        bus.publish("x", Value::Null);
        bus.dispatch();
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish("x", Value::Null);
        bus.dispatch();
        assert_eq!(*seen.borrow(), 1);
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let bus = EventBus::new(10);
        bus.subscribe("x", |_| panic!("observer bug"));
        let seen = collector(&bus, "x");
        bus.publish("x", Value::Null);
        bus.dispatch();
        assert_eq!(seen.borrow().len(), 1);
        bus.publish("x", Value::Null);
        assert_eq!(bus.dispatch(), 1);
    }
}
