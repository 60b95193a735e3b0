// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::warn;

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle returned by [`EventBus::on`] / [`EventBus::once`]; pass it to
/// [`EventBus::off`] to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberId {
    event: String,
    id: u64,
}

struct Entry {
    id: u64,
    once: bool,
    handler: Handler,
}

#[derive(Default)]
struct BusInner {
    handlers: HashMap<String, Vec<Entry>>,
    wildcard: Vec<Entry>,
}

/// In-process publish-subscribe dispatcher keyed by event name.
///
/// Delivery is synchronous on the emitter's execution context, specific
/// handlers first, then `"*"` subscribers.  A panicking handler does not
/// prevent delivery to the rest.  Handlers run outside the bus lock, so they
/// may freely subscribe or emit again.
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `event`, or for every event with `"*"`.
    pub fn on(&self, event: &str, handler: impl Fn(&Value) + Send + Sync + 'static) -> SubscriberId {
        self.subscribe(event, false, Arc::new(handler))
    }

    /// Like [`on`](Self::on) but the handler is removed after its first
    /// delivery.
    pub fn once(
        &self,
        event: &str,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> SubscriberId {
        self.subscribe(event, true, Arc::new(handler))
    }

    fn subscribe(&self, event: &str, once: bool, handler: Handler) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Entry { id, once, handler };
        let mut inner = self.inner.lock().unwrap();
        if event == "*" {
            inner.wildcard.push(entry);
        } else {
            inner.handlers.entry(event.to_string()).or_default().push(entry);
        }
        SubscriberId {
            event: event.to_string(),
            id,
        }
    }

    pub fn off(&self, sub: &SubscriberId) {
        let mut inner = self.inner.lock().unwrap();
        if sub.event == "*" {
            inner.wildcard.retain(|e| e.id != sub.id);
        } else if let Some(entries) = inner.handlers.get_mut(&sub.event) {
            entries.retain(|e| e.id != sub.id);
        }
    }

    /// Synchronous fan-out.  `"*"` as the event name reaches nobody: the
    /// wildcard is a subscription facet, not an event name.
    pub fn emit(&self, event: &str, data: Value) {
        let to_call: Vec<Handler> = {
            let mut inner = self.inner.lock().unwrap();
            let mut batch = Vec::new();
            if let Some(entries) = inner.handlers.get_mut(event) {
                batch.extend(entries.iter().map(|e| Arc::clone(&e.handler)));
                entries.retain(|e| !e.once);
            }
            if event != "*" {
                batch.extend(inner.wildcard.iter().map(|e| Arc::clone(&e.handler)));
                inner.wildcard.retain(|e| !e.once);
            }
            batch
        };
        for handler in to_call {
            if catch_unwind(AssertUnwindSafe(|| handler(&data))).is_err() {
                warn!(event, "event handler panicked; continuing fan-out");
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn counter_handler(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> impl Fn(&Value) + Send + Sync {
        let log = Arc::clone(log);
        let tag = tag.to_string();
        move |_| log.lock().unwrap().push(tag.clone())
    }

    #[test]
    fn specific_handler_receives_matching_event_only() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on("a", counter_handler(&log, "a"));
        bus.emit("a", json!(1));
        bus.emit("b", json!(2));
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
    }

    #[test]
    fn wildcard_receives_every_named_event() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on("*", counter_handler(&log, "w"));
        bus.emit("a", json!(1));
        bus.emit("b", json!(2));
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn emitting_star_does_not_trigger_wildcard() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on("*", counter_handler(&log, "w"));
        bus.emit("*", json!(1));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn specific_handlers_run_before_wildcard() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on("*", counter_handler(&log, "wild"));
        bus.on("a", counter_handler(&log, "specific"));
        bus.emit("a", json!(1));
        assert_eq!(*log.lock().unwrap(), vec!["specific", "wild"]);
    }

    #[test]
    fn once_auto_removes_after_first_delivery() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.once("a", counter_handler(&log, "once"));
        bus.emit("a", json!(1));
        bus.emit("a", json!(2));
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn off_removes_the_handler() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sub = bus.on("a", counter_handler(&log, "a"));
        bus.off(&sub);
        bus.emit("a", json!(1));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn panicking_handler_does_not_stop_fanout() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on("a", |_| panic!("boom"));
        bus.on("a", counter_handler(&log, "survivor"));
        bus.emit("a", json!(1));
        assert_eq!(*log.lock().unwrap(), vec!["survivor"]);
    }

    #[test]
    fn handler_may_emit_reentrantly() {
        let bus = Arc::new(EventBus::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let bus2 = Arc::clone(&bus);
            let log2 = Arc::clone(&log);
            bus.on("outer", move |_| {
                log2.lock().unwrap().push("outer".to_string());
                bus2.emit("inner", json!(null));
            });
        }
        bus.on("inner", counter_handler(&log, "inner"));
        bus.emit("outer", json!(null));
        assert_eq!(*log.lock().unwrap(), vec!["outer", "inner"]);
    }

    #[test]
    fn per_name_delivery_is_fifo() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on("a", counter_handler(&log, "first"));
        bus.on("a", counter_handler(&log, "second"));
        bus.emit("a", json!(1));
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }
}
