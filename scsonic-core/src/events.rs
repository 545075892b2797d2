//! Subscription registry for facade events.
//!
//! `on` returns a [`Subscription`] capability; unsubscribing is by
//! capability, never by comparing handler references. `once` wraps a
//! single-shot subscriber that deregisters itself after the first
//! delivery. There is no backpressure: emission walks the current
//! subscriber list synchronously, and a handler returning an error is
//! reported on the `error` event instead of unwinding into the emitter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use scsonic_types::{Event, EventKind};

type Handler = Arc<dyn Fn(&Event) -> Result<(), String> + Send + Sync>;

struct Subscriber {
    id: u64,
    once: bool,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    by_kind: HashMap<EventKind, Vec<Subscriber>>,
}

/// Capability returned by [`EventHub::on`]; pass it back to
/// [`EventHub::off`] to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    kind: EventKind,
    id: u64,
}

/// Shared, thread-safe event hub.
#[derive(Clone)]
pub struct EventHub {
    registry: Arc<Mutex<Registry>>,
    next_id: Arc<AtomicU64>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&Event) -> Result<(), String> + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(kind, Arc::new(handler), false)
    }

    /// Deliver at most one event, then deregister.
    pub fn once(
        &self,
        kind: EventKind,
        handler: impl Fn(&Event) -> Result<(), String> + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(kind, Arc::new(handler), true)
    }

    fn subscribe(&self, kind: EventKind, handler: Handler, once: bool) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .lock()
            .unwrap()
            .by_kind
            .entry(kind)
            .or_default()
            .push(Subscriber { id, once, handler });
        Subscription { kind, id }
    }

    pub fn off(&self, subscription: Subscription) {
        if let Some(subs) = self
            .registry
            .lock()
            .unwrap()
            .by_kind
            .get_mut(&subscription.kind)
        {
            subs.retain(|s| s.id != subscription.id);
        }
    }

    /// Drop subscribers of one kind, or everything.
    pub fn remove_all(&self, kind: Option<EventKind>) {
        let mut registry = self.registry.lock().unwrap();
        match kind {
            Some(kind) => {
                registry.by_kind.remove(&kind);
            }
            None => registry.by_kind.clear(),
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.registry
            .lock()
            .unwrap()
            .by_kind
            .get(&kind)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Deliver to every subscriber of the event's kind. Handler errors
    /// are collected and republished as `Event::Error`, one per failing
    /// subscriber; errors from `error` handlers are only logged.
    pub fn emit(&self, event: &Event) {
        // Snapshot the handlers, then run them outside the registry lock
        // so subscribers may (un)subscribe from inside a handler.
        let kind = event.kind();
        let due: Vec<(u64, bool, Handler)> = {
            let registry = self.registry.lock().unwrap();
            registry
                .by_kind
                .get(&kind)
                .map(|subs| {
                    subs.iter()
                        .map(|s| (s.id, s.once, Arc::clone(&s.handler)))
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut failures: Vec<String> = Vec::new();
        for (id, once, handler) in due {
            let result = handler(event);
            if once {
                self.off(Subscription { kind, id });
            }
            if let Err(message) = result {
                failures.push(message);
            }
        }

        for message in failures {
            if kind == EventKind::Error {
                log::error!(target: "session::events", "error handler failed: {message}");
            } else {
                self.emit(&Event::Error(format!(
                    "subscriber failed on {kind:?}: {message}"
                )));
            }
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
