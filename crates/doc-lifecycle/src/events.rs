//! Event infrastructure.
//!
//! Provides `DocEvent` for document lifecycle changes and a generic `EventBus`
//! for subscriptions. Buses are shared through `Arc` and are safe to publish
//! to from any task.

use crate::DocId;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by the lifecycle service.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DocEvent {
    /// A document record was inserted and its content initialized.
    Created {
        id: DocId,
        /// Milliseconds since Unix epoch.
        timestamp: i64,
    },
    /// Content and properties were copied from `source` into `target`.
    Duplicated {
        source: DocId,
        target: DocId,
        /// False when the content transform failed and only metadata was copied.
        complete: bool,
    },
    /// Trash flag set.
    Trashed { id: DocId },
    /// Trash flag cleared.
    Restored { id: DocId },
    /// The pooled handle was evicted after its last release.
    Evicted { id: DocId },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Hold this value to keep receiving events, drop it to unsubscribe.
pub struct Subscription {
    bus: Weak<dyn Unsubscribe>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, id: usize);
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Event bus for publishing events to subscribers.
///
/// Used for lifecycle events (`EventBus<DocEvent>`) as well as the change
/// streams of the metadata store and content handles. Wrap in `Arc` to
/// enable subscriptions.
pub struct EventBus<E> {
    callbacks: RwLock<Vec<(usize, Callback<E>)>>,
    next_id: AtomicUsize,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<E: 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&E) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        let bus: Arc<dyn Unsubscribe> = Arc::clone(self) as Arc<dyn Unsubscribe>;
        Subscription {
            bus: Arc::downgrade(&bus),
            id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: E) {
        // Snapshot so callbacks may subscribe or drop subscriptions
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(&event);
        }
    }
}

impl<E: 'static> Unsubscribe for EventBus<E> {
    fn unsubscribe(&self, id: usize) {
        // emit never holds the lock while callbacks run, so waiting here is safe
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn id(s: &str) -> DocId {
        s.parse().unwrap()
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus: Arc<EventBus<DocEvent>> = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let _sub = bus.subscribe(move |event| {
            seen_clone.lock().unwrap().push(event.clone());
        });

        bus.emit(DocEvent::Trashed { id: id("a") });

        assert_eq!(*seen.lock().unwrap(), vec![DocEvent::Trashed { id: id("a") }]);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus: Arc<EventBus<DocEvent>> = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let sub = bus.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });
        bus.emit(DocEvent::Restored { id: id("a") });
        drop(sub);
        bus.emit(DocEvent::Restored { id: id("a") });

        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_drop_waits_for_concurrent_reader() {
        let bus: Arc<EventBus<DocEvent>> = Arc::new(EventBus::new());
        let sub = bus.subscribe(|_| {});

        let reader = bus.callbacks.read().unwrap();
        let dropper = std::thread::spawn(move || drop(sub));
        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(reader);
        dropper.join().unwrap();

        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_callback_may_drop_subscription_during_emit() {
        let bus: Arc<EventBus<DocEvent>> = Arc::new(EventBus::new());
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot_clone = Arc::clone(&slot);

        let sub = bus.subscribe(move |_| {
            slot_clone.lock().unwrap().take();
        });
        *slot.lock().unwrap() = Some(sub);
        bus.emit(DocEvent::Evicted { id: id("a") });

        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_callback_may_subscribe_during_emit() {
        let bus: Arc<EventBus<DocEvent>> = Arc::new(EventBus::new());
        let inner_subs = Arc::new(Mutex::new(Vec::new()));
        let bus_clone = Arc::clone(&bus);
        let inner_clone = Arc::clone(&inner_subs);

        let _sub = bus.subscribe(move |_| {
            let sub = bus_clone.subscribe(|_| {});
            inner_clone.lock().unwrap().push(sub);
        });
        bus.emit(DocEvent::Evicted { id: id("a") });

        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn test_event_serialization() {
        let event = DocEvent::Duplicated {
            source: id("a"),
            target: id("b"),
            complete: true,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"duplicated\""));
        assert!(json.contains("\"source\":\"a\""));
        assert!(json.contains("\"complete\":true"));
    }
}
