//! In-memory multi-subscriber event bus with filters and full replay
//!
//! Fan-out on [`EventBus::publish`] is synchronous and happens in
//! subscription order. Late subscribers do not see past events; they catch up
//! through [`EventBus::replay`]. The subscriber list is snapshotted before
//! fan-out so listeners may subscribe or unsubscribe from inside a callback
//! without invalidating the iteration.

use crate::events::{EventFilter, RuntimeEvent};
use nutype::nutype;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::warn;

/// Handle identifying one subscription, used to unsubscribe
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, From, Into))]
pub struct SubscriptionId(u64);

/// Callback invoked for every matching event
pub type EventListener = Arc<dyn Fn(&RuntimeEvent) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    filter: EventFilter,
    listener: EventListener,
}

/// Multi-subscriber in-memory pub/sub with filtered subscriptions and replay
pub struct EventBus {
    subscribers: RwLock<Arc<Vec<Arc<Subscriber>>>>,
    history: Mutex<Vec<RuntimeEvent>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Arc::new(Vec::new())),
            history: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Publishes an event to every matching subscriber and retains it for
    /// replay.
    ///
    /// Listener panics are swallowed so one faulty subscriber cannot starve
    /// the rest.
    pub fn publish(&self, event: RuntimeEvent) {
        self.history
            .lock()
            .expect("event history mutex poisoned")
            .push(event.clone());

        let snapshot = Arc::clone(&*self.subscribers.read().expect("subscriber lock poisoned"));
        for subscriber in snapshot.iter() {
            if subscriber.filter.matches(&event) {
                let listener = Arc::clone(&subscriber.listener);
                if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                    warn!(
                        event_type = %event.event_type,
                        subscription = %subscriber.id,
                        "event listener panicked; continuing fan-out"
                    );
                }
            }
        }
    }

    /// Registers a listener for events matching `filter`.
    pub fn subscribe(&self, filter: EventFilter, listener: EventListener) -> SubscriptionId {
        let id = SubscriptionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut guard = self.subscribers.write().expect("subscriber lock poisoned");
        let mut next = Vec::clone(&guard);
        next.push(Arc::new(Subscriber {
            id,
            filter,
            listener,
        }));
        *guard = Arc::new(next);
        id
    }

    /// Removes a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut guard = self.subscribers.write().expect("subscriber lock poisoned");
        let before = guard.len();
        let next: Vec<Arc<Subscriber>> = guard.iter().filter(|s| s.id != id).cloned().collect();
        let removed = next.len() != before;
        *guard = Arc::new(next);
        removed
    }

    /// Returns copies of all retained events matching `filter` (all events
    /// when `filter` is `None`), in publish order.
    #[must_use]
    pub fn replay(&self, filter: Option<&EventFilter>) -> Vec<RuntimeEvent> {
        let history = self.history.lock().expect("event history mutex poisoned");
        match filter {
            None => history.clone(),
            Some(f) => history.iter().filter(|e| f.matches(e)).cloned().collect(),
        }
    }

    /// Number of events published so far.
    #[must_use]
    pub fn events_published(&self) -> usize {
        self.history
            .lock()
            .expect("event history mutex poisoned")
            .len()
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .expect("subscriber lock poisoned")
            .len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("events", &self.events_published())
            .finish()
    }
}
