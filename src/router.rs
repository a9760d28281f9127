//! Event subscription registry
//!
//! Maps an event name to its subscribers in subscription order. Dispatch
//! works on a snapshot of the list, so handlers may subscribe or unsubscribe
//! (themselves included) while a dispatch is running.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{trace, warn};

/// Handler invoked with an event payload
pub type EventCallback = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by [`EventRouter::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    callback: EventCallback,
}

/// Routes server-push events to subscribers
#[derive(Default)]
pub struct EventRouter {
    /// Subscribers by event name
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `event`
    pub fn subscribe<F>(&self, event: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .entry(event.to_owned())
            .or_default()
            .push(Subscriber {
                id,
                callback: Arc::new(callback),
            });
        trace!(event, subscription = id.0, "Subscribed");
        id
    }

    /// Remove a handler; returns false if it was not registered
    pub fn unsubscribe(&self, event: &str, id: SubscriptionId) -> bool {
        let mut guard = self.subscribers.write();
        let Some(list) = guard.get_mut(event) else {
            return false;
        };
        let Some(pos) = list.iter().position(|s| s.id == id) else {
            return false;
        };
        list.remove(pos);
        if list.is_empty() {
            guard.remove(event);
        }
        true
    }

    /// Deliver `payload` to every current subscriber of `event`.
    ///
    /// A handler that errors or panics is logged and skipped; the remaining
    /// handlers still run. Returns the number of handlers that succeeded.
    pub fn dispatch(&self, event: &str, payload: &Value) -> usize {
        let snapshot: Vec<(SubscriptionId, EventCallback)> = match self.subscribers.read().get(event) {
            Some(list) => list.iter().map(|s| (s.id, Arc::clone(&s.callback))).collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for (id, callback) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| callback(payload))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!(event, subscription = id.0, error = %e, "Event handler failed"),
                Err(_) => warn!(event, subscription = id.0, "Event handler panicked"),
            }
        }
        delivered
    }

    /// Number of subscribers for `event`
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.subscribers.read().get(event).map_or(0, Vec::len)
    }

    /// Total subscribers across all events
    pub fn len(&self) -> usize {
        self.subscribers.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every subscription. Handlers' captured state is released, which
    /// is how waiters learn that the link went away.
    pub fn clear(&self) {
        let drained: Vec<_> = self.subscribers.write().drain().collect();
        drop(drained);
    }
}
