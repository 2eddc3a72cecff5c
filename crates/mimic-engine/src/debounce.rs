//! At-most-once delivery of engine termination events.
//!
//! Several supervisors may observe the same engine going away: the task
//! waiting on the process or container, and a removal supervisor that gives
//! up after a timeout. Only the first report for a registered id releases the
//! wait-group and reaches subscribers; the rest are dropped.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::waitgroup::WaitGroup;

/// A terminal event for one engine instance.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub id: String,
    /// Set when the engine terminated abnormally.
    pub err: Option<Arc<str>>,
}

impl LifecycleEvent {
    pub fn stopped(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            err: None,
        }
    }

    pub fn failed(id: impl Into<String>, err: impl AsRef<str>) -> Self {
        Self {
            id: id.into(),
            err: Some(Arc::from(err.as_ref())),
        }
    }
}

#[derive(Debug)]
pub struct Debouncer {
    live: Mutex<HashSet<String>>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl Debouncer {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            live: Mutex::new(HashSet::new()),
            events,
        }
    }

    /// Mark `id` live and account for its supervisor in `wg`.
    pub fn register(&self, wg: &WaitGroup, id: &str) {
        let mut live = self.live.lock();
        if live.insert(id.to_string()) {
            wg.add(1);
            trace!(id = %id, "Registered engine for termination tracking");
        }
    }

    /// Deliver `event` if its id is live. Returns whether it was delivered.
    pub fn notify(&self, wg: &WaitGroup, event: LifecycleEvent) -> bool {
        // cheap check first so racing duplicates rarely contend on removal
        if !self.live.lock().contains(&event.id) {
            debug!(id = %event.id, "Dropping duplicate termination event");
            return false;
        }
        let removed = self.live.lock().remove(&event.id);
        if !removed {
            debug!(id = %event.id, "Termination already reported by another supervisor");
            return false;
        }
        // Publish before releasing the wait-group so a woken waiter can
        // already read the event. No subscribers is fine.
        let _ = self.events.send(event);
        wg.done();
        true
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.live.lock().contains(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new()
    }
}
