use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

use super::websocket::{EventKind, ServerEvent};

/// Callback invoked for every event of the kind it was registered for
pub type EventCallback = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Typed dispatcher table for channel events
pub struct EventHandler {
    listeners: Mutex<HashMap<EventKind, Vec<(u64, EventCallback)>>>,
    next_id: AtomicU64,
}

impl EventHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Register a callback; it stays registered until the returned handle is dropped
    pub fn subscribe<F>(self: &Arc<Self>, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));

        Subscription {
            handler: Arc::downgrade(self),
            kind,
            id,
        }
    }

    /// Deliver an event to its listeners, returning how many were called.
    ///
    /// Callbacks run outside the table lock, so they may subscribe or drop
    /// subscriptions themselves.
    pub fn handle_message(&self, event: &ServerEvent) -> usize {
        let kind = event.kind();
        let callbacks: Vec<EventCallback> = self.listeners.lock()
            .get(&kind)
            .map(|entries| entries.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();

        trace!("Dispatching {:?} to {} listener(s)", kind, callbacks.len());
        for callback in &callbacks {
            callback(event);
        }
        callbacks.len()
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.lock().get(&kind).map_or(0, Vec::len)
    }

    fn unsubscribe(&self, kind: EventKind, id: u64) {
        let mut listeners = self.listeners.lock();
        if let Some(entries) = listeners.get_mut(&kind) {
            entries.retain(|(entry_id, _)| *entry_id != id);
            if entries.is_empty() {
                listeners.remove(&kind);
            }
        }
    }
}

/// Registration handle; dropping it removes the callback
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    handler: Weak<EventHandler>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.upgrade() {
            handler.unsubscribe(self.kind, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}
