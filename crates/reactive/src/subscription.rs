//! Subscription management for change streams.
//!
//! This module provides subscription IDs, a registry of listeners, and the
//! RAII guard handed back to subscribers.

use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::Mutex;
use ripple_core::{ChangeEvent, Item};

/// Unique identifier for a subscription.
pub type SubscriptionId = u64;

/// Callback invoked with every published change.
///
/// Listeners run on the publishing task and must not block; operators only
/// enqueue the record and wake their worker.
pub type Listener<T> = Arc<dyn Fn(&Arc<ChangeEvent<T>>) + Send + Sync>;

/// Registry of listeners for one change stream.
pub struct SubscriptionManager<T> {
    /// Registered listeners
    listeners: HashMap<SubscriptionId, Listener<T>>,
    /// Next subscription ID to assign
    next_id: SubscriptionId,
}

impl<T> Default for SubscriptionManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SubscriptionManager<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            listeners: HashMap::new(),
            next_id: 1,
        }
    }

    /// Registers a listener and returns its ID.
    pub fn subscribe(&mut self, listener: Listener<T>) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        self.listeners.insert(id, listener);
        id
    }

    /// Unsubscribes by ID.
    ///
    /// Returns true if the subscription was found and removed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    /// Returns a copy of the current listener list.
    pub fn listeners(&self) -> Vec<Listener<T>> {
        self.listeners.values().cloned().collect()
    }

    /// Returns the number of registered listeners.
    #[inline]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Returns true if there are no listeners.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Returns all subscription IDs.
    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        self.listeners.keys().copied().collect()
    }

    /// Removes every listener.
    pub fn clear(&mut self) {
        self.listeners.clear();
    }
}

/// Handle to a registered listener; unsubscribes when dropped.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: SubscriptionId,
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(id: SubscriptionId, detach: Box<dyn FnOnce() + Send + Sync>) -> Self {
        Self {
            id,
            detach: Some(detach),
        }
    }

    /// Returns the subscription ID.
    #[inline]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Unsubscribes now instead of at drop.
    pub fn unsubscribe(mut self) {
        self.detach_now();
    }

    fn detach_now(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

/// Fan-out point of one change stream.
pub struct Publisher<T> {
    registry: Arc<Mutex<SubscriptionManager<T>>>,
}

impl<T> Default for Publisher<T> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(SubscriptionManager::new())),
        }
    }
}

impl<T: Item> Publisher<T> {
    /// Creates a publisher without listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. The returned guard keeps it registered.
    pub fn subscribe(&self, listener: Listener<T>) -> Subscription {
        let id = self.registry.lock().subscribe(listener);
        let registry: Weak<Mutex<SubscriptionManager<T>>> = Arc::downgrade(&self.registry);
        Subscription::new(
            id,
            Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.lock().unsubscribe(id);
                }
            }),
        )
    }

    /// Delivers a change to every listener registered at the time of the call.
    ///
    /// The registry lock is released before any listener runs, so listeners
    /// may subscribe or unsubscribe from inside the callback.
    pub fn publish(&self, event: ChangeEvent<T>) {
        let listeners = self.registry.lock().listeners();
        if listeners.is_empty() {
            return;
        }
        let event = Arc::new(event);
        for listener in listeners {
            listener(&event);
        }
    }

    /// Returns the number of registered listeners.
    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().len()
    }
}
