//! Subscriber registry - isolated fan-out of notifications
//!
//! Listeners run in registration order. A panicking listener is caught
//! and logged; the remaining listeners still receive the event.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Listener callback
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Handle returned by `subscribe`; releasing it twice is a no-op
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(u64);

/// Ordered set of listeners for events of type `E`
pub struct SubscriberRegistry<E> {
    listeners: RwLock<Vec<(SubscriptionToken, Listener<E>)>>,
    next_id: AtomicU64,
    panics: AtomicU64,
}

impl<E> SubscriberRegistry<E> {
    pub fn new() -> Self {
        SubscriberRegistry {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            panics: AtomicU64::new(0),
        }
    }

    /// Register a listener at the end of the delivery order
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionToken
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let token = SubscriptionToken(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((token, Arc::new(listener)));
        token
    }

    /// Remove a listener. Returns whether it was still registered.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(t, _)| *t != token);
        listeners.len() != before
    }

    /// Deliver an event to every listener; returns how many completed normally
    pub fn notify(&self, event: &E) -> usize {
        // Listeners may (un)subscribe while being notified
        let listeners: Vec<_> = self
            .listeners
            .read()
            .iter()
            .map(|(token, listener)| (*token, Arc::clone(listener)))
            .collect();

        let mut delivered = 0;
        for (token, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    self.panics.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(?token, "listener panicked; continuing delivery");
                }
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Listener panics caught so far
    pub fn panics(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }
}

impl<E> Default for SubscriberRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}
