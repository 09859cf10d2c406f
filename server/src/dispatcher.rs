//! Type-routed delivery of inbound messages to subscribers.
//!
//! The dispatcher owns the consuming end of the inbound queue and the
//! subscription registry. The host calls [`Dispatcher::drain`] on its own
//! schedule (typically once per tick); each queued message is parsed into an
//! [`Envelope`] and handed to every subscriber registered for its type, in
//! registration order, before the next message is looked at.
//!
//! Subscriptions are RAII handles: dropping a [`Subscription`] removes the
//! callback, so a collaborator that goes away can never be called again.

use crate::queue::InboundConsumer;
use log::{debug, info, warn};
use shared::{Envelope, InboundKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};

type Callback = Box<dyn Fn(&str) + Send + Sync>;

struct Subscriber {
    id: u64,
    /// Cleared on unsubscribe so an in-flight drain skips this callback.
    active: AtomicBool,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: HashMap<InboundKind, Vec<Arc<Subscriber>>>,
}

impl Registry {
    fn remove(&mut self, kind: InboundKind, id: u64) {
        if let Some(list) = self.subscribers.get_mut(&kind) {
            list.retain(|subscriber| {
                if subscriber.id == id {
                    subscriber.active.store(false, Ordering::Release);
                    false
                } else {
                    true
                }
            });
            if list.is_empty() {
                self.subscribers.remove(&kind);
            }
        }
    }
}

fn lock_registry(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle for one registered callback. Dropping it unsubscribes.
#[must_use = "dropping a Subscription immediately unsubscribes the callback"]
pub struct Subscription {
    kind: InboundKind,
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn kind(&self) -> InboundKind {
        self.kind
    }

    /// Removes the callback now. Equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock_registry(&registry).remove(self.kind, self.id);
            debug!("Unsubscribed callback {} from '{}'", self.id, self.kind);
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

/// Outcome of one [`Dispatcher::drain`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Messages routed to their type (including types with no subscribers).
    pub dispatched: usize,
    /// Messages dropped as malformed or of unknown type.
    pub dropped: usize,
}

pub struct Dispatcher {
    registry: Arc<Mutex<Registry>>,
    inbox: Mutex<InboundConsumer>,
}

impl Dispatcher {
    pub fn new(inbox: InboundConsumer) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            inbox: Mutex::new(inbox),
        }
    }

    /// Registers `callback` for messages of `kind`; it receives the raw payload.
    pub fn subscribe<F>(&self, kind: InboundKind, callback: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let mut registry = lock_registry(&self.registry);
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .subscribers
            .entry(kind)
            .or_default()
            .push(Arc::new(Subscriber {
                id,
                active: AtomicBool::new(true),
                callback: Box::new(callback),
            }));
        debug!("Subscribed callback {} to '{}'", id, kind);

        Subscription {
            kind,
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn subscriber_count(&self, kind: InboundKind) -> usize {
        lock_registry(&self.registry)
            .subscribers
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Dispatches every message queued at the time of the call, oldest first.
    ///
    /// Never blocks on the network. A drain started while another one is still
    /// running (for example from inside a callback) returns an empty report.
    pub fn drain(&self) -> DrainReport {
        let mut inbox = match self.inbox.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                debug!("Drain already in progress, skipping");
                return DrainReport::default();
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let mut report = DrainReport::default();
        for message in inbox.drain_available() {
            if self.dispatch(&message) {
                report.dispatched += 1;
            } else {
                report.dropped += 1;
            }
        }
        report
    }

    /// Routes one raw message. Returns `false` if it was dropped.
    fn dispatch(&self, message: &str) -> bool {
        let envelope = match Envelope::from_json(message) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed message: {}. Raw message: {}", e, message);
                return false;
            }
        };

        let kind = match envelope.kind.parse::<InboundKind>() {
            Ok(kind) => kind,
            Err(_) => {
                warn!("Received undefined message type '{}'", envelope.kind);
                return false;
            }
        };

        match kind {
            InboundKind::StartSignal => info!("Received message: 'start_signal'"),
            InboundKind::Subtitle => info!("Received subtitle: {}", envelope.payload),
            InboundKind::SelectionConfirmed => info!("Received selection confirmation"),
        }

        // Snapshot so callbacks may subscribe or unsubscribe without deadlocking.
        let subscribers: Vec<Arc<Subscriber>> = lock_registry(&self.registry)
            .subscribers
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        if subscribers.is_empty() {
            debug!("No subscribers for '{}'", kind);
        }

        for subscriber in subscribers {
            if subscriber.active.load(Ordering::Acquire) {
                (subscriber.callback)(&envelope.payload);
            }
        }
        true
    }
}
