//! Event routing to front-end subscribers.
//!
//! Child-process tasks publish session-tagged events here. The router only
//! forwards events whose producer is still the current occupant of its
//! registry slot; output from torn-down or replaced processes is dropped.
//! Subscribers receive events over unbounded channels, so a slow consumer
//! never stalls a process reader.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use protocol::{Event, SessionId};
use tokio::sync::mpsc;

use crate::session::{Instance, ProcessKind, SessionRegistry};

/// Unique identifier for a subscriber.
pub type SubscriberId = u64;

struct Subscriber {
    filter: Option<SessionId>,
    tx: mpsc::UnboundedSender<Event>,
}

impl Subscriber {
    fn wants(&self, event: &Event) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |session_id| session_id == event.session_id())
    }
}

/// Receiving end of an event subscription.
///
/// A dropped subscription stays registered until the next publish it would
/// receive prunes it. Use [`EventRouter::unsubscribe`] to remove it at once.
pub struct EventSubscription {
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventSubscription {
    /// Returns the subscriber id.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Receives the next event. Returns `None` once the router is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Returns an already queued event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

/// Delivery counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EventStats {
    /// Events accepted for delivery.
    pub published: u64,
    /// Events dropped because their producer is no longer current.
    pub dropped_stale: u64,
    /// Individual subscriber deliveries.
    pub delivered: u64,
}

/// Fan-out of session events to subscribers.
pub struct EventRouter {
    registry: Arc<SessionRegistry>,
    subscribers: DashMap<SubscriberId, Subscriber>,
    next_subscriber: AtomicU64,
    published: AtomicU64,
    dropped_stale: AtomicU64,
    delivered: AtomicU64,
}

impl EventRouter {
    /// Creates a router that validates producers against `registry`.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            subscribers: DashMap::new(),
            next_subscriber: AtomicU64::new(1),
            published: AtomicU64::new(0),
            dropped_stale: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    /// Subscribes to events from every session.
    pub fn subscribe(&self) -> EventSubscription {
        self.add_subscriber(None)
    }

    /// Subscribes to events from one session.
    pub fn subscribe_session(&self, session_id: SessionId) -> EventSubscription {
        self.add_subscriber(Some(session_id))
    }

    fn add_subscriber(&self, filter: Option<SessionId>) -> EventSubscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(id, Subscriber { filter, tx });
        tracing::debug!(subscriber_id = id, "Event subscriber added");
        EventSubscription { id, rx }
    }

    /// Removes a subscriber explicitly.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    /// Returns the number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Publishes an event produced by the process `instance` of `kind`.
    ///
    /// Returns false if the event was dropped as a straggler.
    pub fn publish(&self, kind: ProcessKind, instance: Instance, event: Event) -> bool {
        let session_id = event.session_id();
        if !self.registry.is_current(session_id, kind, instance) {
            self.dropped_stale.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                session_id = %session_id,
                event = event.name(),
                instance,
                "Dropped event from stale process"
            );
            return false;
        }
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut closed = Vec::new();
        for subscriber in self.subscribers.iter() {
            if !subscriber.wants(&event) {
                continue;
            }
            if subscriber.tx.send(event.clone()).is_ok() {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            } else {
                closed.push(*subscriber.key());
            }
        }

        for id in closed {
            self.subscribers.remove(&id);
            tracing::debug!(subscriber_id = id, "Pruned closed event subscriber");
        }
        true
    }

    /// Returns a snapshot of the delivery counters.
    pub fn stats(&self) -> EventStats {
        EventStats {
            published: self.published.load(Ordering::Relaxed),
            dropped_stale: self.dropped_stale.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
        }
    }
}
