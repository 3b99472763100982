//! Connection registry
//!
//! Holds the live subscriber handles keyed by opaque, never-reused IDs.
//! The broadcaster takes a point-in-time snapshot and sends without
//! holding the lock, so slow network writes never block `add`/`remove`.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Result;
use crate::video::encoder::Payload;

/// Opaque subscriber identifier
///
/// IDs increase monotonically, so snapshot order is registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A live outbound connection to one viewer
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Human readable peer description for logs
    fn describe(&self) -> String;

    /// Deliver one payload
    ///
    /// Any error means the subscriber is unusable and will be removed.
    async fn send(&self, payload: &Payload) -> Result<()>;

    /// Close the underlying connection; must tolerate repeated calls
    async fn close(&self);
}

/// Registry of active subscribers
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    subscribers: RwLock<BTreeMap<SubscriberId, Arc<dyn Subscriber>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a subscriber and return its ID
    pub fn add(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let peer = subscriber.describe();
        let total = {
            let mut subscribers = self.subscribers.write();
            subscribers.insert(id, subscriber);
            subscribers.len()
        };
        info!(subscriber = %id, peer = %peer, total, "Subscriber registered");
        id
    }

    /// Remove a subscriber
    ///
    /// Removing an unknown or already removed ID is a no-op returning `None`.
    pub fn remove(&self, id: SubscriberId) -> Option<Arc<dyn Subscriber>> {
        let (removed, total) = {
            let mut subscribers = self.subscribers.write();
            let removed = subscribers.remove(&id);
            (removed, subscribers.len())
        };

        if removed.is_some() {
            info!(subscriber = %id, total, "Subscriber removed");
        } else {
            debug!(subscriber = %id, "Subscriber already removed");
        }
        removed
    }

    /// Point-in-time copy of the live set, in registration order
    pub fn snapshot(&self) -> Vec<(SubscriberId, Arc<dyn Subscriber>)> {
        self.subscribers
            .read()
            .iter()
            .map(|(id, subscriber)| (*id, Arc::clone(subscriber)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for subscriber lifecycle management
///
/// Unregisters on drop, so a connection task that ends abruptly still
/// leaves the registry.
pub struct SubscriberGuard {
    id: SubscriberId,
    registry: Arc<ConnectionRegistry>,
}

impl SubscriberGuard {
    pub fn register(registry: Arc<ConnectionRegistry>, subscriber: Arc<dyn Subscriber>) -> Self {
        let id = registry.add(subscriber);
        Self { id, registry }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
