use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use uuid::Uuid;

use crate::protocol::BuildEvent;

/// Per-subscriber queue depth used by [`EventBus::new`].
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

struct Subscriber {
    tx: flume::Sender<BuildEvent>,
    /// Only deliver events for this build when set.
    build_id: Option<Uuid>,
}

/// A broadcast-style event bus built on top of bounded flume channels.
///
/// Publishing never blocks: a subscriber whose queue is full misses the
/// message, and subscribers whose receivers were dropped are pruned. The bus
/// is cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<Subscriber>>>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> flume::Receiver<BuildEvent> {
        self.register(None)
    }

    /// Receive events for one build only.
    pub fn subscribe_build(&self, build_id: Uuid) -> flume::Receiver<BuildEvent> {
        self.register(Some(build_id))
    }

    fn register(&self, build_id: Option<Uuid>) -> flume::Receiver<BuildEvent> {
        let (tx, rx) = flume::bounded(self.capacity);
        self.lock().push(Subscriber { tx, build_id });
        rx
    }

    /// Publish an event to all matching subscribers without waiting.
    pub fn publish(&self, event: BuildEvent) {
        let mut subscribers = self.lock();
        subscribers.retain(|sub| {
            if sub.build_id.is_some_and(|id| id != event.build_id) {
                return !sub.tx.is_disconnected();
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(flume::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(event = %event.event_type, "subscriber queue full, event dropped");
                    true
                }
                Err(flume::TrySendError::Disconnected(_)) => false,
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Events dropped because a subscriber queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
