//! Publish/subscribe bus for outcome events
//!
//! In-process subscribers such as the performance scorer are called
//! synchronously on publish, in registration order. External consumers can
//! additionally tap a tokio broadcast channel.

use overseer_core::event::OutcomeEvent;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

const CHANNEL_CAPACITY: usize = 1024;

/// Receives every event published on the bus
pub trait EventSubscriber: Send + Sync {
    fn name(&self) -> &str;

    fn on_event(&self, event: &OutcomeEvent);
}

pub struct EventBus {
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
    sender: broadcast::Sender<OutcomeEvent>,
    published: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            subscribers: RwLock::new(Vec::new()),
            sender,
            published: AtomicU64::new(0),
        }
    }

    pub fn register(&self, subscriber: Arc<dyn EventSubscriber>) {
        debug!("Registering event subscriber: {}", subscriber.name());
        self.subscribers.write().push(subscriber);
    }

    /// Receiver for events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<OutcomeEvent> {
        self.sender.subscribe()
    }

    /// Deliver an event to every subscriber.
    ///
    /// Callers must not hold store guards: subscribers take their own.
    pub fn publish(&self, event: OutcomeEvent) {
        trace!(event = event.name(), "Publishing outcome event");
        let subscribers: Vec<Arc<dyn EventSubscriber>> = self.subscribers.read().clone();
        for subscriber in &subscribers {
            subscriber.on_event(&event);
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        if self.sender.send(event).is_err() {
            trace!("No external receivers for outcome event");
        }
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
