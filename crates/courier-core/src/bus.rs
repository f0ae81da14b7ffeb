use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::events::ChatEvent;
use crate::filter::RecipientFilter;

const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Process-local live fan-out. Holds no history — backlog always comes from
/// the event log, never from here — so memory stays O(subscribers)
/// regardless of log size.
pub struct EventBus {
    subscribers: DashMap<u64, BusSubscriber>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

struct BusSubscriber {
    filter: RecipientFilter,
    tx: mpsc::Sender<ChatEvent>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(0),
            queue_capacity,
        })
    }

    /// Deliver to every registered subscriber whose filter matches. A full
    /// or closed subscriber queue never blocks delivery to the others; the
    /// event is dropped for that subscriber and logged.
    pub fn publish(&self, event: &ChatEvent) {
        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if !subscriber.filter.matches(event) {
                continue;
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        subscriber = *entry.key(),
                        event_id = %event.id,
                        "subscriber queue full, dropping live event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Register for events published after this call; there is no implicit
    /// backlog. The returned guard deregisters on drop, the receiver yields
    /// matching events in publish order.
    pub fn subscribe(
        self: &Arc<Self>,
        filter: RecipientFilter,
    ) -> (Subscription, mpsc::Receiver<ChatEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.subscribers.insert(id, BusSubscriber { filter, tx });
        (
            Subscription {
                id,
                bus: Arc::clone(self),
            },
            rx,
        )
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// Scoped bus registration: dropping it removes the subscriber, so a closed
/// connection cannot leak delivery to a dead consumer.
pub struct Subscription {
    id: u64,
    bus: Arc<EventBus>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.subscribers.remove(&self.id);
    }
}
