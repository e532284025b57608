//! Event bus for pushing committed state snapshots to live subscribers.
//!
//! The controller publishes a full [`State`](crate::state::State) snapshot
//! after every committed mutation. Subscribers (HTTP `/api/subscribe`
//! connections today, anything else tomorrow) each get a small bounded
//! channel; a slow subscriber has frames dropped rather than ever blocking
//! the publisher.

mod emitter;

pub use emitter::{LoggingStateObserver, NoopStateObserver, StateObserver};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::state::State;

/// Bounded per-subscriber buffer. Matches the corpus's WebSocket connection
/// manager in spirit: many small independent channels rather than one
/// channel with backpressure shared by everyone.
const SUBSCRIBER_BUFFER: usize = 8;

/// Fan-out publisher for committed state snapshots.
pub struct EventBus {
    subscribers: DashMap<u64, mpsc::Sender<Arc<State>>>,
    next_id: AtomicU64,
    observer: Arc<dyn StateObserver>,
}

impl EventBus {
    /// Creates a bus with a no-op observer.
    pub fn new() -> Self {
        Self::with_observer(Arc::new(NoopStateObserver))
    }

    /// Creates a bus that also notifies `observer` on every publish, useful
    /// for tests that want to assert publish counts without racing a channel.
    pub fn with_observer(observer: Arc<dyn StateObserver>) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            observer,
        }
    }

    /// Registers a new subscriber and returns its id plus the receive half
    /// of its channel.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<Arc<State>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.insert(id, tx);
        log::debug!("[EventBus] subscriber {} registered ({} total)", id, self.subscribers.len());
        (id, rx)
    }

    /// Removes a subscriber. Safe to call more than once or with an unknown id.
    pub fn unsubscribe(&self, id: u64) {
        if self.subscribers.remove(&id).is_some() {
            log::debug!("[EventBus] subscriber {} unregistered ({} remaining)", id, self.subscribers.len());
        }
    }

    /// Publishes a snapshot to every subscriber. Never blocks: a subscriber
    /// whose buffer is full simply misses this frame.
    pub fn publish(&self, state: State) {
        let state = Arc::new(state);
        self.observer.on_publish(&state);
        let mut stale = Vec::new();
        for entry in self.subscribers.iter() {
            match entry.value().try_send(Arc::clone(&state)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("[EventBus] subscriber {} buffer full, dropping snapshot", entry.key());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    stale.push(*entry.key());
                }
            }
        }
        for id in stale {
            self.unsubscribe(id);
        }
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::State;

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe();
        bus.publish(State::default());
        let got = rx.recv().await.expect("snapshot delivered");
        assert_eq!(got.info.version, State::default().info.version);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (id, mut rx) = bus.subscribe();
        bus.unsubscribe(id);
        bus.publish(State::default());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn full_buffer_drops_without_blocking() {
        let bus = EventBus::new();
        let (_id, _rx) = bus.subscribe();
        for _ in 0..(SUBSCRIBER_BUFFER + 4) {
            bus.publish(State::default());
        }
        // Publishing past the buffer must not hang the test.
    }
}
