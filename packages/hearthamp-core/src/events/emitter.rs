//! Observer hook for the event bus, decoupled from the channel transport.
//!
//! Mirrors the corpus's emitter-trait pattern: production code gets a
//! no-op, debug builds can wire in a logging observer, and tests can
//! substitute a counting one without touching [`EventBus`](super::EventBus).

use crate::state::State;

/// Observes every snapshot published on the bus, independent of subscribers.
pub trait StateObserver: Send + Sync {
    /// Called once per `publish`, before fan-out to subscribers.
    fn on_publish(&self, state: &State);
}

/// Discards every notification. The production default.
pub struct NoopStateObserver;

impl StateObserver for NoopStateObserver {
    fn on_publish(&self, _state: &State) {}
}

/// Logs every publish at debug level.
pub struct LoggingStateObserver;

impl StateObserver for LoggingStateObserver {
    fn on_publish(&self, state: &State) {
        tracing::debug!(
            sources = state.sources.len(),
            zones = state.zones.len(),
            groups = state.groups.len(),
            streams = state.streams.len(),
            "state_published"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingObserver {
        count: AtomicUsize,
    }

    impl StateObserver for CountingObserver {
        fn on_publish(&self, _state: &State) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn counting_observer_tracks_publishes() {
        let observer = CountingObserver {
            count: AtomicUsize::new(0),
        };
        observer.on_publish(&State::default());
        observer.on_publish(&State::default());
        assert_eq!(observer.count.load(Ordering::SeqCst), 2);
    }
}
