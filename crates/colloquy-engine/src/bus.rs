//! In-process publish/subscribe for session and message notifications.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{trace, warn};

use colloquy_core::events::{BusEvent, EventKind};

const DEFAULT_CAPACITY: usize = 1024;

/// Which events a handler receives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Kind(EventKind),
}

impl EventFilter {
    pub fn matches(&self, event: &BusEvent) -> bool {
        match self {
            Self::All => true,
            Self::Kind(kind) => event.kind() == *kind,
        }
    }
}

/// Broadcast-based event bus. `publish` never awaits; slow receivers lag
/// rather than block the publisher.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
    published: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the number of receivers that got the event.
    pub fn publish(&self, event: BusEvent) -> usize {
        let _ = self.published.fetch_add(1, Ordering::Relaxed);
        trace!(kind = event.kind().as_str(), session_id = %event.session_id(), "publish");
        self.tx.send(event).unwrap_or(0)
    }

    /// Raw receiver of every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    /// Events published after this call as a stream. Lagged gaps are skipped.
    pub fn stream(&self, filter: EventFilter) -> impl Stream<Item = BusEvent> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(move |event| match event {
            Ok(event) if filter.matches(&event) => Some(event),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "event stream lagged, events dropped");
                None
            }
        })
    }

    /// Run `handler` for each matching event on a background task. A
    /// panicking handler is logged and keeps its subscription.
    pub fn on<F>(&self, filter: EventFilter, handler: F) -> Subscription
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let mut rx = self.tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if !filter.matches(&event) {
                            continue;
                        }
                        if std::panic::catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                            warn!(kind = event.kind().as_str(), "event handler panicked");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event handler lagged, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Subscription { handle }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
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

/// Handler registration; dropping it unsubscribes.
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
