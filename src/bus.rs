// =============================================================================
// Event Bus — topic-based in-process publish/subscribe
// =============================================================================
//
// Topics are free-form strings; payloads are JSON values. `fire` never
// suspends: it enqueues the payload onto each subscriber's private FIFO and a
// dedicated drain task awaits the handler, so
//
//   - handlers on one topic observe events in fire order (per subscriber),
//   - a slow or failing handler cannot affect other handlers or the publisher,
//   - delivery is at-most-once (no retry, no re-queue).
//
// The per-subscriber queue is unbounded by default. With BUS_QUEUE_CAP > 0 a
// full queue drops the event for that subscriber (drop, never block — a
// saturated scheduler must not grow memory without bound); drops are counted.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::warn;

pub type Payload = serde_json::Value;
type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// An async event handler. Handlers own their error handling; the bus only
/// isolates them from each other.
pub type Handler = Arc<dyn Fn(Payload) -> HandlerFuture + Send + Sync>;

enum SubSender {
    Unbounded(mpsc::UnboundedSender<Payload>),
    Bounded(mpsc::Sender<Payload>),
}

pub struct EventBus {
    subs: RwLock<HashMap<String, Vec<SubSender>>>,
    queue_cap: usize,
    dropped: AtomicU64,
}

impl EventBus {
    /// `queue_cap == 0` means unbounded subscriber queues.
    pub fn new(queue_cap: usize) -> Self {
        Self {
            subs: RwLock::new(HashMap::new()),
            queue_cap,
            dropped: AtomicU64::new(0),
        }
    }

    /// Register an async handler for `topic`. The same handler registered
    /// twice is invoked twice. Each subscription gets its own drain task so
    /// handler invocations for a topic are sequential per subscription.
    pub fn subscribe(&self, topic: &str, handler: Handler) {
        let sender = if self.queue_cap == 0 {
            let (tx, mut rx) = mpsc::unbounded_channel::<Payload>();
            tokio::spawn(async move {
                while let Some(payload) = rx.recv().await {
                    handler(payload).await;
                }
            });
            SubSender::Unbounded(tx)
        } else {
            let (tx, mut rx) = mpsc::channel::<Payload>(self.queue_cap);
            tokio::spawn(async move {
                while let Some(payload) = rx.recv().await {
                    handler(payload).await;
                }
            });
            SubSender::Bounded(tx)
        };

        self.subs
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(sender);
    }

    /// Publish `payload` on `topic`. Non-suspending; the caller never awaits
    /// delivery. Unknown topics are a no-op.
    pub fn fire(&self, topic: &str, payload: Payload) {
        let subs = self.subs.read();
        let Some(senders) = subs.get(topic) else {
            return;
        };
        for sender in senders {
            let delivered = match sender {
                SubSender::Unbounded(tx) => tx.send(payload.clone()).is_ok(),
                SubSender::Bounded(tx) => match tx.try_send(payload.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(topic, "bus subscriber queue full — event dropped");
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                },
            };
            if !delivered {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Number of events dropped due to full or dead subscriber queues.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of subscriptions currently registered on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subs.read().get(topic).map(|v| v.len()).unwrap_or(0)
    }
}

/// Wrap an `async Fn(Payload)`-shaped closure into a bus [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)))
}
