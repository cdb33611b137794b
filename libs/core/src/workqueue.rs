//! Rate-limited, deduplicating work queue (spec.md §4.5, §9 Design Notes: "Work-queue with
//! rate limiting"). Each controller feeds object keys observed from its informer into one of
//! these; a bounded pool of workers drains it. A key already in flight is dropped rather than
//! requeued, and a key that keeps failing backs off exponentially up to a ceiling, after which
//! it is forgotten (the next informer resync re-adds it).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use tokio::sync::{mpsc, Mutex};

/// A key that failed too many consecutive times is dropped rather than retried forever; the
/// next full informer resync will re-add it if the underlying object still needs attention.
const MAX_ATTEMPTS: u32 = 5;

struct KeyState {
    backoff: ExponentialBackoff,
    attempts: u32,
}

/// Shared bookkeeping behind a [`RateLimitingQueue`]: which keys are currently queued or being
/// processed, and each key's backoff state.
struct Inner<K> {
    in_flight: std::collections::HashSet<K>,
    backoffs: HashMap<K, KeyState>,
}

/// A channel of `K` with in-flight dedup and per-key exponential backoff.
///
/// Cloning shares the same underlying channel and bookkeeping; every producer (informer event
/// handler) and the single consumer (the reconcile loop) hold a clone.
#[derive(Clone)]
pub struct RateLimitingQueue<K>
where
    K: Clone + Eq + std::hash::Hash + Send + 'static,
{
    tx: mpsc::UnboundedSender<K>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<K>>>,
    inner: Arc<Mutex<Inner<K>>>,
}

impl<K> RateLimitingQueue<K>
where
    K: Clone + Eq + std::hash::Hash + Send + 'static,
{
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            inner: Arc::new(Mutex::new(Inner {
                in_flight: Default::default(),
                backoffs: Default::default(),
            })),
        }
    }

    /// Enqueues `key` immediately unless it is already in flight, in which case this is a
    /// no-op: the in-flight worker will observe the latest state when it re-reads the object.
    pub async fn add(&self, key: K) {
        let mut inner = self.inner.lock().await;
        if inner.in_flight.contains(&key) {
            return;
        }
        inner.in_flight.insert(key.clone());
        drop(inner);
        let _ = self.tx.send(key);
    }

    /// Enqueues `key` after its next backoff delay. Returns `None` (the key is forgotten and
    /// will not be requeued by this call) once [`MAX_ATTEMPTS`] has been reached.
    pub async fn add_rate_limited(&self, key: K) -> Option<Duration> {
        let mut inner = self.inner.lock().await;
        let state = inner.backoffs.entry(key.clone()).or_insert_with(|| KeyState {
            backoff: ExponentialBuilder::default()
                .with_max_delay(Duration::from_secs(300))
                .without_max_times()
                .build(),
            attempts: 0,
        });
        state.attempts += 1;
        if state.attempts > MAX_ATTEMPTS {
            inner.backoffs.remove(&key);
            inner.in_flight.remove(&key);
            return None;
        }
        let delay = state.backoff.next().unwrap_or(Duration::from_secs(300));
        drop(inner);

        let queue = self.clone();
        let key_for_task = key;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = queue.tx.send(key_for_task);
        });
        Some(delay)
    }

    /// Clears the backoff state for `key`, called after a successful reconcile.
    pub async fn forget(&self, key: &K) {
        self.inner.lock().await.backoffs.remove(key);
    }

    /// Marks `key` as no longer in flight. Must be called exactly once per dequeued key, once
    /// processing (including any `add_rate_limited` requeue) has been decided.
    pub async fn done(&self, key: &K) {
        self.inner.lock().await.in_flight.remove(key);
    }

    /// Dequeues the next key. Only one caller should drive this loop per queue instance.
    pub async fn recv(&self) -> Option<K> {
        self.rx.lock().await.recv().await
    }

    pub async fn in_flight_count(&self) -> usize {
        self.inner.lock().await.in_flight.len()
    }
}

impl<K> Default for RateLimitingQueue<K>
where
    K: Clone + Eq + std::hash::Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
