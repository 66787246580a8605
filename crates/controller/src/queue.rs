//! Rate-limited work queue. Duplicate keys coalesce while queued, a key
//! being processed is parked until `done`, and failed keys come back with
//! per-key exponential backoff.

use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};

const BACKOFF_BASE_MS: u64 = 5;
const BACKOFF_CAP_SECS: u64 = 1000;

/// Delay before the n-th consecutive retry of a key.
pub fn backoff_delay(failures: u32) -> Duration {
    let capped = Duration::from_secs(BACKOFF_CAP_SECS);
    let exp = failures.saturating_sub(1).min(63);
    match Duration::from_millis(BACKOFF_BASE_MS).checked_mul(1u32 << exp.min(31)) {
        Some(d) if d < capped => d,
        _ => capped,
    }
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    failures: FxHashMap<K, u32>,
    shutting_down: bool,
}

pub struct RateLimitingQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl<K> RateLimitingQueue<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Arc<Self> {
        let (closed_tx, closed_rx) = watch::channel(false);
        Arc::new(Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: FxHashSet::default(),
                processing: FxHashSet::default(),
                failures: FxHashMap::default(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            closed_tx,
            closed_rx,
        })
    }

    /// Enqueue a key. No-ops if the key is already waiting; a key currently
    /// being processed is re-queued when its worker calls `done`.
    pub fn add(&self, key: K) {
        let mut s = self.state.lock().unwrap();
        if s.shutting_down || s.dirty.contains(&key) {
            return;
        }
        s.dirty.insert(key.clone());
        if !s.processing.contains(&key) {
            s.queue.push_back(key);
            drop(s);
            self.notify.notify_one();
        }
    }

    /// Enqueue after a delay.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Enqueue with this key's next backoff delay.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let failures = {
            let mut s = self.state.lock().unwrap();
            let n = s.failures.entry(key.clone()).or_insert(0);
            *n += 1;
            *n
        };
        self.add_after(key, backoff_delay(failures));
    }

    /// Reset a key's backoff after a successful reconcile.
    pub fn forget(&self, key: &K) {
        self.state.lock().unwrap().failures.remove(key);
    }

    /// Next key to process; `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut s = self.state.lock().unwrap();
                if let Some(key) = s.queue.pop_front() {
                    s.dirty.remove(&key);
                    s.processing.insert(key.clone());
                    return Some(key);
                }
                if s.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark a key's processing finished; if events arrived meanwhile the key
    /// goes straight back on the queue.
    pub fn done(&self, key: &K) {
        let mut s = self.state.lock().unwrap();
        s.processing.remove(key);
        if s.dirty.contains(key) && !s.shutting_down {
            s.queue.push_back(key.clone());
            drop(s);
            self.notify.notify_one();
        }
    }

    /// Stop accepting work and wake every blocked `get`.
    pub fn shut_down(&self) {
        self.state.lock().unwrap().shutting_down = true;
        let _ = self.closed_tx.send(true);
        self.notify.notify_waiters();
    }

    /// Resolves once `shut_down` has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(5));
        assert_eq!(backoff_delay(2), Duration::from_millis(10));
        assert_eq!(backoff_delay(4), Duration::from_millis(40));
        assert_eq!(backoff_delay(40), Duration::from_secs(1000));
        assert_eq!(backoff_delay(u32::MAX), Duration::from_secs(1000));
    }

    #[tokio::test]
    async fn duplicate_adds_coalesce() {
        let q = RateLimitingQueue::new();
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn add_during_processing_requeues_on_done() {
        let q = RateLimitingQueue::new();
        q.add("a");
        let key = q.get().await.unwrap();
        // event arrives while the worker holds the key
        q.add("a");
        assert!(q.is_empty());
        q.done(&key);
        assert_eq!(q.get().await, Some("a"));
    }

    #[tokio::test]
    async fn done_without_new_events_leaves_queue_empty() {
        let q = RateLimitingQueue::new();
        q.add("a");
        let key = q.get().await.unwrap();
        q.done(&key);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_getters() {
        let q = RateLimitingQueue::<String>::new();
        let getter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shut_down();
        assert_eq!(getter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn shutdown_drains_pending_items_first() {
        let q = RateLimitingQueue::new();
        q.add("a");
        q.shut_down();
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn adds_after_shutdown_are_dropped() {
        let q = RateLimitingQueue::new();
        q.shut_down();
        q.add("a");
        assert_eq!(q.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_arrive_after_backoff() {
        let q = RateLimitingQueue::new();
        q.add_rate_limited("a");
        tokio::time::sleep(Duration::from_millis(6)).await;
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        q.forget(&"a");
        // counter reset: next failure is back to the base delay
        q.add_rate_limited("a");
        tokio::time::sleep(Duration::from_millis(6)).await;
        assert_eq!(q.get().await, Some("a"));
    }

    #[tokio::test]
    async fn closed_resolves_after_shutdown() {
        let q = RateLimitingQueue::<String>::new();
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.closed().await })
        };
        q.shut_down();
        waiter.await.unwrap();
    }
}
