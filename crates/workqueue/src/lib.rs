//! Corral work queue: a deduplicating set of keys awaiting reconcile.
//!
//! A key lives in at most one of *queued* or *processing*. Adding a key that
//! is already queued is a no-op; adding one that is processing marks it
//! dirty so it is queued again, once, when [`WorkQueue::done`] is called.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use corral_core::backoff::exponential_delay;
use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::{debug, info};

/// Per-key exponential backoff for [`WorkQueue::add_rate_limited`].
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self { base: Duration::from_millis(5), cap: Duration::from_secs(1000) }
    }
}

struct State<K> {
    queue: VecDeque<K>,
    // queued, or re-added while processing
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    failures: FxHashMap<K, u32>,
    shutting_down: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    ready: Notify,
    idle: Notify,
    limiter: RateLimiterConfig,
}

pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    pub fn new(limiter: RateLimiterConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: FxHashSet::default(),
                    processing: FxHashSet::default(),
                    failures: FxHashMap::default(),
                    shutting_down: false,
                }),
                ready: Notify::new(),
                idle: Notify::new(),
                limiter,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, key: K) {
        let mut st = self.lock();
        if st.shutting_down || st.dirty.contains(&key) {
            return;
        }
        counter!("workqueue_adds_total", 1u64);
        st.dirty.insert(key.clone());
        if st.processing.contains(&key) {
            // picked up again by done()
            return;
        }
        st.queue.push_back(key);
        gauge!("workqueue_depth", st.queue.len() as f64);
        drop(st);
        self.inner.ready.notify_one();
    }

    /// Wait for the next key and mark it processing. `None` once shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                if let Some(key) = pop(&mut st) {
                    return Some(key);
                }
                // register before releasing the lock so an add() in between wakes us
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    /// Non-blocking [`get`](Self::get).
    pub fn try_get(&self) -> Option<K> {
        let mut st = self.lock();
        if st.shutting_down {
            return None;
        }
        pop(&mut st)
    }

    /// Finish processing `key`; requeue it once if it was re-added meanwhile.
    pub fn done(&self, key: &K) {
        let mut st = self.lock();
        st.processing.remove(key);
        let requeue = !st.shutting_down && st.dirty.contains(key);
        if requeue {
            st.queue.push_back(key.clone());
            gauge!("workqueue_depth", st.queue.len() as f64);
        }
        let idle = st.processing.is_empty();
        drop(st);
        if requeue {
            self.inner.ready.notify_one();
        }
        if idle {
            self.inner.idle.notify_waiters();
        }
    }

    /// Add `key` once `delay` has elapsed. Must be called within a tokio runtime.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.lock().shutting_down {
            return;
        }
        let q = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            q.add(key);
        });
    }

    /// Requeue with this key's next backoff delay.
    pub fn add_rate_limited(&self, key: K) {
        let attempt = {
            let mut st = self.lock();
            let n = st.failures.entry(key.clone()).or_insert(0);
            let attempt = *n;
            *n = n.saturating_add(1);
            attempt
        };
        let delay = exponential_delay(attempt, self.inner.limiter.base, self.inner.limiter.cap);
        counter!("workqueue_retries_total", 1u64);
        debug!(key = ?key, attempt, delay_ms = delay.as_millis() as u64, "rate-limited requeue");
        self.add_after(key, delay);
    }

    /// Reset `key`'s backoff after a success.
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Number of queued (not processing) keys.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_processing(&self, key: &K) -> bool {
        self.lock().processing.contains(key)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Stop handing out keys and refuse new ones. Queued keys are abandoned;
    /// keys already processing may still call `done`.
    pub fn shut_down(&self) {
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        st.shutting_down = true;
        let abandoned = st.queue.len();
        st.queue.clear();
        st.dirty.clear();
        drop(st);
        info!(abandoned, "work queue shutting down");
        gauge!("workqueue_depth", 0.0);
        self.inner.ready.notify_waiters();
    }

    /// [`shut_down`](Self::shut_down), then wait up to `grace` for in-flight
    /// keys to finish. Returns `true` if everything finished in time.
    pub async fn shut_down_with_drain(&self, grace: Duration) -> bool {
        self.shut_down();
        let drained = async {
            loop {
                let notified = self.inner.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.lock().processing.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(grace, drained).await.is_ok()
    }
}

fn pop<K: Clone + Eq + Hash>(st: &mut State<K>) -> Option<K> {
    let key = st.queue.pop_front()?;
    st.dirty.remove(&key);
    st.processing.insert(key.clone());
    gauge!("workqueue_depth", st.queue.len() as f64);
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::new(RateLimiterConfig::default())
    }

    #[test]
    fn duplicate_adds_collapse() {
        let q = queue();
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.try_get(), Some("a"));
        assert_eq!(q.try_get(), Some("b"));
        assert_eq!(q.try_get(), None);
    }

    #[test]
    fn burst_while_processing_requeues_once() {
        let q = queue();
        q.add("a");
        let k = q.try_get().unwrap();
        for _ in 0..10 {
            q.add("a");
        }
        assert_eq!(q.len(), 0, "processing key must not be queued");
        assert_eq!(q.try_get(), None);
        q.done(&k);
        assert_eq!(q.len(), 1);
        assert_eq!(q.try_get(), Some("a"));
        q.done(&"a");
        assert_eq!(q.try_get(), None);
    }

    #[tokio::test]
    async fn get_waits_for_add() {
        let q = queue();
        let waiter = tokio::spawn({
            let q = q.clone();
            async move { q.get().await }
        });
        tokio::task::yield_now().await;
        q.add("x");
        assert_eq!(waiter.await.unwrap(), Some("x"));
        assert!(q.is_processing(&"x"));
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_delays_delivery() {
        let q = queue();
        q.add_after("x", Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(q.is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(q.try_get(), Some("x"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_grows_and_forget_resets() {
        let q = queue();
        q.add_rate_limited("x");
        q.add_rate_limited("x");
        q.add_rate_limited("x");
        assert_eq!(q.num_requeues(&"x"), 3);
        // third delay is 20ms; all three land as one queued key
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(q.len(), 1);
        q.forget(&"x");
        assert_eq!(q.num_requeues(&"x"), 0);
    }

    #[tokio::test]
    async fn shutdown_releases_waiters_and_refuses_adds() {
        let q = queue();
        let waiter = tokio::spawn({
            let q = q.clone();
            async move { q.get().await }
        });
        tokio::task::yield_now().await;
        q.add("queued");
        q.add("never");
        let _ = waiter.await.unwrap();
        q.shut_down();
        assert_eq!(q.get().await, None);
        q.add("late");
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_in_flight() {
        let q = queue();
        q.add("a");
        let k = q.try_get().unwrap();
        let finisher = tokio::spawn({
            let q = q.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                q.done(&k);
            }
        });
        assert!(q.shut_down_with_drain(Duration::from_secs(10)).await);
        finisher.await.unwrap();

        let q = queue();
        q.add("stuck");
        q.try_get();
        assert!(!q.shut_down_with_drain(Duration::from_secs(1)).await);
    }
}
