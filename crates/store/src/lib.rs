//! Keel store: the work queue feeding reconcile workers.
//!
//! Keys are coalesced while waiting, never handed to two workers at once,
//! and a key re-added while in flight is queued again once `done` is called.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use keel_core::Backoff;
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

struct Inner<K> {
    queue: VecDeque<K>,
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    /// Earliest pending delayed add per key
    waiting: FxHashMap<K, Instant>,
    failures: FxHashMap<K, u32>,
    shutting_down: bool,
}

struct Shared<K> {
    name: String,
    inner: Mutex<Inner<K>>,
    notify: Notify,
    backoff: Backoff,
}

/// Cloneable handle; clones share one queue.
pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn new(name: impl Into<String>, backoff: Backoff) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                inner: Mutex::new(Inner {
                    queue: VecDeque::new(),
                    dirty: FxHashSet::default(),
                    processing: FxHashSet::default(),
                    waiting: FxHashMap::default(),
                    failures: FxHashMap::default(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    // A panicking worker cannot leave the sets half-updated, so a poisoned
    // lock is still consistent.
    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, key: K) {
        let mut inner = self.lock();
        self.add_locked(&mut inner, key);
    }

    fn add_locked(&self, inner: &mut Inner<K>, key: K) {
        if inner.shutting_down {
            return;
        }
        if !inner.dirty.insert(key.clone()) {
            counter!("workqueue_coalesced_total", 1u64, "queue" => self.shared.name.clone());
            return;
        }
        counter!("workqueue_adds_total", 1u64, "queue" => self.shared.name.clone());
        if inner.processing.contains(&key) {
            trace!(queue = %self.shared.name, ?key, "in flight; will requeue on done");
            return;
        }
        inner.queue.push_back(key);
        self.shared.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed. Only the earliest pending deadline
    /// per key is kept.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let deadline = Instant::now() + delay;
        {
            let mut inner = self.lock();
            if inner.shutting_down {
                return;
            }
            match inner.waiting.get(&key) {
                Some(existing) if *existing <= deadline => return,
                _ => {
                    inner.waiting.insert(key.clone(), deadline);
                }
            }
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let mut inner = queue.lock();
            if inner.waiting.get(&key) == Some(&deadline) {
                inner.waiting.remove(&key);
                queue.add_locked(&mut inner, key);
            }
        });
    }

    /// Requeue with per-key exponential backoff; returns the delay used.
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let attempt = {
            let mut inner = self.lock();
            let n = inner.failures.entry(key.clone()).or_insert(0);
            let attempt = *n;
            *n = n.saturating_add(1);
            attempt
        };
        let delay = self.shared.backoff.delay(attempt);
        debug!(queue = %self.shared.name, ?key, attempt, delay_ms = delay.as_millis() as u64, "rate limited requeue");
        self.add_after(key, delay);
        delay
    }

    /// Reset the backoff for `key` after a successful pass.
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if inner.shutting_down {
                    return None;
                }
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` finished; requeues it if it was added while in flight.
    pub fn done(&self, key: &K) {
        let mut inner = self.lock();
        inner.processing.remove(key);
        if inner.dirty.contains(key) && !inner.shutting_down {
            inner.queue.push_back(key.clone());
            self.shared.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.lock().processing.len()
    }

    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.shutting_down = true;
        inner.waiting.clear();
        drop(inner);
        self.shared.notify.notify_waiters();
        debug!(queue = %self.shared.name, "work queue shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<String> {
        WorkQueue::new("test", Backoff::new(Duration::from_millis(10), Duration::from_millis(40)))
    }

    #[tokio::test]
    async fn duplicate_adds_coalesce() {
        let q = queue();
        q.add("a".into());
        q.add("b".into());
        q.add("a".into());
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn add_while_processing_requeues_after_done() {
        let q = queue();
        q.add("a".into());
        let k = q.get().await.unwrap();
        q.add("a".into());
        // single-flight: not handed out again while in flight
        assert!(q.is_empty());
        q.done(&k);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("a"));
        q.done(&"a".to_string());
        assert!(q.is_empty());
        assert_eq!(q.in_flight(), 0);
    }

    #[tokio::test]
    async fn delayed_add_keeps_earliest_deadline() {
        let q = queue();
        q.add_after("a".into(), Duration::from_secs(30));
        q.add_after("a".into(), Duration::from_millis(20));
        assert!(q.is_empty());
        let got = tokio::time::timeout(Duration::from_secs(2), q.get()).await.unwrap();
        assert_eq!(got.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn rate_limit_escalates_and_forget_resets() {
        let q = queue();
        let k = "a".to_string();
        assert_eq!(q.add_rate_limited(k.clone()), Duration::from_millis(10));
        assert_eq!(q.add_rate_limited(k.clone()), Duration::from_millis(20));
        assert_eq!(q.add_rate_limited(k.clone()), Duration::from_millis(40));
        assert_eq!(q.add_rate_limited(k.clone()), Duration::from_millis(40));
        assert_eq!(q.num_requeues(&k), 4);
        q.forget(&k);
        assert_eq!(q.num_requeues(&k), 0);
    }

    #[tokio::test]
    async fn shutdown_releases_waiters_and_drops_adds() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
        q.add("late".into());
        assert!(q.is_empty());
        assert!(q.is_shutting_down());
    }
}
