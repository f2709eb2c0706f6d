//! Rate-limited, per-UID work queue.
//!
//! Guarantees at most one in-flight token per UID: enqueueing a UID that
//! is already queued or being processed is a no-op (dedup on enqueue);
//! `get` hands out an exclusive token that must be released via `done`.
//! Failed items are requeued with exponential backoff via
//! `add_rate_limited`; `forget` clears accumulated backoff on success.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(30),
        }
    }
}

struct Inner {
    queue: VecDeque<String>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    failures: std::collections::HashMap<String, u32>,
    shutdown: bool,
}

/// A bounded work queue of UIDs, fed by an `EventSource` and drained by a
/// worker pool.
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    config: RateLimiterConfig,
}

impl WorkQueue {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                queued: HashSet::new(),
                processing: HashSet::new(),
                failures: std::collections::HashMap::new(),
                shutdown: false,
            }),
            notify: Notify::new(),
            config,
        }
    }

    /// Enqueues `uid` immediately, deduping against an item already
    /// waiting or currently being processed (processed items are marked
    /// dirty and re-enqueued on `done`).
    pub async fn add(&self, uid: impl Into<String>) {
        let uid = uid.into();
        let mut inner = self.inner.lock().await;
        if inner.processing.contains(&uid) {
            // Will be re-added by `done` once the current pass finishes.
            inner.queued.insert(format!("__dirty__{uid}"));
            return;
        }
        if inner.queued.insert(uid.clone()) {
            inner.queue.push_back(uid);
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Schedules `uid` after an exponentially growing delay, doubling on
    /// every successive failure for the same UID up to `max_delay`.
    pub fn add_rate_limited(self: &std::sync::Arc<Self>, uid: impl Into<String>) {
        let uid = uid.into();
        let this = self.clone();
        tokio::spawn(async move {
            let wait = {
                let mut inner = this.inner.lock().await;
                let count = inner.failures.entry(uid.clone()).or_insert(0);
                let exp = this.config.base_delay.as_millis() as u64 * (1u64 << (*count).min(20));
                *count += 1;
                Duration::from_millis(exp).min(this.config.max_delay)
            };
            tokio::time::sleep(wait).await;
            this.add(uid).await;
        });
    }

    /// Clears any accumulated backoff for `uid`, called on a successful
    /// reconciliation.
    pub async fn forget(&self, uid: &str) {
        self.inner.lock().await.failures.remove(uid);
    }

    /// Blocks until a UID is available or the queue shuts down, returning
    /// `None` on shutdown. The returned UID holds an exclusive token until
    /// `done` is called.
    pub async fn get(&self) -> Option<String> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.shutdown && inner.queue.is_empty() {
                    return None;
                }
                if let Some(uid) = inner.queue.pop_front() {
                    inner.queued.remove(&uid);
                    inner.processing.insert(uid.clone());
                    return Some(uid);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Releases the exclusive token for `uid`; if `add` marked it dirty
    /// while processing, re-enqueues it.
    pub async fn done(&self, uid: &str) {
        let mut inner = self.inner.lock().await;
        inner.processing.remove(uid);
        let dirty_key = format!("__dirty__{uid}");
        if inner.queued.remove(&dirty_key) {
            inner.queue.push_back(uid.to_string());
            inner.queued.insert(uid.to_string());
            drop(inner);
            self.notify.notify_one();
        }
    }

    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        inner.shutdown = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Number of in-flight tokens currently held for `uid` — used by
    /// tests to assert the at-most-one invariant.
    pub async fn in_flight_count(&self, uid: &str) -> usize {
        usize::from(self.inner.lock().await.processing.contains(uid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn dedups_on_enqueue() {
        let wq = WorkQueue::new(RateLimiterConfig::default());
        wq.add("m1").await;
        wq.add("m1").await;
        let got = wq.get().await.unwrap();
        assert_eq!(got, "m1");
        assert_eq!(wq.in_flight_count("m1").await, 1);
        wq.done("m1").await;
        assert_eq!(wq.in_flight_count("m1").await, 0);
    }

    #[tokio::test]
    async fn add_while_processing_requeues_after_done() {
        let wq = Arc::new(WorkQueue::new(RateLimiterConfig::default()));
        wq.add("m1").await;
        let got = wq.get().await.unwrap();
        assert_eq!(got, "m1");

        // Dirtied while in flight.
        wq.add("m1").await;
        wq.done("m1").await;

        let got_again = wq.get().await.unwrap();
        assert_eq!(got_again, "m1");
    }

    #[tokio::test]
    async fn rate_limited_item_is_delayed() {
        let wq = Arc::new(WorkQueue::new(RateLimiterConfig {
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(1),
        }));
        let start = std::time::Instant::now();
        wq.add_rate_limited("m1");
        let got = wq.get().await.unwrap();
        assert_eq!(got, "m1");
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[tokio::test]
    async fn shutdown_unblocks_get() {
        let wq = Arc::new(WorkQueue::new(RateLimiterConfig::default()));
        let wq2 = wq.clone();
        let handle = tokio::spawn(async move { wq2.get().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        wq.shutdown().await;
        assert!(handle.await.unwrap().is_none());
    }
}
