//! TTL cache swept by a heap-driven background task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use crate::heap::ExpiryHeap;

struct Inner<V> {
    values: HashMap<String, V>,
    heap: ExpiryHeap,
}

/// Thread-safe key/value cache where every entry carries a TTL.
///
/// Reads never return an expired value, even before the sweeper has run.
pub struct Cache<V> {
    inner: Arc<Mutex<Inner<V>>>,
    wakeups: Arc<Mutex<Option<mpsc::Receiver<()>>>>,
}

impl<V> Clone for Cache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            wakeups: self.wakeups.clone(),
        }
    }
}

impl<V: Clone + Send + 'static> Default for Cache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + 'static> Cache<V> {
    pub fn new() -> Self {
        let (heap, rx) = ExpiryHeap::new();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                values: HashMap::new(),
                heap,
            })),
            wakeups: Arc::new(Mutex::new(Some(rx))),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<V>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace `key`, expiring `ttl` from now.
    pub fn insert(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let mut inner = self.lock();
        inner.heap.add(key.clone(), ttl);
        inner.values.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let inner = self.lock();
        let index = inner.heap.index_of(key)?;
        let entry = inner.heap.get(index)?;
        if entry.expires <= Instant::now() {
            return None;
        }
        inner.values.get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let mut inner = self.lock();
        inner.heap.remove_key(key);
        inner.values.remove(key)
    }

    /// Number of entries not yet swept, expired or not.
    pub fn len(&self) -> usize {
        self.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry whose deadline has passed. Returns how many went.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let mut evicted = 0;
        while let Some(head) = inner.heap.next() {
            if head.expires > now {
                break;
            }
            if let Some(entry) = inner.heap.remove(0) {
                inner.values.remove(&entry.key);
                evicted += 1;
            }
        }
        evicted
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.lock().heap.next().map(|e| e.expires)
    }

    /// Sweep expired entries until `shutdown` flips. Sleeps until the
    /// soonest deadline and re-arms whenever the heap head changes. Only
    /// one loop may run per cache.
    pub async fn run_expiry_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let taken = self.wakeups.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut wakeups) = taken else {
            warn!("cache expiry loop already running");
            return;
        };

        loop {
            let deadline = self.next_deadline();
            let sleep = async {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = sleep => {
                    let evicted = self.evict_expired();
                    if evicted > 0 {
                        debug!(evicted, "expired cache entries evicted");
                    }
                }
                _ = wakeups.recv() => {}
                _ = shutdown.changed() => {
                    debug!("cache expiry loop shutting down");
                    break;
                }
            }
        }

        *self.wakeups.lock().unwrap_or_else(|e| e.into_inner()) = Some(wakeups);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn get_hides_expired_entries() {
        let cache = Cache::new();
        cache.insert("a", 1u32, Duration::from_secs(1));
        assert_eq!(cache.get("a"), Some(1));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn insert_replaces_and_rearms() {
        let cache = Cache::new();
        cache.insert("a", 1u32, Duration::from_secs(1));
        cache.insert("a", 2u32, Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("a"), Some(2));
        assert_eq!(cache.remove("a"), Some(2));
        assert_eq!(cache.get("a"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_loop_sweeps_in_background() {
        let cache = Cache::new();
        let (tx, rx) = watch::channel(false);
        let sweeper = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.run_expiry_loop(rx).await })
        };

        cache.insert("slow", "s".to_string(), Duration::from_secs(30));
        tokio::task::yield_now().await;
        // A sooner deadline must re-arm the sleeping loop.
        cache.insert("fast", "f".to_string(), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(cache.len(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(cache.is_empty());

        tx.send(true).unwrap();
        sweeper.await.unwrap();
    }
}
