//! Expiring key/value cache
//!
//! Every access refreshes an entry's deadline. Expired entries are only
//! removed by `cleanup`, which hands them to the removal listener; the
//! janitor task calls it on a fixed interval.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// Called with each expired entry, outside the cache lock
pub type RemovalListener<K, V> = Box<dyn Fn(K, V) + Send + Sync>;

struct Entry<V> {
    value: V,
    expires: Instant,
}

pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, Entry<V>>>,
    listener: Option<RemovalListener<K, V>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::with_capacity(capacity)),
            listener: None,
        }
    }

    pub fn with_removal_listener(
        ttl: Duration,
        capacity: usize,
        listener: RemovalListener<K, V>,
    ) -> Self {
        Self {
            listener: Some(listener),
            ..Self::new(ttl, capacity)
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or replace; returns the previous value
    pub fn put(&self, key: K, value: V) -> Option<V> {
        let expires = Instant::now() + self.ttl;
        self.entries
            .lock()
            .insert(key, Entry { value, expires })
            .map(|e| e.value)
    }

    /// Clone of the value, refreshing its deadline
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.with_mut(key, |v| v.clone())
    }

    /// Run `f` on the value in place, refreshing its deadline
    pub fn with_mut<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        entry.expires = Instant::now() + self.ttl;
        Some(f(&mut entry.value))
    }

    /// Remove without notifying the listener
    pub fn delete(&self, key: &K) -> Option<V> {
        self.entries.lock().remove(key).map(|e| e.value)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict everything whose deadline has passed at `now`
    pub fn cleanup(&self, now: Instant) -> usize {
        let expired: Vec<(K, V)> = {
            let mut entries = self.entries.lock();
            let keys: Vec<K> = entries
                .iter()
                .filter(|(_, e)| e.expires <= now)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| entries.remove(&k).map(|e| (k, e.value)))
                .collect()
        };

        let count = expired.len();
        if let Some(listener) = &self.listener {
            for (key, value) in expired {
                listener(key, value);
            }
        }
        if count > 0 {
            debug!("Cache cleanup removed {} entries", count);
        }
        count
    }

    /// Run `cleanup` every `interval` on the current tokio runtime
    pub fn start_janitor(self: &Arc<Self>, interval: Duration) -> JanitorHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let cache = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        cache.cleanup(Instant::now());
                    }
                }
            }
        });

        JanitorHandle { stop_tx, task }
    }
}

/// Handle to a running janitor
pub struct JanitorHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl JanitorHandle {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_cache(ttl: Duration) -> (Arc<TtlCache<u32, String>>, Arc<Mutex<Vec<u32>>>) {
        let removed = Arc::new(Mutex::new(Vec::new()));
        let sink = removed.clone();
        let cache = TtlCache::with_removal_listener(
            ttl,
            16,
            Box::new(move |k, _v| sink.lock().push(k)),
        );
        (Arc::new(cache), removed)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_reports_expired() {
        let (cache, removed) = counting_cache(Duration::from_secs(10));
        cache.put(1, "a".into());
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.put(2, "b".into());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.cleanup(Instant::now()), 1);
        assert_eq!(*removed.lock(), vec![1]);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_refreshes_deadline() {
        let (cache, removed) = counting_cache(Duration::from_secs(10));
        cache.put(1, "a".into());
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get(&1).as_deref(), Some("a"));

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.cleanup(Instant::now()), 0);
        assert!(removed.lock().is_empty());
    }

    #[test]
    fn test_delete_skips_listener() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let cache: TtlCache<u32, u32> = TtlCache::with_removal_listener(
            Duration::ZERO,
            4,
            Box::new(move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        cache.put(7, 70);
        assert_eq!(cache.delete(&7), Some(70));
        assert_eq!(cache.delete(&7), None);
        assert_eq!(cache.cleanup(Instant::now()), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_put_replaces_and_with_mut() {
        let cache: TtlCache<&'static str, u32> = TtlCache::new(Duration::from_secs(60), 4);
        assert_eq!(cache.put("k", 1), None);
        assert_eq!(cache.put("k", 2), Some(1));
        assert_eq!(cache.with_mut(&"k", |v| {
            *v += 1;
            *v
        }), Some(3));
        assert_eq!(cache.with_mut(&"missing", |v| *v), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_janitor_evicts_until_stopped() {
        let (cache, removed) = counting_cache(Duration::from_secs(2));
        let janitor = cache.start_janitor(Duration::from_secs(1));
        cache.put(1, "a".into());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(*removed.lock(), vec![1]);
        assert!(cache.is_empty());

        janitor.stop().await;
        cache.put(2, "b".into());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(cache.len(), 1);
    }
}
