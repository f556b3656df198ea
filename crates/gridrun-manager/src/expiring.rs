//! Key/value map whose entries expire when nobody refreshes them.
//!
//! Every entry carries the instant it was last set or touched. A background
//! sweep runs at a fixed interval and visits expired entries oldest first:
//!
//! 1. the pre-removal hook decides whether the entry may go ([`Removal`]);
//! 2. a vetoed entry is touched, a released one is removed;
//! 3. the post-removal hook receives the removed key and value.
//!
//! Hooks run without the map lock held, so they are free to lock other
//! structures (or this map). An entry touched or replaced while its hook
//! runs is left alone. A panicking hook only affects its own entry.
//!
//! [`ExpiringMap::lock`] exposes the map's single mutex for callers that
//! need a check-then-act sequence over several operations.

use std::collections::HashMap;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, trace};

/// Decision of the pre-removal hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Proceed,
    Veto,
}

type RemovingHook<K, V> = Arc<dyn Fn(&K, &V) -> Removal + Send + Sync>;
type RemovedHook<K, V> = Arc<dyn Fn(K, V) + Send + Sync>;

struct Entry<V> {
    value: V,
    stamp: Instant,
    seq: u64,
}

/// Entries of an [`ExpiringMap`], reachable through its lock.
pub struct Entries<K, V> {
    map: HashMap<K, Entry<V>>,
    next_seq: u64,
}

impl<K: Eq + Hash, V> Entries<K, V> {
    /// Insert or replace a value, stamping it now.
    pub fn set(&mut self, key: K, value: V) -> Option<V> {
        let stamp = Instant::now();
        match self.map.get_mut(&key) {
            Some(entry) => {
                entry.stamp = stamp;
                Some(std::mem::replace(&mut entry.value, value))
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.map.insert(key, Entry { value, stamp, seq });
                None
            }
        }
    }

    /// Read a value without refreshing it.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key).map(|e| &e.value)
    }

    /// Refresh the stamp of an entry. Returns false if absent.
    pub fn touch(&mut self, key: &K) -> bool {
        match self.map.get_mut(key) {
            Some(entry) => {
                entry.stamp = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Delete an entry. No hook fires.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key).map(|e| e.value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.map.iter().map(|(k, e)| (k, &e.value))
    }
}

struct Shared<K, V> {
    entries: Mutex<Entries<K, V>>,
    ttl: Duration,
    removing: RwLock<Option<RemovingHook<K, V>>>,
    removed: RwLock<Option<RemovedHook<K, V>>>,
}

impl<K, V> Shared<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn lock(&self) -> MutexGuard<'_, Entries<K, V>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut expired: Vec<(K, V, Instant, u64)> = self
            .lock()
            .map
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.stamp) > self.ttl)
            .map(|(k, e)| (k.clone(), e.value.clone(), e.stamp, e.seq))
            .collect();
        if expired.is_empty() {
            return 0;
        }
        expired.sort_by_key(|(_, _, stamp, seq)| (*stamp, *seq));

        let removing = self
            .removing
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let removed = self
            .removed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut count = 0;
        for (key, value, stamp, _) in expired {
            let decision = match &removing {
                Some(hook) => catch_unwind(AssertUnwindSafe(|| hook(&key, &value)))
                    .unwrap_or_else(|_| {
                        error!("Pre-removal hook panicked, keeping entry");
                        Removal::Veto
                    }),
                None => Removal::Proceed,
            };

            let evicted = {
                let mut entries = self.lock();
                let unchanged = entries
                    .map
                    .get(&key)
                    .is_some_and(|entry| entry.stamp == stamp);
                match (unchanged, decision) {
                    (false, _) => None,
                    (true, Removal::Veto) => {
                        entries.touch(&key);
                        None
                    }
                    (true, Removal::Proceed) => entries.remove(&key),
                }
            };

            if let Some(value) = evicted {
                count += 1;
                if let Some(hook) = &removed {
                    if catch_unwind(AssertUnwindSafe(|| hook(key, value))).is_err() {
                        error!("Post-removal hook panicked");
                    }
                }
            }
        }
        trace!(removed = count, "Expiry sweep finished");
        count
    }
}

/// Map with time-to-live entries and a background sweep.
pub struct ExpiringMap<K, V> {
    shared: Arc<Shared<K, V>>,
    sweeper: JoinHandle<()>,
}

impl<K, V> ExpiringMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a map and start its sweep. Must be called within a Tokio runtime.
    pub fn new(ttl: Duration, sweep_interval: Duration) -> Self {
        let shared = Arc::new(Shared {
            entries: Mutex::new(Entries {
                map: HashMap::new(),
                next_seq: 0,
            }),
            ttl,
            removing: RwLock::new(None),
            removed: RwLock::new(None),
        });

        let weak = Arc::downgrade(&shared);
        let sweeper = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + sweep_interval, sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                shared.sweep();
            }
        });

        Self { shared, sweeper }
    }

    /// Install the pre-removal hook.
    pub fn on_removing<F>(&self, hook: F)
    where
        F: Fn(&K, &V) -> Removal + Send + Sync + 'static,
    {
        *self
            .shared
            .removing
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    /// Install the post-removal hook.
    pub fn on_removed<F>(&self, hook: F)
    where
        F: Fn(K, V) + Send + Sync + 'static,
    {
        *self
            .shared
            .removed
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    /// Lock the map for a composite operation.
    pub fn lock(&self) -> MutexGuard<'_, Entries<K, V>> {
        self.shared.lock()
    }

    pub fn set(&self, key: K, value: V) -> Option<V> {
        self.lock().set(key, value)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.lock().get(key).cloned()
    }

    pub fn touch(&self, key: &K) -> bool {
        self.lock().touch(key)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.lock().remove(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of every entry.
    pub fn snapshot(&self) -> Vec<(K, V)> {
        self.lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn ttl(&self) -> Duration {
        self.shared.ttl
    }

    /// Run one sweep now. Returns the number of removed entries.
    pub fn sweep(&self) -> usize {
        self.shared.sweep()
    }
}

impl<K, V> Drop for ExpiringMap<K, V> {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TTL: Duration = Duration::from_millis(50);
    const NEVER: Duration = Duration::from_secs(3600);

    async fn expire() {
        tokio::time::sleep(TTL + Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_expired_entry_is_removed_and_reported() {
        let map: ExpiringMap<String, u32> = ExpiringMap::new(TTL, NEVER);
        let removed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&removed);
        map.on_removed(move |k, v| sink.lock().unwrap().push((k, v)));

        map.set("a".to_string(), 1);
        assert_eq!(map.sweep(), 0);

        expire().await;
        assert_eq!(map.sweep(), 1);
        assert!(map.is_empty());
        assert_eq!(*removed.lock().unwrap(), vec![("a".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_veto_touches_instead_of_removing() {
        let map: ExpiringMap<&'static str, u32> = ExpiringMap::new(TTL, NEVER);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        map.on_removing(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Removal::Veto
        });

        map.set("busy", 1);
        expire().await;
        assert_eq!(map.sweep(), 0);
        assert!(map.contains_key(&"busy"));

        // The veto refreshed the stamp, so an immediate sweep skips the entry.
        assert_eq!(map.sweep(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_touch_extends_lifetime() {
        let map: ExpiringMap<u32, u32> = ExpiringMap::new(TTL, NEVER);
        map.set(1, 10);
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert!(map.touch(&1));
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert_eq!(map.sweep(), 0);
        assert_eq!(map.get(&1), Some(10));
        assert!(!map.touch(&2));
    }

    #[tokio::test]
    async fn test_remove_does_not_fire_hook() {
        let map: ExpiringMap<u32, u32> = ExpiringMap::new(TTL, NEVER);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        map.on_removed(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        map.set(1, 1);
        assert_eq!(map.remove(&1), Some(1));
        expire().await;
        map.sweep();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_hook_does_not_abort_sweep() {
        let map: ExpiringMap<u32, u32> = ExpiringMap::new(TTL, NEVER);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        map.on_removed(move |k, _| {
            if k == 1 {
                panic!("hook failure");
            }
            sink.lock().unwrap().push(k);
        });

        map.set(1, 1);
        map.set(2, 2);
        expire().await;
        assert_eq!(map.sweep(), 2);
        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_sweep_visits_oldest_first() {
        let map: ExpiringMap<u32, u32> = ExpiringMap::new(TTL, NEVER);
        let order = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&order);
        map.on_removed(move |k, _| sink.lock().unwrap().push(k));

        map.set(3, 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        map.set(1, 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        map.set(2, 0);
        expire().await;
        map.sweep();
        assert_eq!(*order.lock().unwrap(), vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn test_background_sweep_runs() {
        let map: ExpiringMap<u32, u32> =
            ExpiringMap::new(Duration::from_millis(20), Duration::from_millis(10));
        map.set(1, 1);

        let deadline = Instant::now() + Duration::from_secs(2);
        while !map.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(map.is_empty());
    }
}
