//! LRU map with per-entry TTL shared by the nameserver and glue caches

use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Why a lookup produced nothing. Expiry is distinct from absence so
/// callers can decide to overwrite in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMiss {
    NotFound,
    Expired,
}

struct Entry<V> {
    value: V,
    inserted: Instant,
    ttl: Duration,
}

/// TTL-bounded LRU. Expired entries are reported but left in place; the
/// next `set` for the key overwrites them.
pub struct TtlLru<K: Hash + Eq, V: Clone> {
    inner: Mutex<LruCache<K, Entry<V>>>,
}

impl<K: Hash + Eq, V: Clone> TtlLru<K, V> {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        TtlLru {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn get(&self, key: &K) -> Result<V, CacheMiss> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &K, now: Instant) -> Result<V, CacheMiss> {
        let mut inner = self.inner.lock();
        match inner.get(key) {
            None => Err(CacheMiss::NotFound),
            Some(entry) => {
                if now.duration_since(entry.inserted) >= entry.ttl {
                    Err(CacheMiss::Expired)
                } else {
                    Ok(entry.value.clone())
                }
            }
        }
    }

    /// Remaining lifetime of a live entry.
    pub fn ttl_left(&self, key: &K) -> Option<Duration> {
        let mut inner = self.inner.lock();
        let entry = inner.get(key)?;
        entry
            .ttl
            .checked_sub(Instant::now().duration_since(entry.inserted))
    }

    pub fn set(&self, key: K, value: V, ttl: Duration) {
        self.set_at(key, value, ttl, Instant::now());
    }

    pub fn set_at(&self, key: K, value: V, ttl: Duration, now: Instant) {
        self.inner.lock().put(
            key,
            Entry {
                value,
                inserted: now,
                ttl,
            },
        );
    }

    pub fn remove(&self, key: &K) -> bool {
        self.inner.lock().pop(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_get() {
        let cache: TtlLru<u64, u32> = TtlLru::new(16);
        cache.set(1, 99, Duration::from_secs(60));
        assert_eq!(cache.get(&1), Ok(99));
    }

    #[test]
    fn test_expired_is_distinct_from_missing() {
        let cache: TtlLru<u64, u32> = TtlLru::new(16);
        let t0 = Instant::now();
        cache.set_at(1, 99, Duration::from_secs(10), t0);

        assert_eq!(cache.get_at(&2, t0), Err(CacheMiss::NotFound));
        assert_eq!(cache.get_at(&1, t0 + Duration::from_secs(5)), Ok(99));
        assert_eq!(
            cache.get_at(&1, t0 + Duration::from_secs(10)),
            Err(CacheMiss::Expired)
        );
        // expired entry stays and can be overwritten in place
        assert_eq!(cache.len(), 1);
        cache.set_at(1, 100, Duration::from_secs(10), t0 + Duration::from_secs(11));
        assert_eq!(cache.get_at(&1, t0 + Duration::from_secs(12)), Ok(100));
    }

    #[test]
    fn test_lru_eviction() {
        let cache: TtlLru<u64, u32> = TtlLru::new(2);
        cache.set(1, 1, Duration::from_secs(60));
        cache.set(2, 2, Duration::from_secs(60));
        cache.set(3, 3, Duration::from_secs(60));
        assert_eq!(cache.get(&1), Err(CacheMiss::NotFound));
        assert_eq!(cache.get(&3), Ok(3));
    }

    #[test]
    fn test_remove() {
        let cache: TtlLru<u64, u32> = TtlLru::new(4);
        cache.set(7, 7, Duration::from_secs(60));
        assert!(cache.remove(&7));
        assert!(!cache.remove(&7));
        assert_eq!(cache.get(&7), Err(CacheMiss::NotFound));
    }
}
