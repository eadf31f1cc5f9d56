//! Bounded in-process cache used as the fallback layer while the primary
//! backend is unavailable, and as the sole cache in single-instance setups.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry {
    value: String,
    expires_at: Instant,
    touched: u64,
}

struct Inner {
    entries: HashMap<String, Entry>,
    clock: u64,
}

/// Least-recently-used map with per-entry TTLs.
pub struct MemoryCache {
    inner: Mutex<Inner>,
    max_size: usize,
}

impl MemoryCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                clock: 0,
            }),
            max_size,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock().expect("memory cache poisoned");
        inner.clock += 1;
        let clock = inner.clock;

        let entry = inner.entries.get_mut(key)?;
        if entry.expires_at <= Instant::now() {
            inner.entries.remove(key);
            return None;
        }
        entry.touched = clock;
        Some(entry.value.clone())
    }

    pub fn set(&self, key: &str, value: &str, ttl: Duration) {
        let mut inner = self.inner.lock().expect("memory cache poisoned");
        inner.clock += 1;
        let clock = inner.clock;

        if inner.entries.len() >= self.max_size && !inner.entries.contains_key(key) {
            evict_one(&mut inner);
        }

        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
                touched: clock,
            },
        );
    }

    pub fn delete(&self, key: &str) {
        let mut inner = self.inner.lock().expect("memory cache poisoned");
        inner.entries.remove(key);
    }
}

/// Drops one expired entry if any exists, otherwise the least recently used.
fn evict_one(inner: &mut Inner) {
    let now = Instant::now();
    let victim = inner
        .entries
        .iter()
        .find(|(_, e)| e.expires_at <= now)
        .or_else(|| inner.entries.iter().min_by_key(|(_, e)| e.touched))
        .map(|(k, _)| k.clone());
    if let Some(key) = victim {
        inner.entries.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_entries_read_as_misses() {
        let cache = MemoryCache::new(10);
        cache.set("k", "v", Duration::ZERO);
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_eviction_prefers_least_recently_used() {
        let cache = MemoryCache::new(2);
        cache.set("a", "1", Duration::from_secs(60));
        cache.set("b", "2", Duration::from_secs(60));

        // Touch "a" so "b" is the LRU victim.
        cache.get("a");
        cache.set("c", "3", Duration::from_secs(60));

        assert_eq!(cache.get("a").as_deref(), Some("1"));
        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("c").as_deref(), Some("3"));
    }
}
