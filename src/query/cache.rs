//! Query result cache
//!
//! Memoizes atomic searches keyed by `(timestamp, branch, specification)`.
//! Any index mutation clears the whole cache. A disabled (or zero-capacity)
//! cache passes every request through and counts it as a miss.
//!
//! Results are `Arc`-wrapped so a hit only clones a pointer. A result whose
//! search overlapped an invalidation is returned but not cached.

use super::spec::SearchSpecification;
use crate::types::{TemporalKey, Timestamp};
use crate::Result;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifiers matched by one atomic search
pub type SearchResult = Arc<BTreeSet<TemporalKey>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    timestamp: Timestamp,
    branch: String,
    spec: SearchSpecification,
}

pub struct QueryCache {
    /// `None` when caching is disabled
    cache: Option<Mutex<LruCache<CacheKey, SearchResult>>>,
    /// Bumped by every invalidation, read and compared under the cache lock
    generation: AtomicU64,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl QueryCache {
    pub fn new(enabled: bool, capacity: usize) -> Self {
        let cache = match NonZeroUsize::new(capacity) {
            Some(capacity) if enabled => Some(Mutex::new(LruCache::new(capacity))),
            _ => None,
        };
        Self {
            cache,
            generation: AtomicU64::new(0),
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, 0)
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    /// Cached result, or the result of `search` (cached on success)
    pub fn get_or_search<F>(
        &self,
        timestamp: Timestamp,
        branch: &str,
        spec: &SearchSpecification,
        search: F,
    ) -> Result<SearchResult>
    where
        F: FnOnce() -> Result<BTreeSet<TemporalKey>>,
    {
        let Some(cache) = &self.cache else {
            self.miss_count.fetch_add(1, Ordering::Relaxed);
            return search().map(Arc::new);
        };

        let key = CacheKey {
            timestamp,
            branch: branch.to_string(),
            spec: spec.clone(),
        };
        let generation = {
            let mut guard = cache.lock();
            if let Some(result) = guard.get(&key) {
                self.hit_count.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(result));
            }
            self.generation.load(Ordering::Acquire)
        };

        // Computed without holding the lock; concurrent misses may search twice
        self.miss_count.fetch_add(1, Ordering::Relaxed);
        let result = Arc::new(search()?);

        let mut guard = cache.lock();
        if self.generation.load(Ordering::Acquire) == generation {
            guard.put(key, Arc::clone(&result));
        }
        Ok(result)
    }

    /// Drop every cached result (counters are kept)
    pub fn invalidate_all(&self) {
        if let Some(cache) = &self.cache {
            let mut guard = cache.lock();
            guard.clear();
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hit_count.load(Ordering::Relaxed) as f64;
        let misses = self.miss_count.load(Ordering::Relaxed) as f64;

        if hits + misses == 0.0 {
            0.0
        } else {
            hits / (hits + misses)
        }
    }

    pub fn stats(&self) -> CacheStats {
        let (capacity, size) = match &self.cache {
            Some(cache) => {
                let cache = cache.lock();
                (cache.cap().get(), cache.len())
            }
            None => (0, 0),
        };
        CacheStats {
            capacity,
            size,
            hits: self.hit_count.load(Ordering::Relaxed),
            misses: self.miss_count.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub capacity: usize,
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    /// 0.0 - 1.0
    pub hit_rate: f64,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Query cache: {}/{} entries, {:.1}% hit rate ({} hits, {} misses)",
            self.size,
            self.capacity,
            self.hit_rate * 100.0,
            self.hits,
            self.misses
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::TextCondition;
    use std::cell::Cell;

    fn spec(value: &str) -> SearchSpecification {
        SearchSpecification::text("name", TextCondition::Equals, value)
    }

    fn result(key: &str) -> BTreeSet<TemporalKey> {
        [TemporalKey::new("master", "people", key, 10)].into_iter().collect()
    }

    #[test]
    fn test_hits_and_misses() {
        let cache = QueryCache::new(true, 100);
        let calls = Cell::new(0);
        let search = || {
            calls.set(calls.get() + 1);
            Ok(result("k1"))
        };

        let first = cache.get_or_search(10, "master", &spec("a"), search).unwrap();
        let second = cache.get_or_search(10, "master", &spec("a"), || unreachable!()).unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.get(), 1);

        // Different timestamp, branch or specification is a different entry
        cache.get_or_search(11, "master", &spec("a"), || Ok(result("k2"))).unwrap();
        cache.get_or_search(10, "feature", &spec("a"), || Ok(result("k2"))).unwrap();
        cache.get_or_search(10, "master", &spec("b"), || Ok(result("k2"))).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 4);
        assert_eq!(stats.size, 4);
    }

    #[test]
    fn test_invalidate_all() {
        let cache = QueryCache::new(true, 100);
        cache.get_or_search(10, "master", &spec("a"), || Ok(result("k1"))).unwrap();
        cache.invalidate_all();
        assert_eq!(cache.stats().size, 0);

        let calls = Cell::new(0);
        cache
            .get_or_search(10, "master", &spec("a"), || {
                calls.set(1);
                Ok(result("k1"))
            })
            .unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_result_overlapping_invalidation_is_not_cached() {
        let cache = QueryCache::new(true, 10);
        let stale = cache
            .get_or_search(10, "master", &spec("a"), || {
                // A concurrent commit lands while the search runs
                cache.invalidate_all();
                Ok(result("k1"))
            })
            .unwrap();
        assert_eq!(*stale, result("k1"));
        assert_eq!(cache.stats().size, 0);

        let calls = Cell::new(0);
        cache
            .get_or_search(10, "master", &spec("a"), || {
                calls.set(calls.get() + 1);
                Ok(result("k2"))
            })
            .unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(cache.stats().size, 1);
    }

    #[test]
    fn test_disabled_cache_passes_through() {
        for cache in [QueryCache::disabled(), QueryCache::new(true, 0)] {
            assert!(!cache.is_enabled());
            cache.get_or_search(10, "master", &spec("a"), || Ok(result("k1"))).unwrap();
            cache.get_or_search(10, "master", &spec("a"), || Ok(result("k1"))).unwrap();
            let stats = cache.stats();
            assert_eq!((stats.hits, stats.misses, stats.size), (0, 2, 0));
        }
    }

    #[test]
    fn test_errors_are_not_cached() {
        let cache = QueryCache::new(true, 10);
        let failed = cache.get_or_search(10, "master", &spec("a"), || {
            Err(crate::IndexError::InvalidArgument("boom".into()))
        });
        assert!(failed.is_err());
        assert_eq!(cache.stats().size, 0);
    }
}
