//! Time-bounded cache of merged directory listings.
//!
//! Repeated listings of the same directory within the TTL window are served
//! from here without a remote round trip. Any local mutation under a
//! directory invalidates its entry immediately, regardless of TTL.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::node::Node;

#[derive(Debug, Clone)]
struct ListingEntry {
    entries: Vec<Node>,
    inserted_at: Instant,
}

impl ListingEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() > ttl
    }
}

/// Cache statistics.
#[derive(Debug, Default, Clone)]
pub struct ListingCacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that missed or hit an expired entry.
    pub misses: u64,
    /// Entries dropped by capacity pressure.
    pub evictions: u64,
    /// Entries dropped by explicit invalidation.
    pub invalidations: u64,
    /// Current number of cached directories.
    pub size: usize,
}

/// LRU cache of merged listings keyed by directory path.
pub struct ListingCache {
    entries: LruCache<String, ListingEntry>,
    ttl: Duration,
    stats: ListingCacheStats,
}

impl ListingCache {
    /// Cache holding up to `capacity` directories, entries valid for `ttl`.
    /// A zero capacity is clamped to one entry.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
            stats: ListingCacheStats::default(),
        }
    }

    /// Cached listing for a directory, if present and fresh.
    pub fn get(&mut self, dir: &str) -> Option<Vec<Node>> {
        if let Some(entry) = self.entries.get(dir) {
            if entry.is_expired(self.ttl) {
                self.entries.pop(dir);
                self.stats.misses += 1;
                None
            } else {
                self.stats.hits += 1;
                Some(entry.entries.clone())
            }
        } else {
            self.stats.misses += 1;
            None
        }
    }

    /// Store the merged listing for a directory.
    pub fn insert(&mut self, dir: &str, entries: Vec<Node>) {
        let prev_len = self.entries.len();
        self.entries.push(
            dir.to_string(),
            ListingEntry {
                entries,
                inserted_at: Instant::now(),
            },
        );
        if self.entries.len() <= prev_len {
            self.stats.evictions += 1;
        }
    }

    /// Drop a directory's cached listing after a local mutation under it.
    pub fn invalidate(&mut self, dir: &str) {
        if self.entries.pop(dir).is_some() {
            self.stats.invalidations += 1;
        }
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> ListingCacheStats {
        ListingCacheStats {
            size: self.entries.len(),
            ..self.stats.clone()
        }
    }

    /// Number of cached directories.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
