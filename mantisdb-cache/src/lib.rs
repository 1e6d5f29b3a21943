//! Bounded LRU+TTL cache overlay (§4.2).
//!
//! The cache never calls back into the store (§9 "cyclic references"):
//! misses are reported to the caller, who is responsible for resolving them
//! against the authoritative store and re-populating the cache. This keeps
//! `mantisdb-cache` a pure function of the operations performed on it.
//!
//! Per-entry `access_count`/`last_access` are plain atomics mutated without
//! touching the entry map's write path (§4.2 "Concurrency"). The eviction
//! decision is serialized behind a single-evictor lock so I4 (total resident
//! size never exceeds `max_bytes` after any operation returns) holds even
//! under concurrent `put`s, while readers proceed throughout the sweep.

use dashmap::DashMap;
use mantisdb_core::error::MantisError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos() as u64
}

/// A cached value plus the bookkeeping the eviction policy needs.
///
/// Superset of `mantisdb_storage::Entry` (§3 "CacheEntry"): adds `evictable`,
/// a pinning escape hatch for entries the eviction sweep must never touch
/// (unused by the store today, but part of the cache's own contract).
#[derive(Debug)]
struct CacheEntry {
    value: Vec<u8>,
    size: usize,
    expires_at: Option<u64>,
    access_count: AtomicU64,
    last_access: AtomicU64,
    evictable: bool,
}

impl CacheEntry {
    fn new(value: Vec<u8>, ttl: Option<Duration>, evictable: bool) -> Self {
        let now = now_nanos();
        let size = value.len();
        CacheEntry {
            value,
            size,
            expires_at: ttl.map(|d| now + d.as_nanos() as u64),
            access_count: AtomicU64::new(0),
            last_access: AtomicU64::new(now),
            evictable,
        }
    }

    fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(exp) if now_nanos() >= exp)
    }

    fn touch(&self) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        self.last_access.store(now_nanos(), Ordering::Relaxed);
    }
}

/// Eviction/replacement policy. Only `Lru` is implemented (§6 config key
/// `memory.eviction_policy` currently recognizes only `lru`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Lru,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        EvictionPolicy::Lru
    }
}

/// Snapshot of the cache's atomic counters.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size_bytes: u64,
    pub count: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    bytes: AtomicU64,
}

/// Bounded in-memory LRU+TTL cache (C2).
///
/// Backed by a `DashMap` for concurrent lookups; eviction is driven by a
/// single `Mutex<()>` guard so only one evictor runs at a time (§4.2).
pub struct Cache {
    entries: Arc<DashMap<String, Arc<CacheEntry>>>,
    counters: Arc<Counters>,
    max_bytes: u64,
    default_ttl: Option<Duration>,
    policy: EvictionPolicy,
    evict_lock: Arc<Mutex<()>>,
}

impl Clone for Cache {
    fn clone(&self) -> Self {
        Cache {
            entries: Arc::clone(&self.entries),
            counters: Arc::clone(&self.counters),
            max_bytes: self.max_bytes,
            default_ttl: self.default_ttl,
            policy: self.policy,
            evict_lock: Arc::clone(&self.evict_lock),
        }
    }
}

impl Cache {
    pub fn new(max_bytes: u64, default_ttl: Option<Duration>) -> Self {
        Cache {
            entries: Arc::new(DashMap::new()),
            counters: Arc::new(Counters::default()),
            max_bytes,
            default_ttl,
            policy: EvictionPolicy::Lru,
            evict_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Look up `key`. Updates `access_count`/`last_access` in place on hit —
    /// no write-path lock is taken for that update (§4.2). Both a cache miss
    /// and a lazily-discovered-expired entry count as a miss (§4.2 doesn't
    /// distinguish a third counter for expiry).
    pub fn get(&self, key: &str) -> Result<Vec<u8>, MantisError> {
        // The `Ref` guard from `entries.get` is dropped at the end of this
        // inner block, before any removal — holding it across a `remove`
        // on the same shard would deadlock DashMap's internal locking.
        let hit = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => {
                entry.touch();
                Some(entry.value.clone())
            }
            _ => None,
        };

        match hit {
            Some(value) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            None => {
                self.remove_internal(key, false);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Err(MantisError::NotFound)
            }
        }
    }

    /// Insert or replace `key`. Bounded by `ttl` if given, else the cache's
    /// `default_ttl`. Triggers eviction first if the insert would push
    /// resident size past `max_bytes` (I4).
    pub fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), MantisError> {
        let effective_ttl = ttl.or(self.default_ttl);
        let new_size = value.len() as u64;
        let old_size = self.entries.get(key).map(|e| e.size as u64).unwrap_or(0);

        if new_size > self.max_bytes {
            return Err(MantisError::ResourceExhausted(format!(
                "value of {new_size} bytes exceeds cache max_bytes {}",
                self.max_bytes
            )));
        }

        let current = self.counters.bytes.load(Ordering::Relaxed);
        let projected = current - old_size + new_size;
        if projected > self.max_bytes {
            let required = projected - self.max_bytes;
            self.evict_at_least(required, Some(key))?;
        }

        let entry = Arc::new(CacheEntry::new(value, effective_ttl, true));
        self.entries.insert(key.to_string(), entry);
        self.adjust_bytes(new_size as i64 - old_size as i64);
        Ok(())
    }

    /// Remove `key` without counting it as an eviction.
    pub fn invalidate(&self, key: &str) {
        self.remove_internal(key, false);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            size_bytes: self.counters.bytes.load(Ordering::Relaxed),
            count: self.entries.len() as u64,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_internal(&self, key: &str, count_as_eviction: bool) {
        if let Some((_, entry)) = self.entries.remove(key) {
            self.adjust_bytes(-(entry.size as i64));
            if count_as_eviction {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Evict until at least `required` bytes are free, or report
    /// `ResourceExhausted` if the full sweep still can't make room (§4.2
    /// failure model). `skip_key` is the key about to be (re)written — it is
    /// excluded from the candidate set so `put` never evicts the very entry
    /// it is trying to install.
    ///
    /// Candidates are collected as an atomic snapshot, then sorted ascending
    /// by `last_access` (ties: smaller size, then lexicographic key, for
    /// determinism) and removed one at a time until the freed total meets
    /// `required` — evict-minimum, per the §9 Open Question decision
    /// recorded in DESIGN.md.
    fn evict_at_least(&self, required: u64, skip_key: Option<&str>) -> Result<(), MantisError> {
        let _guard = self.evict_lock.lock();

        let mut freed = 0u64;
        loop {
            if freed >= required {
                return Ok(());
            }

            let mut candidates: Vec<(String, u64, u64, bool)> = self
                .entries
                .iter()
                .filter(|e| skip_key != Some(e.key().as_str()))
                .map(|e| {
                    (
                        e.key().clone(),
                        e.last_access.load(Ordering::Relaxed),
                        e.size as u64,
                        e.is_expired(),
                    )
                })
                .collect();

            if candidates.is_empty() {
                return Err(MantisError::ResourceExhausted(format!(
                    "cannot free {required} bytes: no evictable entries remain"
                )));
            }

            candidates.sort_by(|a, b| {
                // Expired entries go first — they're free to reclaim.
                b.3.cmp(&a.3)
                    .then(a.1.cmp(&b.1))
                    .then(a.2.cmp(&b.2))
                    .then(a.0.cmp(&b.0))
            });

            let mut progressed = false;
            for (key, _, size, expired) in candidates {
                if freed >= required {
                    break;
                }
                if self.entries.remove(&key).is_some() {
                    self.adjust_bytes(-(size as i64));
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    freed += size;
                    progressed = true;
                    if expired {
                        debug!(key = %key, "reclaimed expired cache entry during eviction sweep");
                    }
                }
            }

            if !progressed {
                warn!(required, freed, "cache eviction sweep made no progress");
                return Err(MantisError::ResourceExhausted(format!(
                    "could only free {freed} of {required} required bytes"
                )));
            }
        }
    }

    fn adjust_bytes(&self, delta: i64) {
        if delta >= 0 {
            self.counters.bytes.fetch_add(delta as u64, Ordering::Relaxed);
        } else {
            let delta = (-delta) as u64;
            let _ = self.counters.bytes.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                Some(cur.saturating_sub(delta))
            });
        }
    }
}

#[cfg(test)]
mod props {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// P5: after any cache operation returns, size_bytes <= max_bytes.
        #[test]
        fn p5_size_never_exceeds_max(sizes in proptest::collection::vec(1usize..50, 1..30)) {
            let cache = Cache::new(200, None);
            for (i, size) in sizes.iter().enumerate() {
                let _ = cache.put(&format!("k{i}"), vec![0u8; *size], None);
                prop_assert!(cache.stats().size_bytes <= 200);
            }
        }

        /// P6: hits + misses equals the number of gets issued.
        #[test]
        fn p6_hit_plus_miss_equals_gets(keys in proptest::collection::vec("[a-z]{1,4}", 1..20)) {
            let cache = Cache::new(10_000, None);
            cache.put("present", b"v".to_vec(), None).unwrap();
            let mut gets = 0u64;
            for k in &keys {
                let _ = cache.get(k);
                gets += 1;
            }
            let _ = cache.get("present");
            gets += 1;
            let stats = cache.stats();
            prop_assert_eq!(stats.hits + stats.misses, gets);
        }
    }

    /// P7: immediately after a successful write, a read observes the new
    /// value or a miss — never a stale prior value. This is exercised at
    /// the cache layer alone (no store involved) by writing twice in a row
    /// and checking the second value is what's visible.
    #[test]
    fn p7_no_stale_value_after_overwrite() {
        let cache = Cache::new(10_000, None);
        cache.put("k", b"v1".to_vec(), None).unwrap();
        cache.put("k", b"v2".to_vec(), None).unwrap();
        let seen = cache.get("k");
        assert!(matches!(seen, Ok(ref v) if v == b"v2") || matches!(seen, Err(MantisError::NotFound)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trip() {
        let cache = Cache::new(1024, None);
        cache.put("k", b"v".to_vec(), None).unwrap();
        assert_eq!(cache.get("k").unwrap(), b"v");
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn miss_increments_miss_counter() {
        let cache = Cache::new(1024, None);
        assert!(matches!(cache.get("missing"), Err(MantisError::NotFound)));
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn invalidate_does_not_count_as_eviction() {
        let cache = Cache::new(1024, None);
        cache.put("k", b"v".to_vec(), None).unwrap();
        cache.invalidate("k");
        assert_eq!(cache.stats().evictions, 0);
        assert!(matches!(cache.get("k"), Err(MantisError::NotFound)));
    }

    #[test]
    fn ttl_expiry_is_treated_as_miss_and_removed() {
        let cache = Cache::new(1024, None);
        cache.put("t", b"x".to_vec(), Some(Duration::from_millis(20))).unwrap();
        assert!(cache.get("t").is_ok());
        std::thread::sleep(Duration::from_millis(40));
        assert!(matches!(cache.get("t"), Err(MantisError::NotFound)));
        assert_eq!(cache.len(), 0);
    }

    /// Scenario 3 (§8): max_bytes = 1024, ten 200-byte entries, expect
    /// count <= 5 and eviction_counter >= 5, with the least-recently-used
    /// keys gone.
    #[test]
    fn scenario_cache_eviction_under_pressure() {
        let cache = Cache::new(1024, None);
        for i in 0..10 {
            cache.put(&format!("k{i}"), vec![0u8; 200], None).unwrap();
            // give successive entries strictly increasing last_access so
            // the ordering used to pick eviction victims is deterministic.
            std::thread::sleep(Duration::from_millis(1));
        }
        let stats = cache.stats();
        assert!(stats.count <= 5, "count was {}", stats.count);
        assert!(stats.evictions >= 5, "evictions was {}", stats.evictions);
        assert!(matches!(cache.get("k0"), Err(MantisError::NotFound)));
        assert!(cache.get("k9").is_ok());
    }

    #[test]
    fn put_larger_than_capacity_is_resource_exhausted() {
        let cache = Cache::new(100, None);
        let result = cache.put("k", vec![0u8; 200], None);
        assert!(matches!(result, Err(MantisError::ResourceExhausted(_))));
    }

    #[test]
    fn eviction_prefers_expired_entries_first() {
        let cache = Cache::new(300, None);
        cache.put("expired", vec![0u8; 100], Some(Duration::from_millis(5))).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        cache.put("fresh", vec![0u8; 100], None).unwrap();
        cache.put("trigger", vec![0u8; 150], None).unwrap();
        assert!(matches!(cache.get("expired"), Err(MantisError::NotFound)));
        assert!(cache.get("fresh").is_ok());
    }

    #[test]
    fn concurrent_gets_and_puts_keep_size_bounded() {
        let cache = Cache::new(4096, None);
        std::thread::scope(|scope| {
            for t in 0..4 {
                let cache = cache.clone();
                scope.spawn(move || {
                    for i in 0..200 {
                        let key = format!("k{t}_{}", i % 20);
                        let _ = cache.put(&key, vec![0u8; 64], None);
                        let _ = cache.get(&key);
                    }
                });
            }
        });
        assert!(cache.stats().size_bytes <= 4096);
    }
}
