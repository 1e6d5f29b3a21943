//! Lock-free ordered key→value store (§4.1).
//!
//! Backed by a [`crossbeam_skiplist::SkipMap`], giving lock-free reads and
//! fine-grained per-key write coordination without a global lock. Each slot
//! holds an immutable [`Entry`] except for its `access_count`/`last_access`
//! fields, which are per-entry atomics mutated in place on every read —
//! writers replace the whole `Entry` via `insert`, which atomically
//! publishes the new value; the old `Arc<Entry>` becomes unreachable and is
//! reclaimed once the last reader holding it drops it.

use crossbeam_skiplist::SkipMap;
use mantisdb_core::error::MantisError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

pub const MAX_KEY_BYTES: usize = 250;
pub const MAX_VALUE_BYTES: usize = 1024 * 1024;

/// A single stored entry. `key`/`value`/`created_at`/`expires_at` are fixed
/// at construction; `access_count` and `last_access` are mutated in place by
/// readers without replacing the entry.
#[derive(Debug)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
    pub created_at: u64,
    pub updated_at: u64,
    /// Absolute expiry in nanoseconds since epoch; `None` never expires.
    pub expires_at: Option<u64>,
    pub access_count: AtomicU64,
    pub last_access: AtomicU64,
    pub size: usize,
}

impl Entry {
    fn new(key: String, value: Vec<u8>, created_at: u64, ttl: Option<Duration>) -> Self {
        let now = now_nanos();
        let size = value.len();
        Entry {
            key,
            value,
            created_at,
            updated_at: now,
            expires_at: ttl.map(|d| now + d.as_nanos() as u64),
            access_count: AtomicU64::new(0),
            last_access: AtomicU64::new(now),
            size,
        }
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(exp) => now_nanos() >= exp,
            None => false,
        }
    }

    fn touch(&self) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        self.last_access.store(now_nanos(), Ordering::Relaxed);
    }
}

pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos() as u64
}

fn validate_key(key: &str) -> Result<(), MantisError> {
    if key.is_empty() {
        return Err(MantisError::KeyInvalid("key must not be empty".to_string()));
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(MantisError::KeyInvalid(format!(
            "key length {} exceeds {} bytes",
            key.len(),
            MAX_KEY_BYTES
        )));
    }
    if !key.chars().all(|c| !c.is_control()) {
        return Err(MantisError::KeyInvalid(
            "key must consist of printable characters".to_string(),
        ));
    }
    Ok(())
}

fn validate_value(value: &[u8]) -> Result<(), MantisError> {
    if value.len() > MAX_VALUE_BYTES {
        return Err(MantisError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_BYTES,
        });
    }
    Ok(())
}

/// Snapshot of the atomic counters backing [`LockFreeStore::stats`].
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub count: u64,
    pub bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct Counters {
    bytes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Per-item outcome of a [`LockFreeStore::batch_put`] call. Batches are
/// applied with per-item atomicity only — a failure on one item never
/// affects the others (§9 Open Question 3).
#[derive(Debug)]
pub enum PutOutcome {
    Ok,
    Err(MantisError),
}

/// Lock-free ordered key→value map (C1).
///
/// Reads are wait-free; writes install a fresh `Entry` via `SkipMap::insert`,
/// which is the atomic-publication point — concurrent readers either see
/// the old or the new entry in full, never a torn mix (I1).
pub struct LockFreeStore {
    data: Arc<SkipMap<String, Arc<Entry>>>,
    counters: Arc<Counters>,
}

impl Clone for LockFreeStore {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl Default for LockFreeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LockFreeStore {
    pub fn new() -> Self {
        Self {
            data: Arc::new(SkipMap::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Wait-free read. Returns the stable byte snapshot at some point
    /// between call and return (I2); expired entries are treated as absent
    /// and lazily unlinked (I3).
    pub fn get(&self, key: &str) -> Result<Vec<u8>, MantisError> {
        validate_key(key)?;
        match self.data.get(key) {
            Some(node) => {
                let entry = node.value();
                if entry.is_expired() {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    self.lazy_expire(key, entry.size);
                    return Err(MantisError::NotFound);
                }
                entry.touch();
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Ok(entry.value.clone())
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Err(MantisError::NotFound)
            }
        }
    }

    /// Replace any prior entry for `key` (I1). `created_at` is carried
    /// forward from the prior entry if one existed, so repeated writes to
    /// the same key do not reset its creation time.
    pub fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), MantisError> {
        validate_key(key)?;
        validate_value(&value)?;

        let existing = self.data.get(key);
        let created_at = existing
            .as_ref()
            .map(|node| node.value().created_at)
            .unwrap_or_else(now_nanos);
        let old_size = existing.as_ref().map(|node| node.value().size as i64).unwrap_or(0);
        drop(existing);

        let new_size = value.len();
        let entry = Arc::new(Entry::new(key.to_string(), value, created_at, ttl));
        self.data.insert(key.to_string(), entry);
        self.adjust_bytes(new_size as i64 - old_size);
        Ok(())
    }

    /// Remove `key` if present; returns whether it existed.
    pub fn delete(&self, key: &str) -> Result<bool, MantisError> {
        validate_key(key)?;
        match self.data.remove(key) {
            Some(node) => {
                self.adjust_bytes(-(node.value().size as i64));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Membership check without materializing the value. Still honors TTL —
    /// an expired entry is not considered present (I3).
    pub fn exists(&self, key: &str) -> bool {
        match self.data.get(key) {
            Some(node) => !node.value().is_expired(),
            None => false,
        }
    }

    /// Apply a batch of puts. Items may be applied in parallel; each item's
    /// success/failure is independent of the others (§9 Open Question 3).
    pub fn batch_put(&self, items: Vec<(String, Vec<u8>, Option<Duration>)>) -> Vec<PutOutcome> {
        if items.is_empty() {
            return Vec::new();
        }

        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(16)
            .min(items.len().max(1));
        let chunk_size = (items.len() / worker_count).max(1);

        let mut results: Vec<Option<PutOutcome>> = (0..items.len()).map(|_| None).collect();
        let indexed: Vec<(usize, (String, Vec<u8>, Option<Duration>))> =
            items.into_iter().enumerate().collect();

        std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for chunk in indexed.chunks(chunk_size) {
                let store = self.clone();
                handles.push(scope.spawn(move || {
                    chunk
                        .iter()
                        .map(|(idx, (key, value, ttl))| (*idx, store.put(key, value.clone(), *ttl)))
                        .collect::<Vec<_>>()
                }));
            }
            for handle in handles {
                for (idx, outcome) in handle.join().expect("batch_put worker panicked") {
                    results[idx] = Some(match outcome {
                        Ok(()) => PutOutcome::Ok,
                        Err(e) => PutOutcome::Err(e),
                    });
                }
            }
        });

        results
            .into_iter()
            .map(|r| r.expect("every index written exactly once"))
            .collect()
    }

    /// Lazy, ordered-by-key scan. Entries deleted before observation are
    /// skipped; entries inserted after iterator creation may or may not be
    /// observed (§9 Open Question 2 — skipping is allowed).
    pub fn scan_prefix(&self, prefix: &str, limit: Option<usize>) -> Vec<(String, Vec<u8>)> {
        let mut results = Vec::new();
        for node in self.data.range(prefix.to_string()..) {
            let key = node.key();
            if !key.starts_with(prefix) {
                break;
            }
            let entry = node.value();
            if entry.is_expired() {
                continue;
            }
            entry.touch();
            results.push((key.clone(), entry.value.clone()));
            if let Some(limit) = limit {
                if results.len() >= limit {
                    break;
                }
            }
        }
        results
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            count: self.data.len() as u64,
            bytes: self.counters.bytes.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Background-sweeper-style reclamation: remove every currently expired
    /// entry. Safe to call from a periodic task; readers that raced this
    /// sweep already treated the entry as absent (I3).
    pub fn cleanup_expired(&self) -> usize {
        let mut to_remove = Vec::new();
        for node in self.data.iter() {
            if node.value().is_expired() {
                to_remove.push(node.key().clone());
            }
        }
        let removed = to_remove.len();
        for key in to_remove {
            if let Some(node) = self.data.remove(&key) {
                self.adjust_bytes(-(node.value().size as i64));
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        if removed > 0 {
            debug!(removed, "swept expired entries");
        }
        removed
    }

    fn lazy_expire(&self, key: &str, size: usize) {
        if self.data.remove(key).is_some() {
            self.adjust_bytes(-(size as i64));
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn adjust_bytes(&self, delta: i64) {
        if delta >= 0 {
            self.counters.bytes.fetch_add(delta as u64, Ordering::Relaxed);
        } else {
            let delta = (-delta) as u64;
            // Saturating rather than underflowing the atomic counter in the
            // face of any accounting drift.
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
        /// P1: a put is visible to a get unless an intervening delete or
        /// TTL expiry occurred. No TTL is used here, so no expiry races.
        #[test]
        fn p1_put_then_get_roundtrip(key in "[a-zA-Z0-9_]{1,32}", value in proptest::collection::vec(any::<u8>(), 0..64)) {
            let store = LockFreeStore::new();
            store.put(&key, value.clone(), None).unwrap();
            prop_assert_eq!(store.get(&key).unwrap(), value);
        }

        /// P2: the later of two writes to the same key is what subsequent
        /// reads observe.
        #[test]
        fn p2_last_write_wins(key in "[a-zA-Z0-9_]{1,32}", v1 in proptest::collection::vec(any::<u8>(), 0..32), v2 in proptest::collection::vec(any::<u8>(), 0..32)) {
            let store = LockFreeStore::new();
            store.put(&key, v1, None).unwrap();
            store.put(&key, v2.clone(), None).unwrap();
            prop_assert_eq!(store.get(&key).unwrap(), v2);
        }

        /// P3: a delete makes a subsequent get report NotFound.
        #[test]
        fn p3_delete_then_not_found(key in "[a-zA-Z0-9_]{1,32}", value in proptest::collection::vec(any::<u8>(), 0..32)) {
            let store = LockFreeStore::new();
            store.put(&key, value, None).unwrap();
            store.delete(&key).unwrap();
            prop_assert!(matches!(store.get(&key), Err(MantisError::NotFound)));
        }

        /// P4: count equals puts minus deletes that actually hit an entry,
        /// for a sequence of distinct keys.
        #[test]
        fn p4_count_matches_puts_minus_hits(n in 1usize..20) {
            let store = LockFreeStore::new();
            for i in 0..n {
                store.put(&format!("k{i}"), vec![0], None).unwrap();
            }
            let deletes_that_hit = n / 2;
            for i in 0..deletes_that_hit {
                prop_assert!(store.delete(&format!("k{i}")).unwrap());
            }
            prop_assert_eq!(store.len(), n - deletes_that_hit);
        }

        /// P9: every key produced by scan_prefix(p) actually has that prefix.
        #[test]
        fn p9_scan_prefix_soundness(suffixes in proptest::collection::vec("[a-z]{1,8}", 0..20)) {
            let store = LockFreeStore::new();
            for (i, s) in suffixes.iter().enumerate() {
                store.put(&format!("pre:{s}:{i}"), vec![0], None).unwrap();
            }
            for (key, _) in store.scan_prefix("pre:", None) {
                prop_assert!(key.starts_with("pre:"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trip() {
        let store = LockFreeStore::new();
        store.put("k", b"v".to_vec(), None).unwrap();
        assert_eq!(store.get("k").unwrap(), b"v");
    }

    #[test]
    fn delete_then_get_not_found() {
        let store = LockFreeStore::new();
        store.put("k", b"v".to_vec(), None).unwrap();
        assert!(store.delete("k").unwrap());
        assert!(matches!(store.get("k"), Err(MantisError::NotFound)));
    }

    #[test]
    fn delete_absent_reports_false() {
        let store = LockFreeStore::new();
        assert!(!store.delete("missing").unwrap());
    }

    #[test]
    fn empty_key_is_invalid() {
        let store = LockFreeStore::new();
        assert!(matches!(store.put("", vec![], None), Err(MantisError::KeyInvalid(_))));
    }

    #[test]
    fn oversized_value_is_rejected() {
        let store = LockFreeStore::new();
        let huge = vec![0u8; MAX_VALUE_BYTES + 1];
        assert!(matches!(
            store.put("k", huge, None),
            Err(MantisError::ValueTooLarge { .. })
        ));
    }

    #[test]
    fn ttl_expiry_hides_entry() {
        let store = LockFreeStore::new();
        store
            .put("t", b"x".to_vec(), Some(Duration::from_millis(20)))
            .unwrap();
        assert!(store.get("t").is_ok());
        std::thread::sleep(Duration::from_millis(40));
        assert!(matches!(store.get("t"), Err(MantisError::NotFound)));
    }

    #[test]
    fn second_write_wins_and_preserves_created_at() {
        let store = LockFreeStore::new();
        store.put("k", b"v1".to_vec(), None).unwrap();
        let created_first = store.data.get("k").unwrap().value().created_at;
        store.put("k", b"v2".to_vec(), None).unwrap();
        assert_eq!(store.get("k").unwrap(), b"v2");
        let created_second = store.data.get("k").unwrap().value().created_at;
        assert_eq!(created_first, created_second);
    }

    #[test]
    fn scan_prefix_is_ordered_and_prefix_scoped() {
        let store = LockFreeStore::new();
        store.put("doc:a:1", b"1".to_vec(), None).unwrap();
        store.put("doc:a:2", b"2".to_vec(), None).unwrap();
        store.put("doc:b:1", b"3".to_vec(), None).unwrap();
        let results = store.scan_prefix("doc:a:", None);
        assert_eq!(
            results,
            vec![
                ("doc:a:1".to_string(), b"1".to_vec()),
                ("doc:a:2".to_string(), b"2".to_vec()),
            ]
        );
    }

    #[test]
    fn scan_prefix_respects_limit() {
        let store = LockFreeStore::new();
        for i in 0..5 {
            store.put(&format!("p:{i}"), vec![0], None).unwrap();
        }
        assert_eq!(store.scan_prefix("p:", Some(2)).len(), 2);
    }

    #[test]
    fn batch_put_reports_per_item_outcomes() {
        let store = LockFreeStore::new();
        let outcomes = store.batch_put(vec![
            ("a".to_string(), b"1".to_vec(), None),
            ("".to_string(), b"2".to_vec(), None),
            ("b".to_string(), b"3".to_vec(), None),
        ]);
        assert!(matches!(outcomes[0], PutOutcome::Ok));
        assert!(matches!(outcomes[1], PutOutcome::Err(MantisError::KeyInvalid(_))));
        assert!(matches!(outcomes[2], PutOutcome::Ok));
        assert_eq!(store.get("a").unwrap(), b"1");
        assert_eq!(store.get("b").unwrap(), b"3");
    }

    #[test]
    fn stats_reflect_hits_and_misses() {
        let store = LockFreeStore::new();
        store.put("k", b"v".to_vec(), None).unwrap();
        store.get("k").unwrap();
        let _ = store.get("missing");
        let stats = store.stats();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn concurrent_puts_all_land() {
        let store = LockFreeStore::new();
        std::thread::scope(|scope| {
            for t in 0..8 {
                let store = store.clone();
                scope.spawn(move || {
                    for i in 0..200 {
                        let key = format!("k_{t}_{i}");
                        store.put(&key, vec![t as u8], None).unwrap();
                    }
                });
            }
        });
        assert_eq!(store.len(), 1600);
    }
}
