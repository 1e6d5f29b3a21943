//! KV view: the thinnest façade over the storage substrate (§4.3 "KV
//! view"), namespaced under `kv:<key>` (§3).

use mantisdb_core::error::{MantisError, MantisResult};
use mantisdb_storage::PutOutcome;
use std::time::Duration;

use crate::MultiModelStore;

fn kv_key(key: &str) -> String {
    format!("kv:{key}")
}

impl MultiModelStore {
    /// Cache-aside read (§4.3 "Read path"): cache first, store on miss,
    /// repopulate the cache bounded by `default_ttl`.
    pub fn get(&self, key: &str) -> MantisResult<Vec<u8>> {
        let namespaced = kv_key(key);
        match self.cache.get(&namespaced) {
            Ok(value) => Ok(value),
            Err(_) => {
                let value = self.storage.get(&namespaced)?;
                if self.cache.put(&namespaced, value.clone(), self.default_ttl).is_err() {
                    tracing::warn!(key = %key, "cache bypass: populate-on-miss failed");
                }
                Ok(value)
            }
        }
    }

    /// Write-through (§4.3 "Write path"): store first, then cache — the
    /// cache never retains the pre-write value after this returns `Ok`.
    pub fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> MantisResult<()> {
        let namespaced = kv_key(key);
        self.storage.put(&namespaced, value.clone(), ttl)?;
        if self.cache.put(&namespaced, value, ttl.or(self.default_ttl)).is_err() {
            tracing::warn!(key = %key, "cache bypass: write-through population failed");
        }
        Ok(())
    }

    pub fn delete(&self, key: &str) -> MantisResult<bool> {
        let namespaced = kv_key(key);
        let existed = self.storage.delete(&namespaced)?;
        self.cache.invalidate(&namespaced);
        Ok(existed)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.storage.exists(&kv_key(key))
    }

    /// Ordered scan of keys under `prefix`, without the `kv:` namespace
    /// prefix in the returned keys.
    pub fn scan(&self, prefix: &str, limit: Option<usize>) -> Vec<(String, Vec<u8>)> {
        self.storage
            .scan_prefix(&kv_key(prefix), limit)
            .into_iter()
            .map(|(k, v)| (k.trim_start_matches("kv:").to_string(), v))
            .collect()
    }

    /// Best-effort, per-item write-through (§4.3 "Batch path" — KV batches
    /// are not atomic as a whole).
    pub fn batch_set(&self, items: Vec<(String, Vec<u8>, Option<Duration>)>) -> Vec<MantisResult<()>> {
        let namespaced: Vec<(String, Vec<u8>, Option<Duration>)> = items
            .iter()
            .map(|(k, v, ttl)| (kv_key(k), v.clone(), *ttl))
            .collect();
        let outcomes = self.storage.batch_put(namespaced.clone());
        outcomes
            .into_iter()
            .zip(namespaced)
            .map(|(outcome, (key, value, ttl))| match outcome {
                PutOutcome::Ok => {
                    if self.cache.put(&key, value, ttl.or(self.default_ttl)).is_err() {
                        tracing::warn!(key = %key, "cache bypass: batch write-through failed");
                    }
                    Ok(())
                }
                PutOutcome::Err(e) => Err(e),
            })
            .collect()
    }

    /// Best-effort per-item reads (§4.3 "Batch path").
    pub fn batch_get(&self, keys: Vec<String>) -> Vec<MantisResult<Vec<u8>>> {
        keys.iter().map(|k| self.get(k)).collect()
    }
}
