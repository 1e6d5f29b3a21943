//! Multi-model façade over the lock-free storage substrate (§4.3).
//!
//! `MultiModelStore` wires a [`mantisdb_storage::LockFreeStore`] and a
//! [`mantisdb_cache::Cache`] together behind four views sharing one
//! namespaced key space (§3): KV (`kv:`), Document (`doc:`), Columnar
//! (`col:`) and a read-only SQL-style Query view over the other three.
//! Every view follows the same cache-coherency protocol (§4.3 "Read path" /
//! "Write path"): cache-aside reads, write-through writes, invalidate-on-
//! delete.

pub mod aggregate;
mod columnar;
mod document;
mod kv;
pub mod processing;
pub mod query;
pub mod types;

use dashmap::DashMap;
use mantisdb_cache::Cache;
use mantisdb_storage::LockFreeStore;
use std::sync::Arc;
use std::time::Duration;

use document::CollectionState;
use columnar::TableState;

pub use types::{
    AggregateStage, CollectionInfo, ColumnDef, ColumnType, DocumentQuery, DocumentQueryResult,
    GroupStage, RowQuery, RowQueryResult, SqlQueryResult, TableDescription, TableSchema,
};

pub struct MultiModelStore {
    storage: LockFreeStore,
    cache: Cache,
    collections: DashMap<String, Arc<CollectionState>>,
    tables: DashMap<String, TableState>,
    default_ttl: Option<Duration>,
}

impl MultiModelStore {
    /// `cache_max_bytes` bounds the cache shared by all four views;
    /// `cache_default_ttl` is the TTL applied to cache entries populated by
    /// a read or write that did not specify its own TTL (§4.3 "Cache").
    pub fn new(cache_max_bytes: u64, cache_default_ttl: Option<Duration>) -> Self {
        MultiModelStore {
            storage: LockFreeStore::new(),
            cache: Cache::new(cache_max_bytes, cache_default_ttl),
            collections: DashMap::new(),
            tables: DashMap::new(),
            default_ttl: cache_default_ttl,
        }
    }

    pub fn storage_stats(&self) -> mantisdb_storage::StoreStats {
        self.storage.stats()
    }

    pub fn cache_stats(&self) -> mantisdb_cache::CacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_store_starts_empty() {
        let store = MultiModelStore::new(1024 * 1024, None);
        assert_eq!(store.storage_stats().count, 0);
        assert_eq!(store.cache_stats().count, 0);
    }
}
