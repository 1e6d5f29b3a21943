//! Document view: logical `(collection, id) -> JSON object` (§4.3).
//!
//! Documents are stored whole, as a single JSON blob, under the namespaced
//! key `doc:<collection>:<id>` (§3). Collections are auto-vivified on first
//! write — there is no explicit `create_collection`, matching the lifecycle
//! note in §3 ("entries are created by the first write").

use dashmap::DashMap;
use mantisdb_core::error::{MantisError, MantisResult};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::processing::{DocumentFilter, DocumentPaginator, DocumentSorter};
use crate::types::{CollectionInfo, DocumentQuery, DocumentQueryResult};
use crate::MultiModelStore;

fn doc_key(collection: &str, id: &str) -> String {
    format!("doc:{collection}:{id}")
}

fn doc_prefix(collection: &str) -> String {
    format!("doc:{collection}:")
}

/// A single-field index over a collection. Maintained incrementally on
/// every write after creation, back-filled from existing data at creation
/// time (§4.3 "create_index").
pub(crate) struct DocumentIndex {
    pub unique: bool,
    /// Serialized field value -> set of document ids holding that value.
    entries: DashMap<String, Vec<String>>,
}

impl DocumentIndex {
    fn new(unique: bool) -> Self {
        DocumentIndex {
            unique,
            entries: DashMap::new(),
        }
    }

    fn record(&self, value: &Value, id: &str) {
        let key = value.to_string();
        self.entries.entry(key).or_default().push(id.to_string());
    }

    fn remove(&self, value: &Value, id: &str) {
        let key = value.to_string();
        if let Some(mut ids) = self.entries.get_mut(&key) {
            ids.retain(|existing| existing != id);
        }
    }

    fn conflicts_with(&self, value: &Value, id: &str) -> bool {
        if !self.unique {
            return false;
        }
        self.entries
            .get(&value.to_string())
            .map(|ids| ids.iter().any(|existing| existing != id))
            .unwrap_or(false)
    }
}

#[derive(Default)]
pub(crate) struct CollectionState {
    pub(crate) indexes: DashMap<String, Arc<DocumentIndex>>,
    count: AtomicUsize,
    approx_size: AtomicUsize,
}

fn field_value(document: &Value, field: &str) -> Value {
    DocumentFilter::get_nested_field(document, field)
}

impl MultiModelStore {
    fn collection_state(&self, collection: &str) -> Arc<CollectionState> {
        Arc::clone(
            &self
                .collections
                .entry(collection.to_string())
                .or_insert_with(|| Arc::new(CollectionState::default())),
        )
    }

    /// Insert or replace a document. Write-through: the store is updated
    /// first, then the cache is populated with the fresh value — it never
    /// retains a stale prior value after this returns successfully (§4.3
    /// "Write path").
    pub fn document_put(&self, collection: &str, id: &str, document: Value) -> MantisResult<()> {
        if !document.is_object() {
            return Err(MantisError::SchemaViolation(
                "document must be a JSON object".to_string(),
            ));
        }

        let state = self.collection_state(collection);
        let key = doc_key(collection, id);
        let previous = self.storage.get(&key).ok().and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok());

        // Validate unique indexes before writing anything.
        for entry in state.indexes.iter() {
            let field = entry.key();
            let index = entry.value();
            let new_value = field_value(&document, field);
            if index.conflicts_with(&new_value, id) {
                return Err(MantisError::UniqueViolation(format!(
                    "field '{field}' already has value {new_value} in collection '{collection}'"
                )));
            }
        }

        let bytes = serde_json::to_vec(&document)
            .map_err(|e| MantisError::Internal(format!("document serialization failed: {e}")))?;
        let byte_len = bytes.len();
        self.storage.put(&key, bytes.clone(), None)?;
        if self.cache.put(&key, bytes, self.default_ttl).is_err() {
            tracing::warn!(key = %key, "cache bypass: write-through population failed");
        }

        for entry in state.indexes.iter() {
            let field = entry.key();
            let index = entry.value();
            if let Some(prev) = &previous {
                index.remove(&field_value(prev, field), id);
            }
            index.record(&field_value(&document, field), id);
        }

        if previous.is_none() {
            state.count.fetch_add(1, Ordering::Relaxed);
        }
        state.approx_size.store(byte_len, Ordering::Relaxed);
        Ok(())
    }

    /// Cache-aside read: check the cache first, fall through to the store
    /// on miss, and repopulate the cache with the store's TTL bounded by
    /// `default_ttl` (§4.3 "Read path").
    pub fn document_get(&self, collection: &str, id: &str) -> MantisResult<Value> {
        let key = doc_key(collection, id);
        let bytes = match self.cache.get(&key) {
            Ok(bytes) => bytes,
            Err(_) => {
                let bytes = self.storage.get(&key)?;
                if self.cache.put(&key, bytes.clone(), self.default_ttl).is_err() {
                    tracing::warn!(key = %key, "cache bypass: populate-on-miss failed");
                }
                bytes
            }
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| MantisError::Internal(format!("stored document is not valid JSON: {e}")))
    }

    pub fn document_delete(&self, collection: &str, id: &str) -> MantisResult<bool> {
        let key = doc_key(collection, id);
        let previous = self.storage.get(&key).ok().and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok());
        let existed = self.storage.delete(&key)?;
        self.cache.invalidate(&key);

        if existed {
            if let Some(state) = self.collections.get(collection) {
                if let Some(prev) = &previous {
                    for entry in state.indexes.iter() {
                        entry.value().remove(&field_value(prev, entry.key()), id);
                    }
                }
                state.count.fetch_sub(1, Ordering::Relaxed);
            }
        }
        Ok(existed)
    }

    /// Create a field index, back-filling it from existing documents
    /// (§4.3 "create_index"). Fails with `UniqueViolation` if a unique
    /// index can't be back-filled without conflict.
    pub fn document_create_index(&self, collection: &str, field: &str, unique: bool) -> MantisResult<()> {
        let state = self.collection_state(collection);
        let index = Arc::new(DocumentIndex::new(unique));

        for (key, bytes) in self.storage.scan_prefix(&doc_prefix(collection), None) {
            let id = key.rsplit(':').next().unwrap_or_default().to_string();
            let document: Value = serde_json::from_slice(&bytes)
                .map_err(|e| MantisError::Internal(format!("corrupt document at {key}: {e}")))?;
            let value = field_value(&document, field);
            if index.conflicts_with(&value, &id) {
                return Err(MantisError::UniqueViolation(format!(
                    "cannot create unique index on '{field}': duplicate value {value}"
                )));
            }
            index.record(&value, &id);
        }

        state.indexes.insert(field.to_string(), index);
        Ok(())
    }

    /// Filtered, sorted, paginated document query (§4.3 "query"). Full scan
    /// of the collection — correctness over index-accelerated lookups,
    /// matching the scope of this engine's query layer (§1 Non-goals: the
    /// SQL optimizer itself is an external collaborator).
    pub fn document_query(&self, collection: &str, query: &DocumentQuery) -> MantisResult<DocumentQueryResult> {
        let start = Instant::now();
        let mut documents: Vec<Value> = self
            .storage
            .scan_prefix(&doc_prefix(collection), None)
            .into_iter()
            .filter_map(|(_, bytes)| serde_json::from_slice::<Value>(&bytes).ok())
            .collect();

        if let Some(filter) = &query.filter {
            documents = DocumentFilter::filter_documents(documents, filter);
        }
        let total = documents.len();

        if let Some(sort) = &query.sort {
            DocumentSorter::sort_documents(&mut documents, sort);
        }

        let mut documents = DocumentPaginator::paginate_documents(documents, query.offset, query.limit);

        if let Some(projection) = &query.projection {
            documents = documents.into_iter().map(|d| apply_projection(&d, projection)).collect();
        }

        Ok(DocumentQueryResult {
            count: documents.len(),
            documents,
            total,
            duration: start.elapsed(),
        })
    }

    pub fn collection_info(&self, collection: &str) -> Option<CollectionInfo> {
        self.collections.get(collection).map(|state| CollectionInfo {
            name: collection.to_string(),
            count: state.count.load(Ordering::Relaxed),
            approx_size: state.approx_size.load(Ordering::Relaxed),
        })
    }
}

/// Keep only the fields named with a truthy value in `projection` (an
/// inclusion-only MongoDB-style projection spec, e.g. `{"name": 1}`).
fn apply_projection(document: &Value, projection: &Value) -> Value {
    let Value::Object(spec) = projection else {
        return document.clone();
    };
    let Value::Object(source) = document else {
        return document.clone();
    };
    let mut out = serde_json::Map::new();
    for (field, include) in spec {
        let wanted = match include {
            Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
            Value::Bool(b) => *b,
            _ => false,
        };
        if wanted {
            if let Some(value) = source.get(field) {
                out.insert(field.clone(), value.clone());
            }
        }
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MultiModelStore;
    use serde_json::json;

    fn store() -> MultiModelStore {
        MultiModelStore::new(1024 * 1024, None)
    }

    #[test]
    fn put_then_get_round_trip() {
        let store = store();
        store.document_put("users", "1", json!({"name": "Alice"})).unwrap();
        assert_eq!(store.document_get("users", "1").unwrap(), json!({"name": "Alice"}));
    }

    #[test]
    fn delete_then_not_found() {
        let store = store();
        store.document_put("users", "1", json!({"name": "Alice"})).unwrap();
        assert!(store.document_delete("users", "1").unwrap());
        assert!(matches!(store.document_get("users", "1"), Err(MantisError::NotFound)));
    }

    /// Scenario 4 (§8): ages 17/25/40, `$gt: 18` returns ids 2 and 3.
    #[test]
    fn scenario_document_query_gt_filter() {
        let store = store();
        store.document_put("people", "1", json!({"id": 1, "age": 17})).unwrap();
        store.document_put("people", "2", json!({"id": 2, "age": 25})).unwrap();
        store.document_put("people", "3", json!({"id": 3, "age": 40})).unwrap();

        let result = store
            .document_query("people", &DocumentQuery::with_filter(json!({"age": {"$gt": 18}})))
            .unwrap();
        let mut ids: Vec<i64> = result.documents.iter().map(|d| d["id"].as_i64().unwrap()).collect();
        ids.sort();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(result.total, 2);

        let limited = store
            .document_query(
                "people",
                &DocumentQuery {
                    filter: Some(json!({"age": {"$gt": 18}})),
                    limit: Some(1),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(limited.documents.len(), 1);
        assert_eq!(limited.total, 2);
    }

    #[test]
    fn unique_index_rejects_duplicate_on_write() {
        let store = store();
        store.document_put("users", "1", json!({"email": "a@x.com"})).unwrap();
        store.document_create_index("users", "email", true).unwrap();
        let result = store.document_put("users", "2", json!({"email": "a@x.com"}));
        assert!(matches!(result, Err(MantisError::UniqueViolation(_))));
    }

    #[test]
    fn create_index_backfill_detects_existing_conflict() {
        let store = store();
        store.document_put("users", "1", json!({"email": "a@x.com"})).unwrap();
        store.document_put("users", "2", json!({"email": "a@x.com"})).unwrap();
        let result = store.document_create_index("users", "email", true);
        assert!(matches!(result, Err(MantisError::UniqueViolation(_))));
    }

    #[test]
    fn cache_write_through_never_serves_stale_value() {
        let store = store();
        store.document_put("users", "1", json!({"v": 1})).unwrap();
        assert_eq!(store.document_get("users", "1").unwrap(), json!({"v": 1}));
        store.document_put("users", "1", json!({"v": 2})).unwrap();
        assert_eq!(store.document_get("users", "1").unwrap(), json!({"v": 2}));
    }

    #[test]
    fn projection_keeps_only_requested_fields() {
        let store = store();
        store
            .document_put("users", "1", json!({"name": "Alice", "age": 30, "secret": "x"}))
            .unwrap();
        let result = store
            .document_query(
                "users",
                &DocumentQuery {
                    projection: Some(json!({"name": 1})),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(result.documents[0], json!({"name": "Alice"}));
    }
}
