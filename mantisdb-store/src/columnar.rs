//! Columnar view: logical `(table, rowid) -> row` with a declared schema
//! (§4.3 "Columnar view").
//!
//! Each column of each row is stored under its own namespaced key,
//! `col:<table>:<rowid>:<col>` (§3), so the storage substrate genuinely
//! holds data column-by-column rather than as one opaque row blob.
//! Collection into rows happens at the façade layer by grouping a
//! `scan_prefix` over the table's key space by rowid.

use dashmap::DashMap;
use mantisdb_core::error::{MantisError, MantisResult};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::processing::{DocumentFilter, DocumentPaginator, DocumentSorter};
use crate::types::{ColumnDef, RowQuery, RowQueryResult, TableDescription, TableSchema};
use crate::MultiModelStore;

fn table_prefix(table: &str) -> String {
    format!("col:{table}:")
}

fn row_key(table: &str, rowid: &str, column: &str) -> String {
    format!("col:{table}:{rowid}:{column}")
}

pub(crate) struct TableState {
    pub(crate) schema: TableSchema,
    next_rowid: AtomicU64,
    row_count: AtomicUsize,
    /// Serialized primary-key tuple -> rowid, for O(1) uniqueness checks.
    pk_index: DashMap<String, String>,
    /// Serializes insert/update so the uniqueness check-then-write pair is
    /// atomic without requiring a CAS over the whole row (§4.3 "Primary-key
    /// columns... unique constraint enforced on insert/update").
    write_lock: Mutex<()>,
}

impl TableState {
    fn new(schema: TableSchema) -> Self {
        TableState {
            schema,
            next_rowid: AtomicU64::new(0),
            row_count: AtomicUsize::new(0),
            pk_index: DashMap::new(),
            write_lock: Mutex::new(()),
        }
    }

    fn pk_value(&self, row: &serde_json::Map<String, Value>) -> String {
        let parts: Vec<String> = self
            .schema
            .primary_key_columns()
            .map(|c| row.get(&c.name).cloned().unwrap_or(Value::Null).to_string())
            .collect();
        parts.join("\u{1}")
    }
}

fn parse_row_key<'a>(key: &'a str, table: &str) -> Option<(&'a str, &'a str)> {
    let prefix = table_prefix(table);
    let rest = key.strip_prefix(prefix.as_str())?;
    let mut parts = rest.splitn(2, ':');
    let rowid = parts.next()?;
    let column = parts.next()?;
    Some((rowid, column))
}

/// Validate and fill in defaults/nulls for one input row against `schema`.
/// Returns `SchemaViolation` if a non-nullable column without a default is
/// missing.
fn materialize_row(
    schema: &TableSchema,
    input: &serde_json::Map<String, Value>,
) -> MantisResult<serde_json::Map<String, Value>> {
    let mut row = serde_json::Map::new();
    for column in &schema.columns {
        let value = match input.get(&column.name) {
            Some(v) if !v.is_null() => v.clone(),
            _ => {
                if column.primary_key {
                    return Err(MantisError::SchemaViolation(format!(
                        "primary key column '{}' must be non-null",
                        column.name
                    )));
                }
                match &column.default {
                    Some(default) => default.clone(),
                    None if column.nullable => Value::Null,
                    None => {
                        return Err(MantisError::SchemaViolation(format!(
                            "column '{}' is non-nullable and has no default",
                            column.name
                        )));
                    }
                }
            }
        };
        row.insert(column.name.clone(), value);
    }
    Ok(row)
}

impl MultiModelStore {
    pub fn create_table(&self, name: &str, columns: Vec<ColumnDef>) -> MantisResult<()> {
        if self.tables.contains_key(name) {
            return Err(MantisError::AlreadyExists);
        }
        let schema = TableSchema {
            name: name.to_string(),
            columns,
        };
        self.tables.insert(name.to_string(), TableState::new(schema));
        Ok(())
    }

    pub fn drop_table(&self, name: &str) -> MantisResult<()> {
        let Some((_, _state)) = self.tables.remove(name) else {
            return Err(MantisError::NotFound);
        };
        let keys: Vec<String> = self
            .storage
            .scan_prefix(&table_prefix(name), None)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        for key in keys {
            self.storage.delete(&key)?;
            self.cache.invalidate(&key);
        }
        Ok(())
    }

    pub fn describe_table(&self, name: &str) -> MantisResult<TableDescription> {
        let state = self.tables.get(name).ok_or(MantisError::NotFound)?;
        Ok(TableDescription {
            schema: state.schema.clone(),
            row_count: state.row_count.load(Ordering::Relaxed),
        })
    }

    pub fn list_tables(&self) -> Vec<String> {
        self.tables.iter().map(|e| e.key().clone()).collect()
    }

    /// Insert rows. Per-row atomicity, not whole-batch (§4.3, §9 Open
    /// Question 3): each row either lands or is rejected independently, and
    /// a rejected row does not undo prior rows in the same call (§8
    /// scenario 5 — "first row present, second rejected").
    pub fn insert(&self, table: &str, rows: Vec<Value>) -> MantisResult<Vec<MantisResult<()>>> {
        let state = self.tables.get(table).ok_or(MantisError::NotFound)?;
        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            outcomes.push(self.insert_one(table, &state, row));
        }
        Ok(outcomes)
    }

    fn insert_one(&self, table: &str, state: &TableState, row: Value) -> MantisResult<()> {
        let Value::Object(input) = row else {
            return Err(MantisError::SchemaViolation("row must be a JSON object".to_string()));
        };
        let materialized = materialize_row(&state.schema, &input)?;

        let _guard = state.write_lock.lock();
        let pk = state.pk_value(&materialized);
        if state.pk_index.contains_key(&pk) {
            return Err(MantisError::UniqueViolation(format!(
                "primary key conflict in table '{table}'"
            )));
        }

        let rowid = format!("{:020}", state.next_rowid.fetch_add(1, Ordering::Relaxed));
        for (column, value) in &materialized {
            let bytes = serde_json::to_vec(value)
                .map_err(|e| MantisError::Internal(format!("column serialization failed: {e}")))?;
            self.storage.put(&row_key(table, &rowid, column), bytes, None)?;
        }
        state.pk_index.insert(pk, rowid);
        state.row_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn list_rows(&self, table: &str) -> Vec<(String, serde_json::Map<String, Value>)> {
        let mut rows: BTreeMap<String, serde_json::Map<String, Value>> = BTreeMap::new();
        for (key, bytes) in self.storage.scan_prefix(&table_prefix(table), None) {
            let Some((rowid, column)) = parse_row_key(&key, table) else {
                continue;
            };
            let Ok(value) = serde_json::from_slice::<Value>(&bytes) else {
                continue;
            };
            rows.entry(rowid.to_string()).or_default().insert(column.to_string(), value);
        }
        rows.into_iter().collect()
    }

    fn row_as_value(row: &serde_json::Map<String, Value>) -> Value {
        Value::Object(row.clone())
    }

    pub fn update(&self, table: &str, r#where: &Value, set: &Value) -> MantisResult<usize> {
        let state = self.tables.get(table).ok_or(MantisError::NotFound)?;
        let Value::Object(set_fields) = set else {
            return Err(MantisError::SchemaViolation("set must be a JSON object".to_string()));
        };

        let _guard = state.write_lock.lock();
        let matching: Vec<(String, serde_json::Map<String, Value>)> = self
            .list_rows(table)
            .into_iter()
            .filter(|(_, row)| DocumentFilter::matches_filter(&Self::row_as_value(row), r#where))
            .collect();

        // Validate the whole update atomically: compute every new pk tuple
        // up front and reject the call before mutating anything if any
        // would conflict (no partial-update scenario is specified, unlike
        // insert's per-row contract).
        let mut new_pks = Vec::with_capacity(matching.len());
        for (rowid, row) in &matching {
            let mut updated = row.clone();
            for (k, v) in set_fields {
                updated.insert(k.clone(), v.clone());
            }
            let new_pk = state.pk_value(&updated);
            if let Some(holder) = state.pk_index.get(&new_pk) {
                if *holder != *rowid {
                    return Err(MantisError::UniqueViolation(format!(
                        "update would duplicate primary key in table '{table}'"
                    )));
                }
            }
            new_pks.push((rowid.clone(), row.clone(), updated, new_pk));
        }

        for (rowid, old_row, updated, new_pk) in &new_pks {
            let old_pk = state.pk_value(old_row);
            if *new_pk != old_pk {
                state.pk_index.remove(&old_pk);
                state.pk_index.insert(new_pk.clone(), rowid.clone());
            }
            for (column, value) in updated {
                let bytes = serde_json::to_vec(value)
                    .map_err(|e| MantisError::Internal(format!("column serialization failed: {e}")))?;
                self.storage.put(&row_key(table, rowid, column), bytes, None)?;
                self.cache.invalidate(&row_key(table, rowid, column));
            }
        }
        Ok(new_pks.len())
    }

    pub fn delete_rows(&self, table: &str, r#where: &Value) -> MantisResult<usize> {
        let state = self.tables.get(table).ok_or(MantisError::NotFound)?;
        let _guard = state.write_lock.lock();
        let matching = self.list_rows(table);
        let mut deleted = 0usize;
        for (rowid, row) in matching {
            if !DocumentFilter::matches_filter(&Self::row_as_value(&row), r#where) {
                continue;
            }
            for column in row.keys() {
                let key = row_key(table, &rowid, column);
                self.storage.delete(&key)?;
                self.cache.invalidate(&key);
            }
            state.pk_index.remove(&state.pk_value(&row));
            deleted += 1;
        }
        state.row_count.fetch_sub(deleted, Ordering::Relaxed);
        Ok(deleted)
    }

    pub fn columnar_query(&self, table: &str, query: &RowQuery) -> MantisResult<RowQueryResult> {
        if !self.tables.contains_key(table) {
            return Err(MantisError::NotFound);
        }
        let mut rows: Vec<Value> = self
            .list_rows(table)
            .into_iter()
            .map(|(_, row)| Self::row_as_value(&row))
            .collect();

        if let Some(filter) = &query.r#where {
            rows = DocumentFilter::filter_documents(rows, filter);
        }
        let total = rows.len();

        if let Some(order_by) = &query.order_by {
            DocumentSorter::sort_documents(&mut rows, order_by);
        }

        let mut rows = DocumentPaginator::paginate_documents(rows, query.offset, query.limit);

        if let Some(select) = &query.select {
            rows = rows
                .into_iter()
                .map(|row| {
                    let Value::Object(obj) = row else { return row };
                    let mut projected = serde_json::Map::new();
                    for col in select {
                        if let Some(v) = obj.get(col) {
                            projected.insert(col.clone(), v.clone());
                        }
                    }
                    Value::Object(projected)
                })
                .collect();
        }

        Ok(RowQueryResult { rows, total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColumnType;
    use crate::MultiModelStore;
    use serde_json::json;

    fn int_col(name: &str, pk: bool) -> ColumnDef {
        ColumnDef {
            name: name.to_string(),
            ty: ColumnType::Int,
            nullable: !pk,
            primary_key: pk,
            default: None,
        }
    }

    #[test]
    fn create_table_rejects_duplicate_name() {
        let store = MultiModelStore::new(1024 * 1024, None);
        store.create_table("t", vec![int_col("id", true)]).unwrap();
        assert!(matches!(store.create_table("t", vec![]), Err(MantisError::AlreadyExists)));
    }

    #[test]
    fn drop_absent_table_is_not_found() {
        let store = MultiModelStore::new(1024 * 1024, None);
        assert!(matches!(store.drop_table("missing"), Err(MantisError::NotFound)));
    }

    /// Scenario 5 (§8): insert([{id:1},{id:1}]) -> UniqueViolation on the
    /// second row; first row remains present.
    #[test]
    fn scenario_columnar_uniqueness() {
        let store = MultiModelStore::new(1024 * 1024, None);
        store.create_table("u", vec![int_col("id", true)]).unwrap();
        let outcomes = store.insert("u", vec![json!({"id": 1}), json!({"id": 1})]).unwrap();
        assert!(outcomes[0].is_ok());
        assert!(matches!(outcomes[1], Err(MantisError::UniqueViolation(_))));

        let result = store.columnar_query("u", &RowQuery::default()).unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0]["id"], json!(1));
    }

    #[test]
    fn insert_missing_non_nullable_column_is_schema_violation() {
        let store = MultiModelStore::new(1024 * 1024, None);
        store
            .create_table(
                "t",
                vec![
                    int_col("id", true),
                    ColumnDef {
                        name: "name".to_string(),
                        ty: ColumnType::Text,
                        nullable: false,
                        primary_key: false,
                        default: None,
                    },
                ],
            )
            .unwrap();
        let outcomes = store.insert("t", vec![json!({"id": 1})]).unwrap();
        assert!(matches!(outcomes[0], Err(MantisError::SchemaViolation(_))));
    }

    #[test]
    fn update_and_delete_rows() {
        let store = MultiModelStore::new(1024 * 1024, None);
        store.create_table("t", vec![int_col("id", true)]).unwrap();
        store.insert("t", vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})]).unwrap();

        let updated = store.update("t", &json!({"id": 2}), &json!({"id": 20})).unwrap();
        assert_eq!(updated, 1);

        let deleted = store.delete_rows("t", &json!({"id": 1})).unwrap();
        assert_eq!(deleted, 1);

        let remaining = store.columnar_query("t", &RowQuery::default()).unwrap();
        let mut ids: Vec<i64> = remaining.rows.iter().map(|r| r["id"].as_i64().unwrap()).collect();
        ids.sort();
        assert_eq!(ids, vec![3, 20]);
    }

    #[test]
    fn query_select_projects_columns() {
        let store = MultiModelStore::new(1024 * 1024, None);
        store
            .create_table("t", vec![int_col("id", true), {
                let mut c = int_col("extra", false);
                c.ty = ColumnType::Text;
                c.default = Some(json!("x"));
                c
            }])
            .unwrap();
        store.insert("t", vec![json!({"id": 1})]).unwrap();
        let result = store
            .columnar_query(
                "t",
                &RowQuery {
                    select: Some(vec!["id".to_string()]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(result.rows[0], json!({"id": 1}));
    }
}
