//! Shared request/response/schema types for the document, columnar, and
//! query views (§4.3).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// MongoDB-style document query request: filter, optional projection,
/// sort, and pagination (§4.3 "Document view").
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DocumentQuery {
    pub filter: Option<Value>,
    pub projection: Option<Value>,
    pub sort: Option<Value>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl DocumentQuery {
    pub fn with_filter(filter: Value) -> Self {
        DocumentQuery {
            filter: Some(filter),
            ..Default::default()
        }
    }
}

/// Result of a [`DocumentQuery`] (§6 `POST /documents/:collection/query`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentQueryResult {
    pub documents: Vec<Value>,
    pub count: usize,
    pub total: usize,
    pub duration: Duration,
}

/// One stage of an aggregation pipeline (§4.3 "aggregate"). Stages execute
/// in order; the closed set matches the spec exactly — no stage beyond
/// these is recognized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateStage {
    Match(Value),
    Project(Value),
    Group(GroupStage),
    Sort(Value),
    Limit(usize),
    Skip(usize),
    Unwind(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupStage {
    /// Field name to group by, or `null` to group everything into one bucket.
    #[serde(rename = "_id")]
    pub id_field: Option<String>,
    /// Accumulator expressions, e.g. `{"total": {"$sum": "count"}}`.
    #[serde(flatten)]
    pub accumulators: serde_json::Map<String, Value>,
}

/// Column data type (§3 "Columnar table metadata").
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Int,
    Float,
    Text,
    Bool,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn primary_key_columns(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter().filter(|c| c.primary_key)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Description returned by `describe(name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDescription {
    pub schema: TableSchema,
    pub row_count: usize,
}

/// Selection for a columnar `query` (§4.3 "Columnar view").
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RowQuery {
    pub select: Option<Vec<String>>,
    pub r#where: Option<Value>,
    pub order_by: Option<Value>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowQueryResult {
    pub rows: Vec<Value>,
    pub total: usize,
}

/// Result of the SQL-level `Query` view (§4.3 "Query view (SQL)").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlQueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    pub duration_ms: f64,
}

/// Approximate collection metadata (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub name: String,
    pub count: usize,
    pub approx_size: usize,
}
