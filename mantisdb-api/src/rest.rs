//! Route table and handlers for the REST boundary (§6 wire protocol).

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use mantisdb_core::{MantisConfig, MantisError};
use mantisdb_store::{AggregateStage, ColumnDef, DocumentQuery, MultiModelStore, RowQuery};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MultiModelStore>,
    pub config: MantisConfig,
    pub started_at: Instant,
}

/// Builds the full route table. A bearer-token guard runs in front of every
/// route when `security.admin_token` is configured; with no token configured
/// the boundary is open, matching the "if set" wording in the config table.
pub fn build_router(state: AppState) -> Router {
    let admin_token = state.config.security.admin_token.clone();

    let router = Router::new()
        .route("/api/health", get(health))
        .route("/api/stats", get(stats))
        .route("/api/query", post(sql_query))
        .route("/api/kv/:key", get(kv_get).put(kv_put).delete(kv_delete))
        .route("/api/kv/batch", post(kv_batch))
        .route(
            "/api/documents/:collection",
            post(document_create).get(document_list),
        )
        .route(
            "/api/documents/:collection/:id",
            get(document_get).put(document_put).delete(document_delete),
        )
        .route("/api/documents/:collection/query", post(document_query))
        .route(
            "/api/documents/:collection/aggregate",
            post(document_aggregate),
        )
        .route(
            "/api/columnar/tables",
            get(columnar_list_tables).post(columnar_create_table),
        )
        .route(
            "/api/columnar/tables/:name",
            get(columnar_describe_table).delete(columnar_drop_table),
        )
        .route("/api/columnar/tables/:name/rows", post(columnar_insert))
        .route("/api/columnar/tables/:name/query", post(columnar_query))
        .route("/api/columnar/tables/:name/delete", post(columnar_delete))
        .layer(CorsLayer::permissive())
        .with_state(state);

    match admin_token {
        Some(token) => router.layer(axum::middleware::from_fn(
            move |headers: HeaderMap, req, next: axum::middleware::Next| {
                let token = token.clone();
                async move { auth_guard(token, headers, req, next).await }
            },
        )),
        None => router,
    }
}

async fn auth_guard(
    token: String,
    headers: HeaderMap,
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(t) if t == token => next.run(req).await,
        _ => error_response(MantisError::KeyInvalid("missing or invalid bearer token".into())),
    }
}

fn error_response(err: MantisError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let code = match &err {
        MantisError::NotFound => "not_found",
        MantisError::AlreadyExists => "already_exists",
        MantisError::KeyInvalid(_) => "key_invalid",
        MantisError::SchemaViolation(_) => "schema_violation",
        MantisError::ValueTooLarge { .. } => "value_too_large",
        MantisError::UniqueViolation(_) => "unique_violation",
        MantisError::Cancelled => "cancelled",
        MantisError::Timeout => "timeout",
        MantisError::ResourceExhausted(_) => "resource_exhausted",
        MantisError::StorageError { .. } => "storage_error",
        MantisError::Internal(_) => "internal",
    };
    let body = json!({
        "error": {
            "code": code,
            "message": err.to_string(),
            "request_id": uuid::Uuid::new_v4().to_string(),
        }
    });
    (status, Json(body)).into_response()
}

fn ok_json<T: Serialize>(status: StatusCode, body: T) -> Response {
    (status, Json(body)).into_response()
}

fn result_response<T: Serialize>(result: Result<T, MantisError>) -> Response {
    match result {
        Ok(body) => ok_json(StatusCode::OK, body),
        Err(e) => {
            warn!(error = %e, "request failed");
            error_response(e)
        }
    }
}

// ---- health / stats / sql query --------------------------------------

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "database_stats": state.store.storage_stats(),
        "cache": state.store.cache_stats(),
        "memory": { "eviction_policy": state.config.memory.eviction_policy },
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "platform": std::env::consts::OS,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Deserialize)]
struct SqlQueryRequest {
    query: String,
    #[allow(dead_code)]
    query_type: Option<String>,
}

async fn sql_query(State(state): State<AppState>, Json(req): Json<SqlQueryRequest>) -> Response {
    result_response(state.store.sql_query(&req.query))
}

// ---- kv ----------------------------------------------------------------

async fn kv_get(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.store.get(&key) {
        Ok(value) => ok_json(StatusCode::OK, json!({ "value": value })),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct KvPutRequest {
    value: Vec<u8>,
    ttl: Option<u64>,
}

async fn kv_put(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(req): Json<KvPutRequest>,
) -> Response {
    let ttl = req.ttl.map(Duration::from_secs);
    result_response(
        state
            .store
            .set(&key, req.value, ttl)
            .map(|()| json!({ "ok": true })),
    )
}

async fn kv_delete(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.store.delete(&key) {
        Ok(existed) => ok_json(StatusCode::OK, json!({ "existed": existed })),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum KvBatchOp {
    Get { key: String },
    Set { key: String, value: Vec<u8>, ttl: Option<u64> },
    Delete { key: String },
}

#[derive(Deserialize)]
struct KvBatchRequest {
    ops: Vec<KvBatchOp>,
}

async fn kv_batch(State(state): State<AppState>, Json(req): Json<KvBatchRequest>) -> Response {
    let mut results = Vec::with_capacity(req.ops.len());
    for op in req.ops {
        let entry = match op {
            KvBatchOp::Get { key } => match state.store.get(&key) {
                Ok(value) => json!({ "ok": true, "value": value }),
                Err(e) => json!({ "ok": false, "error": e.to_string() }),
            },
            KvBatchOp::Set { key, value, ttl } => {
                match state.store.set(&key, value, ttl.map(Duration::from_secs)) {
                    Ok(()) => json!({ "ok": true }),
                    Err(e) => json!({ "ok": false, "error": e.to_string() }),
                }
            }
            KvBatchOp::Delete { key } => match state.store.delete(&key) {
                Ok(existed) => json!({ "ok": true, "existed": existed }),
                Err(e) => json!({ "ok": false, "error": e.to_string() }),
            },
        };
        results.push(entry);
    }
    ok_json(StatusCode::OK, json!({ "results": results }))
}

// ---- documents -----------------------------------------------------------

#[derive(Deserialize)]
struct DocumentCreateRequest {
    document: Value,
}

async fn document_create(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(req): Json<DocumentCreateRequest>,
) -> Response {
    let id = req
        .document
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    match state.store.document_put(&collection, &id, req.document) {
        Ok(()) => ok_json(StatusCode::CREATED, json!({ "id": id })),
        Err(e) => error_response(e),
    }
}

async fn document_get(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> Response {
    result_response(state.store.document_get(&collection, &id))
}

async fn document_put(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Json(document): Json<Value>,
) -> Response {
    result_response(
        state
            .store
            .document_put(&collection, &id, document)
            .map(|()| json!({ "ok": true })),
    )
}

async fn document_delete(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> Response {
    result_response(
        state
            .store
            .document_delete(&collection, &id)
            .map(|_| json!({ "ok": true })),
    )
}

async fn document_list(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mut query = DocumentQuery::default();
    query.limit = params.get("limit").and_then(|v| v.parse().ok());
    query.offset = params.get("offset").and_then(|v| v.parse().ok());
    result_response(state.store.document_query(&collection, &query))
}

async fn document_query(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(query): Json<DocumentQuery>,
) -> Response {
    result_response(state.store.document_query(&collection, &query))
}

#[derive(Deserialize)]
struct AggregateRequest {
    pipeline: Vec<AggregateStage>,
}

async fn document_aggregate(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(req): Json<AggregateRequest>,
) -> Response {
    result_response(
        state
            .store
            .document_aggregate(&collection, &req.pipeline)
            .map(|documents| json!({ "documents": documents })),
    )
}

// ---- columnar --------------------------------------------------------

async fn columnar_list_tables(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "tables": state.store.list_tables() }))
}

#[derive(Deserialize)]
struct CreateTableRequest {
    name: String,
    columns: Vec<ColumnDef>,
}

async fn columnar_create_table(
    State(state): State<AppState>,
    Json(req): Json<CreateTableRequest>,
) -> Response {
    match state.store.create_table(&req.name, req.columns) {
        Ok(()) => ok_json(StatusCode::CREATED, json!({ "ok": true })),
        Err(e) => error_response(e),
    }
}

async fn columnar_describe_table(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    result_response(state.store.describe_table(&name))
}

async fn columnar_drop_table(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    result_response(state.store.drop_table(&name).map(|()| json!({ "ok": true })))
}

#[derive(Deserialize)]
struct InsertRowsRequest {
    rows: Vec<Value>,
}

async fn columnar_insert(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<InsertRowsRequest>,
) -> Response {
    match state.store.insert(&name, req.rows) {
        Ok(per_row) => {
            let inserted = per_row.iter().filter(|r| r.is_ok()).count();
            ok_json(StatusCode::CREATED, json!({ "inserted": inserted }))
        }
        Err(e) => error_response(e),
    }
}

async fn columnar_query(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(query): Json<RowQuery>,
) -> Response {
    result_response(state.store.columnar_query(&name, &query))
}

#[derive(Deserialize)]
struct DeleteRowsRequest {
    r#where: Value,
}

async fn columnar_delete(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<DeleteRowsRequest>,
) -> Response {
    result_response(
        state
            .store
            .delete_rows(&name, &req.r#where)
            .map(|deleted| json!({ "deleted": deleted })),
    )
}
