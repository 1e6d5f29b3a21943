//! Thin HTTP/JSON boundary over a [`MultiModelStore`] (§6).
//!
//! This crate owns wire translation only: request bodies in, store calls
//! out, [`MantisError::status_code`] mapped onto the documented status
//! codes. No auth beyond an optional bearer check against
//! `security.admin_token`, no TLS termination, no health-probe loop — those
//! are an external collaborator's concern.

mod rest;

pub use rest::{build_router, AppState};

use mantisdb_core::MantisConfig;
use mantisdb_store::MultiModelStore;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Runs the REST boundary until its listener is dropped. Callers typically
/// drive this from a lifecycle step (§4.4) and rely on the surrounding
/// coordinator for shutdown, not on this function returning on its own.
pub async fn serve(config: &MantisConfig, store: Arc<MultiModelStore>) -> anyhow::Result<()> {
    let state = AppState {
        store,
        config: config.clone(),
        started_at: Instant::now(),
    };
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "REST API listening");
    axum::serve(listener, app).await?;
    Ok(())
}
