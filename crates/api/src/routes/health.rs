//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub replica_index: u32,
    pub replica_count: u32,
}

/// GET /health: liveness and the shard this replica serves.
pub async fn check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        replica_index: state.shard.replica_index(),
        replica_count: state.shard.replica_count(),
    })
}
