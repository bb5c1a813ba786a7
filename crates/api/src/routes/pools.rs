//! Bulkhead utilization endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::ServiceId;
use resilience::PoolStats;

use crate::AppState;
use crate::error::ApiError;

/// GET /pools/{source}/{destination}: in-use and waiting counts of one pool.
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path((source, destination)): Path<(String, String)>,
) -> Result<Json<PoolStats>, ApiError> {
    state
        .orchestrator
        .pools()
        .stats(&ServiceId::new(source.as_str()), &ServiceId::new(destination.as_str()))
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No pool for {source} -> {destination}")))
}

/// GET /pools: every pool created so far.
pub async fn list(State(state): State<Arc<AppState>>) -> Json<Vec<PoolStats>> {
    Json(state.orchestrator.pools().all_stats())
}
