//! Circuit breaker inspection and operator reset.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::ServiceId;
use resilience::CircuitBreakerRecord;

use crate::AppState;
use crate::error::ApiError;

/// GET /breakers/{source}/{destination}: the shared record of one pair.
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path((source, destination)): Path<(String, String)>,
) -> Result<Json<CircuitBreakerRecord>, ApiError> {
    let record = state
        .orchestrator
        .breakers()
        .record(&ServiceId::new(source), &ServiceId::new(destination))
        .await?;
    Ok(Json(record))
}

/// POST /breakers/{source}/{destination}/reset: force the pair CLOSED.
#[tracing::instrument(skip(state))]
pub async fn reset(
    State(state): State<Arc<AppState>>,
    Path((source, destination)): Path<(String, String)>,
) -> Result<Json<CircuitBreakerRecord>, ApiError> {
    let source = ServiceId::new(source);
    let destination = ServiceId::new(destination);
    let breakers = state.orchestrator.breakers();
    breakers.reset(&source, &destination).await?;
    Ok(Json(breakers.record(&source, &destination).await?))
}
