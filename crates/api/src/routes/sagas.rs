//! Saga start, status and cancellation endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::InstanceId;
use saga::{CancelAck, SagaState, SagaStatus};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Deserialize)]
pub struct StartSagaRequest {
    pub definition_id: String,
    #[serde(default)]
    pub input: serde_json::Value,
    /// Run to a terminal state before responding instead of in the background.
    #[serde(default)]
    pub wait: bool,
}

// -- Response types --

#[derive(Serialize)]
pub struct SagaStartedResponse {
    pub instance_id: InstanceId,
    pub state: SagaState,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub instance_id: InstanceId,
    pub status: &'static str,
}

// -- Handlers --

/// POST /sagas: start an instance of a registered definition.
///
/// The instance runs in the background when this replica owns its shard;
/// otherwise the owning replica's worker pool picks it up.
#[tracing::instrument(skip(state, req), fields(definition_id = %req.definition_id))]
pub async fn start(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartSagaRequest>,
) -> Result<(StatusCode, Json<SagaStartedResponse>), ApiError> {
    metrics::counter!("api_saga_start_requests_total", "definition" => req.definition_id.clone())
        .increment(1);
    let orchestrator = &state.orchestrator;
    let instance_id = orchestrator
        .start_saga(&req.definition_id, req.input)
        .await?;

    let saga_state = if req.wait {
        orchestrator.run(instance_id).await?.state
    } else {
        if state.shard.owns(instance_id) {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                if let Err(e) = orchestrator.run(instance_id).await {
                    tracing::warn!(%instance_id, error = %e, "background saga run failed");
                }
            });
        }
        SagaState::Started
    };

    Ok((
        StatusCode::CREATED,
        Json(SagaStartedResponse {
            instance_id,
            state: saga_state,
        }),
    ))
}

/// GET /sagas/{id}: last persisted status of an instance.
#[tracing::instrument(skip(state))]
pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SagaStatus>, ApiError> {
    let instance_id = parse_instance_id(&id)?;
    Ok(Json(state.orchestrator.get_saga_status(instance_id).await?))
}

/// POST /sagas/{id}/cancel: request cancellation.
#[tracing::instrument(skip(state))]
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    let instance_id = parse_instance_id(&id)?;
    let (code, status) = match state.orchestrator.cancel_saga(instance_id).await? {
        CancelAck::Requested => (StatusCode::ACCEPTED, "REQUESTED"),
        CancelAck::AlreadyTerminal => (StatusCode::OK, "ALREADY_TERMINAL"),
    };
    Ok((
        code,
        Json(CancelResponse {
            instance_id,
            status,
        }),
    ))
}

/// GET /definitions: registered definition ids.
pub async fn definitions(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.orchestrator.registry().ids())
}

fn parse_instance_id(id: &str) -> Result<InstanceId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid instance id: {e}")))
}
