//! HTTP API for the saga orchestrator.
//!
//! Exposes `StartSaga`, `GetSagaStatus` and `CancelSaga` over REST, plus
//! operator endpoints for pools and circuit breakers, structured logging
//! (tracing) and Prometheus metrics.

pub mod config;
pub mod demo;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{SagaOrchestrator, ShardAssignment, StepInvoker};
use state_store::VersionedStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Store shared by every component of a replica.
pub type SharedStore = Arc<dyn VersionedStore>;

/// Orchestrator over a type-erased store and invoker.
pub type Orchestrator = SagaOrchestrator<SharedStore, Arc<dyn StepInvoker>>;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Instances this replica runs itself after `POST /sagas`.
    pub shard: ShardAssignment,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::render))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/definitions", get(routes::sagas::definitions))
        .route("/sagas", post(routes::sagas::start))
        .route("/sagas/{id}", get(routes::sagas::status))
        .route("/sagas/{id}/cancel", post(routes::sagas::cancel))
        .route("/pools", get(routes::pools::list))
        .route("/pools/{source}/{destination}", get(routes::pools::get))
        .route("/breakers/{source}/{destination}", get(routes::breakers::get))
        .route(
            "/breakers/{source}/{destination}/reset",
            post(routes::breakers::reset),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
