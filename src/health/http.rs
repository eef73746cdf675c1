//! HTTP endpoints for health and metrics polling

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use super::{HealthReporter, HealthStatus};

/// Routes: `GET /health`, `GET /health/live`, `GET /metrics`
pub fn health_router(reporter: Arc<HealthReporter>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(live_handler))
        .route("/metrics", get(metrics_handler))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(reporter)
}

/// Latest snapshot, or a fresh one if the periodic refresh hasn't run yet.
/// Unhealthy answers 503 so load balancers can act on the status code alone.
async fn health_handler(State(reporter): State<Arc<HealthReporter>>) -> impl IntoResponse {
    let report = match reporter.latest() {
        Some(report) => report,
        None => reporter.refresh().await,
    };

    let code = if report.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(report))
}

async fn live_handler(State(reporter): State<Arc<HealthReporter>>) -> impl IntoResponse {
    Json(json!({
        "status": "alive",
        "uptime": reporter.started.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics_handler(State(reporter): State<Arc<HealthReporter>>) -> impl IntoResponse {
    Json(reporter.metrics())
}
