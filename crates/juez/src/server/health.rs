//! Health check and metrics handlers.

use axum::{extract::State, http::header, response::IntoResponse, Json};
use serde::Serialize;

use crate::metrics;
use crate::server::state::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    /// Enabled exercises available for grading
    pub exercises: usize,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: if state.shutdown.is_cancelled() {
            "shutting_down"
        } else {
            "healthy"
        },
        version: env!("CARGO_PKG_VERSION"),
        exercises: state.grader.registry().list().count(),
    })
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}
