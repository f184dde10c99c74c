//! HTTP intake for submissions and read-only exercise queries.

pub mod error;
pub mod evaluate;
pub mod exercises;
pub mod health;
pub mod state;

use axum::{
    Router,
    http::{Method, header},
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub use error::{ApiError, ApiResult};
pub use state::AppState;

/// Create the application router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::ORIGIN]);

    Router::new()
        .route("/evaluate", post(evaluate::evaluate))
        .route("/exercises", get(exercises::list_exercises))
        .route("/tests/{guide}/{exercise}", get(exercises::download_test))
        .route("/health", get(health::health_check))
        .route("/metrics", get(health::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
