use crate::handlers;
use crate::AppState;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/run-code", post(handlers::run_code))
        .route("/run-tests", post(handlers::run_tests))
        .route("/submit", post(handlers::submit))
        .route("/submissions/:id", get(handlers::get_submission))
        .route("/submissions/:id/result", get(handlers::get_result))
        .route("/submissions/:id/cancel", post(handlers::cancel_submission))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}
