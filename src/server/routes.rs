//! Router configuration for the work API.

use axum::{
    routing::{get, put},
    Router,
};
use tower_http::cors::CorsLayer;

use super::handlers;
use super::AppState;

/// Create the router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        // Worker contract
        .route("/work", get(handlers::get_work))
        .route("/work/:id", put(handlers::update_work))
        // Read-only jobs API
        .route("/jobs", get(handlers::list_jobs))
        .route("/jobs/:job_id", get(handlers::job_detail))
        .route("/jobs/:job_id/items", get(handlers::job_items))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
