//! HTTP server for the grid manager.
//!
//! Provides endpoints for:
//! - The agent protocol (`/v1/agents/*`)
//! - Repository and task management (`/v1/repositories`, `/v1/tasks`, `/v1/schedules`)
//! - The grid summary (`/v1/summary`)
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

mod handlers;
pub mod responses;

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    // CORS layer for dashboard access
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Agent protocol
        .route("/v1/agents/register", post(handlers::register))
        .route("/v1/agents/ping", post(handlers::ping))
        .route("/v1/agents/disconnect", post(handlers::disconnect))
        .route("/v1/agents/progress", post(handlers::progress))
        .route("/v1/agents/descriptor", post(handlers::descriptor))
        .route("/v1/agents/join", post(handlers::join))
        .route("/v1/agents/cancel", post(handlers::cancel))
        // Management protocol
        .route("/v1/summary", get(handlers::grid_summary))
        .route("/v1/tasks", get(handlers::grid_tasks))
        .route("/v1/tasks/launch", post(handlers::launch_task))
        .route("/v1/tasks/execute", post(handlers::execute_task))
        .route("/v1/tasks/:id/abort", post(handlers::abort_task))
        .route("/v1/repositories", post(handlers::add_repository))
        .route("/v1/repositories/:name", delete(handlers::remove_repository))
        .route("/v1/repositories/:name/tasks", get(handlers::repository_tasks))
        .route("/v1/schedules", post(handlers::schedule_task))
        // Observability routes
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
