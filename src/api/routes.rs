use super::handlers::{execution, health, pool};
use super::middleware::cors::add_cors;
use crate::services::ExecutionService;
use axum::{
    Router,
    routing::{delete, get, post, put},
};

#[derive(Clone)]
pub struct AppState {
    pub execution_service: ExecutionService,
}

pub fn create_router(execution_service: ExecutionService) -> Router {
    let state = AppState { execution_service };

    let api_routes = Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Execution
        .route("/api/executions", post(execution::start_execution))
        .route("/api/executions/{id}", get(execution::get_execution))
        .route("/api/executions/{id}/stop", put(execution::stop_execution))
        .route("/api/executions/{id}/stream", get(execution::stream_execution))
        // Connection pool
        .route(
            "/api/pool",
            get(pool::list_connections).delete(pool::evict_connections),
        )
        .route("/api/pool/{key}", delete(pool::evict_connection))
        .with_state(state);

    add_cors(api_routes)
}
