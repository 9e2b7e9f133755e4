pub mod changes;
pub mod generate;
pub mod health;
pub mod tasks;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Task Ledger API
        .route("/api/v1/tasks", post(tasks::handle_create_task))
        .route("/api/v1/tasks/:id", get(tasks::handle_get_task))
        .route("/api/v1/tasks/:id/cancel", post(tasks::handle_cancel_task))
        // Generation API
        .route("/api/v1/generate", post(generate::handle_generate))
        // Review API
        .route("/api/v1/cvs/:id/changes", get(changes::handle_list_changes))
        .route(
            "/api/v1/changes/:id/status",
            post(changes::handle_set_change_status),
        )
        .with_state(state)
}
