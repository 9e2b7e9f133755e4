//! Axum route handlers for the Task Ledger API.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::task::{BackgroundTaskRow, NewTask};
use crate::state::AppState;
use crate::tasks::ledger::TaskStore;
use crate::telemetry::{self, TaskEvent};

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub task: BackgroundTaskRow,
}

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub owner_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// POST /api/v1/tasks
///
/// Creates a ledger row in `queued`. The id is caller-generated so clients
/// can poll immediately, before any worker picks the task up.
pub async fn handle_create_task(
    State(state): State<AppState>,
    Json(request): Json<NewTask>,
) -> Result<Json<TaskResponse>, AppError> {
    if request.id.trim().is_empty() {
        return Err(AppError::Validation("task id cannot be empty".to_string()));
    }
    if request.kind.trim().is_empty() {
        return Err(AppError::Validation("task kind cannot be empty".to_string()));
    }

    let task = state
        .task_store
        .create(request)
        .await
        .map_err(AppError::Internal)?;

    telemetry::emit(&TaskEvent::TaskCreated {
        task_id: &task.id,
        owner_id: task.owner_id,
        kind: &task.kind,
    });

    Ok(Json(TaskResponse { task }))
}

/// GET /api/v1/tasks/:id?owner_id=
///
/// Status poll: current status plus result or error payload.
pub async fn handle_get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<TaskResponse>, AppError> {
    let task = state
        .task_store
        .get(&task_id, query.owner_id)
        .await
        .map_err(AppError::Internal)?
        .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))?;

    Ok(Json(TaskResponse { task }))
}

/// POST /api/v1/tasks/:id/cancel
///
/// Trips the cancel signal of a live task. Cancelling a task that already
/// finished (or was never scheduled here) reports `cancelled: false`.
pub async fn handle_cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    let cancelled = state.scheduler.cancel(&task_id);
    Ok(Json(CancelResponse { cancelled }))
}
