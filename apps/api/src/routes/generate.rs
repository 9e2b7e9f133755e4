//! Axum route handler for starting a generation request.

use std::sync::Arc;

use axum::{extract::State, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::task::NewTask;
use crate::pipeline::orchestrator::run_generation_request;
use crate::pipeline::PipelineContext;
use crate::state::AppState;
use crate::storage::read_cv;
use crate::tasks::ledger::TaskStore;
use crate::telemetry::{self, TaskEvent};

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub owner_id: Uuid,
    pub source_cv_id: Uuid,
    /// One offer per target posting URL.
    pub target_urls: Vec<String>,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub task_id: String,
    pub request_id: Uuid,
    pub total_offers: usize,
}

/// POST /api/v1/generate
///
/// Creates the request, its offers, and the ledger row, then enqueues the
/// pipeline and returns immediately. Progress is polled via the task API.
/// Credit and quota checks happen upstream of this service.
pub async fn handle_generate(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, AppError> {
    if request.target_urls.is_empty() {
        return Err(AppError::Validation(
            "target_urls cannot be empty".to_string(),
        ));
    }
    if request.target_urls.iter().any(|u| u.trim().is_empty()) {
        return Err(AppError::Validation(
            "target_urls cannot contain empty entries".to_string(),
        ));
    }

    let source = read_cv(&state.db, request.owner_id, request.source_cv_id)
        .await
        .map_err(AppError::Internal)?
        .ok_or_else(|| AppError::NotFound(format!("CV {}", request.source_cv_id)))?;

    let request_id = Uuid::new_v4();
    let total_offers = request.target_urls.len();

    sqlx::query(
        r#"
        INSERT INTO generation_requests (id, owner_id, source_cv_id, total_offers, status)
        VALUES ($1, $2, $3, $4, 'created')
        "#,
    )
    .bind(request_id)
    .bind(request.owner_id)
    .bind(request.source_cv_id)
    .bind(total_offers as i32)
    .execute(&state.db)
    .await?;

    for (index, url) in request.target_urls.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO generation_offers (id, request_id, owner_id, offer_index, source_url, status)
            VALUES ($1, $2, $3, $4, $5, 'created')
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(request_id)
        .bind(request.owner_id)
        .bind(index as i32)
        .bind(url.trim())
        .execute(&state.db)
        .await?;
    }

    let task_id = request_id.to_string();
    let task = state
        .task_store
        .create(NewTask {
            id: task_id.clone(),
            owner_id: request.owner_id,
            kind: "cv_generation".to_string(),
            title: format!("Generate CV from {}", source.filename),
            device_id: request.device_id.clone(),
            should_refresh_list: true,
            created_at: Utc::now().timestamp_millis(),
        })
        .await
        .map_err(AppError::Internal)?;

    telemetry::emit(&TaskEvent::TaskCreated {
        task_id: &task.id,
        owner_id: task.owner_id,
        kind: &task.kind,
    });

    let ctx = PipelineContext::new(
        state.db.clone(),
        state.llm.clone(),
        state.settings.clone(),
        &state.config,
    )
    .map_err(AppError::Internal)?;
    let store: Arc<dyn crate::tasks::ledger::TaskStore> = state.task_store.clone();
    let owner_id = request.owner_id;
    let worker_task_id = task_id.clone();

    state
        .scheduler
        .enqueue(task_id.clone(), owner_id, move |signal| {
            run_generation_request(ctx, store, worker_task_id, owner_id, request_id, signal)
        });

    Ok(Json(GenerateResponse {
        task_id,
        request_id,
        total_offers,
    }))
}
