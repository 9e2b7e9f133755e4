//! Axum route handlers for reviewing pending changes.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::diff::normalizer::ChangeStatus;
use crate::diff::review::{
    list_changes, review_progress, set_change_status, ChangeFilter, PendingChangeRow,
    ReviewProgress,
};
use crate::errors::AppError;
use crate::models::cv::Section;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListChangesQuery {
    pub owner_id: Uuid,
    pub section: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListChangesResponse {
    pub changes: Vec<PendingChangeRow>,
    pub progress: ReviewProgress,
}

#[derive(Debug, Deserialize)]
pub struct SetStatusRequest {
    pub owner_id: Uuid,
    /// "accepted" or "rejected".
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct SetStatusResponse {
    pub updated: bool,
}

/// GET /api/v1/cvs/:id/changes?owner_id=&section=&status=
///
/// Lists a generated document's changes with review progress. Progress is
/// computed over the unfiltered set so a section filter does not distort it.
pub async fn handle_list_changes(
    State(state): State<AppState>,
    Path(cv_id): Path<Uuid>,
    Query(query): Query<ListChangesQuery>,
) -> Result<Json<ListChangesResponse>, AppError> {
    let section = match query.section.as_deref() {
        Some(raw) => Some(
            Section::parse(raw)
                .ok_or_else(|| AppError::Validation(format!("unknown section '{raw}'")))?,
        ),
        None => None,
    };
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            ChangeStatus::parse(raw)
                .ok_or_else(|| AppError::Validation(format!("unknown status '{raw}'")))?,
        ),
        None => None,
    };

    let all = list_changes(&state.db, query.owner_id, cv_id, &ChangeFilter::default())
        .await
        .map_err(AppError::Internal)?;
    let progress = review_progress(&all);

    let changes = if section.is_none() && status.is_none() {
        all
    } else {
        list_changes(&state.db, query.owner_id, cv_id, &ChangeFilter { section, status })
            .await
            .map_err(AppError::Internal)?
    };

    Ok(Json(ListChangesResponse { changes, progress }))
}

/// POST /api/v1/changes/:id/status
///
/// Accepts or rejects a single change. Re-reviewing a change overwrites its
/// previous verdict; setting it back to `pending` is not supported.
pub async fn handle_set_change_status(
    State(state): State<AppState>,
    Path(change_id): Path<Uuid>,
    Json(request): Json<SetStatusRequest>,
) -> Result<Json<SetStatusResponse>, AppError> {
    let status = ChangeStatus::parse(&request.status)
        .filter(|s| *s != ChangeStatus::Pending)
        .ok_or_else(|| {
            AppError::Validation(format!(
                "status must be 'accepted' or 'rejected', got '{}'",
                request.status
            ))
        })?;

    let updated = set_change_status(&state.db, request.owner_id, change_id, status)
        .await
        .map_err(AppError::Internal)?;

    if !updated {
        return Err(AppError::NotFound(format!("change {change_id}")));
    }

    Ok(Json(SetStatusResponse { updated }))
}
