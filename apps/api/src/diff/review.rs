//! Review operations over persisted pending changes.
//!
//! One row per change, keyed by (cv_file_id, change_key). The key is the
//! normalizer's deterministic id, so re-persisting the same changeset is a
//! no-op rather than a duplicate.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::diff::normalizer::{ChangeStatus, PendingChange};
use crate::models::cv::Section;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PendingChangeRow {
    pub id: Uuid,
    pub cv_file_id: Uuid,
    pub change_key: String,
    pub section: String,
    pub change_type: String,
    pub status: String,
    pub category: Option<String>,
    pub item_name: Option<String>,
    pub item_index: Option<i32>,
    pub field: Option<String>,
    pub reason: Option<String>,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

/// Inserts normalized changes for a generated document. Conflicting keys are
/// ignored, so replays after a retry cannot duplicate rows.
pub async fn save_pending_changes(
    pool: &PgPool,
    cv_file_id: Uuid,
    changes: &[PendingChange],
) -> Result<u64> {
    let mut inserted = 0;
    for change in changes {
        let done = sqlx::query(
            r#"
            INSERT INTO pending_changes
                (id, cv_file_id, change_key, section, change_type, status,
                 category, item_name, item_index, field, reason, before, after)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (cv_file_id, change_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(cv_file_id)
        .bind(&change.key)
        .bind(change.section.as_str())
        .bind(change.change_type.as_str())
        .bind(change.status.as_str())
        .bind(&change.category)
        .bind(&change.item_name)
        .bind(change.item_index.map(|i| i as i32))
        .bind(&change.field)
        .bind(&change.reason)
        .bind(&change.before)
        .bind(&change.after)
        .execute(pool)
        .await?;
        inserted += done.rows_affected();
    }
    Ok(inserted)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangeFilter {
    pub section: Option<Section>,
    pub status: Option<ChangeStatus>,
}

pub async fn list_changes(
    pool: &PgPool,
    owner_id: Uuid,
    cv_file_id: Uuid,
    filter: &ChangeFilter,
) -> Result<Vec<PendingChangeRow>> {
    let rows = sqlx::query_as::<_, PendingChangeRow>(
        r#"
        SELECT pc.* FROM pending_changes pc
        JOIN cv_files cf ON cf.id = pc.cv_file_id
        WHERE pc.cv_file_id = $1
          AND cf.owner_id = $2
          AND ($3::text IS NULL OR pc.section = $3)
          AND ($4::text IS NULL OR pc.status = $4)
        ORDER BY pc.section, pc.change_key
        "#,
    )
    .bind(cv_file_id)
    .bind(owner_id)
    .bind(filter.section.map(|s| s.as_str()))
    .bind(filter.status.map(|s| s.as_str()))
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Accepts or rejects a single change. Returns false when no row matched
/// (wrong owner or unknown id).
pub async fn set_change_status(
    pool: &PgPool,
    owner_id: Uuid,
    change_id: Uuid,
    status: ChangeStatus,
) -> Result<bool> {
    let done = sqlx::query(
        r#"
        UPDATE pending_changes pc
        SET status = $3, reviewed_at = NOW()
        FROM cv_files cf
        WHERE pc.id = $1 AND cf.id = pc.cv_file_id AND cf.owner_id = $2
        "#,
    )
    .bind(change_id)
    .bind(owner_id)
    .bind(status.as_str())
    .execute(pool)
    .await?;

    Ok(done.rows_affected() > 0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewProgress {
    pub total: usize,
    pub reviewed: usize,
    pub pending: usize,
    pub percent_complete: u8,
}

/// Progress over a set of persisted changes. Pure; works on any row slice.
pub fn review_progress(rows: &[PendingChangeRow]) -> ReviewProgress {
    let total = rows.len();
    let pending = rows
        .iter()
        .filter(|r| r.status == ChangeStatus::Pending.as_str())
        .count();
    let reviewed = total - pending;
    let percent_complete = if total == 0 {
        100
    } else {
        ((reviewed * 100) / total) as u8
    };
    ReviewProgress {
        total,
        reviewed,
        pending,
        percent_complete,
    }
}

pub fn all_reviewed(rows: &[PendingChangeRow]) -> bool {
    rows.iter().all(|r| r.status != ChangeStatus::Pending.as_str())
}
