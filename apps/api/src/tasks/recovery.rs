//! Recovery Sweep: boot-time repair of work orphaned by a restart.
//!
//! In-process tasks do not survive the process. Anything still queued or
//! running when we come back up was interrupted; the sweep moves it to
//! `failed` so clients see a terminal state instead of a forever-pending one.
//! It never resumes work.

use anyhow::Result;
use sqlx::PgPool;
use tracing::info;

use crate::models::task::TaskStatus;

/// Error recorded on every row the sweep repairs.
pub const RESTART_ERROR: &str = "interrupted by restart";

/// External in-progress marker on `cv_files` reset by the sweep.
pub const PROCESSING_IDLE: &str = "idle";

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub tasks_failed: u64,
    pub requests_failed: u64,
    pub offers_failed: u64,
    pub subtasks_failed: u64,
    pub documents_reset: u64,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.tasks_failed
            + self.requests_failed
            + self.offers_failed
            + self.subtasks_failed
            + self.documents_reset
    }
}

/// Runs the sweep. Called exactly once per process lifetime, before the
/// listener binds, so no new work can race with it.
pub async fn run_recovery_sweep(pool: &PgPool) -> Result<SweepReport> {
    let failed = TaskStatus::Failed.as_str();

    let tasks_failed = sqlx::query(
        r#"
        UPDATE background_tasks
        SET status = $1, error = $2, updated_at = NOW()
        WHERE status IN ('queued', 'running')
        "#,
    )
    .bind(failed)
    .bind(RESTART_ERROR)
    .execute(pool)
    .await?
    .rows_affected();

    let requests_failed = sqlx::query(
        r#"
        UPDATE generation_requests
        SET status = $1, error = $2, completed_at = NOW()
        WHERE status NOT IN ('completed', 'failed')
        "#,
    )
    .bind(failed)
    .bind(RESTART_ERROR)
    .execute(pool)
    .await?
    .rows_affected();

    let offers_failed = sqlx::query(
        r#"
        UPDATE generation_offers
        SET status = $1, error = $2, completed_at = NOW()
        WHERE status NOT IN ('completed', 'failed')
        "#,
    )
    .bind(failed)
    .bind(RESTART_ERROR)
    .execute(pool)
    .await?
    .rows_affected();

    let subtasks_failed = sqlx::query(
        r#"
        UPDATE generation_subtasks
        SET status = $1, error = $2, completed_at = NOW()
        WHERE status NOT IN ('completed', 'failed')
        "#,
    )
    .bind(failed)
    .bind(RESTART_ERROR)
    .execute(pool)
    .await?
    .rows_affected();

    let documents_reset = sqlx::query(
        "UPDATE cv_files SET processing_status = $1, updated_at = NOW() WHERE processing_status <> $1",
    )
    .bind(PROCESSING_IDLE)
    .execute(pool)
    .await?
    .rows_affected();

    let report = SweepReport {
        tasks_failed,
        requests_failed,
        offers_failed,
        subtasks_failed,
        documents_reset,
    };

    info!(
        "Recovery sweep repaired {} rows (tasks={}, requests={}, offers={}, subtasks={}, documents={})",
        report.total(),
        report.tasks_failed,
        report.requests_failed,
        report.offers_failed,
        report.subtasks_failed,
        report.documents_reset,
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_report_total_sums_all_tables() {
        let report = SweepReport {
            tasks_failed: 2,
            requests_failed: 1,
            offers_failed: 3,
            subtasks_failed: 5,
            documents_reset: 1,
        };
        assert_eq!(report.total(), 12);
        assert_eq!(SweepReport::default().total(), 0);
    }
}
