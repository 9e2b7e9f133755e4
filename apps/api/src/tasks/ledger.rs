//! Task Ledger: the durable record behind every background task.
//!
//! All writes are keyed by (id, owner) and idempotent: a write that matches
//! zero rows is silently ignored, so replayed status syncs cannot corrupt a
//! row that has already moved on or been deleted.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::task::{BackgroundTaskRow, NewTask, StatusUpdate, TaskStatus};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts a new row in `queued`.
    async fn create(&self, task: NewTask) -> Result<BackgroundTaskRow>;

    /// Point read scoped to the owner.
    async fn get(&self, task_id: &str, owner_id: Uuid) -> Result<Option<BackgroundTaskRow>>;

    /// Single status write. Zero rows matched is not an error.
    async fn set_status(&self, task_id: &str, owner_id: Uuid, update: StatusUpdate) -> Result<()>;

    /// Attaches a result payload without touching status or error.
    async fn record_result(&self, task_id: &str, owner_id: Uuid, result: Value) -> Result<()>;

    /// Bulk transition of every queued/running row to `failed`.
    /// Returns the number of rows repaired.
    async fn fail_interrupted(&self, error: &str) -> Result<u64>;
}

pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn create(&self, task: NewTask) -> Result<BackgroundTaskRow> {
        let row = sqlx::query_as::<_, BackgroundTaskRow>(
            r#"
            INSERT INTO background_tasks
                (id, owner_id, kind, title, status, created_at, device_id, should_refresh_list)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(&task.id)
        .bind(task.owner_id)
        .bind(&task.kind)
        .bind(&task.title)
        .bind(TaskStatus::Queued.as_str())
        .bind(task.created_at)
        .bind(&task.device_id)
        .bind(task.should_refresh_list)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn get(&self, task_id: &str, owner_id: Uuid) -> Result<Option<BackgroundTaskRow>> {
        let row = sqlx::query_as::<_, BackgroundTaskRow>(
            "SELECT * FROM background_tasks WHERE id = $1 AND owner_id = $2",
        )
        .bind(task_id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn set_status(&self, task_id: &str, owner_id: Uuid, update: StatusUpdate) -> Result<()> {
        // COALESCE keeps a previously written result when the update carries none.
        sqlx::query(
            r#"
            UPDATE background_tasks
            SET status = $3, error = $4, result = COALESCE($5, result), updated_at = NOW()
            WHERE id = $1 AND owner_id = $2
            "#,
        )
        .bind(task_id)
        .bind(owner_id)
        .bind(update.status.as_str())
        .bind(&update.error)
        .bind(&update.result)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_result(&self, task_id: &str, owner_id: Uuid, result: Value) -> Result<()> {
        sqlx::query(
            "UPDATE background_tasks SET result = $3, updated_at = NOW() WHERE id = $1 AND owner_id = $2",
        )
        .bind(task_id)
        .bind(owner_id)
        .bind(&result)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fail_interrupted(&self, error: &str) -> Result<u64> {
        let done = sqlx::query(
            r#"
            UPDATE background_tasks
            SET status = $1, error = $2, updated_at = NOW()
            WHERE status IN ($3, $4)
            "#,
        )
        .bind(TaskStatus::Failed.as_str())
        .bind(error)
        .bind(TaskStatus::Queued.as_str())
        .bind(TaskStatus::Running.as_str())
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected())
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory ledger with the same write semantics as the Postgres store.
    #[derive(Default)]
    pub(crate) struct MemoryTaskStore {
        rows: Mutex<HashMap<String, BackgroundTaskRow>>,
    }

    impl MemoryTaskStore {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn snapshot(&self, task_id: &str) -> Option<BackgroundTaskRow> {
            self.rows.lock().unwrap().get(task_id).cloned()
        }
    }

    #[async_trait]
    impl TaskStore for MemoryTaskStore {
        async fn create(&self, task: NewTask) -> Result<BackgroundTaskRow> {
            let row = BackgroundTaskRow {
                id: task.id.clone(),
                owner_id: task.owner_id,
                kind: task.kind,
                title: task.title,
                status: TaskStatus::Queued.as_str().to_string(),
                error: None,
                result: None,
                created_at: task.created_at,
                device_id: task.device_id,
                should_refresh_list: task.should_refresh_list,
                updated_at: Utc::now(),
            };
            self.rows.lock().unwrap().insert(task.id, row.clone());
            Ok(row)
        }

        async fn get(&self, task_id: &str, owner_id: Uuid) -> Result<Option<BackgroundTaskRow>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .get(task_id)
                .filter(|r| r.owner_id == owner_id)
                .cloned())
        }

        async fn set_status(
            &self,
            task_id: &str,
            owner_id: Uuid,
            update: StatusUpdate,
        ) -> Result<()> {
            let mut rows = self.rows.lock().unwrap();
            if let Some(row) = rows.get_mut(task_id).filter(|r| r.owner_id == owner_id) {
                row.status = update.status.as_str().to_string();
                row.error = update.error;
                if let Some(result) = update.result {
                    row.result = Some(result);
                }
                row.updated_at = Utc::now();
            }
            Ok(())
        }

        async fn record_result(&self, task_id: &str, owner_id: Uuid, result: Value) -> Result<()> {
            let mut rows = self.rows.lock().unwrap();
            if let Some(row) = rows.get_mut(task_id).filter(|r| r.owner_id == owner_id) {
                row.result = Some(result);
                row.updated_at = Utc::now();
            }
            Ok(())
        }

        async fn fail_interrupted(&self, error: &str) -> Result<u64> {
            let mut repaired = 0;
            let mut rows = self.rows.lock().unwrap();
            for row in rows.values_mut() {
                if matches!(row.status(), Some(s) if !s.is_terminal()) {
                    row.status = TaskStatus::Failed.as_str().to_string();
                    row.error = Some(error.to_string());
                    repaired += 1;
                }
            }
            Ok(repaired)
        }
    }
}
