//! Document storage collaborator over the `cv_files` table.
//!
//! Generated documents live in Postgres as JSONB alongside their source. The
//! pipeline treats content as opaque beyond the sectioned shape it patches.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::cv::{CvDocument, CvFileRow};
use crate::tasks::recovery::PROCESSING_IDLE;

/// Marker set on a source file while a pipeline holds it.
pub const PROCESSING_GENERATING: &str = "generating";

pub async fn read_cv(pool: &PgPool, owner_id: Uuid, cv_id: Uuid) -> Result<Option<CvFileRow>> {
    let row = sqlx::query_as::<_, CvFileRow>(
        "SELECT * FROM cv_files WHERE id = $1 AND owner_id = $2",
    )
    .bind(cv_id)
    .bind(owner_id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Persists a generated document and returns its id.
pub async fn write_generated_cv(
    pool: &PgPool,
    owner_id: Uuid,
    filename: &str,
    document: &CvDocument,
    language: Option<&str>,
) -> Result<Uuid> {
    let content = serde_json::to_value(document).context("serializing generated document")?;
    let id = Uuid::new_v4();

    sqlx::query(
        r#"
        INSERT INTO cv_files
            (id, owner_id, filename, content, language, created_by, processing_status)
        VALUES ($1, $2, $3, $4, $5, 'generation', $6)
        "#,
    )
    .bind(id)
    .bind(owner_id)
    .bind(filename)
    .bind(&content)
    .bind(language)
    .bind(PROCESSING_IDLE)
    .execute(pool)
    .await?;

    Ok(id)
}

/// Flips the external in-progress marker on a source file.
pub async fn set_processing_status(pool: &PgPool, cv_id: Uuid, status: &str) -> Result<()> {
    sqlx::query("UPDATE cv_files SET processing_status = $2, updated_at = NOW() WHERE id = $1")
        .bind(cv_id)
        .bind(status)
        .execute(pool)
        .await?;

    Ok(())
}
