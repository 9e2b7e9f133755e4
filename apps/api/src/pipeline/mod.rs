//! Offer Pipeline: fan-out/fan-in generation of tailored CVs.
//!
//! One request covers one source document and N target offers. Each offer
//! walks extract → classify → batch → recompose, persisting every phase in
//! its own subtask row so progress survives inspection mid-flight.

pub mod batch;
pub mod classify;
pub mod extract;
pub mod orchestrator;
pub mod prompts;
pub mod recompose;

use anyhow::Result;
use serde_json::Value;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::llm_client::{LlmClient, Usage};
use crate::models::generation::{OfferStatus, SubtaskKind};
use crate::settings::ModelSettingsCache;

/// Everything a pipeline phase needs. Cheap to clone into spawned subtasks.
#[derive(Clone)]
pub struct PipelineContext {
    pub db: PgPool,
    pub llm: LlmClient,
    /// Plain HTTP client for fetching posting pages, separate from the LLM wire.
    pub http: reqwest::Client,
    pub settings: ModelSettingsCache,
    pub max_parallel_subtasks: usize,
    pub max_concurrent_offers: usize,
}

impl PipelineContext {
    pub fn new(
        db: PgPool,
        llm: LlmClient,
        settings: ModelSettingsCache,
        config: &Config,
    ) -> Result<Self> {
        Ok(Self {
            db,
            llm,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()?,
            settings,
            max_parallel_subtasks: config.max_parallel_subtasks,
            max_concurrent_offers: config.max_concurrent_offers,
        })
    }
}

// ── Subtask row lifecycle, shared by every phase ─────────────────────────────

pub(crate) async fn start_subtask(db: &PgPool, offer_id: Uuid, kind: SubtaskKind) -> Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO generation_subtasks (id, offer_id, kind, status) VALUES ($1, $2, $3, 'running')",
    )
    .bind(id)
    .bind(offer_id)
    .bind(kind.as_str())
    .execute(db)
    .await?;
    Ok(id)
}

pub(crate) async fn complete_subtask(
    db: &PgPool,
    subtask_id: Uuid,
    output: Option<&Value>,
    modifications: Option<&Value>,
    model_used: Option<&str>,
    usage: Option<Usage>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE generation_subtasks
        SET status = 'completed', output = $2, modifications = $3, model_used = $4,
            prompt_tokens = $5, completion_tokens = $6, completed_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(subtask_id)
    .bind(output)
    .bind(modifications)
    .bind(model_used)
    .bind(usage.map(|u| u.input_tokens as i32))
    .bind(usage.map(|u| u.output_tokens as i32))
    .execute(db)
    .await?;
    Ok(())
}

/// Best-effort: a failed subtask must never mask the error that failed it.
pub(crate) async fn fail_subtask(db: &PgPool, subtask_id: Uuid, error: &str) {
    let result = sqlx::query(
        "UPDATE generation_subtasks SET status = 'failed', error = $2, completed_at = NOW() WHERE id = $1",
    )
    .bind(subtask_id)
    .bind(error)
    .execute(db)
    .await;
    if let Err(e) = result {
        warn!("Failed to record subtask {subtask_id} failure: {e}");
    }
}

pub(crate) async fn set_offer_status(db: &PgPool, offer_id: Uuid, status: OfferStatus) -> Result<()> {
    sqlx::query("UPDATE generation_offers SET status = $2 WHERE id = $1")
        .bind(offer_id)
        .bind(status.as_str())
        .execute(db)
        .await?;
    Ok(())
}
