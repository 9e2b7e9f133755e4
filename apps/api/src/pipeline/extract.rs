//! Extraction phase: resolves an offer's source URL into a normalized
//! `JobPosting`, cached per (owner, url) so repeat generations against the
//! same posting skip the LLM entirely.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::models::generation::{GenerationOfferRow, SubtaskKind};
use crate::pipeline::prompts::{EXTRACTION_PROMPT_TEMPLATE, EXTRACTION_SYSTEM};
use crate::pipeline::{complete_subtask, fail_subtask, start_subtask, PipelineContext};
use crate::settings::ModelRole;
use crate::tasks::scheduler::CancelSignal;

/// Page text beyond this length adds noise, not signal.
const MAX_PAGE_TEXT_CHARS: usize = 20_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostingSkills {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub nice_to_have: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPosting {
    pub title: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub skills: PostingSkills,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub posting_id: Uuid,
    pub posting: JobPosting,
    pub from_cache: bool,
}

pub async fn execute_extraction(
    ctx: &PipelineContext,
    offer: &GenerationOfferRow,
    signal: &CancelSignal,
) -> Result<ExtractionResult> {
    let subtask_id = start_subtask(&ctx.db, offer.id, SubtaskKind::Extraction).await?;

    match extract_inner(ctx, offer, signal).await {
        Ok((result, model_used, usage)) => {
            let output = serde_json::to_value(&result.posting)?;
            complete_subtask(
                &ctx.db,
                subtask_id,
                Some(&output),
                None,
                model_used.as_deref(),
                usage,
            )
            .await?;

            sqlx::query("UPDATE generation_offers SET job_posting_id = $2 WHERE id = $1")
                .bind(offer.id)
                .bind(result.posting_id)
                .execute(&ctx.db)
                .await?;

            Ok(result)
        }
        Err(e) => {
            fail_subtask(&ctx.db, subtask_id, &format!("{e:#}")).await;
            Err(e)
        }
    }
}

async fn extract_inner(
    ctx: &PipelineContext,
    offer: &GenerationOfferRow,
    signal: &CancelSignal,
) -> Result<(ExtractionResult, Option<String>, Option<crate::llm_client::Usage>)> {
    if let Some((posting_id, posting)) =
        cached_posting(&ctx.db, offer.owner_id, &offer.source_url).await?
    {
        info!("Posting cache hit for offer {} ({})", offer.id, offer.source_url);
        return Ok((
            ExtractionResult {
                posting_id,
                posting,
                from_cache: true,
            },
            None,
            None,
        ));
    }

    let page_text = fetch_page_text(ctx, &offer.source_url).await?;
    let prompt =
        EXTRACTION_PROMPT_TEMPLATE.replace("{page_text}", truncate_page_text(&page_text));

    let model = ctx.settings.model_for(ModelRole::Extraction).await;
    let (posting, usage): (JobPosting, _) = ctx
        .llm
        .call_json(&model, &prompt, EXTRACTION_SYSTEM, signal)
        .await
        .with_context(|| format!("extracting posting from {}", offer.source_url))?;

    let posting_id = insert_posting(&ctx.db, offer.owner_id, &offer.source_url, &posting).await?;

    Ok((
        ExtractionResult {
            posting_id,
            posting,
            from_cache: false,
        },
        Some(model),
        Some(usage),
    ))
}

async fn cached_posting(
    db: &PgPool,
    owner_id: Uuid,
    source_url: &str,
) -> Result<Option<(Uuid, JobPosting)>> {
    let row: Option<(Uuid, Value)> = sqlx::query_as(
        "SELECT id, posting FROM job_postings WHERE owner_id = $1 AND source_url = $2",
    )
    .bind(owner_id)
    .bind(source_url)
    .fetch_optional(db)
    .await?;

    match row {
        Some((id, posting)) => {
            let posting =
                serde_json::from_value(posting).context("deserializing cached posting")?;
            Ok(Some((id, posting)))
        }
        None => Ok(None),
    }
}

async fn insert_posting(
    db: &PgPool,
    owner_id: Uuid,
    source_url: &str,
    posting: &JobPosting,
) -> Result<Uuid> {
    // On conflict the existing row keeps its id, so read it back instead of
    // trusting the freshly generated one.
    let id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO job_postings (id, owner_id, source_url, posting)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (owner_id, source_url) DO UPDATE SET posting = EXCLUDED.posting
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(owner_id)
    .bind(source_url)
    .bind(serde_json::to_value(posting)?)
    .fetch_one(db)
    .await?;
    Ok(id)
}

async fn fetch_page_text(ctx: &PipelineContext, url: &str) -> Result<String> {
    let response = ctx
        .http
        .get(url)
        .send()
        .await
        .with_context(|| format!("fetching posting page {url}"))?;

    if !response.status().is_success() {
        anyhow::bail!("posting page {url} returned {}", response.status());
    }

    let body = response.text().await.context("reading posting page body")?;
    Ok(body)
}

fn truncate_page_text(text: &str) -> &str {
    match text.char_indices().nth(MAX_PAGE_TEXT_CHARS) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_posting_deserializes_with_minimal_fields() {
        let posting: JobPosting = serde_json::from_value(json!({
            "title": "Backend Engineer"
        }))
        .unwrap();
        assert_eq!(posting.title, "Backend Engineer");
        assert!(posting.company.is_none());
        assert!(posting.skills.required.is_empty());
    }

    #[test]
    fn test_posting_full_shape() {
        let posting: JobPosting = serde_json::from_value(json!({
            "title": "Senior Rust Engineer",
            "company": "Acme",
            "description": "Build the platform.",
            "skills": {"required": ["Rust"], "nice_to_have": ["Kubernetes"]},
            "language": "en"
        }))
        .unwrap();
        assert_eq!(posting.skills.required, vec!["Rust"]);
        assert_eq!(posting.language.as_deref(), Some("en"));
    }

    #[test]
    fn test_truncate_page_text_respects_char_boundaries() {
        let short = "hello";
        assert_eq!(truncate_page_text(short), short);

        let long = "é".repeat(MAX_PAGE_TEXT_CHARS + 100);
        let truncated = truncate_page_text(&long);
        assert_eq!(truncated.chars().count(), MAX_PAGE_TEXT_CHARS);
    }
}
