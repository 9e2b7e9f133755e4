//! Batching phase: one subtask per content section, fanned out together.
//!
//! Subtasks persist independently the moment they finish and never block or
//! abort their siblings; recomposition decides what a failure means. Fan-out
//! is bounded by the configured semaphore so a wide request cannot exhaust
//! the LLM budget in one burst.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;
use uuid::Uuid;

use crate::diff::normalizer::RawModification;
use crate::models::cv::{CvDocument, Section};
use crate::models::generation::SubtaskKind;
use crate::pipeline::classify::ClassifiedCv;
use crate::pipeline::orchestrator::with_retry;
use crate::pipeline::prompts::{section_guidance, BATCH_PROMPT_TEMPLATE, BATCH_SYSTEM};
use crate::pipeline::{complete_subtask, fail_subtask, start_subtask, PipelineContext};
use crate::settings::ModelRole;
use crate::tasks::scheduler::CancelSignal;

/// Wire shape every batch subtask returns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchOutput {
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub modifications: Vec<RawModification>,
}

/// Terminal state of one section subtask, as recomposition consumes it.
#[derive(Debug, Clone)]
pub struct SubtaskOutcome {
    pub kind: SubtaskKind,
    pub section: Section,
    pub content: Option<Value>,
    pub modifications: Vec<RawModification>,
    pub error: Option<String>,
}

impl SubtaskOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    fn failed(kind: SubtaskKind, section: Section, error: String) -> Self {
        SubtaskOutcome {
            kind,
            section,
            content: None,
            modifications: Vec::new(),
            error: Some(error),
        }
    }
}

/// Runs all five section subtasks for one offer and returns their terminal
/// outcomes in section display order. Never errors as a whole: each failure
/// is captured in its outcome.
pub async fn run_section_batches(
    ctx: &PipelineContext,
    offer_id: Uuid,
    source: &CvDocument,
    classified: &ClassifiedCv,
    posting_json: &Value,
    signal: &CancelSignal,
) -> Vec<SubtaskOutcome> {
    let semaphore = Arc::new(Semaphore::new(ctx.max_parallel_subtasks));
    let mut join_set: JoinSet<SubtaskOutcome> = JoinSet::new();

    for kind in SubtaskKind::batch_kinds() {
        let section = match kind.section() {
            Some(section) => section,
            None => continue,
        };
        let ctx = ctx.clone();
        let signal = signal.clone();
        let semaphore = semaphore.clone();
        let content = section_input(source, classified, section);
        let posting_json = posting_json.clone();

        join_set.spawn(async move {
            let _permit = match semaphore.acquire().await {
                Ok(permit) => permit,
                Err(_) => {
                    return SubtaskOutcome::failed(kind, section, "fan-out aborted".to_string())
                }
            };
            run_one_section(&ctx, offer_id, kind, section, content, posting_json, &signal).await
        });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(join_err) => {
                // A panicked subtask only loses its own section.
                warn!("Section subtask panicked: {join_err}");
            }
        }
    }

    let order = SubtaskKind::batch_kinds();
    outcomes.sort_by_key(|o| order.iter().position(|k| *k == o.kind));
    outcomes
}

/// What each section subtask rewrites. Experiences and projects start from
/// the classified sets so removed items never reach the model.
fn section_input(source: &CvDocument, classified: &ClassifiedCv, section: Section) -> Value {
    match section {
        Section::Experience => Value::Array(classified.experiences.clone()),
        Section::Projects => Value::Array(classified.projects.clone()),
        Section::Skills => source.skills.clone(),
        Section::Summary => source.summary.clone(),
        Section::Extras => Value::Array(source.extras.clone()),
        Section::Languages | Section::Education => Value::Null,
    }
}

async fn run_one_section(
    ctx: &PipelineContext,
    offer_id: Uuid,
    kind: SubtaskKind,
    section: Section,
    content: Value,
    posting_json: Value,
    signal: &CancelSignal,
) -> SubtaskOutcome {
    let subtask_id = match start_subtask(&ctx.db, offer_id, kind).await {
        Ok(id) => id,
        Err(e) => {
            warn!("Could not open subtask row for {}: {e:#}", kind.as_str());
            return SubtaskOutcome::failed(kind, section, format!("{e:#}"));
        }
    };

    let label = kind.as_str();
    let attempt_result = with_retry(label, signal, |_attempt| {
        let ctx = ctx.clone();
        let content = content.clone();
        let posting_json = posting_json.clone();
        let signal = signal.clone();
        async move { call_section_model(&ctx, section, &content, &posting_json, &signal).await }
    })
    .await;

    match attempt_result {
        Ok((output, model, usage)) => {
            let modifications = match serde_json::to_value(&output.modifications) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("Could not serialize modifications for {label}: {e}");
                    None
                }
            };
            if let Err(e) = complete_subtask(
                &ctx.db,
                subtask_id,
                Some(&output.content),
                modifications.as_ref(),
                Some(&model),
                Some(usage),
            )
            .await
            {
                warn!("Could not persist subtask {label}: {e:#}");
                return SubtaskOutcome::failed(kind, section, format!("{e:#}"));
            }

            SubtaskOutcome {
                kind,
                section,
                content: Some(output.content),
                modifications: output.modifications,
                error: None,
            }
        }
        Err(e) => {
            let error = format!("{e:#}");
            fail_subtask(&ctx.db, subtask_id, &error).await;
            SubtaskOutcome::failed(kind, section, error)
        }
    }
}

async fn call_section_model(
    ctx: &PipelineContext,
    section: Section,
    content: &Value,
    posting_json: &Value,
    signal: &CancelSignal,
) -> Result<(BatchOutput, String, crate::llm_client::Usage)> {
    let prompt = BATCH_PROMPT_TEMPLATE
        .replace("{section}", section.as_str())
        .replace("{section_guidance}", section_guidance(section))
        .replace("{content_json}", &serde_json::to_string_pretty(content)?)
        .replace("{posting_json}", &serde_json::to_string_pretty(posting_json)?);

    let model = ctx.settings.model_for(ModelRole::SectionBatch).await;
    let (output, usage): (BatchOutput, _) = ctx
        .llm
        .call_json(&model, &prompt, BATCH_SYSTEM, signal)
        .await
        .with_context(|| format!("rewriting {section} section"))?;

    Ok((output, model, usage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::normalizer::ModAction;
    use crate::pipeline::classify::{apply_classification, Classification};
    use serde_json::json;

    #[test]
    fn test_batch_output_tolerates_missing_fields() {
        let bare: BatchOutput = serde_json::from_value(json!({})).unwrap();
        assert!(bare.content.is_null());
        assert!(bare.modifications.is_empty());

        let full: BatchOutput = serde_json::from_value(json!({
            "content": {"text": "Rewritten summary"},
            "modifications": [{"action": "modify", "reason": "tightened"}]
        }))
        .unwrap();
        assert_eq!(full.modifications.len(), 1);
        assert_eq!(full.modifications[0].action, ModAction::Modify);
    }

    #[test]
    fn test_section_input_uses_classified_sets_for_experience_and_projects() {
        let source: CvDocument = serde_json::from_value(json!({
            "summary": {"text": "original"},
            "skills": {"languages": ["Rust"]},
            "experience": [{"name": "Acme"}, {"name": "Globex"}],
            "projects": [],
            "extras": [{"name": "CKA"}]
        }))
        .unwrap();
        let mut classified = apply_classification(&source, &Classification::default());
        classified.experiences.truncate(1);

        let experience_input = section_input(&source, &classified, Section::Experience);
        assert_eq!(experience_input.as_array().unwrap().len(), 1);

        assert_eq!(section_input(&source, &classified, Section::Summary)["text"], "original");
        assert_eq!(
            section_input(&source, &classified, Section::Extras),
            json!([{"name": "CKA"}])
        );
    }

    #[test]
    fn test_failed_outcome_reports_its_section() {
        let outcome = SubtaskOutcome::failed(
            SubtaskKind::BatchSkills,
            Section::Skills,
            "model exploded".to_string(),
        );
        assert!(!outcome.succeeded());
        assert_eq!(outcome.section, Section::Skills);
        assert!(outcome.content.is_none());
    }
}
