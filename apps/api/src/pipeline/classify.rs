//! Classification phase: keep / remove / move-to-projects decisions over the
//! source experiences and projects, persisted verbatim on the offer before
//! any section batch runs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::models::cv::CvDocument;
use crate::models::generation::{GenerationOfferRow, SubtaskKind};
use crate::pipeline::prompts::{CLASSIFICATION_PROMPT_TEMPLATE, CLASSIFICATION_SYSTEM};
use crate::pipeline::{complete_subtask, fail_subtask, start_subtask, PipelineContext};
use crate::settings::ModelRole;
use crate::tasks::scheduler::CancelSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Keep,
    Remove,
    MoveToProjects,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionTarget {
    Experience,
    Project,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationDecision {
    pub target: DecisionTarget,
    pub index: usize,
    pub decision: Decision,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Classification {
    pub decisions: Vec<ClassificationDecision>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassificationStats {
    pub kept_experiences: usize,
    pub removed_experiences: usize,
    pub moved_to_projects: usize,
    pub kept_projects: usize,
    pub removed_projects: usize,
    pub invalid_decisions: usize,
}

/// The classified item sets recomposition builds on. Moved experiences are
/// converted to project shape carrying their pre-transformation content.
#[derive(Debug, Clone)]
pub struct ClassifiedCv {
    pub experiences: Vec<Value>,
    pub projects: Vec<Value>,
    pub stats: ClassificationStats,
}

/// Pure application of a decision list to the source item sets. Items without
/// a decision are kept; decisions with out-of-bounds indices or an illegal
/// move on a project are counted and skipped.
pub fn apply_classification(source: &CvDocument, classification: &Classification) -> ClassifiedCv {
    let mut stats = ClassificationStats::default();

    let mut experience_decisions = vec![Decision::Keep; source.experience.len()];
    let mut project_decisions = vec![Decision::Keep; source.projects.len()];

    for decision in &classification.decisions {
        let slot = match decision.target {
            DecisionTarget::Experience => experience_decisions.get_mut(decision.index),
            DecisionTarget::Project => project_decisions.get_mut(decision.index),
        };
        let Some(slot) = slot else {
            warn!(
                "Skipping classification decision with out-of-bounds index {} for {:?}",
                decision.index, decision.target
            );
            stats.invalid_decisions += 1;
            continue;
        };
        if decision.target == DecisionTarget::Project && decision.decision == Decision::MoveToProjects {
            warn!("Skipping MOVE_TO_PROJECTS on a project at index {}", decision.index);
            stats.invalid_decisions += 1;
            continue;
        }
        *slot = decision.decision;
    }

    let mut experiences = Vec::new();
    let mut moved = Vec::new();
    for (item, decision) in source.experience.iter().zip(&experience_decisions) {
        match decision {
            Decision::Keep => {
                stats.kept_experiences += 1;
                experiences.push(item.clone());
            }
            Decision::Remove => stats.removed_experiences += 1,
            Decision::MoveToProjects => {
                stats.moved_to_projects += 1;
                moved.push(experience_to_project(item));
            }
        }
    }

    let mut projects = Vec::new();
    for (item, decision) in source.projects.iter().zip(&project_decisions) {
        match decision {
            Decision::Remove => stats.removed_projects += 1,
            _ => {
                stats.kept_projects += 1;
                projects.push(item.clone());
            }
        }
    }
    projects.extend(moved);

    ClassifiedCv {
        experiences,
        projects,
        stats,
    }
}

/// Converts an experience item to project shape, keeping the original
/// descriptive content rather than re-generating it.
pub fn experience_to_project(experience: &Value) -> Value {
    let get = |key: &str| experience.get(key).cloned().unwrap_or(Value::Null);

    let name = match (
        experience.get("title").and_then(Value::as_str),
        experience.get("company").and_then(Value::as_str),
    ) {
        (Some(title), Some(company)) => json!(format!("{title} ({company})")),
        (Some(title), None) => json!(title),
        (None, Some(company)) => json!(company),
        (None, None) => get("name"),
    };

    let summary = match experience.get("description") {
        Some(Value::String(d)) if !d.is_empty() => json!(d),
        _ => get("responsibilities"),
    };

    json!({
        "name": name,
        "summary": summary,
        "tech_stack": get("skills_used"),
        "period": get("period"),
        "origin": "experience"
    })
}

/// Runs the classification subtask and persists the decision list verbatim on
/// the offer row.
pub async fn execute_classification(
    ctx: &PipelineContext,
    offer: &GenerationOfferRow,
    source: &CvDocument,
    posting_json: &Value,
    signal: &CancelSignal,
) -> Result<Classification> {
    let subtask_id = start_subtask(&ctx.db, offer.id, SubtaskKind::Classification).await?;

    match classify_inner(ctx, offer, source, posting_json, signal).await {
        Ok((classification, model, usage)) => {
            let output = serde_json::to_value(&classification)?;
            complete_subtask(&ctx.db, subtask_id, Some(&output), None, Some(&model), Some(usage))
                .await?;

            sqlx::query("UPDATE generation_offers SET classification = $2 WHERE id = $1")
                .bind(offer.id)
                .bind(&output)
                .execute(&ctx.db)
                .await?;

            Ok(classification)
        }
        Err(e) => {
            fail_subtask(&ctx.db, subtask_id, &format!("{e:#}")).await;
            Err(e)
        }
    }
}

async fn classify_inner(
    ctx: &PipelineContext,
    offer: &GenerationOfferRow,
    source: &CvDocument,
    posting_json: &Value,
    signal: &CancelSignal,
) -> Result<(Classification, String, crate::llm_client::Usage)> {
    let prompt = CLASSIFICATION_PROMPT_TEMPLATE
        .replace("{experiences_json}", &serde_json::to_string_pretty(&source.experience)?)
        .replace("{projects_json}", &serde_json::to_string_pretty(&source.projects)?)
        .replace("{posting_json}", &serde_json::to_string_pretty(posting_json)?);

    let model = ctx.settings.model_for(ModelRole::Classification).await;
    let (classification, usage): (Classification, _) = ctx
        .llm
        .call_json(&model, &prompt, CLASSIFICATION_SYSTEM, signal)
        .await
        .with_context(|| format!("classifying items for offer {}", offer.id))?;

    Ok((classification, model, usage))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> CvDocument {
        serde_json::from_value(json!({
            "experience": [
                {"title": "Backend Engineer", "company": "Acme",
                 "description": "Built APIs", "skills_used": ["Rust"]},
                {"title": "Intern", "company": "Globex", "description": "Support work"},
                {"title": "Freelance Consultant", "description": "Side automation gigs",
                 "skills_used": ["Python"]}
            ],
            "projects": [
                {"name": "Orrery", "summary": "Planet simulator"},
                {"name": "Old Blog", "summary": "Abandoned"}
            ]
        }))
        .unwrap()
    }

    fn decision(
        target: DecisionTarget,
        index: usize,
        decision: Decision,
    ) -> ClassificationDecision {
        ClassificationDecision {
            target,
            index,
            decision,
            reason: Some("because".to_string()),
        }
    }

    #[test]
    fn test_decision_wire_format_is_uppercase() {
        let parsed: ClassificationDecision = serde_json::from_value(json!({
            "target": "experience",
            "index": 1,
            "decision": "MOVE_TO_PROJECTS"
        }))
        .unwrap();
        assert_eq!(parsed.decision, Decision::MoveToProjects);
        assert_eq!(parsed.target, DecisionTarget::Experience);
    }

    #[test]
    fn test_unlisted_items_default_to_keep() {
        let classified = apply_classification(&source(), &Classification::default());
        assert_eq!(classified.experiences.len(), 3);
        assert_eq!(classified.projects.len(), 2);
        assert_eq!(classified.stats.kept_experiences, 3);
        assert_eq!(classified.stats.invalid_decisions, 0);
    }

    #[test]
    fn test_remove_and_move_decisions_apply() {
        let classification = Classification {
            decisions: vec![
                decision(DecisionTarget::Experience, 1, Decision::Remove),
                decision(DecisionTarget::Experience, 2, Decision::MoveToProjects),
                decision(DecisionTarget::Project, 1, Decision::Remove),
            ],
        };
        let classified = apply_classification(&source(), &classification);

        assert_eq!(classified.experiences.len(), 1);
        assert_eq!(classified.experiences[0]["company"], "Acme");

        // Kept project plus the moved experience, in that order.
        assert_eq!(classified.projects.len(), 2);
        assert_eq!(classified.projects[0]["name"], "Orrery");
        assert_eq!(classified.projects[1]["name"], "Freelance Consultant");
        assert_eq!(classified.projects[1]["origin"], "experience");

        assert_eq!(classified.stats.removed_experiences, 1);
        assert_eq!(classified.stats.moved_to_projects, 1);
        assert_eq!(classified.stats.removed_projects, 1);
    }

    #[test]
    fn test_invalid_decisions_are_counted_and_skipped() {
        let classification = Classification {
            decisions: vec![
                decision(DecisionTarget::Experience, 99, Decision::Remove),
                decision(DecisionTarget::Project, 0, Decision::MoveToProjects),
            ],
        };
        let classified = apply_classification(&source(), &classification);
        assert_eq!(classified.stats.invalid_decisions, 2);
        assert_eq!(classified.experiences.len(), 3);
        assert_eq!(classified.projects.len(), 2);
    }

    #[test]
    fn test_experience_to_project_carries_source_content() {
        let experience = json!({
            "title": "Backend Engineer",
            "company": "Acme",
            "description": "Built the billing API",
            "skills_used": ["Rust", "PostgreSQL"],
            "period": "2021-2023"
        });
        let project = experience_to_project(&experience);
        assert_eq!(project["name"], "Backend Engineer (Acme)");
        assert_eq!(project["summary"], "Built the billing API");
        assert_eq!(project["tech_stack"], json!(["Rust", "PostgreSQL"]));
        assert_eq!(project["period"], "2021-2023");
    }

    #[test]
    fn test_experience_to_project_falls_back_to_responsibilities() {
        let experience = json!({
            "title": "Engineer",
            "responsibilities": ["Ran deployments", "On-call"]
        });
        let project = experience_to_project(&experience);
        assert_eq!(project["name"], "Engineer");
        assert_eq!(project["summary"], json!(["Ran deployments", "On-call"]));
    }
}
