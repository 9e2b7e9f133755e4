//! Recomposition phase: assembles the final document from whatever the
//! section subtasks produced, falling back to classified source content where
//! a subtask failed. Classification decisions always land: a moved experience
//! reaches the projects section with its pre-transformation content even when
//! the projects subtask died.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::diff::apply::{apply_patches, DocumentPatch};
use crate::diff::normalizer::{normalize, ModAction, PendingChange, RawModification};
use crate::diff::review::save_pending_changes;
use crate::models::cv::{item_name, CvDocument, CvFileRow, Section};
use crate::models::generation::{GenerationOfferRow, SubtaskKind};
use crate::pipeline::batch::SubtaskOutcome;
use crate::pipeline::classify::{Classification, ClassifiedCv, Decision, DecisionTarget};
use crate::pipeline::extract::JobPosting;
use crate::pipeline::{complete_subtask, fail_subtask, start_subtask, PipelineContext};
use crate::storage::write_generated_cv;
use crate::tasks::scheduler::CancelSignal;

#[derive(Debug, Clone)]
pub struct RecomposedDocument {
    pub document: CvDocument,
    pub changes: Vec<PendingChange>,
    /// Sections that fell back to classified source content.
    pub sections_recovered: Vec<Section>,
}

#[derive(Debug, Clone)]
pub struct GeneratedCv {
    pub cv_file_id: Uuid,
    pub filename: String,
    pub change_count: usize,
}

/// Pure assembly. Fails only when zero section subtasks succeeded; any other
/// combination produces a best-effort document.
pub fn assemble_document(
    source: &CvDocument,
    classification: &Classification,
    classified: &ClassifiedCv,
    outcomes: &[SubtaskOutcome],
    posting: &JobPosting,
) -> Result<RecomposedDocument> {
    if !outcomes.iter().any(SubtaskOutcome::succeeded) {
        anyhow::bail!("no section subtask succeeded");
    }

    let mut patches = Vec::new();
    let mut sections_recovered = Vec::new();

    for outcome in outcomes {
        let section = outcome.section;
        match outcome.content.as_ref().filter(|c| section_shape_ok(section, c)) {
            Some(content) if outcome.succeeded() => {
                patches.push(DocumentPatch::ReplaceSection {
                    section,
                    content: content.clone(),
                });
            }
            _ => {
                if outcome.succeeded() {
                    warn!("Discarding malformed {section} content, keeping source");
                }
                sections_recovered.push(section);
                // Experiences and projects still need the classified sets so
                // removals and moves survive the subtask failure.
                match section {
                    Section::Experience => patches.push(DocumentPatch::ReplaceSection {
                        section,
                        content: Value::Array(classified.experiences.clone()),
                    }),
                    Section::Projects => patches.push(DocumentPatch::ReplaceSection {
                        section,
                        content: Value::Array(classified.projects.clone()),
                    }),
                    _ => {}
                }
            }
        }
    }

    // No subtask covers languages; derive them from posting mentions.
    patches.push(DocumentPatch::ReplaceSection {
        section: Section::Languages,
        content: Value::Array(derive_languages(&source.languages, posting)),
    });

    let mut document = apply_patches(source, &patches);

    if let Some(header) = document.header.as_object_mut() {
        header.insert("current_title".to_string(), json!(posting.title));
    }

    let mut changes = classification_changes(source, classification);
    for outcome in outcomes.iter().filter(|o| o.succeeded()) {
        changes.extend(normalize(&outcome.modifications, outcome.section));
    }
    let mut seen_keys = std::collections::HashSet::new();
    changes.retain(|c| seen_keys.insert(c.key.clone()));

    Ok(RecomposedDocument {
        document,
        changes,
        sections_recovered,
    })
}

/// A successful subtask still has to return content of the section's shape.
fn section_shape_ok(section: Section, content: &Value) -> bool {
    match section {
        Section::Skills => content.is_object(),
        Section::Summary => !content.is_null(),
        _ => content.is_array(),
    }
}

/// Pending changes derived from classification decisions, addressed by the
/// source item's label.
fn classification_changes(source: &CvDocument, classification: &Classification) -> Vec<PendingChange> {
    let raw: Vec<RawModification> = classification
        .decisions
        .iter()
        .filter(|d| d.target == DecisionTarget::Experience)
        .filter_map(|d| {
            let action = match d.decision {
                Decision::Remove => ModAction::RemoveExperience,
                Decision::MoveToProjects => ModAction::MoveToProjects,
                Decision::Keep => return None,
            };
            let item = source
                .experience
                .get(d.index)
                .and_then(item_name)
                .map(str::to_string);
            Some(RawModification {
                action,
                category: None,
                item,
                index: Some(d.index),
                field: None,
                reason: d.reason.clone(),
                before: source.experience.get(d.index).cloned(),
                after: None,
            })
        })
        .collect();

    normalize(&raw, Section::Experience)
}

/// Languages named by the posting surface first; relative order is otherwise
/// preserved. Purely textual, no model call.
pub fn derive_languages(languages: &[Value], posting: &JobPosting) -> Vec<Value> {
    let haystack = format!(
        "{} {} {}",
        posting.title,
        posting.description,
        posting
            .skills
            .required
            .iter()
            .chain(posting.skills.nice_to_have.iter())
            .cloned()
            .collect::<Vec<_>>()
            .join(" ")
    )
    .to_lowercase();

    let mentioned = |item: &Value| {
        item_name(item).is_some_and(|name| haystack.contains(&name.trim().to_lowercase()))
    };

    let mut ordered: Vec<Value> = languages.iter().filter(|l| mentioned(l)).cloned().collect();
    ordered.extend(languages.iter().filter(|l| !mentioned(l)).cloned());
    ordered
}

/// Derives the generated file's name from its source and the posting title.
/// `{base}_adapted_{slug}_{timestamp}_{suffix}.json`
pub fn derive_filename(
    source_filename: &str,
    posting_title: &str,
    now: DateTime<Utc>,
    suffix: &str,
) -> String {
    let base = source_filename
        .strip_suffix(".json")
        .unwrap_or(source_filename);
    let slug = slugify(posting_title, 30);
    format!(
        "{base}_adapted_{slug}_{}_{suffix}.json",
        now.format("%Y%m%d%H%M%S")
    )
}

fn slugify(text: &str, max_len: usize) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= max_len {
            break;
        }
    }
    slug.trim_matches('-').to_string()
}

fn random_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..4].to_string()
}

/// Runs the recomposition subtask: assemble, persist the document, persist
/// the normalized changes, and stamp the offer with the result.
#[allow(clippy::too_many_arguments)]
pub async fn execute_recomposition(
    ctx: &PipelineContext,
    offer: &GenerationOfferRow,
    source_file: &CvFileRow,
    source: &CvDocument,
    classification: &Classification,
    classified: &ClassifiedCv,
    outcomes: &[SubtaskOutcome],
    posting: &JobPosting,
    _signal: &CancelSignal,
) -> Result<GeneratedCv> {
    let subtask_id = start_subtask(&ctx.db, offer.id, SubtaskKind::Recomposition).await?;

    let result = async {
        let recomposed = assemble_document(source, classification, classified, outcomes, posting)?;

        let filename = derive_filename(
            &source_file.filename,
            &posting.title,
            Utc::now(),
            &random_suffix(),
        );
        let language = posting
            .language
            .as_deref()
            .or(source_file.language.as_deref());

        let cv_file_id = write_generated_cv(
            &ctx.db,
            offer.owner_id,
            &filename,
            &recomposed.document,
            language,
        )
        .await
        .context("persisting generated document")?;

        let persisted = save_pending_changes(&ctx.db, cv_file_id, &recomposed.changes).await?;

        sqlx::query(
            "UPDATE generation_offers SET generated_cv_id = $2, generated_filename = $3 WHERE id = $1",
        )
        .bind(offer.id)
        .bind(cv_file_id)
        .bind(&filename)
        .execute(&ctx.db)
        .await?;

        info!(
            "Recomposed offer {}: {} ({} changes, {} sections recovered)",
            offer.id,
            filename,
            persisted,
            recomposed.sections_recovered.len()
        );

        Ok::<_, anyhow::Error>((recomposed, cv_file_id, filename))
    }
    .await;

    match result {
        Ok((recomposed, cv_file_id, filename)) => {
            let output = json!({
                "cv_file_id": cv_file_id,
                "filename": filename,
                "changes": recomposed.changes.len(),
                "sections_recovered": recomposed.sections_recovered,
            });
            complete_subtask(&ctx.db, subtask_id, Some(&output), None, None, None).await?;
            Ok(GeneratedCv {
                cv_file_id,
                filename,
                change_count: recomposed.changes.len(),
            })
        }
        Err(e) => {
            fail_subtask(&ctx.db, subtask_id, &format!("{e:#}")).await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::normalizer::ChangeType;
    use crate::pipeline::classify::{apply_classification, ClassificationDecision};
    use crate::pipeline::extract::PostingSkills;

    fn source() -> CvDocument {
        serde_json::from_value(json!({
            "header": {"full_name": "Ada Lovelace", "current_title": "Engineer"},
            "summary": {"text": "Original summary"},
            "skills": {"languages": [{"name": "Rust", "level": 4}]},
            "experience": [
                {"title": "Backend Engineer", "company": "Acme", "description": "Built APIs"},
                {"title": "Side Consultant", "description": "Automation gigs"}
            ],
            "projects": [{"name": "Orrery", "summary": "Simulator"}],
            "languages": [
                {"name": "French", "level": 5},
                {"name": "English", "level": 4},
                {"name": "German", "level": 2}
            ]
        }))
        .unwrap()
    }

    fn posting() -> JobPosting {
        JobPosting {
            title: "Senior Rust Engineer".to_string(),
            company: Some("Initech".to_string()),
            description: "Backend role. English required, German a plus.".to_string(),
            skills: PostingSkills {
                required: vec!["Rust".to_string()],
                nice_to_have: vec![],
            },
            language: Some("en".to_string()),
        }
    }

    fn success(section: Section, content: Value) -> SubtaskOutcome {
        let kind = SubtaskKind::batch_kinds()
            .into_iter()
            .find(|k| k.section() == Some(section))
            .unwrap();
        SubtaskOutcome {
            kind,
            section,
            content: Some(content),
            modifications: Vec::new(),
            error: None,
        }
    }

    fn failure(section: Section) -> SubtaskOutcome {
        let kind = SubtaskKind::batch_kinds()
            .into_iter()
            .find(|k| k.section() == Some(section))
            .unwrap();
        SubtaskOutcome {
            kind,
            section,
            content: None,
            modifications: Vec::new(),
            error: Some("model exploded".to_string()),
        }
    }

    fn move_second_experience() -> Classification {
        Classification {
            decisions: vec![ClassificationDecision {
                target: DecisionTarget::Experience,
                index: 1,
                decision: Decision::MoveToProjects,
                reason: Some("reads better as a project".to_string()),
            }],
        }
    }

    #[test]
    fn test_all_failed_subtasks_fail_recomposition() {
        let src = source();
        let classification = Classification::default();
        let classified = apply_classification(&src, &classification);
        let outcomes = vec![failure(Section::Experience), failure(Section::Summary)];

        let result = assemble_document(&src, &classification, &classified, &outcomes, &posting());
        assert!(result.is_err());
    }

    #[test]
    fn test_successful_sections_replace_failed_ones_fall_back() {
        let src = source();
        let classification = Classification::default();
        let classified = apply_classification(&src, &classification);
        let outcomes = vec![
            success(Section::Summary, json!({"text": "Tailored summary"})),
            failure(Section::Skills),
        ];

        let recomposed =
            assemble_document(&src, &classification, &classified, &outcomes, &posting()).unwrap();

        assert_eq!(recomposed.document.summary["text"], "Tailored summary");
        // Failed skills subtask: source content stands.
        assert_eq!(recomposed.document.skills, src.skills);
        assert_eq!(recomposed.sections_recovered, vec![Section::Skills]);
    }

    #[test]
    fn test_moved_experience_lands_in_projects_even_when_projects_subtask_failed() {
        let src = source();
        let classification = move_second_experience();
        let classified = apply_classification(&src, &classification);
        let outcomes = vec![
            success(Section::Summary, json!({"text": "ok"})),
            failure(Section::Experience),
            failure(Section::Projects),
        ];

        let recomposed =
            assemble_document(&src, &classification, &classified, &outcomes, &posting()).unwrap();

        // Experience list shrank to the kept item.
        assert_eq!(recomposed.document.experience.len(), 1);
        // Moved item is present with its pre-transformation content.
        let moved = recomposed
            .document
            .projects
            .iter()
            .find(|p| p["origin"] == "experience")
            .unwrap();
        assert_eq!(moved["name"], "Side Consultant");
        assert_eq!(moved["summary"], "Automation gigs");

        // And the move is reported as a pending change.
        let change = recomposed
            .changes
            .iter()
            .find(|c| c.change_type == ChangeType::MovedToProjects)
            .unwrap();
        assert_eq!(change.item_name.as_deref(), Some("Side Consultant"));
    }

    #[test]
    fn test_malformed_successful_content_is_discarded() {
        let src = source();
        let classification = Classification::default();
        let classified = apply_classification(&src, &classification);
        let outcomes = vec![
            success(Section::Experience, json!({"not": "a list"})),
            success(Section::Summary, json!({"text": "ok"})),
        ];

        let recomposed =
            assemble_document(&src, &classification, &classified, &outcomes, &posting()).unwrap();
        // Classified (here: unchanged) experiences stand in for the bad content.
        assert_eq!(recomposed.document.experience, src.experience);
        assert!(recomposed.sections_recovered.contains(&Section::Experience));
    }

    #[test]
    fn test_header_title_comes_from_posting() {
        let src = source();
        let classification = Classification::default();
        let classified = apply_classification(&src, &classification);
        let outcomes = vec![success(Section::Summary, json!({"text": "ok"}))];

        let recomposed =
            assemble_document(&src, &classification, &classified, &outcomes, &posting()).unwrap();
        assert_eq!(recomposed.document.header["current_title"], "Senior Rust Engineer");
        assert_eq!(recomposed.document.header["full_name"], "Ada Lovelace");
    }

    #[test]
    fn test_languages_mentioned_by_posting_come_first() {
        let reordered = derive_languages(&source().languages, &posting());
        let names: Vec<&str> = reordered.iter().filter_map(item_name).collect();
        assert_eq!(names, vec!["English", "German", "French"]);
    }

    #[test]
    fn test_derive_filename_shape() {
        let now = DateTime::parse_from_rfc3339("2026-03-01T12:30:45Z")
            .unwrap()
            .with_timezone(&Utc);
        let name = derive_filename("ada_cv.json", "Senior Rust Engineer (m/f/d)", now, "ab12");
        assert_eq!(name, "ada_cv_adapted_senior-rust-engineer-m-f-d_20260301123045_ab12.json");
    }

    #[test]
    fn test_slugify_truncates_and_trims() {
        let slug = slugify("A very long posting title that keeps going and going", 30);
        assert!(slug.len() <= 30);
        assert!(!slug.ends_with('-'));
        assert_eq!(slugify("C++ / Rust!!", 30), "c-rust");
    }
}
