//! Row types for generation requests, per-offer pipelines, and section subtasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::cv::Section;

/// Offer pipeline states. `failed` is reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfferStatus {
    Created,
    Extracting,
    Extracted,
    Classifying,
    Classified,
    Batching,
    Batched,
    Recomposing,
    Completed,
    Failed,
}

impl OfferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfferStatus::Created => "created",
            OfferStatus::Extracting => "extracting",
            OfferStatus::Extracted => "extracted",
            OfferStatus::Classifying => "classifying",
            OfferStatus::Classified => "classified",
            OfferStatus::Batching => "batching",
            OfferStatus::Batched => "batched",
            OfferStatus::Recomposing => "recomposing",
            OfferStatus::Completed => "completed",
            OfferStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OfferStatus::Completed | OfferStatus::Failed)
    }
}

/// One subtask row per pipeline phase or per content-section batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtaskKind {
    Extraction,
    Classification,
    BatchExperiences,
    BatchProjects,
    BatchSkills,
    BatchSummary,
    BatchExtras,
    Recomposition,
}

impl SubtaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubtaskKind::Extraction => "extraction",
            SubtaskKind::Classification => "classification",
            SubtaskKind::BatchExperiences => "batch_experiences",
            SubtaskKind::BatchProjects => "batch_projects",
            SubtaskKind::BatchSkills => "batch_skills",
            SubtaskKind::BatchSummary => "batch_summary",
            SubtaskKind::BatchExtras => "batch_extras",
            SubtaskKind::Recomposition => "recomposition",
        }
    }

    /// The content section a batch subtask rewrites, if it is one.
    pub fn section(&self) -> Option<Section> {
        match self {
            SubtaskKind::BatchExperiences => Some(Section::Experience),
            SubtaskKind::BatchProjects => Some(Section::Projects),
            SubtaskKind::BatchSkills => Some(Section::Skills),
            SubtaskKind::BatchSummary => Some(Section::Summary),
            SubtaskKind::BatchExtras => Some(Section::Extras),
            _ => None,
        }
    }

    /// The batch subtasks fanned out over a single offer, in display order.
    pub fn batch_kinds() -> [SubtaskKind; 5] {
        [
            SubtaskKind::BatchExperiences,
            SubtaskKind::BatchProjects,
            SubtaskKind::BatchSkills,
            SubtaskKind::BatchSummary,
            SubtaskKind::BatchExtras,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GenerationRequestRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub source_cv_id: Uuid,
    pub total_offers: i32,
    /// Incremented once per terminal offer, success or failure.
    pub completed_offers: i32,
    pub status: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GenerationOfferRow {
    pub id: Uuid,
    pub request_id: Uuid,
    pub owner_id: Uuid,
    pub offer_index: i32,
    pub source_url: String,
    pub job_posting_id: Option<Uuid>,
    pub status: String,
    /// Classification decision list, persisted verbatim before batching.
    pub classification: Option<Value>,
    pub generated_cv_id: Option<Uuid>,
    pub generated_filename: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GenerationSubtaskRow {
    pub id: Uuid,
    pub offer_id: Uuid,
    pub kind: String,
    pub status: String,
    pub output: Option<Value>,
    /// Raw modification list reported alongside the rewritten content.
    pub modifications: Option<Value>,
    pub model_used: Option<String>,
    pub prompt_tokens: Option<i32>,
    pub completion_tokens: Option<i32>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_status_terminality() {
        assert!(OfferStatus::Completed.is_terminal());
        assert!(OfferStatus::Failed.is_terminal());
        for status in [
            OfferStatus::Created,
            OfferStatus::Extracting,
            OfferStatus::Extracted,
            OfferStatus::Classifying,
            OfferStatus::Classified,
            OfferStatus::Batching,
            OfferStatus::Batched,
            OfferStatus::Recomposing,
        ] {
            assert!(!status.is_terminal(), "{} must be non-terminal", status.as_str());
        }
    }

    #[test]
    fn test_batch_kinds_cover_all_content_sections() {
        let sections: Vec<Section> = SubtaskKind::batch_kinds()
            .iter()
            .filter_map(|k| k.section())
            .collect();
        assert_eq!(
            sections,
            vec![
                Section::Experience,
                Section::Projects,
                Section::Skills,
                Section::Summary,
                Section::Extras,
            ]
        );
        assert_eq!(SubtaskKind::Extraction.section(), None);
        assert_eq!(SubtaskKind::Recomposition.section(), None);
    }
}
