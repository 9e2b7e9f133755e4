// All LLM prompt constants for the generation pipeline.

use crate::models::cv::Section;

/// System prompt for posting extraction; enforces JSON-only output.
pub const EXTRACTION_SYSTEM: &str =
    "You are an expert job posting analyst. \
    Extract structured information from the raw text of a job posting page. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences. \
    Do NOT include explanations or apologies.";

/// Extraction prompt template. Replace `{page_text}` before sending.
pub const EXTRACTION_PROMPT_TEMPLATE: &str = r#"Extract the job posting from the following page text.

Return a JSON object with this EXACT schema (no extra fields):
{
  "title": "Senior Backend Engineer",
  "company": "Acme Corp",
  "description": "Concise summary of the role and its responsibilities",
  "skills": {
    "required": ["Rust", "PostgreSQL"],
    "nice_to_have": ["Kubernetes"]
  },
  "language": "en"
}

Rules:
- "title" is the job title only, without the company name or location.
- "company" is null if the page never names the employer.
- "description" is a faithful summary in the posting's own language, at most 5 sentences.
- "skills.required" lists explicit must-haves; "skills.nice_to_have" lists preferred extras.
- "language" is the ISO 639-1 code of the posting text ("en", "fr", "de", ...).
- Ignore navigation, cookie banners, and unrelated listings on the page.

PAGE TEXT:
{page_text}"#;

/// System prompt for experience/project classification.
pub const CLASSIFICATION_SYSTEM: &str =
    "You are an expert CV strategist deciding which parts of a CV serve a specific job posting. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences.";

/// Classification prompt template.
/// Replace: {experiences_json}, {projects_json}, {posting_json}
pub const CLASSIFICATION_PROMPT_TEMPLATE: &str = r#"Decide, for every experience and project below, whether it should be kept, removed, or (experiences only) moved to the projects section for this job posting.

Return a JSON object with this EXACT schema:
{
  "decisions": [
    {"target": "experience", "index": 0, "decision": "KEEP", "reason": "Directly relevant backend role"},
    {"target": "experience", "index": 2, "decision": "MOVE_TO_PROJECTS", "reason": "Side engagement, reads better as a project"},
    {"target": "project", "index": 1, "decision": "REMOVE", "reason": "Unrelated domain"}
  ]
}

Rules:
- "index" is the zero-based position in the list below. Never invent indices.
- "decision" is one of "KEEP", "REMOVE", "MOVE_TO_PROJECTS".
- "MOVE_TO_PROJECTS" is only valid for experiences.
- Omitting an item means KEEP.
- Every decision needs a one-sentence reason.

EXPERIENCES:
{experiences_json}

PROJECTS:
{projects_json}

JOB POSTING:
{posting_json}"#;

/// System prompt for section batch rewriting.
pub const BATCH_SYSTEM: &str =
    "You are an expert CV writer tailoring one section of a CV to a job posting. \
    Never invent employers, dates, degrees, or facts not present in the source content. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences.";

/// Section batch prompt template.
/// Replace: {section}, {section_guidance}, {content_json}, {posting_json}
pub const BATCH_PROMPT_TEMPLATE: &str = r#"Rewrite the "{section}" section of a CV so it speaks to the job posting below, and report every modification you make.

{section_guidance}

Return a JSON object with this EXACT schema:
{
  "content": <the rewritten section, same shape as the source content>,
  "modifications": [
    {"action": "modify", "name": "Acme Corp", "reason": "Emphasized backend scope"},
    {"action": "add", "skill": "Rust", "category": "languages", "reason": "Required by the posting"}
  ]
}

Rules:
- "content" must keep the source structure: a list stays a list, an object stays an object.
- Report one modification entry per item you add, remove, or materially rewrite.
- "action" is one of "add", "remove", "modify", "adjust_level", "keep".
- Identify items by "name" (or "skill" for skill entries); include "category" for skills.
- Never fabricate content; rephrasing and reordering the source is the only allowed change.

SOURCE CONTENT:
{content_json}

JOB POSTING:
{posting_json}"#;

/// Per-section guidance spliced into the batch prompt.
pub fn section_guidance(section: Section) -> &'static str {
    match section {
        Section::Experience => {
            "Lead with achievements matching the posting's responsibilities. \
            Keep every employer, title, and date exactly as in the source."
        }
        Section::Projects => {
            "Surface projects whose stack overlaps the posting's required skills. \
            Keep project names and technology lists factual."
        }
        Section::Skills => {
            "Order categories and skills so posting-relevant ones come first. \
            Only adjust a proficiency level when the source evidence supports it."
        }
        Section::Summary => {
            "Rewrite the summary to mirror the posting's vocabulary in 2-4 sentences. \
            Keep claims grounded in the rest of the CV."
        }
        Section::Extras => {
            "Keep certifications and awards verbatim; drop only entries with no \
            conceivable relevance to the posting."
        }
        // Languages and education are never batched; recomposition carries them.
        Section::Languages | Section::Education => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_carry_their_placeholders() {
        assert!(EXTRACTION_PROMPT_TEMPLATE.contains("{page_text}"));
        for placeholder in ["{experiences_json}", "{projects_json}", "{posting_json}"] {
            assert!(CLASSIFICATION_PROMPT_TEMPLATE.contains(placeholder));
        }
        for placeholder in ["{section}", "{section_guidance}", "{content_json}", "{posting_json}"] {
            assert!(BATCH_PROMPT_TEMPLATE.contains(placeholder));
        }
    }

    #[test]
    fn test_batched_sections_have_guidance() {
        for section in [
            Section::Experience,
            Section::Projects,
            Section::Skills,
            Section::Summary,
            Section::Extras,
        ] {
            assert!(!section_guidance(section).is_empty());
        }
    }
}
