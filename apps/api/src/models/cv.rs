//! Sectioned CV document shape plus item-identity helpers.
//!
//! Section items stay loosely typed (`serde_json::Value`): the product's CV
//! schema evolves client-side and the pipeline only addresses items by name
//! or index, never by full shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// Content sections of a CV document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Section {
    Summary,
    Skills,
    Experience,
    Projects,
    Education,
    Languages,
    Extras,
}

impl Section {
    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Summary => "summary",
            Section::Skills => "skills",
            Section::Experience => "experience",
            Section::Projects => "projects",
            Section::Education => "education",
            Section::Languages => "languages",
            Section::Extras => "extras",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "summary" => Some(Section::Summary),
            "skills" => Some(Section::Skills),
            "experience" => Some(Section::Experience),
            "projects" => Some(Section::Projects),
            "education" => Some(Section::Education),
            "languages" => Some(Section::Languages),
            "extras" => Some(Section::Extras),
            _ => None,
        }
    }

    /// Sections whose content is a list of items. Summary and skills carry
    /// free-form structures instead.
    pub fn is_list(&self) -> bool {
        !matches!(self, Section::Summary | Section::Skills)
    }
}

impl std::fmt::Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The full document. Unknown top-level keys survive round trips via `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CvDocument {
    #[serde(default)]
    pub header: Value,
    #[serde(default)]
    pub summary: Value,
    /// Map of category name to skill item list.
    #[serde(default)]
    pub skills: Value,
    #[serde(default)]
    pub experience: Vec<Value>,
    #[serde(default)]
    pub projects: Vec<Value>,
    #[serde(default)]
    pub education: Vec<Value>,
    #[serde(default)]
    pub languages: Vec<Value>,
    #[serde(default)]
    pub extras: Vec<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl CvDocument {
    pub fn list_section(&self, section: Section) -> Option<&Vec<Value>> {
        match section {
            Section::Experience => Some(&self.experience),
            Section::Projects => Some(&self.projects),
            Section::Education => Some(&self.education),
            Section::Languages => Some(&self.languages),
            Section::Extras => Some(&self.extras),
            Section::Summary | Section::Skills => None,
        }
    }

    pub fn list_section_mut(&mut self, section: Section) -> Option<&mut Vec<Value>> {
        match section {
            Section::Experience => Some(&mut self.experience),
            Section::Projects => Some(&mut self.projects),
            Section::Education => Some(&mut self.education),
            Section::Languages => Some(&mut self.languages),
            Section::Extras => Some(&mut self.extras),
            Section::Summary | Section::Skills => None,
        }
    }
}

/// Item identity: the label a modification addresses an item by.
/// Plain strings identify themselves; objects try name, title, then label.
pub fn item_name(item: &Value) -> Option<&str> {
    match item {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => ["name", "title", "label"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str)),
        _ => None,
    }
}

/// Case-insensitive, whitespace-trimmed label comparison.
pub fn names_match(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CvFileRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub filename: String,
    pub content: Value,
    pub language: Option<String>,
    /// Producer tag, e.g. "generation" for pipeline output.
    pub created_by: Option<String>,
    /// External in-progress marker. `idle` unless a pipeline holds the file.
    pub processing_status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CvFileRow {
    pub fn document(&self) -> Result<CvDocument, serde_json::Error> {
        serde_json::from_value(self.content.clone())
    }
}
