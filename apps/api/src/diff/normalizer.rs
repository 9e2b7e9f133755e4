//! Changeset Normalizer: turns the raw modification lists reported by batch
//! subtasks into review-ready pending changes.
//!
//! Change ids are deterministic (`section:identity:change_type`), so
//! re-normalizing the same raw list produces the same set and persistence can
//! rely on conflict-free re-inserts.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tracing::warn;

use crate::models::cv::{names_match, Section};

/// Actions a batch subtask may report. The wire format is an open string
/// set; anything unrecognized lands in `Unknown` and is skipped with a log,
/// never silently string-compared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModAction {
    Add,
    Remove,
    Modify,
    AdjustLevel,
    MoveToProjects,
    RemoveExperience,
    Keep,
    Unknown(String),
}

impl ModAction {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "add" | "added" => ModAction::Add,
            "remove" | "removed" | "delete" => ModAction::Remove,
            "modify" | "modified" | "update" | "updated" => ModAction::Modify,
            "adjust_level" | "level_adjusted" | "adjust-level" => ModAction::AdjustLevel,
            "move_to_projects" | "moved_to_projects" => ModAction::MoveToProjects,
            "remove_experience" | "experience_removed" => ModAction::RemoveExperience,
            "keep" | "kept" => ModAction::Keep,
            _ => ModAction::Unknown(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ModAction::Add => "add",
            ModAction::Remove => "remove",
            ModAction::Modify => "modify",
            ModAction::AdjustLevel => "adjust_level",
            ModAction::MoveToProjects => "move_to_projects",
            ModAction::RemoveExperience => "remove_experience",
            ModAction::Keep => "keep",
            ModAction::Unknown(raw) => raw.as_str(),
        }
    }

    /// The change type this action maps to. Keep and Unknown produce none.
    pub fn change_type(&self) -> Option<ChangeType> {
        match self {
            ModAction::Add => Some(ChangeType::Added),
            ModAction::Remove => Some(ChangeType::Removed),
            ModAction::Modify => Some(ChangeType::Modified),
            ModAction::AdjustLevel => Some(ChangeType::LevelAdjusted),
            ModAction::MoveToProjects => Some(ChangeType::MovedToProjects),
            ModAction::RemoveExperience => Some(ChangeType::ExperienceRemoved),
            ModAction::Keep | ModAction::Unknown(_) => None,
        }
    }
}

impl Serialize for ModAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ModAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(ModAction::parse(&raw))
    }
}

/// One modification as reported on the wire by a batch subtask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawModification {
    pub action: ModAction,
    #[serde(default)]
    pub category: Option<String>,
    /// Item label. Batches use `skill` for skill entries and `name` elsewhere.
    #[serde(default, alias = "skill", alias = "name", alias = "label")]
    pub item: Option<String>,
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub before: Option<Value>,
    #[serde(default)]
    pub after: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Modified,
    Removed,
    MovedToProjects,
    LevelAdjusted,
    ExperienceRemoved,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Added => "added",
            ChangeType::Modified => "modified",
            ChangeType::Removed => "removed",
            ChangeType::MovedToProjects => "moved_to_projects",
            ChangeType::LevelAdjusted => "level_adjusted",
            ChangeType::ExperienceRemoved => "experience_removed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "added" => Some(ChangeType::Added),
            "modified" => Some(ChangeType::Modified),
            "removed" => Some(ChangeType::Removed),
            "moved_to_projects" => Some(ChangeType::MovedToProjects),
            "level_adjusted" => Some(ChangeType::LevelAdjusted),
            "experience_removed" => Some(ChangeType::ExperienceRemoved),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Pending,
    Accepted,
    Rejected,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Pending => "pending",
            ChangeStatus::Accepted => "accepted",
            ChangeStatus::Rejected => "rejected",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(ChangeStatus::Pending),
            "accepted" => Some(ChangeStatus::Accepted),
            "rejected" => Some(ChangeStatus::Rejected),
            _ => None,
        }
    }
}

/// A review-ready change. `key` is deterministic for a given raw list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    pub key: String,
    pub section: Section,
    pub change_type: ChangeType,
    pub status: ChangeStatus,
    pub category: Option<String>,
    pub item_name: Option<String>,
    pub item_index: Option<usize>,
    pub field: Option<String>,
    pub reason: Option<String>,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// Identity an item is addressed by: label when present, else index.
fn identity(raw: &RawModification) -> String {
    match (&raw.item, raw.index) {
        (Some(label), _) if !label.trim().is_empty() => label.trim().to_ascii_lowercase(),
        (_, Some(index)) => format!("#{index}"),
        _ => "section".to_string(),
    }
}

/// Maps raw modifications for one section to pending changes. Keeps are
/// dropped, unknown actions are logged and skipped, duplicate identities
/// collapse to the first occurrence.
pub fn normalize(raw_mods: &[RawModification], section: Section) -> Vec<PendingChange> {
    let mut seen: BTreeMap<String, ()> = BTreeMap::new();
    let mut changes = Vec::new();

    for raw in raw_mods {
        let change_type = match raw.action.change_type() {
            Some(ct) => ct,
            None => {
                if let ModAction::Unknown(action) = &raw.action {
                    warn!(
                        "Skipping modification with unknown action '{action}' in {section} section"
                    );
                }
                continue;
            }
        };

        let key = format!("{}:{}:{}", section.as_str(), identity(raw), change_type.as_str());
        if seen.insert(key.clone(), ()).is_some() {
            continue;
        }

        changes.push(PendingChange {
            key,
            section,
            change_type,
            status: ChangeStatus::Pending,
            category: raw.category.clone(),
            item_name: raw.item.as_deref().map(|s| s.trim().to_string()),
            item_index: raw.index,
            field: raw.field.clone(),
            reason: raw.reason.clone(),
            before: raw.before.clone(),
            after: raw.after.clone(),
        });
    }

    changes
}

// ── Read surface: pure filters over normalized changes ──────────────────────

pub fn by_section_and_status<'a>(
    changes: &'a [PendingChange],
    section: Section,
    status: ChangeStatus,
) -> Vec<&'a PendingChange> {
    changes
        .iter()
        .filter(|c| c.section == section && c.status == status)
        .collect()
}

pub fn by_item<'a>(changes: &'a [PendingChange], item: &str) -> Vec<&'a PendingChange> {
    changes
        .iter()
        .filter(|c| c.item_name.as_deref().is_some_and(|n| names_match(n, item)))
        .collect()
}

pub fn grouped_by_type<'a>(
    changes: &'a [PendingChange],
    section: Section,
) -> BTreeMap<&'static str, Vec<&'a PendingChange>> {
    let mut groups: BTreeMap<&'static str, Vec<&'a PendingChange>> = BTreeMap::new();
    for change in changes.iter().filter(|c| c.section == section) {
        groups.entry(change.change_type.as_str()).or_default().push(change);
    }
    groups
}
