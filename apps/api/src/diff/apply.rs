//! Modification Applier: pure document patching.
//!
//! `apply_patches` deep-copies the source document and applies each patch in
//! order. It never mutates its input and never fails as a whole: a patch that
//! cannot apply (missing target, wrong shape, unknown op) is logged and
//! skipped, and the remaining patches still run.
//!
//! Two patch generations coexist on the wire: coarse whole-section
//! replacement and granular per-item ops. Both deserialize into
//! `DocumentPatch`; ops from newer clients we do not understand land in
//! `Unknown` via `#[serde(other)]`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::diff::levels::normalize_level;
use crate::models::cv::{item_name, names_match, CvDocument, Section};

/// How a granular patch addresses an item. Name wins when both are present
/// and is matched case-insensitively; index is the positional fallback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemRef {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub index: Option<usize>,
}

impl ItemRef {
    pub fn by_name(name: impl Into<String>) -> Self {
        ItemRef {
            name: Some(name.into()),
            index: None,
        }
    }

    pub fn by_index(index: usize) -> Self {
        ItemRef {
            name: None,
            index: Some(index),
        }
    }

    fn resolve(&self, items: &[Value]) -> Option<usize> {
        if let Some(wanted) = self.name.as_deref() {
            let found = items
                .iter()
                .position(|item| item_name(item).is_some_and(|n| names_match(n, wanted)));
            if found.is_some() {
                return found;
            }
        }
        self.index.filter(|i| *i < items.len())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DocumentPatch {
    /// Coarse generation: replace a whole section.
    ReplaceSection { section: Section, content: Value },
    /// Granular generation: single-item ops.
    AddItem { section: Section, item: Value },
    RemoveItem { section: Section, target: ItemRef },
    ModifyItem {
        section: Section,
        target: ItemRef,
        fields: Map<String, Value>,
    },
    SetSkillLevel {
        category: String,
        name: String,
        level: Value,
    },
    /// Anything from a newer schema generation. Logged and skipped.
    #[serde(other)]
    Unknown,
}

/// Applies every patch to a deep copy of the document. Infallible by design;
/// inapplicable patches are skipped with a warning.
pub fn apply_patches(document: &CvDocument, patches: &[DocumentPatch]) -> CvDocument {
    let mut result = document.clone();

    for patch in patches {
        match patch {
            DocumentPatch::ReplaceSection { section, content } => {
                replace_section(&mut result, *section, content);
            }
            DocumentPatch::AddItem { section, item } => {
                add_item(&mut result, *section, item);
            }
            DocumentPatch::RemoveItem { section, target } => {
                remove_item(&mut result, *section, target);
            }
            DocumentPatch::ModifyItem {
                section,
                target,
                fields,
            } => {
                modify_item(&mut result, *section, target, fields);
            }
            DocumentPatch::SetSkillLevel {
                category,
                name,
                level,
            } => {
                set_skill_level(&mut result, category, name, level);
            }
            DocumentPatch::Unknown => {
                warn!("Skipping patch with unknown op");
            }
        }
    }

    result
}

fn replace_section(doc: &mut CvDocument, section: Section, content: &Value) {
    match section {
        Section::Summary => doc.summary = content.clone(),
        Section::Skills => doc.skills = content.clone(),
        _ => match content {
            Value::Array(items) => {
                if let Some(list) = doc.list_section_mut(section) {
                    *list = items.clone();
                }
            }
            _ => warn!("Skipping replace of {section}: content is not a list"),
        },
    }
}

fn add_item(doc: &mut CvDocument, section: Section, item: &Value) {
    let Some(list) = doc.list_section_mut(section) else {
        warn!("Skipping add in {section}: not an item section");
        return;
    };
    // Dedup by identity so replayed modification lists stay idempotent.
    if let Some(new_name) = item_name(item) {
        let exists = list
            .iter()
            .any(|existing| item_name(existing).is_some_and(|n| names_match(n, new_name)));
        if exists {
            return;
        }
    }
    list.push(item.clone());
}

fn remove_item(doc: &mut CvDocument, section: Section, target: &ItemRef) {
    let Some(list) = doc.list_section_mut(section) else {
        warn!("Skipping remove in {section}: not an item section");
        return;
    };
    match target.resolve(list) {
        Some(index) => {
            list.remove(index);
        }
        None => warn!("Skipping remove in {section}: target not found"),
    }
}

fn modify_item(doc: &mut CvDocument, section: Section, target: &ItemRef, fields: &Map<String, Value>) {
    let Some(list) = doc.list_section_mut(section) else {
        warn!("Skipping modify in {section}: not an item section");
        return;
    };
    let Some(index) = target.resolve(list) else {
        warn!("Skipping modify in {section}: target not found");
        return;
    };
    let Value::Object(item) = &mut list[index] else {
        warn!("Skipping modify in {section}: target item is not an object");
        return;
    };

    for (field, value) in fields {
        if let Some(diff) = as_field_diff(value) {
            apply_field_diff(item, field, diff);
        } else {
            item.insert(field.clone(), value.clone());
        }
    }
}

/// A field value shaped `{add?, remove?, update?}` is a list diff rather than
/// a direct assignment.
fn as_field_diff(value: &Value) -> Option<&Map<String, Value>> {
    let map = value.as_object()?;
    if map.is_empty() {
        return None;
    }
    map.keys()
        .all(|k| matches!(k.as_str(), "add" | "remove" | "update"))
        .then_some(map)
}

fn apply_field_diff(item: &mut Map<String, Value>, field: &str, diff: &Map<String, Value>) {
    let entries = match item.get_mut(field) {
        Some(Value::Array(entries)) => entries,
        Some(_) => {
            warn!("Skipping diff on field '{field}': not a list");
            return;
        }
        None => {
            item.insert(field.to_string(), Value::Array(Vec::new()));
            match item.get_mut(field) {
                Some(Value::Array(entries)) => entries,
                _ => return,
            }
        }
    };

    if let Some(Value::Array(to_remove)) = diff.get("remove") {
        for removal in to_remove {
            if let Some(name) = item_name(removal) {
                entries.retain(|e| !item_name(e).is_some_and(|n| names_match(n, name)));
            }
        }
    }

    if let Some(Value::Array(updates)) = diff.get("update") {
        for update in updates {
            let (Some(index), Some(value)) = (
                update.get("index").and_then(Value::as_u64),
                update.get("value"),
            ) else {
                warn!("Skipping malformed update entry on field '{field}'");
                continue;
            };
            let index = index as usize;
            if index < entries.len() {
                entries[index] = value.clone();
            } else {
                warn!("Skipping update on field '{field}': index {index} out of bounds");
            }
        }
    }

    if let Some(Value::Array(to_add)) = diff.get("add") {
        for addition in to_add {
            let duplicate = item_name(addition).is_some_and(|name| {
                entries
                    .iter()
                    .any(|e| item_name(e).is_some_and(|n| names_match(n, name)))
            });
            if !duplicate {
                entries.push(addition.clone());
            }
        }
    }
}

fn set_skill_level(doc: &mut CvDocument, category: &str, name: &str, level: &Value) {
    let Some(normalized) = normalize_level(level) else {
        warn!("Skipping level adjust for '{name}': unrecognized level {level}");
        return;
    };

    let Some(categories) = doc.skills.as_object_mut() else {
        warn!("Skipping level adjust for '{name}': skills section is not categorized");
        return;
    };
    let Some(Value::Array(entries)) = categories.get_mut(category) else {
        warn!("Skipping level adjust for '{name}': no '{category}' category");
        return;
    };

    let Some(entry) = entries
        .iter_mut()
        .find(|e| item_name(e).is_some_and(|n| names_match(n, name)))
    else {
        warn!("Skipping level adjust: '{name}' not found in '{category}'");
        return;
    };

    match entry {
        Value::Object(map) => {
            map.insert("level".to_string(), Value::from(normalized));
        }
        // Plain string skills gain structure the first time a level lands.
        Value::String(skill_name) => {
            *entry = serde_json::json!({ "name": skill_name, "level": normalized });
        }
        _ => warn!("Skipping level adjust: '{name}' has an unsupported shape"),
    }
}
