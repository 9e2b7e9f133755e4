//! Proficiency level normalization.
//!
//! Source documents and model output carry levels in several shapes: plain
//! integers, floats, numeric strings, and free text ("advanced", "fluent").
//! Everything collapses to the canonical 0..=5 integer scale.

use serde_json::Value;

pub const MIN_LEVEL: u8 = 0;
pub const MAX_LEVEL: u8 = 5;

/// Normalizes any supported level representation to 0..=5.
/// Returns None for shapes that cannot be interpreted.
pub fn normalize_level(raw: &Value) -> Option<u8> {
    match raw {
        Value::Number(n) => n.as_f64().map(clamp_to_scale),
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(n) = trimmed.parse::<f64>() {
                return Some(clamp_to_scale(n));
            }
            level_from_text(trimmed)
        }
        _ => None,
    }
}

fn clamp_to_scale(n: f64) -> u8 {
    let rounded = n.round();
    if rounded <= MIN_LEVEL as f64 {
        MIN_LEVEL
    } else if rounded >= MAX_LEVEL as f64 {
        MAX_LEVEL
    } else {
        rounded as u8
    }
}

fn level_from_text(text: &str) -> Option<u8> {
    let lower = text.to_ascii_lowercase();
    let level = match lower.as_str() {
        "none" => 0,
        "beginner" | "basic" | "novice" | "notions" => 1,
        "elementary" | "limited" => 2,
        "intermediate" | "conversational" | "working" | "good" => 3,
        "advanced" | "fluent" | "proficient" | "very good" => 4,
        "expert" | "native" | "bilingual" | "master" => 5,
        _ => return None,
    };
    Some(level)
}

/// Canonical display label for a normalized level.
pub fn level_label(level: u8) -> &'static str {
    match level.min(MAX_LEVEL) {
        0 => "none",
        1 => "beginner",
        2 => "elementary",
        3 => "intermediate",
        4 => "advanced",
        _ => "expert",
    }
}
