//! Strict checks on single detection entries from the idiom detector.
//!
//! Model output is untrusted: every field is type-checked and anything
//! unexpected is a `Validation` error for that entry alone.

use crate::error::AppError;
use serde_json::Value;

pub const CORRECTION_PREFIX: &str = "原字幕:";

/// One well-formed detection, before timestamp resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionEntry {
    /// Canonical (corrected) idiom text.
    pub idiom_text: String,
    /// Global transcript sentence index.
    pub sentence_index: usize,
    /// Text as it appeared in the transcript, when it differs.
    pub raw_text: Option<String>,
    pub correction_note: Option<String>,
    /// Episode the detector claims, if it echoed one back.
    pub episode_number: Option<i64>,
}

/// CJK unified ideographs (basic block and extension A) plus the
/// compatibility block.
pub fn is_cjk_ideograph(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0xF900..=0xFAFF)
}

pub fn validate_idiom_text(text: &str, lengths: &[usize]) -> Result<(), AppError> {
    if text.is_empty() {
        return Err(AppError::Validation("empty idiom text".into()));
    }
    if let Some(c) = text.chars().find(|c| !is_cjk_ideograph(*c)) {
        return Err(AppError::Validation(format!(
            "idiom {:?} contains non-ideograph {:?}",
            text, c
        )));
    }
    let len = text.chars().count();
    if !lengths.contains(&len) {
        return Err(AppError::Validation(format!(
            "idiom {:?} has {} characters, expected one of {:?}",
            text, len, lengths
        )));
    }
    Ok(())
}

fn string_field<'a>(obj: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Result<Option<&'a str>, AppError> {
    for key in keys {
        match obj.get(*key) {
            None | Some(Value::Null) => continue,
            Some(Value::String(s)) => return Ok(Some(s.trim())),
            Some(other) => {
                return Err(AppError::Validation(format!(
                    "field {:?} must be a string, got {}",
                    key, other
                )))
            }
        }
    }
    Ok(None)
}

fn integer_field(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Result<Option<i64>, AppError> {
    for key in keys {
        match obj.get(*key) {
            None | Some(Value::Null) => continue,
            Some(Value::Number(n)) => {
                return n
                    .as_i64()
                    .map(Some)
                    .ok_or_else(|| AppError::Validation(format!("field {:?} must be an integer, got {}", key, n)))
            }
            Some(other) => {
                return Err(AppError::Validation(format!(
                    "field {:?} must be an integer, got {}",
                    key, other
                )))
            }
        }
    }
    Ok(None)
}

/// Parse and validate one entry. Accepts the detector's
/// `{"word", "original", "index"}` shape as well as explicit
/// `idiom_text` / `timestamp_index` / `correction_note` fields.
pub fn parse_entry(value: &Value, lengths: &[usize]) -> Result<DetectionEntry, AppError> {
    let obj = value
        .as_object()
        .ok_or_else(|| AppError::Validation(format!("entry is not an object: {}", value)))?;

    let idiom_text = string_field(obj, &["word", "idiom_text", "idiom"])?
        .ok_or_else(|| AppError::Validation("missing idiom text".into()))?
        .to_string();
    validate_idiom_text(&idiom_text, lengths)?;

    let index = integer_field(obj, &["index", "timestamp_index", "sentence_index"])?
        .ok_or_else(|| AppError::Validation("missing sentence index".into()))?;
    let sentence_index = usize::try_from(index)
        .map_err(|_| AppError::Validation(format!("negative sentence index {}", index)))?;

    let episode_number = integer_field(obj, &["episode_number", "episode"])?;

    let original = string_field(obj, &["original"])?
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let note = string_field(obj, &["correction_note"])?
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    // A note of the form 原字幕:<raw> also names the raw text
    let raw_from_note = note
        .as_deref()
        .and_then(|n| n.strip_prefix(CORRECTION_PREFIX))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let raw_text = original.or(raw_from_note).filter(|raw| *raw != idiom_text);
    let correction_note = match (&note, &raw_text) {
        (Some(n), _) => Some(n.clone()),
        (None, Some(raw)) => Some(format!("{}{}", CORRECTION_PREFIX, raw)),
        (None, None) => None,
    };

    Ok(DetectionEntry {
        idiom_text,
        sentence_index,
        raw_text,
        correction_note,
        episode_number,
    })
}
