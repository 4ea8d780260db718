use crate::error::AppError;
use crate::transcript::TranscriptSentence;
use serde_json::Value;

/// A bounded run of consecutive transcript sentences submitted together to
/// the idiom detector. Sentence `i` of `sentences` is global index
/// `first_sentence + i`.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSpan {
    pub source_fingerprint: String,
    pub episode_number: i64,
    pub batch_index: i64,
    pub first_sentence: usize,
    pub sentences: Vec<TranscriptSentence>,
}

impl BatchSpan {
    pub fn contains(&self, sentence_index: usize) -> bool {
        sentence_index >= self.first_sentence
            && sentence_index < self.first_sentence + self.sentences.len()
    }

    pub fn sentence(&self, sentence_index: usize) -> Option<&TranscriptSentence> {
        if !self.contains(sentence_index) {
            return None;
        }
        self.sentences.get(sentence_index - self.first_sentence)
    }

    /// `[index] text` lines, the form the detector is prompted with.
    pub fn numbered_lines(&self) -> String {
        self.sentences
            .iter()
            .enumerate()
            .map(|(i, s)| format!("[{}] {}", self.first_sentence + i, s.text.trim()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Detector output for one span, parsed to a list of raw entries.
#[derive(Debug, Clone)]
pub struct DetectionBatch {
    pub span: BatchSpan,
    pub entries: Vec<Value>,
}

impl DetectionBatch {
    /// Locate and parse the JSON array in a detector response. Anything that
    /// is not an array is a malformed batch.
    pub fn from_response(span: BatchSpan, response: &str) -> Result<Self, AppError> {
        match extract_json_array(response) {
            Some(entries) => Ok(Self { span, entries }),
            None => Err(AppError::Extraction(format!(
                "batch {} of {}: no JSON array in detector response",
                span.batch_index, span.source_fingerprint
            ))),
        }
    }
}

/// Extract a JSON array from an LLM response (handles markdown code blocks
/// and surrounding prose).
pub fn extract_json_array(response: &str) -> Option<Vec<Value>> {
    let trimmed = response.trim();

    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(trimmed) {
        return Some(items);
    }

    // Markdown code block
    if let Some(start) = trimmed.find("```") {
        let after_marker = &trimmed[start + 3..];
        let body_start = after_marker.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_marker[body_start..];
        if let Some(end) = body.find("```") {
            if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(body[..end].trim()) {
                return Some(items);
            }
        }
    }

    // First balanced [...] in the text, skipping brackets inside strings
    let start = trimmed.find('[')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in trimmed[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &trimmed[start..start + i + 1];
                    return match serde_json::from_str::<Value>(candidate) {
                        Ok(Value::Array(items)) => Some(items),
                        _ => None,
                    };
                }
            }
            _ => {}
        }
    }

    None
}
