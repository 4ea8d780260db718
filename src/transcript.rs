//! Transcript artifact: ordered sentences with word-level timings.

use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    pub word: String,
    /// Seconds. Missing when the aligner could not place the word.
    pub start: Option<f64>,
    pub end: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSentence {
    pub text: String,
    pub start: f64,
    pub end: f64,
    #[serde(default)]
    pub words: Vec<WordTiming>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub language: String,
    pub sentences: Vec<TranscriptSentence>,
}

impl Transcript {
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Io(format!("{}: {}", path.display(), e)))?;
        let transcript: Transcript = serde_json::from_str(&content).map_err(|e| {
            AppError::Transcription(format!("unparseable transcript {}: {}", path.display(), e))
        })?;
        transcript.validate()?;
        Ok(transcript)
    }

    /// Sentences must have a non-negative, non-inverted time span.
    pub fn validate(&self) -> Result<(), AppError> {
        for (i, s) in self.sentences.iter().enumerate() {
            if !s.start.is_finite() || !s.end.is_finite() || s.start < 0.0 || s.end < s.start {
                return Err(AppError::Transcription(format!(
                    "sentence {} has invalid span {}..{}",
                    i, s.start, s.end
                )));
            }
        }
        Ok(())
    }
}

impl TranscriptSentence {
    /// Time span of `needle` inside this sentence, from the timings of the
    /// words that cover it. Falls back to the whole sentence when the text
    /// is not found or the covering words carry no timings.
    pub fn locate(&self, needle: &str) -> (f64, f64) {
        let fallback = (self.start, self.end);
        if needle.is_empty() || self.words.is_empty() {
            return fallback;
        }

        // Character offsets of each word within the concatenated text
        let mut joined = String::new();
        let mut spans = Vec::with_capacity(self.words.len());
        for w in &self.words {
            let from = joined.chars().count();
            joined.push_str(w.word.trim());
            spans.push((from, joined.chars().count()));
        }

        let Some(byte_pos) = joined.find(needle) else {
            return fallback;
        };
        let first = joined[..byte_pos].chars().count();
        let last = first + needle.chars().count();

        let covering: Vec<&WordTiming> = self
            .words
            .iter()
            .zip(&spans)
            .filter(|(_, (from, to))| *from < last && *to > first)
            .map(|(w, _)| w)
            .collect();

        let start = covering.iter().find_map(|w| w.start);
        let end = covering.iter().rev().find_map(|w| w.end);
        match (start, end) {
            (Some(s), Some(e)) if e >= s => (s, e),
            _ => fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn word(w: &str, start: f64, end: f64) -> WordTiming {
        WordTiming {
            word: w.to_string(),
            start: Some(start),
            end: Some(end),
        }
    }

    fn sentence() -> TranscriptSentence {
        TranscriptSentence {
            text: "韩立罗荒儿逃".to_string(),
            start: 10.0,
            end: 14.0,
            words: vec![
                word("韩立", 10.0, 11.0),
                word("罗荒", 12.3, 13.0),
                word("儿逃", 13.0, 13.6),
            ],
        }
    }

    #[test]
    fn test_locate_uses_word_timings() {
        assert_eq!(sentence().locate("罗荒儿逃"), (12.3, 13.6));
    }

    #[test]
    fn test_locate_partial_word_overlap() {
        assert_eq!(sentence().locate("立罗"), (10.0, 13.0));
    }

    #[test]
    fn test_locate_falls_back_to_sentence() {
        assert_eq!(sentence().locate("落荒而逃"), (10.0, 14.0));

        let mut s = sentence();
        s.words[1].start = None;
        s.words[2].end = None;
        assert_eq!(s.locate("罗荒儿逃"), (10.0, 14.0));
    }

    #[test]
    fn test_load_rejects_garbage_and_inverted_spans() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("t.json");

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(Transcript::load(&path), Err(AppError::Transcription(_))));

        std::fs::write(
            &path,
            r#"{"language":"zh","sentences":[{"text":"x","start":5.0,"end":1.0}]}"#,
        )
        .unwrap();
        assert!(matches!(Transcript::load(&path), Err(AppError::Transcription(_))));

        std::fs::write(
            &path,
            r#"{"language":"zh","sentences":[{"text":"x","start":1.0,"end":2.0}]}"#,
        )
        .unwrap();
        let t = Transcript::load(&path).unwrap();
        assert!(t.sentences[0].words.is_empty());
    }
}
