//! Idiom Aggregator: turns detector batches into deduplicated occurrences
//! and keeps the frequency index in step with them.
//!
//! Occurrences are the source of truth. The stored frequency index is
//! updated in the same transaction as each occurrence insert, and can be
//! rebuilt from the occurrences at any time.

pub mod batch;
pub mod validation;

pub use batch::{extract_json_array, BatchSpan, DetectionBatch};
pub use validation::{parse_entry, validate_idiom_text, DetectionEntry, CORRECTION_PREFIX};

use crate::database::idioms::insert_sorted;
use crate::database::{
    Database, FrequencyEntry, FrequencyIndex, IdiomOccurrence, NewOccurrence, Provenance,
};
use crate::error::AppError;
use crate::registry::short;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

pub const HALT_FLAG: &str = "aggregation_halted";

#[derive(Debug, Clone, Serialize)]
pub struct AcceptedDetection {
    pub occurrence_id: i64,
    pub idiom_text: String,
    pub timestamp_start: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedDetection {
    pub entry_index: usize,
    pub reason: String,
}

#[derive(Debug, Default, Serialize)]
pub struct IngestOutcome {
    pub accepted: Vec<AcceptedDetection>,
    pub rejected: Vec<RejectedDetection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub idioms: usize,
    pub occurrences: usize,
}

/// Instruction for the clips stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClipRequest {
    pub occurrence_id: i64,
    pub idiom_text: String,
    pub episode_number: i64,
    /// Padded, clamped at 0.
    pub start: f64,
    pub end: f64,
    pub file_name: String,
    pub existing_clip: Option<String>,
}

fn clip_name_of(path: &str) -> Option<String> {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
}

fn unique_clip_name(base: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    let stem = base.strip_suffix(".mp4").unwrap_or(base);
    let mut n = 2;
    loop {
        let candidate = format!("{}_{}.mp4", stem, n);
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn to_millis(seconds: f64) -> i64 {
    (seconds * 1000.0).round() as i64
}

/// `{idiom}_{episode}_{offset}s.mp4`, reduced to alphanumerics, `_`, `.`, `-`.
pub fn clip_file_name(idiom_text: &str, episode_number: i64, start: f64) -> String {
    let raw = format!("{}_{}_{}s.mp4", idiom_text, episode_number, start.max(0.0) as i64);
    raw.chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect()
}

/// Deterministic rebuild: one count and one episode reference per
/// occurrence, episodes ascending, `last_updated` = newest occurrence.
pub fn build_frequency_index(occurrences: &[IdiomOccurrence]) -> FrequencyIndex {
    let mut index = FrequencyIndex::new();
    for occ in occurrences {
        let entry = index
            .entry(occ.idiom_text.clone())
            .or_insert_with(|| FrequencyEntry {
                total_count: 0,
                episodes: Vec::new(),
                last_updated: String::new(),
            });
        entry.total_count += 1;
        insert_sorted(&mut entry.episodes, occ.episode_number);
        if occ.created_at > entry.last_updated {
            entry.last_updated = occ.created_at.clone();
        }
    }
    index
}

#[derive(Clone)]
pub struct Aggregator {
    db: Arc<Database>,
    idiom_lengths: Vec<usize>,
}

impl Aggregator {
    pub fn new(db: Arc<Database>, idiom_lengths: &[usize]) -> Self {
        Self {
            db,
            idiom_lengths: idiom_lengths.to_vec(),
        }
    }

    pub fn is_halted(&self) -> Result<bool, AppError> {
        Ok(self.db.get_flag(HALT_FLAG)?)
    }

    fn ensure_running(&self) -> Result<(), AppError> {
        if self.is_halted()? {
            return Err(AppError::Consistency(
                "aggregation halted pending reconcile".into(),
            ));
        }
        Ok(())
    }

    /// Validate one entry against its span and resolve its timestamps.
    fn resolve_entry(&self, span: &BatchSpan, value: &serde_json::Value) -> Result<NewOccurrence, AppError> {
        let entry = parse_entry(value, &self.idiom_lengths)?;

        if let Some(episode) = entry.episode_number {
            if episode != span.episode_number {
                return Err(AppError::Validation(format!(
                    "entry claims episode {}, batch is episode {}",
                    episode, span.episode_number
                )));
            }
        }

        let sentence = span.sentence(entry.sentence_index).ok_or_else(|| {
            AppError::Validation(format!(
                "sentence index {} outside batch span {}..{}",
                entry.sentence_index,
                span.first_sentence,
                span.first_sentence + span.sentences.len()
            ))
        })?;

        // The transcript holds the raw text; fall back to the canonical form
        let (start, end) = match entry.raw_text.as_deref() {
            Some(raw) if sentence.text.contains(raw) => sentence.locate(raw),
            _ => sentence.locate(&entry.idiom_text),
        };

        Ok(NewOccurrence {
            idiom_text: entry.idiom_text,
            episode_number: span.episode_number,
            start_ms: to_millis(start),
            end_ms: to_millis(end),
            source_fingerprint: span.source_fingerprint.clone(),
            sentence_index: entry.sentence_index as i64,
            raw_text: entry.raw_text,
            correction_note: entry.correction_note,
        })
    }

    fn reject(
        &self,
        span: &BatchSpan,
        entry_index: Option<usize>,
        raw: &str,
        reason: &str,
    ) -> Result<(), AppError> {
        log::warn!(
            "Rejected detection in batch {} of episode {} ({}), entry {:?}: {}",
            span.batch_index,
            span.episode_number,
            short(&span.source_fingerprint),
            entry_index,
            reason
        );
        self.db.record_rejection(
            &span.source_fingerprint,
            span.episode_number,
            span.batch_index,
            entry_index.map(|i| i as i64),
            raw,
            reason,
        )?;
        Ok(())
    }

    /// Entry-by-entry ingest. Invalid entries and duplicates of an existing
    /// (idiom, episode, start) key are rejected and recorded; the rest of
    /// the batch is unaffected.
    pub fn ingest(&self, batch: &DetectionBatch) -> Result<IngestOutcome, AppError> {
        self.ensure_running()?;
        let span = &batch.span;
        let mut outcome = IngestOutcome::default();

        for (i, value) in batch.entries.iter().enumerate() {
            let raw = value.to_string();
            let occ = match self.resolve_entry(span, value) {
                Ok(occ) => occ,
                Err(e) => {
                    self.reject(span, Some(i), &raw, &e.to_string())?;
                    outcome.rejected.push(RejectedDetection {
                        entry_index: i,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            match self.db.insert_occurrence(&occ)? {
                Some(id) => {
                    log::debug!(
                        "Accepted {} in episode {} at {}ms",
                        occ.idiom_text,
                        occ.episode_number,
                        occ.start_ms
                    );
                    outcome.accepted.push(AcceptedDetection {
                        occurrence_id: id,
                        idiom_text: occ.idiom_text,
                        timestamp_start: occ.start_ms as f64 / 1000.0,
                    });
                }
                None => {
                    let reason = format!(
                        "duplicate of existing occurrence ({}, episode {}, {}ms)",
                        occ.idiom_text, occ.episode_number, occ.start_ms
                    );
                    self.reject(span, Some(i), &raw, &reason)?;
                    outcome.rejected.push(RejectedDetection { entry_index: i, reason });
                }
            }
        }

        log::info!(
            "Batch {} of episode {}: {} accepted, {} rejected",
            span.batch_index,
            span.episode_number,
            outcome.accepted.len(),
            outcome.rejected.len()
        );
        Ok(outcome)
    }

    /// Parse a raw detector response and ingest it. An unparseable response
    /// rejects the whole batch with an `Extraction` error.
    pub fn ingest_response(&self, span: BatchSpan, response: &str) -> Result<IngestOutcome, AppError> {
        self.ensure_running()?;
        match DetectionBatch::from_response(span.clone(), response) {
            Ok(batch) => self.ingest(&batch),
            Err(e) => {
                let raw: String = response.chars().take(2000).collect();
                self.reject(&span, None, &raw, &e.to_string())?;
                Err(e)
            }
        }
    }

    // =========================================================================
    // Frequency index
    // =========================================================================

    pub fn recompute_frequency_index(&self) -> Result<FrequencyIndex, AppError> {
        let occurrences = self.db.get_all_occurrences()?;
        Ok(build_frequency_index(&occurrences))
    }

    pub fn frequency_index(&self) -> Result<FrequencyIndex, AppError> {
        Ok(self.db.load_frequency_index()?)
    }

    /// Compare the stored index with a rebuild. On divergence aggregation is
    /// halted until `reconcile` runs.
    pub fn verify_consistency(&self) -> Result<ConsistencyReport, AppError> {
        let stored = self.db.load_frequency_index()?;
        let rebuilt = self.recompute_frequency_index()?;

        if stored == rebuilt {
            let occurrences = rebuilt.values().map(|e| e.total_count as usize).sum();
            return Ok(ConsistencyReport {
                idioms: rebuilt.len(),
                occurrences,
            });
        }

        let mut diverged: Vec<&str> = stored
            .keys()
            .chain(rebuilt.keys())
            .filter(|k| stored.get(*k) != rebuilt.get(*k))
            .map(String::as_str)
            .collect();
        diverged.sort_unstable();
        diverged.dedup();

        self.db.set_flag(HALT_FLAG, true)?;
        let message = format!(
            "frequency index diverges from occurrences for {} idiom(s): {}",
            diverged.len(),
            diverged.iter().take(20).copied().collect::<Vec<_>>().join(", ")
        );
        log::error!("{}; aggregation halted", message);
        Err(AppError::Consistency(message))
    }

    /// Replace the stored index with a rebuild and lift the halt.
    pub fn reconcile(&self) -> Result<ConsistencyReport, AppError> {
        let rebuilt = self.recompute_frequency_index()?;
        self.db.replace_frequency_index(&rebuilt)?;
        self.db.set_flag(HALT_FLAG, false)?;
        let occurrences = rebuilt.values().map(|e| e.total_count as usize).sum();
        log::info!(
            "Frequency index rebuilt: {} idioms, {} occurrences",
            rebuilt.len(),
            occurrences
        );
        Ok(ConsistencyReport {
            idioms: rebuilt.len(),
            occurrences,
        })
    }

    // =========================================================================
    // Provenance and clips
    // =========================================================================

    pub fn provenance(&self, occurrence_id: i64) -> Result<Provenance, AppError> {
        let occ = self
            .db
            .get_occurrence(occurrence_id)?
            .ok_or_else(|| AppError::NotFound(format!("occurrence {}", occurrence_id)))?;
        Ok(Provenance {
            occurrence_id: occ.id,
            raw_text: occ.raw_text.clone().unwrap_or_else(|| occ.idiom_text.clone()),
            canonical_text: occ.idiom_text,
            correction_note: occ.correction_note,
            corrected: occ.corrected,
            episode_number: occ.episode_number,
            timestamp_start: occ.timestamp_start,
            source_fingerprint: occ.source_fingerprint,
        })
    }

    /// One clip per occurrence owned by `fingerprint`, padded and named.
    ///
    /// The end is clamped to `duration` when it is known. Names are unique
    /// across the whole clip library: an occurrence keeps the clip it
    /// already has, and a colliding new name gets a `_2`, `_3`... suffix
    /// in occurrence order.
    pub fn clip_requests(
        &self,
        fingerprint: &str,
        padding_start: f64,
        padding_end: f64,
        duration: Option<f64>,
    ) -> Result<Vec<ClipRequest>, AppError> {
        let occurrences = self.db.get_occurrences_for_fingerprint(fingerprint)?;

        let mut taken: HashSet<String> = self
            .db
            .get_clip_paths_outside(fingerprint)?
            .iter()
            .chain(occurrences.iter().filter_map(|o| o.clip_path.as_ref()))
            .filter_map(|p| clip_name_of(p))
            .collect();

        let mut requests = Vec::with_capacity(occurrences.len());
        for occ in occurrences {
            let start = (occ.timestamp_start - padding_start).max(0.0);
            let mut end = occ.timestamp_end + padding_end;
            if let Some(duration) = duration {
                end = end.min(duration).max(start);
            }

            let file_name = match occ.clip_path.as_deref().and_then(clip_name_of) {
                Some(name) => name,
                None => {
                    let name = unique_clip_name(
                        &clip_file_name(&occ.idiom_text, occ.episode_number, start),
                        &taken,
                    );
                    taken.insert(name.clone());
                    name
                }
            };

            requests.push(ClipRequest {
                occurrence_id: occ.id,
                idiom_text: occ.idiom_text,
                episode_number: occ.episode_number,
                start,
                end,
                file_name,
                existing_clip: occ.clip_path,
            });
        }
        Ok(requests)
    }

    pub fn record_clip(&self, occurrence_id: i64, clip_path: &str) -> Result<(), AppError> {
        self.db.set_clip_path(occurrence_id, clip_path)?;
        Ok(())
    }

    pub fn occurrences_for_idiom(&self, idiom_text: &str) -> Result<Vec<IdiomOccurrence>, AppError> {
        Ok(self.db.get_occurrences_for_idiom(idiom_text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::{TranscriptSentence, WordTiming};
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (Aggregator, Arc<Database>, TempDir) {
        let temp = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&temp.path().join("test.db")).unwrap());
        (Aggregator::new(db.clone(), &[4]), db, temp)
    }

    fn sentence(text: &str, start: f64, end: f64) -> TranscriptSentence {
        TranscriptSentence {
            text: text.to_string(),
            start,
            end,
            words: vec![],
        }
    }

    fn span(first: usize, sentences: Vec<TranscriptSentence>) -> BatchSpan {
        BatchSpan {
            source_fingerprint: "fpA".to_string(),
            episode_number: 1,
            batch_index: (first / 10) as i64,
            first_sentence: first,
            sentences,
        }
    }

    fn batch(span: BatchSpan, entries: Vec<serde_json::Value>) -> DetectionBatch {
        DetectionBatch { span, entries }
    }

    #[test]
    fn test_same_batch_twice_counts_once() {
        let (agg, _db, _temp) = setup();
        let s = span(0, vec![sentence("他落荒而逃", 12.3, 14.0)]);
        let entries = vec![json!({"word": "落荒而逃", "index": 0})];

        let first = agg.ingest(&batch(s.clone(), entries.clone())).unwrap();
        assert_eq!(first.accepted.len(), 1);
        let index_once = agg.frequency_index().unwrap();

        let second = agg.ingest(&batch(s, entries)).unwrap();
        assert!(second.accepted.is_empty());
        assert_eq!(second.rejected.len(), 1);

        let index_twice = agg.frequency_index().unwrap();
        assert_eq!(index_once, index_twice);
        assert_eq!(index_twice["落荒而逃"].total_count, 1);
    }

    #[test]
    fn test_seam_duplicate_across_adjacent_batches() {
        let (agg, _db, _temp) = setup();
        let shared = sentence("落荒而逃", 12.3, 13.5);
        let left = span(0, vec![sentence("前文", 10.0, 12.0), shared.clone()]);
        let mut right = span(1, vec![shared]);
        right.batch_index = 1;

        agg.ingest(&batch(left, vec![json!({"word": "落荒而逃", "index": 1})])).unwrap();
        let outcome = agg
            .ingest(&batch(right, vec![json!({"word": "落荒而逃", "index": 1})]))
            .unwrap();
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(agg.frequency_index().unwrap()["落荒而逃"].total_count, 1);
    }

    #[test]
    fn test_partial_batch_keeps_good_entries() {
        let (agg, db, _temp) = setup();
        let s = span(
            5,
            vec![
                sentence("一心一意地修炼", 1.0, 3.0),
                sentence("画蛇添足", 4.0, 5.0),
            ],
        );
        let outcome = agg
            .ingest(&batch(
                s,
                vec![
                    json!({"word": "一心一意", "index": 5}),
                    json!({"word": "", "index": 5}),
                    json!({"word": "画蛇添足", "index": 99}),
                    json!({"word": "画蛇添足", "index": 6}),
                    json!({"word": "画蛇添足", "index": 6, "episode_number": 2}),
                ],
            ))
            .unwrap();

        assert_eq!(outcome.accepted.len(), 2);
        let rejected: Vec<usize> = outcome.rejected.iter().map(|r| r.entry_index).collect();
        assert_eq!(rejected, vec![1, 2, 4]);
        assert_eq!(db.get_rejections(Some("fpA"), 10).unwrap().len(), 3);
    }

    #[test]
    fn test_malformed_response_rejected_wholesale() {
        let (agg, db, _temp) = setup();
        let s = span(0, vec![sentence("落荒而逃", 0.0, 1.0)]);
        let err = agg.ingest_response(s, "I found: 落荒而逃").unwrap_err();
        assert!(matches!(err, AppError::Extraction(_)));

        let rejections = db.get_rejections(None, 10).unwrap();
        assert_eq!(rejections.len(), 1);
        assert_eq!(rejections[0].entry_index, None);
        assert!(db.get_all_occurrences().unwrap().is_empty());
    }

    #[test]
    fn test_correction_provenance() {
        let (agg, _db, _temp) = setup();
        let mut s = sentence("韩立罗荒儿逃", 10.0, 14.0);
        s.words = vec![
            WordTiming { word: "韩立".into(), start: Some(10.0), end: Some(11.0) },
            WordTiming { word: "罗荒儿逃".into(), start: Some(12.3), end: Some(13.6) },
        ];
        let outcome = agg
            .ingest_response(
                span(0, vec![s]),
                "```json\n[{\"word\": \"落荒而逃\", \"index\": 0, \"correction_note\": \"原字幕:罗荒儿逃\"}]\n```",
            )
            .unwrap();
        assert_eq!(outcome.accepted[0].timestamp_start, 12.3);

        let p = agg.provenance(outcome.accepted[0].occurrence_id).unwrap();
        assert_eq!(p.canonical_text, "落荒而逃");
        assert_eq!(p.raw_text, "罗荒儿逃");
        assert_eq!(p.correction_note.as_deref(), Some("原字幕:罗荒儿逃"));
        assert!(p.corrected);

        assert!(matches!(agg.provenance(999), Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_recompute_matches_incremental_index() {
        let (agg, _db, _temp) = setup();
        for (ep, t) in [(3, 5.0), (1, 2.0), (2, 7.5), (1, 9.0)] {
            let mut s = span(0, vec![sentence("落荒而逃一心一意", t, t + 2.0)]);
            s.episode_number = ep;
            agg.ingest(&batch(
                s,
                vec![
                    json!({"word": "落荒而逃", "index": 0}),
                    json!({"word": "一心一意", "index": 0}),
                ],
            ))
            .unwrap();
        }

        let rebuilt = agg.recompute_frequency_index().unwrap();
        assert_eq!(rebuilt, agg.frequency_index().unwrap());
        assert_eq!(rebuilt["落荒而逃"].episodes, vec![1, 1, 2, 3]);
        let report = agg.verify_consistency().unwrap();
        assert_eq!(report.idioms, 2);
        assert_eq!(report.occurrences, 8);
    }

    #[test]
    fn test_divergence_halts_until_reconcile() {
        let (agg, db, _temp) = setup();
        let s = span(0, vec![sentence("落荒而逃", 1.0, 2.0)]);
        agg.ingest(&batch(s.clone(), vec![json!({"word": "落荒而逃", "index": 0})]))
            .unwrap();

        // Corrupt the stored index behind the aggregator's back
        let mut index = db.load_frequency_index().unwrap();
        index.get_mut("落荒而逃").unwrap().total_count = 5;
        db.replace_frequency_index(&index).unwrap();

        assert!(matches!(agg.verify_consistency(), Err(AppError::Consistency(_))));
        assert!(agg.is_halted().unwrap());
        assert!(matches!(
            agg.ingest(&batch(s, vec![])),
            Err(AppError::Consistency(_))
        ));

        agg.reconcile().unwrap();
        assert!(!agg.is_halted().unwrap());
        assert!(agg.verify_consistency().is_ok());
    }

    #[test]
    fn test_clip_requests_padding_and_names() {
        let (agg, _db, _temp) = setup();
        let s = span(
            0,
            vec![
                sentence("落荒而逃", 0.2, 1.0),
                sentence("落荒而逃", 30.1, 31.0),
                sentence("落荒而逃", 30.4, 31.5),
            ],
        );
        agg.ingest(&batch(
            s,
            vec![
                json!({"word": "落荒而逃", "index": 0}),
                json!({"word": "落荒而逃", "index": 1}),
                json!({"word": "落荒而逃", "index": 2}),
            ],
        ))
        .unwrap();

        let requests = agg.clip_requests("fpA", 0.5, 0.5, None).unwrap();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].start, 0.0);
        assert_eq!(requests[0].file_name, "落荒而逃_1_0s.mp4");
        assert_eq!(requests[1].file_name, "落荒而逃_1_29s.mp4");
        assert_eq!(requests[2].file_name, "落荒而逃_1_29s_2.mp4");
        assert!((requests[1].end - 31.5).abs() < 1e-9);
    }

    #[test]
    fn test_clip_names_unique_across_fingerprints() {
        let (agg, _db, _temp) = setup();
        agg.ingest(&batch(
            span(0, vec![sentence("落荒而逃", 12.3, 13.0)]),
            vec![json!({"word": "落荒而逃", "index": 0})],
        ))
        .unwrap();
        let mut other = span(0, vec![sentence("落荒而逃", 12.35, 13.0)]);
        other.source_fingerprint = "fpB".to_string();
        agg.ingest(&batch(other, vec![json!({"word": "落荒而逃", "index": 0})]))
            .unwrap();

        let a = agg.clip_requests("fpA", 0.5, 0.5, None).unwrap();
        assert_eq!(a[0].file_name, "落荒而逃_1_11s.mp4");
        agg.record_clip(a[0].occurrence_id, "/clips/落荒而逃_1_11s.mp4")
            .unwrap();

        let b = agg.clip_requests("fpB", 0.5, 0.5, None).unwrap();
        assert_eq!(b[0].file_name, "落荒而逃_1_11s_2.mp4");
        assert!(b[0].existing_clip.is_none());

        // A recorded clip keeps its name
        let again = agg.clip_requests("fpA", 0.5, 0.5, None).unwrap();
        assert_eq!(again[0].file_name, "落荒而逃_1_11s.mp4");
        assert_eq!(
            again[0].existing_clip.as_deref(),
            Some("/clips/落荒而逃_1_11s.mp4")
        );
    }

    #[test]
    fn test_clip_end_clamped_to_duration() {
        let (agg, _db, _temp) = setup();
        agg.ingest(&batch(
            span(0, vec![sentence("落荒而逃", 58.0, 59.8)]),
            vec![json!({"word": "落荒而逃", "index": 0})],
        ))
        .unwrap();

        let requests = agg.clip_requests("fpA", 0.5, 0.5, Some(60.0)).unwrap();
        assert!((requests[0].start - 57.5).abs() < 1e-9);
        assert!((requests[0].end - 60.0).abs() < 1e-9);

        let unclamped = agg.clip_requests("fpA", 0.5, 0.5, None).unwrap();
        assert!((unclamped[0].end - 60.3).abs() < 1e-9);
    }

    #[test]
    fn test_clip_file_name_sanitized() {
        assert_eq!(clip_file_name("落荒/而逃", 12, 7.9), "落荒而逃_12_7s.mp4");
    }
}
