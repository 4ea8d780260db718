use crate::aggregator::{Aggregator, ConsistencyReport};
use crate::database::{
    Database, IdiomFrequency, IdiomOccurrence, PipelineError, PipelineStats, Provenance, Rejection,
};
use crate::error::AppError;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct IdiomDrillDown {
    pub idiom_text: String,
    pub total_count: i64,
    pub episodes: Vec<i64>,
    pub last_updated: String,
    /// Each occurrence carries its clip reference once the clip is cut.
    pub occurrences: Vec<IdiomOccurrence>,
}

pub fn get_top_idioms(db: &Database, limit: Option<i64>) -> Result<Vec<IdiomFrequency>, AppError> {
    db.top_idioms(limit.unwrap_or(20)).map_err(AppError::from)
}

pub fn get_idiom_occurrences(aggregator: &Aggregator, idiom_text: &str) -> Result<IdiomDrillDown, AppError> {
    let index = aggregator.frequency_index()?;
    let entry = index
        .get(idiom_text)
        .ok_or_else(|| AppError::NotFound(format!("idiom {}", idiom_text)))?;
    Ok(IdiomDrillDown {
        idiom_text: idiom_text.to_string(),
        total_count: entry.total_count,
        episodes: entry.episodes.clone(),
        last_updated: entry.last_updated.clone(),
        occurrences: aggregator.occurrences_for_idiom(idiom_text)?,
    })
}

pub fn get_provenance(aggregator: &Aggregator, occurrence_id: i64) -> Result<Provenance, AppError> {
    aggregator.provenance(occurrence_id)
}

pub fn get_pipeline_stats(db: &Database) -> Result<PipelineStats, AppError> {
    db.get_pipeline_stats().map_err(AppError::from)
}

pub fn get_recent_errors(db: &Database, limit: Option<i64>) -> Result<Vec<PipelineError>, AppError> {
    db.get_recent_pipeline_errors(limit.unwrap_or(20))
        .map_err(AppError::from)
}

pub fn get_rejections(
    db: &Database,
    fingerprint: Option<&str>,
    limit: Option<i64>,
) -> Result<Vec<Rejection>, AppError> {
    db.get_rejections(fingerprint, limit.unwrap_or(50))
        .map_err(AppError::from)
}

/// Compare the stored index against a rebuild. A mismatch halts aggregation.
pub fn verify_index(aggregator: &Aggregator) -> Result<ConsistencyReport, AppError> {
    aggregator.verify_consistency()
}

pub fn reconcile_index(aggregator: &Aggregator) -> Result<ConsistencyReport, AppError> {
    log::info!("Operator reconcile requested");
    aggregator.reconcile()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::NewOccurrence;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn occurrence(idiom: &str, episode: i64, start_ms: i64) -> NewOccurrence {
        NewOccurrence {
            idiom_text: idiom.to_string(),
            episode_number: episode,
            start_ms,
            end_ms: start_ms + 1500,
            source_fingerprint: format!("fp{}", episode),
            sentence_index: 0,
            raw_text: None,
            correction_note: None,
        }
    }

    fn setup() -> (Arc<Database>, Aggregator, TempDir) {
        let temp = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&temp.path().join("test.db")).unwrap());
        db.insert_occurrence(&occurrence("落荒而逃", 2, 5000)).unwrap();
        db.insert_occurrence(&occurrence("落荒而逃", 1, 12300)).unwrap();
        db.insert_occurrence(&occurrence("一心一意", 1, 800)).unwrap();
        let aggregator = Aggregator::new(db.clone(), &[4]);
        (db, aggregator, temp)
    }

    #[test]
    fn test_top_idioms_and_drill_down() {
        let (db, aggregator, _temp) = setup();

        let top = get_top_idioms(&db, None).unwrap();
        assert_eq!(top[0].idiom_text, "落荒而逃");
        assert_eq!(top[0].total_count, 2);
        assert_eq!(top[0].episode_count, 2);

        let drill = get_idiom_occurrences(&aggregator, "落荒而逃").unwrap();
        assert_eq!(drill.episodes, vec![1, 2]);
        assert_eq!(drill.occurrences.len(), 2);

        assert!(matches!(
            get_idiom_occurrences(&aggregator, "画蛇添足"),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_verify_then_reconcile() {
        let (_db, aggregator, _temp) = setup();
        let report = verify_index(&aggregator).unwrap();
        assert_eq!(report.idioms, 2);
        assert_eq!(report.occurrences, 3);
        assert_eq!(reconcile_index(&aggregator).unwrap().occurrences, 3);
    }
}
