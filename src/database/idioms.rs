//! Idiom occurrence, frequency index and rejection persistence.

use super::{now_timestamp, Database};
use super::models::*;
use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};

const OCCURRENCE_COLUMNS: &str = "id, idiom_text, episode_number, start_ms, end_ms, source_fingerprint,
     sentence_index, raw_text, correction_note, clip_path, created_at";

fn occurrence_from_row(row: &Row) -> rusqlite::Result<IdiomOccurrence> {
    let start_ms: i64 = row.get(3)?;
    let end_ms: i64 = row.get(4)?;
    let correction_note: Option<String> = row.get(8)?;
    Ok(IdiomOccurrence {
        id: row.get(0)?,
        idiom_text: row.get(1)?,
        episode_number: row.get(2)?,
        timestamp_start: start_ms as f64 / 1000.0,
        timestamp_end: end_ms as f64 / 1000.0,
        source_fingerprint: row.get(5)?,
        sentence_index: row.get(6)?,
        raw_text: row.get(7)?,
        corrected: correction_note.is_some(),
        correction_note,
        clip_path: row.get(9)?,
        created_at: row.get(10)?,
    })
}

/// Insert `episode` keeping the list ascending (duplicates allowed).
pub(crate) fn insert_sorted(episodes: &mut Vec<i64>, episode: i64) {
    let pos = episodes.partition_point(|e| *e <= episode);
    episodes.insert(pos, episode);
}

impl Database {
    // =========================================================================
    // Occurrences
    // =========================================================================

    /// Store one occurrence and fold it into the frequency index, both in one
    /// transaction. Returns `None` if the (idiom, episode, start) key exists.
    pub fn insert_occurrence(&self, occ: &NewOccurrence) -> Result<Option<i64>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_timestamp();

        let inserted = tx.execute(
            "INSERT INTO idiom_occurrences
                (idiom_text, episode_number, start_ms, end_ms, source_fingerprint,
                 sentence_index, raw_text, correction_note, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(idiom_text, episode_number, start_ms) DO NOTHING",
            params![
                occ.idiom_text,
                occ.episode_number,
                occ.start_ms,
                occ.end_ms,
                occ.source_fingerprint,
                occ.sentence_index,
                occ.raw_text,
                occ.correction_note,
                now
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        let id = tx.last_insert_rowid();

        let existing: Option<(i64, String, String)> = tx
            .query_row(
                "SELECT total_count, episode_refs, last_updated FROM frequency_index WHERE idiom_text = ?",
                params![occ.idiom_text],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let (count, mut episodes, last_updated) = match existing {
            Some((count, refs, last)) => (
                count,
                serde_json::from_str::<Vec<i64>>(&refs)?,
                last.max(now.clone()),
            ),
            None => (0, Vec::new(), now.clone()),
        };
        insert_sorted(&mut episodes, occ.episode_number);

        tx.execute(
            "INSERT INTO frequency_index (idiom_text, total_count, episode_refs, last_updated)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(idiom_text) DO UPDATE SET
                total_count = excluded.total_count,
                episode_refs = excluded.episode_refs,
                last_updated = excluded.last_updated",
            params![
                occ.idiom_text,
                count + 1,
                serde_json::to_string(&episodes)?,
                last_updated
            ],
        )?;

        tx.commit()?;
        Ok(Some(id))
    }

    pub fn occurrence_exists(&self, idiom_text: &str, episode_number: i64, start_ms: i64) -> Result<bool> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM idiom_occurrences
                 WHERE idiom_text = ? AND episode_number = ? AND start_ms = ?",
                params![idiom_text, episode_number, start_ms],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_occurrence(&self, id: i64) -> Result<Option<IdiomOccurrence>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM idiom_occurrences WHERE id = ?", OCCURRENCE_COLUMNS);
        let occ = conn.query_row(&sql, params![id], occurrence_from_row).optional()?;
        Ok(occ)
    }

    pub fn get_all_occurrences(&self) -> Result<Vec<IdiomOccurrence>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM idiom_occurrences ORDER BY episode_number ASC, start_ms ASC, id ASC",
            OCCURRENCE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], occurrence_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Drill-down for one idiom, in episode/time order.
    pub fn get_occurrences_for_idiom(&self, idiom_text: &str) -> Result<Vec<IdiomOccurrence>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM idiom_occurrences WHERE idiom_text = ?
             ORDER BY episode_number ASC, start_ms ASC",
            OCCURRENCE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![idiom_text], occurrence_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_occurrences_for_fingerprint(&self, fingerprint: &str) -> Result<Vec<IdiomOccurrence>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM idiom_occurrences WHERE source_fingerprint = ?
             ORDER BY start_ms ASC, id ASC",
            OCCURRENCE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![fingerprint], occurrence_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Clip paths already recorded for occurrences of other fingerprints.
    pub fn get_clip_paths_outside(&self, fingerprint: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT clip_path FROM idiom_occurrences
             WHERE clip_path IS NOT NULL AND source_fingerprint != ?",
        )?;
        let rows = stmt
            .query_map(params![fingerprint], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(rows)
    }

    pub fn set_clip_path(&self, occurrence_id: i64, clip_path: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE idiom_occurrences SET clip_path = ? WHERE id = ?",
            params![clip_path, occurrence_id],
        )?;
        Ok(())
    }

    // =========================================================================
    // Frequency index
    // =========================================================================

    pub fn load_frequency_index(&self) -> Result<FrequencyIndex> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT idiom_text, total_count, episode_refs, last_updated FROM frequency_index",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut index = FrequencyIndex::new();
        for (idiom, total_count, refs, last_updated) in rows {
            let episodes: Vec<i64> = serde_json::from_str(&refs)?;
            index.insert(
                idiom,
                FrequencyEntry {
                    total_count,
                    episodes,
                    last_updated,
                },
            );
        }
        Ok(index)
    }

    /// Overwrite the stored index wholesale (used by reconcile).
    pub fn replace_frequency_index(&self, index: &FrequencyIndex) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM frequency_index", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO frequency_index (idiom_text, total_count, episode_refs, last_updated)
                 VALUES (?, ?, ?, ?)",
            )?;
            for (idiom, entry) in index {
                stmt.execute(params![
                    idiom,
                    entry.total_count,
                    serde_json::to_string(&entry.episodes)?,
                    entry.last_updated
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Most frequent idioms first; ties by idiom text.
    pub fn top_idioms(&self, limit: i64) -> Result<Vec<IdiomFrequency>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT idiom_text, total_count, episode_refs, last_updated FROM frequency_index
             ORDER BY total_count DESC, idiom_text ASC LIMIT ?",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut result = Vec::with_capacity(rows.len());
        for (idiom_text, total_count, refs, last_updated) in rows {
            let mut episodes: Vec<i64> = serde_json::from_str(&refs)?;
            episodes.dedup();
            result.push(IdiomFrequency {
                idiom_text,
                total_count,
                episode_count: episodes.len() as i64,
                last_updated,
            });
        }
        Ok(result)
    }

    // =========================================================================
    // Rejections
    // =========================================================================

    pub fn record_rejection(
        &self,
        source_fingerprint: &str,
        episode_number: i64,
        batch_index: i64,
        entry_index: Option<i64>,
        raw_entry: &str,
        reason: &str,
    ) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO rejected_detections
                (source_fingerprint, episode_number, batch_index, entry_index, raw_entry, reason, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                source_fingerprint,
                episode_number,
                batch_index,
                entry_index,
                raw_entry,
                reason,
                now_timestamp()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_rejections(&self, fingerprint: Option<&str>, limit: i64) -> Result<Vec<Rejection>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, source_fingerprint, episode_number, batch_index, entry_index, raw_entry, reason, created_at
             FROM rejected_detections
             WHERE ?1 IS NULL OR source_fingerprint = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![fingerprint, limit], |row| {
                Ok(Rejection {
                    id: row.get(0)?,
                    source_fingerprint: row.get(1)?,
                    episode_number: row.get(2)?,
                    batch_index: row.get(3)?,
                    entry_index: row.get(4)?,
                    raw_entry: row.get(5)?,
                    reason: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
