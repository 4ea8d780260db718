//! SourceFile / StageStatus persistence.
//!
//! Every state change is a single conditional UPDATE inside an IMMEDIATE
//! transaction, so two controllers racing for the same (fingerprint, stage)
//! see exactly one winner and an interrupted write leaves the prior state.

use super::{now_timestamp, Database};
use super::models::*;
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

const SOURCE_FILE_COLUMNS: &str =
    "id, path, fingerprint, episode_number, file_size, superseded, added_date, updated_at";

fn source_file_from_row(row: &Row) -> rusqlite::Result<SourceFile> {
    Ok(SourceFile {
        id: row.get(0)?,
        path: row.get(1)?,
        fingerprint: row.get(2)?,
        episode_number: row.get(3)?,
        file_size: row.get(4)?,
        superseded: row.get::<_, i32>(5)? == 1,
        added_date: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn load_stage_status(conn: &Connection, fingerprint: &str) -> Result<Option<StageStatus>> {
    let mut stmt = conn.prepare(
        "SELECT stage, state, artifact_path, last_error, attempts, started_at, completed_at, updated_at
         FROM stage_status WHERE fingerprint = ? ORDER BY stage_order ASC",
    )?;
    let rows = stmt
        .query_map(params![fingerprint], |row| {
            let stage: String = row.get(0)?;
            let state: String = row.get(1)?;
            let record = StageRecord {
                stage: Stage::Audio,
                state: StageState::Pending,
                artifact_path: row.get(2)?,
                last_error: row.get(3)?,
                attempts: row.get(4)?,
                started_at: row.get(5)?,
                completed_at: row.get(6)?,
                updated_at: row.get(7)?,
            };
            Ok((stage, state, record))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    if rows.is_empty() {
        return Ok(None);
    }

    let mut records = Vec::with_capacity(rows.len());
    for (stage, state, mut record) in rows {
        record.stage = stage
            .parse()
            .map_err(|e: String| anyhow::anyhow!("corrupt stage row for {}: {}", fingerprint, e))?;
        record.state = state
            .parse()
            .map_err(|e: String| anyhow::anyhow!("corrupt stage row for {}: {}", fingerprint, e))?;
        records.push(record);
    }

    Ok(Some(StageStatus {
        fingerprint: fingerprint.to_string(),
        stages: records,
    }))
}

fn stage_state(conn: &Connection, fingerprint: &str, stage: Stage) -> Result<Option<StageState>> {
    let state: Option<String> = conn
        .query_row(
            "SELECT state FROM stage_status WHERE fingerprint = ? AND stage = ?",
            params![fingerprint, stage.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    state
        .map(|s| {
            s.parse()
                .map_err(|e: String| anyhow::anyhow!("corrupt {} row for {}: {}", stage, fingerprint, e))
        })
        .transpose()
}

impl Database {
    // =========================================================================
    // Source files
    // =========================================================================

    pub fn get_source_files(&self, include_superseded: bool) -> Result<Vec<SourceFile>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM source_files {} ORDER BY episode_number ASC, fingerprint ASC",
            SOURCE_FILE_COLUMNS,
            if include_superseded { "" } else { "WHERE superseded = 0" }
        );
        let mut stmt = conn.prepare(&sql)?;
        let files = stmt
            .query_map([], source_file_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(files)
    }

    pub fn get_source_file(&self, fingerprint: &str) -> Result<Option<SourceFile>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM source_files WHERE fingerprint = ?",
            SOURCE_FILE_COLUMNS
        );
        let file = conn
            .query_row(&sql, params![fingerprint], source_file_from_row)
            .optional()?;
        Ok(file)
    }

    pub fn get_source_files_by_episode(&self, episode_number: i64) -> Result<Vec<SourceFile>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM source_files WHERE episode_number = ? ORDER BY superseded ASC, fingerprint ASC",
            SOURCE_FILE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let files = stmt
            .query_map(params![episode_number], source_file_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(files)
    }

    /// Insert a new fingerprint with all four stages `pending`.
    ///
    /// A fingerprint seen before (e.g. a file restored to earlier content)
    /// keeps its stage history; it is only un-superseded and re-pathed.
    /// Returns `true` when a new row was created.
    pub fn register_source_file(
        &self,
        fingerprint: &str,
        path: &str,
        episode_number: i64,
        file_size: Option<i64>,
    ) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_timestamp();

        let inserted = tx.execute(
            "INSERT INTO source_files (fingerprint, path, episode_number, file_size, superseded, added_date, updated_at)
             VALUES (?, ?, ?, ?, 0, ?, ?)
             ON CONFLICT(fingerprint) DO NOTHING",
            params![fingerprint, path, episode_number, file_size, now, now],
        )?;

        if inserted == 0 {
            tx.execute(
                "UPDATE source_files SET path = ?, superseded = 0, updated_at = ? WHERE fingerprint = ?",
                params![path, now, fingerprint],
            )?;
        } else {
            for stage in Stage::ALL {
                tx.execute(
                    "INSERT INTO stage_status (fingerprint, stage, stage_order, state, attempts, updated_at)
                     VALUES (?, ?, ?, 'pending', 0, ?)",
                    params![fingerprint, stage.as_str(), stage.order(), now],
                )?;
            }
        }

        tx.commit()?;
        Ok(inserted > 0)
    }

    /// Record that identical content now lives at a different path.
    pub fn update_source_path(&self, fingerprint: &str, path: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE source_files SET path = ?, superseded = 0, updated_at = ? WHERE fingerprint = ?",
            params![path, now_timestamp(), fingerprint],
        )?;
        Ok(())
    }

    pub fn mark_superseded(&self, fingerprint: &str) -> Result<bool> {
        let conn = self.lock()?;
        let count = conn.execute(
            "UPDATE source_files SET superseded = 1, updated_at = ? WHERE fingerprint = ? AND superseded = 0",
            params![now_timestamp(), fingerprint],
        )?;
        Ok(count > 0)
    }

    // =========================================================================
    // Stage status
    // =========================================================================

    pub fn get_stage_status(&self, fingerprint: &str) -> Result<Option<StageStatus>> {
        let conn = self.lock()?;
        load_stage_status(&conn, fingerprint)
    }

    pub fn get_sources_with_status(&self, include_superseded: bool) -> Result<Vec<SourceFileWithStatus>> {
        let files = self.get_source_files(include_superseded)?;
        let conn = self.lock()?;
        let mut result = Vec::with_capacity(files.len());
        for file in files {
            let status = load_stage_status(&conn, &file.fingerprint)?.unwrap_or_else(|| StageStatus {
                fingerprint: file.fingerprint.clone(),
                stages: Vec::new(),
            });
            let state = if file.superseded {
                FileState::Superseded
            } else {
                status.overall()
            };
            result.push(SourceFileWithStatus { file, status, state });
        }
        Ok(result)
    }

    /// Files with a startable stage and nothing running or blocked, oldest
    /// episode first, ties broken by fingerprint.
    pub fn get_work_candidates(&self) -> Result<Vec<WorkItem>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT f.fingerprint, f.path, f.episode_number FROM source_files f
             WHERE f.superseded = 0
               AND EXISTS (SELECT 1 FROM stage_status s
                           WHERE s.fingerprint = f.fingerprint AND s.state IN ('pending', 'failed'))
               AND NOT EXISTS (SELECT 1 FROM stage_status s
                               WHERE s.fingerprint = f.fingerprint AND s.state IN ('running', 'blocked'))
             ORDER BY f.episode_number ASC, f.fingerprint ASC",
        )?;
        let items = stmt
            .query_map([], |row| {
                Ok(WorkItem {
                    fingerprint: row.get(0)?,
                    path: row.get(1)?,
                    episode_number: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Take the `running` lock for (fingerprint, stage).
    ///
    /// Succeeds only if the stage is `pending`/`failed`, the preceding stage
    /// is `done`, and the file is not superseded. Returns `false` otherwise.
    pub fn try_acquire_stage(&self, fingerprint: &str, stage: Stage, owner: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let superseded: Option<i32> = tx
            .query_row(
                "SELECT superseded FROM source_files WHERE fingerprint = ?",
                params![fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        if superseded != Some(0) {
            return Ok(false);
        }

        if let Some(prev) = stage.previous() {
            if stage_state(&tx, fingerprint, prev)? != Some(StageState::Done) {
                return Ok(false);
            }
        }

        let now = now_timestamp();
        let updated = tx.execute(
            "UPDATE stage_status
             SET state = 'running', lock_owner = ?, started_at = ?, updated_at = ?
             WHERE fingerprint = ? AND stage = ? AND state IN ('pending', 'failed')",
            params![owner, now, now, fingerprint, stage.as_str()],
        )?;

        tx.commit()?;
        Ok(updated == 1)
    }

    /// `running -> done`, only for the lock holder.
    pub fn complete_stage(
        &self,
        fingerprint: &str,
        stage: Stage,
        owner: &str,
        artifact_path: &str,
    ) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_timestamp();
        let updated = tx.execute(
            "UPDATE stage_status
             SET state = 'done', artifact_path = ?, last_error = NULL, lock_owner = NULL,
                 completed_at = ?, updated_at = ?
             WHERE fingerprint = ? AND stage = ? AND state = 'running' AND lock_owner = ?",
            params![artifact_path, now, now, fingerprint, stage.as_str(), owner],
        )?;
        tx.commit()?;
        Ok(updated == 1)
    }

    /// `running -> failed`, or `running -> blocked` once `max_attempts`
    /// failures have accumulated. Returns the resulting state, or `None` if
    /// the caller did not hold the lock.
    pub fn fail_stage(
        &self,
        fingerprint: &str,
        stage: Stage,
        owner: &str,
        error: &str,
        max_attempts: u32,
    ) -> Result<Option<(StageState, i64)>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let attempts: Option<i64> = tx
            .query_row(
                "SELECT attempts FROM stage_status
                 WHERE fingerprint = ? AND stage = ? AND state = 'running' AND lock_owner = ?",
                params![fingerprint, stage.as_str(), owner],
                |row| row.get(0),
            )
            .optional()?;
        let Some(attempts) = attempts else {
            return Ok(None);
        };

        let attempts = attempts + 1;
        let next = if attempts >= i64::from(max_attempts) {
            StageState::Blocked
        } else {
            StageState::Failed
        };

        tx.execute(
            "UPDATE stage_status
             SET state = ?, attempts = ?, last_error = ?, lock_owner = NULL, updated_at = ?
             WHERE fingerprint = ? AND stage = ?",
            params![next.as_str(), attempts, error, now_timestamp(), fingerprint, stage.as_str()],
        )?;
        tx.commit()?;
        Ok(Some((next, attempts)))
    }

    /// Compare-and-set of one stage row: applies only if the row is still in
    /// `expected`. Artifact and error are written as given.
    pub fn set_stage_state(
        &self,
        fingerprint: &str,
        stage: Stage,
        expected: StageState,
        next: StageState,
        artifact_path: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_timestamp();
        let completed_at = if next == StageState::Done { Some(now.clone()) } else { None };
        let started_at = if next == StageState::Running { Some(now.clone()) } else { None };
        let updated = tx.execute(
            "UPDATE stage_status
             SET state = ?,
                 artifact_path = COALESCE(?, artifact_path),
                 last_error = ?,
                 started_at = COALESCE(?, started_at),
                 completed_at = COALESCE(?, completed_at),
                 lock_owner = CASE WHEN ? = 'running' THEN lock_owner ELSE NULL END,
                 updated_at = ?
             WHERE fingerprint = ? AND stage = ? AND state = ?",
            params![
                next.as_str(),
                artifact_path,
                error,
                started_at,
                completed_at,
                next.as_str(),
                now,
                fingerprint,
                stage.as_str(),
                expected.as_str()
            ],
        )?;
        tx.commit()?;
        Ok(updated == 1)
    }

    /// Startup reconciliation: every `running` stage belongs to a process
    /// that is gone. Each becomes `failed` (or `blocked` when out of
    /// attempts). Returns (fingerprint, stage, new state).
    pub fn recover_interrupted(&self, max_attempts: u32) -> Result<Vec<(String, Stage, StageState)>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let running: Vec<(String, String, i64)> = {
            let mut stmt = tx.prepare(
                "SELECT fingerprint, stage, attempts FROM stage_status WHERE state = 'running'
                 ORDER BY fingerprint, stage_order",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let now = now_timestamp();
        let mut recovered = Vec::with_capacity(running.len());
        for (fingerprint, stage, attempts) in running {
            let stage: Stage = stage
                .parse()
                .map_err(|e: String| anyhow::anyhow!("corrupt stage row for {}: {}", fingerprint, e))?;
            let attempts = attempts + 1;
            let next = if attempts >= i64::from(max_attempts) {
                StageState::Blocked
            } else {
                StageState::Failed
            };
            tx.execute(
                "UPDATE stage_status
                 SET state = ?, attempts = ?, lock_owner = NULL,
                     last_error = 'interrupted: process exited while stage was running',
                     updated_at = ?
                 WHERE fingerprint = ? AND stage = ?",
                params![next.as_str(), attempts, now, fingerprint, stage.as_str()],
            )?;
            recovered.push((fingerprint, stage, next));
        }

        tx.commit()?;
        Ok(recovered)
    }

    /// Operator retry: blocked/failed stages of a file become `failed` with
    /// a fresh attempt budget. Completed stages are untouched.
    pub fn reset_attempts(&self, fingerprint: &str) -> Result<usize> {
        let conn = self.lock()?;
        let count = conn.execute(
            "UPDATE stage_status
             SET state = 'failed', attempts = 0, updated_at = ?
             WHERE fingerprint = ? AND state IN ('blocked', 'failed')",
            params![now_timestamp(), fingerprint],
        )?;
        Ok(count)
    }

    pub fn get_blocked_files(&self) -> Result<Vec<SourceFile>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM source_files f
             WHERE f.superseded = 0
               AND EXISTS (SELECT 1 FROM stage_status s
                           WHERE s.fingerprint = f.fingerprint AND s.state = 'blocked')
             ORDER BY f.episode_number ASC, f.fingerprint ASC",
            SOURCE_FILE_COLUMNS
                .split(", ")
                .map(|c| format!("f.{}", c))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut stmt = conn.prepare(&sql)?;
        let files = stmt
            .query_map([], source_file_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(files)
    }
}
