pub mod idioms;
pub mod models;
pub mod registry;


use anyhow::{anyhow, Result};
use chrono::SecondsFormat;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub use models::*;

/// Durable store for the registry (source files, stage status) and the
/// aggregator (occurrences, frequency index, rejections).
///
/// Opened once at process start and shared as `Arc<Database>`; `close`
/// checkpoints the WAL on shutdown.
pub struct Database {
    conn: Mutex<Connection>,
    path: PathBuf,
}

/// Fixed-width UTC timestamp so stored values order lexically.
pub(crate) fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        // WAL keeps the last committed state readable if the process dies mid-write
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=FULL;
            PRAGMA foreign_keys=ON;
            PRAGMA busy_timeout=5000;
            PRAGMA cache_size=10000;
            PRAGMA temp_store=MEMORY;
        ",
        )?;

        let db = Self {
            conn: Mutex::new(conn),
            path: db_path.to_path_buf(),
        };

        db.init_schema()?;

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    /// Flush the WAL into the main database file.
    pub fn close(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        log::info!("Database checkpointed and closed: {}", self.path.display());
        Ok(())
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS source_files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fingerprint TEXT NOT NULL UNIQUE,
                path TEXT NOT NULL,
                episode_number INTEGER NOT NULL,
                file_size INTEGER,
                superseded INTEGER NOT NULL DEFAULT 0,
                added_date TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_source_files_path ON source_files(path);
            CREATE INDEX IF NOT EXISTS idx_source_files_episode
                ON source_files(superseded, episode_number, fingerprint);

            -- One row per (fingerprint, stage); the running marker is the stage lock
            CREATE TABLE IF NOT EXISTS stage_status (
                fingerprint TEXT NOT NULL,
                stage TEXT NOT NULL,
                stage_order INTEGER NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                artifact_path TEXT,
                last_error TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                lock_owner TEXT,
                started_at TEXT,
                completed_at TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (fingerprint, stage),
                FOREIGN KEY (fingerprint) REFERENCES source_files(fingerprint) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_stage_status_state ON stage_status(state);

            CREATE TABLE IF NOT EXISTS idiom_occurrences (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                idiom_text TEXT NOT NULL,
                episode_number INTEGER NOT NULL,
                start_ms INTEGER NOT NULL,
                end_ms INTEGER NOT NULL,
                source_fingerprint TEXT NOT NULL,
                sentence_index INTEGER NOT NULL,
                raw_text TEXT,
                correction_note TEXT,
                clip_path TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(idiom_text, episode_number, start_ms)
            );

            CREATE INDEX IF NOT EXISTS idx_occurrences_fingerprint
                ON idiom_occurrences(source_fingerprint);
            CREATE INDEX IF NOT EXISTS idx_occurrences_episode
                ON idiom_occurrences(episode_number, start_ms);

            -- Incrementally maintained; always rebuildable from idiom_occurrences
            CREATE TABLE IF NOT EXISTS frequency_index (
                idiom_text TEXT PRIMARY KEY,
                total_count INTEGER NOT NULL,
                episode_refs TEXT NOT NULL,
                last_updated TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rejected_detections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_fingerprint TEXT NOT NULL,
                episode_number INTEGER NOT NULL,
                batch_index INTEGER NOT NULL,
                entry_index INTEGER,
                raw_entry TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_rejections_fingerprint
                ON rejected_detections(source_fingerprint);

            CREATE TABLE IF NOT EXISTS pipeline_errors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                stage TEXT NOT NULL,
                fingerprint TEXT,
                error_kind TEXT NOT NULL,
                message TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                resolved INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_pipeline_errors_fingerprint
                ON pipeline_errors(fingerprint, resolved);

            -- App settings (key-value store)
            CREATE TABLE IF NOT EXISTS app_settings (
                key TEXT PRIMARY KEY,
                value TEXT,
                updated_at TEXT DEFAULT (datetime('now'))
            );

            INSERT OR IGNORE INTO app_settings (key, value) VALUES
                ('paused', 'false'),
                ('aggregation_halted', 'false');
        "#,
        )?;

        Ok(())
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let result = conn.query_row(
            "SELECT value FROM app_settings WHERE key = ?",
            params![key],
            |row| row.get(0),
        );
        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO app_settings (key, value, updated_at) VALUES (?, ?, ?)",
            params![key, value, now_timestamp()],
        )?;
        Ok(())
    }

    pub fn get_all_settings(&self) -> Result<HashMap<String, String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT key, value FROM app_settings")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut settings = HashMap::new();
        for row in rows {
            let (key, value) = row?;
            settings.insert(key, value);
        }
        Ok(settings)
    }

    pub fn get_flag(&self, key: &str) -> Result<bool> {
        Ok(self.get_setting(key)?.map(|v| v == "true").unwrap_or(false))
    }

    pub fn set_flag(&self, key: &str, value: bool) -> Result<()> {
        self.set_setting(key, if value { "true" } else { "false" })
    }

    // =========================================================================
    // Pipeline errors
    // =========================================================================

    pub fn log_pipeline_error(
        &self,
        stage: &str,
        fingerprint: Option<&str>,
        error_kind: &str,
        message: &str,
        attempt: i64,
    ) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO pipeline_errors (stage, fingerprint, error_kind, message, attempt, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![stage, fingerprint, error_kind, message, attempt, now_timestamp()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn mark_pipeline_errors_resolved(&self, fingerprint: &str) -> Result<usize> {
        let conn = self.lock()?;
        let count = conn.execute(
            "UPDATE pipeline_errors SET resolved = 1 WHERE fingerprint = ? AND resolved = 0",
            params![fingerprint],
        )?;
        Ok(count)
    }

    pub fn get_recent_pipeline_errors(&self, limit: i64) -> Result<Vec<PipelineError>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, stage, fingerprint, error_kind, message, attempt, resolved, created_at
             FROM pipeline_errors ORDER BY id DESC LIMIT ?",
        )?;
        let errors = stmt
            .query_map(params![limit], |row| {
                Ok(PipelineError {
                    id: row.get(0)?,
                    stage: row.get(1)?,
                    fingerprint: row.get(2)?,
                    error_kind: row.get(3)?,
                    message: row.get(4)?,
                    attempt: row.get(5)?,
                    resolved: row.get::<_, i32>(6)? == 1,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(errors)
    }

    // =========================================================================
    // Stats
    // =========================================================================

    pub fn get_pipeline_stats(&self) -> Result<PipelineStats> {
        let conn = self.lock()?;

        let total_files: i64 =
            conn.query_row("SELECT COUNT(*) FROM source_files", [], |row| row.get(0))?;
        let superseded_files: i64 = conn.query_row(
            "SELECT COUNT(*) FROM source_files WHERE superseded = 1",
            [],
            |row| row.get(0),
        )?;
        let completed_files: i64 = conn.query_row(
            "SELECT COUNT(*) FROM source_files f WHERE f.superseded = 0
               AND NOT EXISTS (SELECT 1 FROM stage_status s
                               WHERE s.fingerprint = f.fingerprint AND s.state != 'done')",
            [],
            |row| row.get(0),
        )?;
        let blocked_files: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT s.fingerprint) FROM stage_status s
             JOIN source_files f ON f.fingerprint = s.fingerprint
             WHERE s.state = 'blocked' AND f.superseded = 0",
            [],
            |row| row.get(0),
        )?;

        let mut stages = std::collections::BTreeMap::new();
        for stage in Stage::ALL {
            stages.insert(stage.as_str().to_string(), StageStateCounts::default());
        }
        {
            let mut stmt = conn.prepare(
                "SELECT s.stage, s.state, COUNT(*) FROM stage_status s
                 JOIN source_files f ON f.fingerprint = s.fingerprint
                 WHERE f.superseded = 0
                 GROUP BY s.stage, s.state",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            for row in rows {
                let (stage, state, count) = row?;
                let state: StageState = state
                    .parse()
                    .map_err(|e: String| anyhow!("corrupt {} row: {}", stage, e))?;
                let counts = stages.entry(stage).or_default();
                match state {
                    StageState::Pending => counts.pending = count,
                    StageState::Running => counts.running = count,
                    StageState::Done => counts.done = count,
                    StageState::Failed => counts.failed = count,
                    StageState::Blocked => counts.blocked = count,
                }
            }
        }

        let total_occurrences: i64 =
            conn.query_row("SELECT COUNT(*) FROM idiom_occurrences", [], |row| row.get(0))?;
        let distinct_idioms: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT idiom_text) FROM idiom_occurrences",
            [],
            |row| row.get(0),
        )?;
        let clips_cut: i64 = conn.query_row(
            "SELECT COUNT(*) FROM idiom_occurrences WHERE clip_path IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        let rejected_detections: i64 =
            conn.query_row("SELECT COUNT(*) FROM rejected_detections", [], |row| row.get(0))?;
        let unresolved_errors: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pipeline_errors WHERE resolved = 0",
            [],
            |row| row.get(0),
        )?;

        Ok(PipelineStats {
            total_files,
            superseded_files,
            completed_files,
            blocked_files,
            stages,
            total_occurrences,
            distinct_idioms,
            clips_cut,
            rejected_detections,
            unresolved_errors,
        })
    }
}
