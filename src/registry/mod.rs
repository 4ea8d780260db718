//! Content Registry: which source files exist, what their content is, and
//! how far each has progressed through the stages.
//!
//! Identity is the content fingerprint. A renamed file keeps its history; a
//! file whose bytes changed is a new fingerprint and starts from `audio`.

pub mod fingerprint;

pub use fingerprint::{fingerprint_file, parse_episode_number};

use crate::database::{Database, SourceFile, Stage, StageState, StageStatus};
use crate::error::AppError;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// One file found on disk by `scan`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub fingerprint: String,
    pub episode_number: i64,
    pub file_size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanIssue {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default, Serialize)]
pub struct ScanReport {
    pub files: Vec<ScannedFile>,
    /// Unreadable files; logged and left out of `files`.
    pub errors: Vec<ScanIssue>,
    /// Video files without an episode number.
    pub skipped: Vec<ScanIssue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangedFile {
    pub file: ScannedFile,
    pub previous_fingerprint: String,
}

#[derive(Debug, Default, Serialize)]
pub struct ScanDiff {
    pub new: Vec<ScannedFile>,
    pub unchanged: Vec<ScannedFile>,
    pub changed: Vec<ChangedFile>,
}

#[derive(Debug, Default, Serialize)]
pub struct SyncReport {
    pub registered: usize,
    pub changed: usize,
    pub renamed: usize,
    pub unchanged: usize,
    pub superseded: usize,
    pub errors: Vec<ScanIssue>,
    pub skipped: Vec<ScanIssue>,
}

/// Classify scanned files against the registered set.
///
/// A known fingerprint is `unchanged` wherever it now lives. An unseen
/// fingerprint at a path a live file is registered under is `changed`;
/// anything else unseen is `new`. The same content found at two paths is
/// reported once, at the first path.
pub fn diff(known: &[SourceFile], scanned: &[ScannedFile]) -> ScanDiff {
    let known_fingerprints: HashSet<&str> = known.iter().map(|f| f.fingerprint.as_str()).collect();
    let live_by_path: HashMap<&str, &str> = known
        .iter()
        .filter(|f| !f.superseded)
        .map(|f| (f.path.as_str(), f.fingerprint.as_str()))
        .collect();

    let mut result = ScanDiff::default();
    let mut seen = HashSet::new();
    for file in scanned {
        if !seen.insert(file.fingerprint.as_str()) {
            log::warn!(
                "Duplicate content at {} (fingerprint {} already seen), ignoring",
                file.path.display(),
                short(&file.fingerprint)
            );
            continue;
        }

        if known_fingerprints.contains(file.fingerprint.as_str()) {
            result.unchanged.push(file.clone());
            continue;
        }

        let path = file.path.to_string_lossy();
        match live_by_path.get(path.as_ref()) {
            Some(previous) => result.changed.push(ChangedFile {
                file: file.clone(),
                previous_fingerprint: previous.to_string(),
            }),
            None => result.new.push(file.clone()),
        }
    }
    result
}

pub(crate) fn short(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(12)]
}

#[derive(Clone)]
pub struct Registry {
    db: Arc<Database>,
    extensions: Vec<String>,
}

impl Registry {
    pub fn new(db: Arc<Database>, extensions: &[String]) -> Self {
        Self {
            db,
            extensions: extensions.iter().map(|e| e.to_lowercase()).collect(),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    fn is_video(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| self.extensions.contains(&ext.to_string_lossy().to_lowercase()))
            .unwrap_or(false)
    }

    /// Fingerprint every video file under `directory`.
    ///
    /// Fails only when the directory itself is missing; unreadable entries
    /// are logged and skipped.
    pub fn scan(&self, directory: &Path) -> Result<ScanReport, AppError> {
        if !directory.is_dir() {
            return Err(AppError::Io(format!(
                "scan directory not found: {}",
                directory.display()
            )));
        }

        let mut report = ScanReport::default();
        let mut candidates = Vec::new();
        for entry in WalkDir::new(directory).follow_links(false) {
            match entry {
                Ok(entry) => {
                    if entry.file_type().is_file() && self.is_video(entry.path()) {
                        candidates.push(entry.into_path());
                    }
                }
                Err(e) => {
                    log::warn!("Error accessing entry: {}", e);
                    report.errors.push(ScanIssue {
                        path: e.path().map(Path::to_path_buf).unwrap_or_default(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        candidates.sort();

        for path in candidates {
            let Some(episode_number) = parse_episode_number(&path) else {
                log::warn!("No episode number in {}, skipping", path.display());
                report.skipped.push(ScanIssue {
                    path,
                    reason: "no episode number in file name".to_string(),
                });
                continue;
            };

            let fingerprint = match fingerprint_file(&path) {
                Ok(fp) => fp,
                Err(e) => {
                    log::warn!("Skipping unreadable file {}: {}", path.display(), e);
                    report.errors.push(ScanIssue {
                        path,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            let file_size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

            report.files.push(ScannedFile {
                path,
                fingerprint,
                episode_number,
                file_size,
            });
        }

        log::info!(
            "Scanned {}: {} video files, {} errors, {} skipped",
            directory.display(),
            report.files.len(),
            report.errors.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    /// Scan `directory` and bring the store in line with it.
    pub fn sync(&self, directory: &Path) -> Result<SyncReport, AppError> {
        let scan = self.scan(directory)?;
        let known = self.db.get_source_files(true)?;
        let changes = diff(&known, &scan.files);

        let mut report = SyncReport {
            errors: scan.errors,
            skipped: scan.skipped,
            ..Default::default()
        };

        for file in &changes.new {
            self.register(file)?;
            log::info!(
                "Registered episode {} ({}) fingerprint {}",
                file.episode_number,
                file.path.display(),
                short(&file.fingerprint)
            );
            report.registered += 1;
        }

        for change in &changes.changed {
            self.db.mark_superseded(&change.previous_fingerprint)?;
            self.register(&change.file)?;
            log::info!(
                "Content changed at {}: {} supersedes {}",
                change.file.path.display(),
                short(&change.file.fingerprint),
                short(&change.previous_fingerprint)
            );
            report.changed += 1;
        }

        let known_by_fp: HashMap<&str, &SourceFile> =
            known.iter().map(|f| (f.fingerprint.as_str(), f)).collect();
        for file in &changes.unchanged {
            let path = file.path.to_string_lossy();
            match known_by_fp.get(file.fingerprint.as_str()) {
                Some(existing) if existing.path == path && !existing.superseded => {
                    report.unchanged += 1;
                }
                _ => {
                    self.db.update_source_path(&file.fingerprint, &path)?;
                    log::info!("Fingerprint {} now at {}", short(&file.fingerprint), path);
                    report.renamed += 1;
                }
            }
        }

        // Anything live that the scan did not find has vanished. Paths that
        // failed to read are left alone; their content is unknown.
        let present: HashSet<&str> = scan.files.iter().map(|f| f.fingerprint.as_str()).collect();
        let unreadable: HashSet<PathBuf> = report.errors.iter().map(|e| e.path.clone()).collect();
        let replaced: HashSet<&str> = changes
            .changed
            .iter()
            .map(|c| c.previous_fingerprint.as_str())
            .collect();
        for file in known.iter().filter(|f| !f.superseded) {
            if present.contains(file.fingerprint.as_str())
                || replaced.contains(file.fingerprint.as_str())
                || unreadable.contains(Path::new(&file.path))
            {
                continue;
            }
            if self.db.mark_superseded(&file.fingerprint)? {
                log::info!(
                    "Episode {} ({}) no longer present, fingerprint {} superseded",
                    file.episode_number,
                    file.path,
                    short(&file.fingerprint)
                );
                report.superseded += 1;
            }
        }

        Ok(report)
    }

    fn register(&self, file: &ScannedFile) -> Result<(), AppError> {
        self.db.register_source_file(
            &file.fingerprint,
            &file.path.to_string_lossy(),
            file.episode_number,
            Some(file.file_size as i64),
        )?;
        Ok(())
    }

    pub fn get_status(&self, fingerprint: &str) -> Result<StageStatus, AppError> {
        self.db
            .get_stage_status(fingerprint)?
            .ok_or_else(|| AppError::NotFound(format!("fingerprint {}", fingerprint)))
    }

    /// Validated, atomic stage update for callers outside the controller's
    /// lock protocol. Illegal transitions are `Validation` errors; losing a
    /// race to a concurrent writer is reported the same way.
    pub fn set_stage(
        &self,
        fingerprint: &str,
        stage: Stage,
        state: StageState,
        artifact_path: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        let status = self.get_status(fingerprint)?;
        let current = status.state_of(stage);
        if !current.can_transition_to(state) {
            return Err(AppError::Validation(format!(
                "{} stage of {}: {} -> {} is not allowed",
                stage,
                short(fingerprint),
                current,
                state
            )));
        }
        if state == StageState::Running {
            if let Some(prev) = stage.previous() {
                if status.state_of(prev) != StageState::Done {
                    return Err(AppError::Validation(format!(
                        "{} stage of {} cannot run before {} is done",
                        stage,
                        short(fingerprint),
                        prev
                    )));
                }
            }
        }

        if !self
            .db
            .set_stage_state(fingerprint, stage, current, state, artifact_path, error)?
        {
            return Err(AppError::Validation(format!(
                "{} stage of {} changed concurrently",
                stage,
                short(fingerprint)
            )));
        }
        Ok(())
    }

    pub fn files_for_episode(&self, episode_number: i64) -> Result<Vec<SourceFile>, AppError> {
        Ok(self.db.get_source_files_by_episode(episode_number)?)
    }
}
