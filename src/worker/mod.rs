//! Pipeline Controller: drives each registered file through
//! audio -> transcript -> idioms -> clips.
//!
//! All progress lives in the store. A stage is claimed by atomically moving
//! it to `running` under this controller's id, executed, and then moved to
//! `done` (or `failed`/`blocked`). Where to resume is read back from the
//! stage records, never inferred from which files happen to exist.

pub mod artifacts;
pub mod batching;

use crate::aggregator::Aggregator;
use crate::config::AppConfig;
use crate::database::{Database, FileState, Stage, StageState, StageStatus, WorkItem};
use crate::error::AppError;
use crate::executors::StageExecutors;
use crate::registry::{short, Registry, SyncReport};
use crate::transcript::Transcript;
use artifacts::{
    partial_path, write_json_atomic, ArtifactLayout, BatchSummary, ClipEntry, ClipManifest,
    IdiomsArtifact,
};
use batching::{effective_batch_size, plan_batches};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Persisted operator toggle; honoured between stages.
pub const PAUSED_FLAG: &str = "paused";

/// The stage currently executing, for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct ActiveStage {
    pub fingerprint: String,
    pub episode_number: i64,
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
}

/// Shared worker state for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct WorkerState {
    pub current: Option<ActiveStage>,
    pub processed_count: i64,
    pub last_activity: Option<DateTime<Utc>>,
    pub paused: bool,
    pub last_error: Option<String>,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self {
            current: None,
            processed_count: 0,
            last_activity: Some(Utc::now()),
            paused: false,
            last_error: None,
        }
    }
}

impl WorkerState {
    pub fn is_processing(&self) -> bool {
        self.current.is_some()
    }
}

/// What one pass over the work candidates did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub files_processed: usize,
    pub stages_run: usize,
    pub stages_reused: usize,
    pub stages_failed: usize,
    pub blocked: usize,
    pub paused: bool,
    pub cancelled: bool,
    pub halted: bool,
}

enum StageOutcome {
    Executed(PathBuf),
    Reused(PathBuf),
}

enum FileOutcome {
    Completed,
    Failed(Option<StageState>),
    Halted,
    Paused,
    Cancelled,
    Skipped,
}

/// Control surface shared with signal handlers and operator commands.
#[derive(Clone)]
pub struct ControllerHandle {
    db: Arc<Database>,
    state: Arc<RwLock<WorkerState>>,
    cancel: CancellationToken,
    drain: CancellationToken,
}

impl ControllerHandle {
    /// Stop starting new stages. The stage in flight runs to completion.
    pub async fn pause(&self) -> Result<(), AppError> {
        self.db.set_flag(PAUSED_FLAG, true)?;
        self.state.write().await.paused = true;
        log::info!("Pipeline paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), AppError> {
        self.db.set_flag(PAUSED_FLAG, false)?;
        self.state.write().await.paused = false;
        log::info!("Pipeline resumed");
        Ok(())
    }

    /// Graceful stop: finish the stage in flight, then exit. Unlike
    /// `pause` this is not persisted.
    pub fn shutdown(&self) {
        log::info!("Shutdown requested, finishing current stage");
        self.drain.cancel();
    }

    /// Hard stop: in-flight executors are killed and their stage is left
    /// `running`, to be recovered on the next start.
    pub fn stop(&self) {
        log::warn!("Hard stop requested");
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.drain.is_cancelled()
    }

    pub async fn state(&self) -> WorkerState {
        self.state.read().await.clone()
    }
}

pub struct PipelineController<E: StageExecutors> {
    registry: Registry,
    aggregator: Aggregator,
    executors: Arc<E>,
    layout: ArtifactLayout,
    config: AppConfig,
    state: Arc<RwLock<WorkerState>>,
    worker_id: String,
    cancel: CancellationToken,
    drain: CancellationToken,
}

impl<E: StageExecutors> PipelineController<E> {
    pub fn new(registry: Registry, aggregator: Aggregator, executors: Arc<E>, config: AppConfig) -> Self {
        let layout = ArtifactLayout::new(&config.work_dir(), &config.clips_dir());
        Self {
            registry,
            aggregator,
            executors,
            layout,
            config,
            state: Arc::new(RwLock::new(WorkerState::default())),
            worker_id: uuid::Uuid::new_v4().to_string(),
            cancel: CancellationToken::new(),
            drain: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            db: self.db().clone(),
            state: self.state.clone(),
            cancel: self.cancel.clone(),
            drain: self.drain.clone(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    fn db(&self) -> &Arc<Database> {
        self.registry.database()
    }

    /// Startup reconciliation. Stages left `running` by a dead process
    /// become `failed` (or `blocked`) and are picked up again.
    pub fn recover(&self) -> Result<usize, AppError> {
        let recovered = self.db().recover_interrupted(self.config.max_attempts)?;
        for (fingerprint, stage, state) in &recovered {
            if *state == StageState::Blocked {
                log::error!(
                    "ALERT: {} interrupted at {} and out of attempts, blocked",
                    short(fingerprint),
                    stage
                );
            } else {
                log::warn!(
                    "Recovered interrupted {} stage of {}, eligible for retry",
                    stage,
                    short(fingerprint)
                );
            }
        }
        Ok(recovered.len())
    }

    pub async fn sync_sources(&self) -> Result<SyncReport, AppError> {
        let registry = self.registry.clone();
        let dir = self.config.raw_video_dir();
        tokio::task::spawn_blocking(move || registry.sync(&dir))
            .await
            .map_err(|e| AppError::Other(format!("scan task failed: {}", e)))?
    }

    async fn is_paused(&self) -> bool {
        let paused = match self.db().get_flag(PAUSED_FLAG) {
            Ok(flag) => flag,
            Err(e) => {
                log::warn!("Failed to read pause flag: {}", e);
                false
            }
        };
        let mut ws = self.state.write().await;
        ws.paused = paused;
        paused
    }

    /// One pass over the current candidates, each file taken end to end
    /// before the next. Returns early on pause or hard stop.
    pub async fn run_once(&self) -> Result<RunSummary, AppError> {
        self.layout.ensure_dirs()?;
        let candidates = self.db().get_work_candidates()?;
        let mut summary = RunSummary::default();

        if !candidates.is_empty() {
            log::info!("{} file(s) with pending work", candidates.len());
        }

        for item in &candidates {
            match self.process_file(item, &mut summary).await? {
                FileOutcome::Completed => {
                    summary.files_processed += 1;
                    self.db().mark_pipeline_errors_resolved(&item.fingerprint)?;
                    let mut ws = self.state.write().await;
                    ws.processed_count += 1;
                    ws.last_activity = Some(Utc::now());
                    log::info!(
                        "Episode {} ({}) complete",
                        item.episode_number,
                        short(&item.fingerprint)
                    );
                }
                FileOutcome::Failed(Some(StageState::Blocked)) => summary.blocked += 1,
                FileOutcome::Failed(_) | FileOutcome::Skipped => {}
                FileOutcome::Halted => summary.halted = true,
                FileOutcome::Paused => {
                    summary.paused = true;
                    log::info!("Paused, not starting further stages");
                    break;
                }
                FileOutcome::Cancelled => {
                    summary.cancelled = true;
                    break;
                }
            }
        }

        Ok(summary)
    }

    /// Recover, then scan and process until stopped.
    pub async fn run(&self) {
        log::info!("Pipeline controller {} started", self.worker_id);

        if let Err(e) = self.recover() {
            log::error!("Failed to recover interrupted stages: {}", e);
        }

        let poll = std::time::Duration::from_secs(self.config.poll_interval_secs.max(1));
        loop {
            if self.cancel.is_cancelled() || self.drain.is_cancelled() {
                break;
            }

            match self.sync_sources().await {
                Ok(report) => log::debug!("Scan: {:?}", report),
                Err(e) => log::error!("Scan of source directory failed: {}", e),
            }

            match self.run_once().await {
                Ok(summary) if summary.cancelled => break,
                Ok(summary) => {
                    if summary.stages_run + summary.stages_failed > 0 {
                        log::info!(
                            "Pass finished: {} file(s) done, {} stage(s) run, {} reused, {} failed",
                            summary.files_processed,
                            summary.stages_run,
                            summary.stages_reused,
                            summary.stages_failed
                        );
                    }
                }
                Err(e) => {
                    log::error!("Pipeline pass aborted: {}", e);
                    self.state.write().await.last_error = Some(e.to_string());
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.drain.cancelled() => break,
                _ = tokio::time::sleep(poll) => {}
            }
        }

        log::info!("Pipeline controller stopped");
    }

    async fn process_file(&self, item: &WorkItem, summary: &mut RunSummary) -> Result<FileOutcome, AppError> {
        loop {
            if self.cancel.is_cancelled() || self.drain.is_cancelled() {
                return Ok(FileOutcome::Cancelled);
            }
            if self.is_paused().await {
                return Ok(FileOutcome::Paused);
            }

            let status = self.registry.get_status(&item.fingerprint)?;
            let Some(stage) = status.resume_point() else {
                return Ok(if status.overall() == FileState::Done {
                    FileOutcome::Completed
                } else {
                    FileOutcome::Skipped
                });
            };

            if stage == Stage::Idioms && self.aggregator.is_halted()? {
                log::warn!(
                    "Aggregation halted, episode {} waits at idioms until reconcile",
                    item.episode_number
                );
                return Ok(FileOutcome::Halted);
            }

            if !self.db().try_acquire_stage(&item.fingerprint, stage, &self.worker_id)? {
                log::debug!("{} of {} is held elsewhere", stage, short(&item.fingerprint));
                return Ok(FileOutcome::Skipped);
            }

            log::info!(
                "Episode {} ({}): {} running",
                item.episode_number,
                short(&item.fingerprint),
                stage
            );
            self.set_active(item, stage).await;
            let result = self.execute_stage(item, stage, &status).await;
            self.state.write().await.current = None;

            match result {
                Ok(outcome) => {
                    let (path, reused) = match outcome {
                        StageOutcome::Executed(p) => (p, false),
                        StageOutcome::Reused(p) => (p, true),
                    };
                    let artifact = path.to_string_lossy();
                    if !self
                        .db()
                        .complete_stage(&item.fingerprint, stage, &self.worker_id, &artifact)?
                    {
                        log::warn!("Lost the {} lock for {}", stage, short(&item.fingerprint));
                        return Ok(FileOutcome::Skipped);
                    }
                    if reused {
                        summary.stages_reused += 1;
                    } else {
                        summary.stages_run += 1;
                    }
                    log::info!(
                        "Episode {} ({}): {} done -> {}",
                        item.episode_number,
                        short(&item.fingerprint),
                        stage,
                        artifact
                    );
                }
                Err(AppError::Cancelled) => {
                    log::warn!(
                        "Hard stop during {} of {}, stage left running",
                        stage,
                        short(&item.fingerprint)
                    );
                    return Ok(FileOutcome::Cancelled);
                }
                Err(e) => {
                    summary.stages_failed += 1;
                    if e.is_fatal() {
                        summary.halted = true;
                    }
                    let state = self.record_failure(item, stage, &e).await?;
                    return Ok(FileOutcome::Failed(state));
                }
            }
        }
    }

    async fn set_active(&self, item: &WorkItem, stage: Stage) {
        let mut ws = self.state.write().await;
        ws.current = Some(ActiveStage {
            fingerprint: item.fingerprint.clone(),
            episode_number: item.episode_number,
            stage,
            started_at: Utc::now(),
        });
        ws.last_activity = Some(Utc::now());
    }

    /// Errors that cannot succeed on a retry use up the budget at once.
    async fn record_failure(
        &self,
        item: &WorkItem,
        stage: Stage,
        error: &AppError,
    ) -> Result<Option<StageState>, AppError> {
        let budget = if error.is_retryable() || error.is_fatal() {
            self.config.max_attempts
        } else {
            1
        };
        let message = error.to_string();
        let result = self
            .db()
            .fail_stage(&item.fingerprint, stage, &self.worker_id, &message, budget)?;
        let attempt = result.map(|(_, a)| a).unwrap_or(0);
        self.db().log_pipeline_error(
            stage.as_str(),
            Some(&item.fingerprint),
            error.kind(),
            &message,
            attempt,
        )?;
        self.state.write().await.last_error = Some(message.clone());

        match result {
            Some((StageState::Blocked, attempts)) => log::error!(
                "ALERT: episode {} ({}) blocked at {} after {} attempt(s): {}",
                item.episode_number,
                short(&item.fingerprint),
                stage,
                attempts,
                message
            ),
            Some((_, attempts)) => log::warn!(
                "Episode {} ({}): {} failed (attempt {}/{}): {}",
                item.episode_number,
                short(&item.fingerprint),
                stage,
                attempts,
                budget,
                message
            ),
            None => log::warn!("Lost the {} lock for {} while failing it", stage, short(&item.fingerprint)),
        }
        if error.is_fatal() {
            log::error!("ALERT: {}; run `reconcile` to resume aggregation", message);
        }
        Ok(result.map(|(s, _)| s))
    }

    /// Reuse a valid artifact left by an earlier attempt, otherwise run the
    /// executor.
    async fn execute_stage(
        &self,
        item: &WorkItem,
        stage: Stage,
        status: &StageStatus,
    ) -> Result<StageOutcome, AppError> {
        let target = self.layout.path_for(stage, &item.fingerprint);
        if target.exists() {
            match artifacts::validate(stage, &target) {
                Ok(()) => {
                    log::info!(
                        "Reusing {} artifact for {}: {}",
                        stage,
                        short(&item.fingerprint),
                        target.display()
                    );
                    return Ok(StageOutcome::Reused(target));
                }
                Err(e) => log::warn!("Discarding invalid {} artifact {}: {}", stage, target.display(), e),
            }
        }

        match stage {
            Stage::Audio => self.run_audio(item, &target).await?,
            Stage::Transcript => self.run_transcript(item, status, &target).await?,
            Stage::Idioms => self.run_idioms(item, status, &target).await?,
            Stage::Clips => self.run_clips(item, status, &target).await?,
        }
        Ok(StageOutcome::Executed(target))
    }

    /// Artifact recorded for `stage`, or where it would have been written.
    fn input_artifact(&self, status: &StageStatus, stage: Stage) -> PathBuf {
        status
            .artifact_of(stage)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.layout.path_for(stage, &status.fingerprint))
    }

    async fn run_audio(&self, item: &WorkItem, target: &Path) -> Result<(), AppError> {
        let partial = partial_path(target);
        let _ = std::fs::remove_file(&partial);

        if let Err(e) = self
            .executors
            .extract_audio(Path::new(&item.path), &partial, &self.cancel)
            .await
        {
            if !matches!(e, AppError::Cancelled) {
                let _ = std::fs::remove_file(&partial);
            }
            return Err(e);
        }

        if let Err(e) = artifacts::validate_audio(&partial) {
            let _ = std::fs::remove_file(&partial);
            return Err(e);
        }
        std::fs::rename(&partial, target)?;
        Ok(())
    }

    async fn run_transcript(&self, item: &WorkItem, status: &StageStatus, target: &Path) -> Result<(), AppError> {
        let audio = self.input_artifact(status, Stage::Audio);
        let transcript = self.executors.transcribe(&audio, &self.cancel).await?;
        transcript.validate()?;
        if transcript.sentences.is_empty() {
            return Err(AppError::Transcription(format!(
                "empty transcript for episode {}",
                item.episode_number
            )));
        }
        write_json_atomic(target, &transcript)
    }

    async fn run_idioms(&self, item: &WorkItem, status: &StageStatus, target: &Path) -> Result<(), AppError> {
        let transcript = Transcript::load(&self.input_artifact(status, Stage::Transcript))?;
        let batch_size = effective_batch_size(self.config.batch_size);
        let spans = plan_batches(&item.fingerprint, item.episode_number, &transcript, batch_size);
        log::info!(
            "Episode {}: {} sentences in {} batch(es) of up to {}",
            item.episode_number,
            transcript.sentences.len(),
            spans.len(),
            batch_size
        );

        let mut batches = Vec::with_capacity(spans.len());
        for span in spans {
            if self.cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            // A failed call fails the stage; an unusable reply only loses this batch.
            let response = self.executors.detect_idioms(&span, &self.cancel).await?;

            let mut summary = BatchSummary {
                batch_index: span.batch_index,
                first_sentence: span.first_sentence,
                sentence_count: span.sentences.len(),
                accepted: Vec::new(),
                rejected: 0,
                malformed: false,
            };
            match self.aggregator.ingest_response(span, &response) {
                Ok(outcome) => {
                    summary.accepted = outcome.accepted.iter().map(|a| a.occurrence_id).collect();
                    summary.rejected = outcome.rejected.len();
                }
                Err(AppError::Extraction(reason)) => {
                    log::warn!(
                        "Episode {} batch {} rejected: {}",
                        item.episode_number,
                        summary.batch_index,
                        reason
                    );
                    summary.malformed = true;
                }
                Err(e) => return Err(e),
            }
            batches.push(summary);
        }

        self.aggregator.verify_consistency()?;

        write_json_atomic(
            target,
            &IdiomsArtifact {
                fingerprint: item.fingerprint.clone(),
                episode_number: item.episode_number,
                batches,
            },
        )
    }

    async fn run_clips(&self, item: &WorkItem, status: &StageStatus, target: &Path) -> Result<(), AppError> {
        let video = Path::new(&item.path);
        let audio = self.input_artifact(status, Stage::Audio);
        let duration = match artifacts::wav_duration(&audio) {
            Ok(d) => d,
            Err(e) => {
                log::debug!("No duration from {}: {}", audio.display(), e);
                None
            }
        };
        let requests = self.aggregator.clip_requests(
            &item.fingerprint,
            self.config.clip_padding_start,
            self.config.clip_padding_end,
            duration,
        )?;

        let mut clips = Vec::with_capacity(requests.len());
        for request in &requests {
            if self.cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            if let Some(existing) = request.existing_clip.as_deref() {
                if is_non_empty(Path::new(existing)) {
                    clips.push(ClipEntry {
                        occurrence_id: request.occurrence_id,
                        idiom_text: request.idiom_text.clone(),
                        path: existing.to_string(),
                    });
                    continue;
                }
            }

            let clip_path = self.layout.clip_path(&request.file_name);
            let partial = partial_path(&clip_path);
            let _ = std::fs::remove_file(&partial);
            if let Err(e) = self
                .executors
                .cut_clip(video, request, &partial, &self.cancel)
                .await
            {
                if !matches!(e, AppError::Cancelled) {
                    let _ = std::fs::remove_file(&partial);
                }
                return Err(e);
            }
            if !is_non_empty(&partial) {
                let _ = std::fs::remove_file(&partial);
                return Err(AppError::Media(format!(
                    "clip cutter produced no output for {}",
                    request.file_name
                )));
            }
            std::fs::rename(&partial, &clip_path)?;

            let path = clip_path.to_string_lossy().to_string();
            self.aggregator.record_clip(request.occurrence_id, &path)?;
            log::debug!("Clip {} ({:.2}s-{:.2}s)", path, request.start, request.end);
            clips.push(ClipEntry {
                occurrence_id: request.occurrence_id,
                idiom_text: request.idiom_text.clone(),
                path,
            });
        }

        write_json_atomic(
            target,
            &ClipManifest {
                fingerprint: item.fingerprint.clone(),
                episode_number: item.episode_number,
                clips,
            },
        )
    }
}

fn is_non_empty(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}
