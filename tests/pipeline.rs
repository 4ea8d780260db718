//! End-to-end controller scenarios against an in-process executor.

use chengyu_clips::aggregator::{BatchSpan, ClipRequest, HALT_FLAG};
use chengyu_clips::commands;
use chengyu_clips::config::AppConfig;
use chengyu_clips::database::{FileState, Stage, StageState};
use chengyu_clips::error::AppError;
use chengyu_clips::executors::StageExecutors;
use chengyu_clips::registry::fingerprint_file;
use chengyu_clips::transcript::{Transcript, TranscriptSentence, WordTiming};
use chengyu_clips::App;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Mock executors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    /// Return a retryable error.
    Fail,
    /// Block until cancelled, like a process killed mid-stage.
    Hang,
    /// Detector replies with prose instead of JSON.
    Malformed,
    /// Succeed, but hand back an artifact with nothing in it.
    Empty,
}

#[derive(Default)]
struct MockExecutors {
    calls: Mutex<Vec<(Stage, String)>>,
    faults: Mutex<HashMap<(Stage, String), Fault>>,
    hung: Notify,
}

impl MockExecutors {
    fn with_fault(stage: Stage, fingerprint: &str, fault: Fault) -> Self {
        let mock = Self::default();
        mock.faults
            .lock()
            .unwrap()
            .insert((stage, fingerprint.to_string()), fault);
        mock
    }

    fn record(&self, stage: Stage, fingerprint: &str) -> Option<Fault> {
        self.calls
            .lock()
            .unwrap()
            .push((stage, fingerprint.to_string()));
        self.faults
            .lock()
            .unwrap()
            .get(&(stage, fingerprint.to_string()))
            .copied()
    }

    fn count(&self, stage: Stage, fingerprint: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, fp)| *s == stage && fp == fingerprint)
            .count()
    }

    fn count_stage(&self, stage: Stage) -> usize {
        self.calls.lock().unwrap().iter().filter(|(s, _)| *s == stage).count()
    }

    fn total(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn touched(&self, fingerprint: &str) -> bool {
        self.calls.lock().unwrap().iter().any(|(_, fp)| fp == fingerprint)
    }

    async fn hang(&self, cancel: &CancellationToken) -> AppError {
        self.hung.notify_one();
        cancel.cancelled().await;
        AppError::Cancelled
    }
}

fn wav_bytes() -> Vec<u8> {
    let mut bytes = b"RIFF\x24\x00\x00\x00WAVEfmt ".to_vec();
    bytes.resize(64, 0);
    bytes
}

fn sentence(i: usize, text: &str) -> TranscriptSentence {
    TranscriptSentence {
        text: text.to_string(),
        start: i as f64 * 2.0,
        end: i as f64 * 2.0 + 1.8,
        words: vec![],
    }
}

/// Fifteen sentences: a misheard 落荒而逃 at [3] (with word timings) and
/// 一心一意 at [12], in the second batch of ten.
fn canned_transcript() -> Transcript {
    let mut sentences: Vec<TranscriptSentence> =
        (0..15).map(|i| sentence(i, &format!("第{}句", i))).collect();
    sentences[3] = TranscriptSentence {
        text: "韩立罗荒儿逃".into(),
        start: 6.0,
        end: 7.8,
        words: vec![
            WordTiming { word: "韩立".into(), start: Some(6.0), end: Some(6.5) },
            WordTiming { word: "罗荒".into(), start: Some(6.5), end: Some(7.0) },
            WordTiming { word: "儿逃".into(), start: Some(7.0), end: Some(7.6) },
        ],
    };
    sentences[12] = sentence(12, "大家一心一意好");
    Transcript {
        language: "zh".into(),
        sentences,
    }
}

impl StageExecutors for MockExecutors {
    async fn extract_audio(
        &self,
        video: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let fp = fingerprint_file(video)?;
        match self.record(Stage::Audio, &fp) {
            Some(Fault::Hang) => return Err(self.hang(cancel).await),
            Some(Fault::Empty) => {
                // header only, no samples
                std::fs::write(output, &wav_bytes()[..44])?;
                return Ok(());
            }
            Some(_) => return Err(AppError::Media("ffmpeg exited with status 1".into())),
            None => {}
        }
        std::fs::write(output, wav_bytes())?;
        Ok(())
    }

    async fn transcribe(&self, audio: &Path, cancel: &CancellationToken) -> Result<Transcript, AppError> {
        let fp = audio
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        match self.record(Stage::Transcript, &fp) {
            Some(Fault::Hang) => return Err(self.hang(cancel).await),
            Some(Fault::Empty) => {
                return Ok(Transcript {
                    language: "zh".into(),
                    sentences: vec![],
                })
            }
            Some(_) => return Err(AppError::Transcription("whisper-cli failed".into())),
            None => {}
        }
        Ok(canned_transcript())
    }

    async fn detect_idioms(&self, span: &BatchSpan, cancel: &CancellationToken) -> Result<String, AppError> {
        match self.record(Stage::Idioms, &span.source_fingerprint) {
            Some(Fault::Hang) => return Err(self.hang(cancel).await),
            Some(Fault::Fail) | Some(Fault::Empty) => return Err(AppError::Extraction("Failed to call Ollama: timed out".into())),
            Some(Fault::Malformed) => return Ok("抱歉，我无法识别这些文本中的成语。".into()),
            None => {}
        }
        let mut entries = Vec::new();
        for (i, s) in span.sentences.iter().enumerate() {
            let index = span.first_sentence + i;
            if s.text.contains("罗荒儿逃") {
                entries.push(json!({"word": "落荒而逃", "original": "罗荒儿逃", "index": index}));
            }
            if s.text.contains("一心一意") {
                entries.push(json!({"word": "一心一意", "original": "一心一意", "index": index}));
                entries.push(json!({"word": "好", "original": "好", "index": index}));
            }
        }
        Ok(format!("```json\n{}\n```", serde_json::Value::Array(entries)))
    }

    async fn cut_clip(
        &self,
        video: &Path,
        _request: &ClipRequest,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let fp = fingerprint_file(video)?;
        match self.record(Stage::Clips, &fp) {
            Some(Fault::Hang) => return Err(self.hang(cancel).await),
            Some(_) => return Err(AppError::Media("ffmpeg exited with status 1".into())),
            None => {}
        }
        std::fs::write(output, b"fake mp4 data")?;
        Ok(())
    }
}

// ============================================================================
// Fixture
// ============================================================================

struct Fixture {
    _temp: TempDir,
    config: AppConfig,
    raw: PathBuf,
    fp1: String,
    fp2: String,
}

fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let raw = temp.path().join("raw");
    std::fs::create_dir_all(&raw).unwrap();
    std::fs::write(raw.join("ep01.mp4"), b"episode one video bytes").unwrap();
    std::fs::write(raw.join("ep02.mp4"), b"episode two video bytes").unwrap();
    std::fs::write(raw.join("notes.txt"), b"not a video").unwrap();

    let mut config = AppConfig::default();
    config.data_dir = temp.path().join("data");
    config.raw_video_dir = Some(raw.clone());
    config.batch_size = 10;
    config.max_attempts = 2;
    config.poll_interval_secs = 1;

    let fp1 = fingerprint_file(&raw.join("ep01.mp4")).unwrap();
    let fp2 = fingerprint_file(&raw.join("ep02.mp4")).unwrap();
    Fixture {
        _temp: temp,
        config,
        raw,
        fp1,
        fp2,
    }
}

fn file_state(app: &App, fingerprint: &str) -> FileState {
    commands::get_file_status(&app.registry(), fingerprint)
        .unwrap()
        .state
}

fn stage_state(app: &App, fingerprint: &str, stage: Stage) -> StageState {
    app.registry().get_status(fingerprint).unwrap().state_of(stage)
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_full_run_then_idempotent_second_run() {
    let fx = fixture();
    let app = App::open(fx.config.clone()).unwrap();

    let mock = Arc::new(MockExecutors::default());
    let controller = app.controller(mock.clone());
    let report = controller.sync_sources().await.unwrap();
    assert_eq!(report.registered, 2);

    let summary = controller.run_once().await.unwrap();
    assert_eq!(summary.files_processed, 2);
    assert_eq!(summary.stages_run, 8);
    assert_eq!(summary.stages_failed, 0);
    assert_eq!(file_state(&app, &fx.fp1), FileState::Done);
    assert_eq!(file_state(&app, &fx.fp2), FileState::Done);
    assert_eq!(mock.count_stage(Stage::Audio), 2);
    // two batches per episode
    assert_eq!(mock.count_stage(Stage::Idioms), 4);

    let top = commands::get_top_idioms(&app.db, None).unwrap();
    assert_eq!(top.len(), 2);
    let escape = top.iter().find(|f| f.idiom_text == "落荒而逃").unwrap();
    assert_eq!(escape.total_count, 2);
    assert_eq!(escape.episode_count, 2);

    let clips_dir = fx.config.clips_dir();
    assert!(clips_dir.join("落荒而逃_1_6s.mp4").exists());
    assert!(clips_dir.join("一心一意_2_23s.mp4").exists());
    let clip_count = std::fs::read_dir(&clips_dir).unwrap().count();
    assert_eq!(clip_count, 4);

    let drill = commands::get_idiom_occurrences(&app.aggregator(), "落荒而逃").unwrap();
    assert!(drill.occurrences.iter().all(|o| o.clip_path.is_some()));

    // Second pass over an unchanged registry does nothing
    let again = Arc::new(MockExecutors::default());
    let controller = app.controller(again.clone());
    let report = controller.sync_sources().await.unwrap();
    assert_eq!(report.registered, 0);
    assert_eq!(report.unchanged, 2);
    let summary = controller.run_once().await.unwrap();
    assert_eq!(again.total(), 0);
    assert_eq!(summary.stages_run + summary.stages_reused, 0);
    assert_eq!(std::fs::read_dir(&clips_dir).unwrap().count(), clip_count);
    assert_eq!(commands::verify_index(&app.aggregator()).unwrap().occurrences, 4);
}

#[tokio::test]
async fn test_crash_during_transcript_resumes_at_transcript() {
    let fx = fixture();
    let ep01_stages;
    {
        let app = App::open(fx.config.clone()).unwrap();
        let mock = Arc::new(MockExecutors::with_fault(Stage::Transcript, &fx.fp2, Fault::Hang));
        let controller = app.controller(mock.clone());
        controller.sync_sources().await.unwrap();

        let handle = controller.handle();
        let (summary, _) = tokio::join!(controller.run_once(), async {
            mock.hung.notified().await;
            handle.stop();
        });
        let summary = summary.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.files_processed, 1);

        assert_eq!(file_state(&app, &fx.fp1), FileState::Done);
        assert_eq!(stage_state(&app, &fx.fp2, Stage::Audio), StageState::Done);
        assert_eq!(stage_state(&app, &fx.fp2, Stage::Transcript), StageState::Running);
        ep01_stages = app.registry().get_status(&fx.fp1).unwrap();
        // process exits here without any cleanup
    }

    let app = App::open(fx.config.clone()).unwrap();
    let mock = Arc::new(MockExecutors::default());
    let controller = app.controller(mock.clone());
    assert_eq!(controller.recover().unwrap(), 1);

    let status = app.registry().get_status(&fx.fp2).unwrap();
    assert_eq!(status.state_of(Stage::Transcript), StageState::Failed);
    assert_eq!(status.get(Stage::Transcript).unwrap().attempts, 1);
    assert_eq!(status.resume_point(), Some(Stage::Transcript));

    let summary = controller.run_once().await.unwrap();
    assert_eq!(summary.files_processed, 1);
    assert_eq!(mock.count_stage(Stage::Audio), 0);
    assert_eq!(mock.count(Stage::Transcript, &fx.fp2), 1);
    assert!(!mock.touched(&fx.fp1));
    assert_eq!(file_state(&app, &fx.fp2), FileState::Done);

    let ep01_after = app.registry().get_status(&fx.fp1).unwrap();
    for (before, after) in ep01_stages.stages.iter().zip(ep01_after.stages.iter()) {
        assert_eq!(before.state, after.state);
        assert_eq!(before.completed_at, after.completed_at);
        assert_eq!(before.attempts, after.attempts);
    }
}

#[tokio::test]
async fn test_repeated_failure_blocks_until_retry() {
    let fx = fixture();
    let app = App::open(fx.config.clone()).unwrap();
    let mock = Arc::new(MockExecutors::with_fault(Stage::Audio, &fx.fp2, Fault::Fail));
    let controller = app.controller(mock.clone());
    controller.sync_sources().await.unwrap();

    let first = controller.run_once().await.unwrap();
    assert_eq!(first.files_processed, 1);
    assert_eq!(first.stages_failed, 1);
    assert_eq!(stage_state(&app, &fx.fp2, Stage::Audio), StageState::Failed);

    let second = controller.run_once().await.unwrap();
    assert_eq!(second.blocked, 1);
    assert_eq!(file_state(&app, &fx.fp2), FileState::Blocked);

    // Blocked files are not retried on their own
    controller.run_once().await.unwrap();
    assert_eq!(mock.count(Stage::Audio, &fx.fp2), 2);

    let alerts = commands::get_alerts(&app.registry(), &app.aggregator()).unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].fingerprint.as_deref(), Some(fx.fp2.as_str()));
    assert_eq!(alerts[0].stage, Some(Stage::Audio));

    let errors = commands::get_recent_errors(&app.db, None).unwrap();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| e.error_kind == "MediaError"));

    commands::retry_file(&app.registry(), &fx.fp2).unwrap();
    let healthy = Arc::new(MockExecutors::default());
    let controller = app.controller(healthy.clone());
    let summary = controller.run_once().await.unwrap();
    assert_eq!(summary.files_processed, 1);
    assert_eq!(file_state(&app, &fx.fp2), FileState::Done);
    assert!(!healthy.touched(&fx.fp1));
    assert!(commands::get_alerts(&app.registry(), &app.aggregator())
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_pause_prevents_new_stages() {
    let fx = fixture();
    let app = App::open(fx.config.clone()).unwrap();
    let mock = Arc::new(MockExecutors::default());
    let controller = app.controller(mock.clone());
    controller.sync_sources().await.unwrap();

    commands::pause_pipeline(&app.db).unwrap();
    let summary = controller.run_once().await.unwrap();
    assert!(summary.paused);
    assert_eq!(mock.total(), 0);
    assert!(controller.handle().state().await.paused);

    controller.handle().resume().await.unwrap();
    let summary = controller.run_once().await.unwrap();
    assert!(!summary.paused);
    assert_eq!(summary.files_processed, 2);
}

#[tokio::test]
async fn test_malformed_batch_is_rejected_and_stage_continues() {
    let fx = fixture();
    let app = App::open(fx.config.clone()).unwrap();
    let mock = Arc::new(MockExecutors::with_fault(Stage::Idioms, &fx.fp1, Fault::Malformed));
    let controller = app.controller(mock.clone());
    controller.sync_sources().await.unwrap();

    let summary = controller.run_once().await.unwrap();
    assert_eq!(summary.files_processed, 2);
    assert_eq!(file_state(&app, &fx.fp1), FileState::Done);

    let rejections = commands::get_rejections(&app.db, Some(&fx.fp1), None).unwrap();
    assert_eq!(rejections.len(), 2);
    assert!(rejections.iter().all(|r| r.entry_index.is_none()));

    // Episode 2 had one invalid entry rejected on its own
    let rejections = commands::get_rejections(&app.db, Some(&fx.fp2), None).unwrap();
    assert_eq!(rejections.len(), 1);
    assert_eq!(rejections[0].entry_index, Some(1));

    let escape = commands::get_idiom_occurrences(&app.aggregator(), "落荒而逃").unwrap();
    assert_eq!(escape.episodes, vec![2]);
}

#[tokio::test]
async fn test_detector_transport_failure_fails_stage() {
    let fx = fixture();
    let app = App::open(fx.config.clone()).unwrap();
    let mock = Arc::new(MockExecutors::with_fault(Stage::Idioms, &fx.fp1, Fault::Fail));
    let controller = app.controller(mock.clone());
    controller.sync_sources().await.unwrap();

    controller.run_once().await.unwrap();
    let status = app.registry().get_status(&fx.fp1).unwrap();
    assert_eq!(status.state_of(Stage::Transcript), StageState::Done);
    assert_eq!(status.state_of(Stage::Idioms), StageState::Failed);
    assert!(status
        .get(Stage::Idioms)
        .and_then(|r| r.last_error.as_deref())
        .unwrap_or_default()
        .contains("timed out"));
    assert_eq!(file_state(&app, &fx.fp2), FileState::Done);
}

#[tokio::test]
async fn test_corrected_detection_keeps_provenance() {
    let fx = fixture();
    let app = App::open(fx.config.clone()).unwrap();
    let controller = app.controller(Arc::new(MockExecutors::default()));
    controller.sync_sources().await.unwrap();
    controller.run_once().await.unwrap();

    let drill = commands::get_idiom_occurrences(&app.aggregator(), "落荒而逃").unwrap();
    let occ = drill
        .occurrences
        .iter()
        .find(|o| o.episode_number == 1)
        .unwrap();
    assert_eq!(occ.timestamp_start, 6.5);
    assert_eq!(occ.timestamp_end, 7.6);

    let provenance = commands::get_provenance(&app.aggregator(), occ.id).unwrap();
    assert_eq!(provenance.canonical_text, "落荒而逃");
    assert_eq!(provenance.raw_text, "罗荒儿逃");
    assert_eq!(provenance.correction_note.as_deref(), Some("原字幕:罗荒儿逃"));
    assert!(provenance.corrected);
}

#[tokio::test]
async fn test_renamed_file_is_not_reprocessed_and_changed_file_is() {
    let fx = fixture();
    let app = App::open(fx.config.clone()).unwrap();
    let controller = app.controller(Arc::new(MockExecutors::default()));
    controller.sync_sources().await.unwrap();
    controller.run_once().await.unwrap();

    std::fs::rename(fx.raw.join("ep02.mp4"), fx.raw.join("ep02_final.mp4")).unwrap();
    std::fs::write(fx.raw.join("ep01.mp4"), b"episode one, re-encoded").unwrap();
    let fp1_new = fingerprint_file(&fx.raw.join("ep01.mp4")).unwrap();

    let mock = Arc::new(MockExecutors::default());
    let controller = app.controller(mock.clone());
    let report = controller.sync_sources().await.unwrap();
    assert_eq!(report.renamed, 1);
    assert_eq!(report.changed, 1);

    controller.run_once().await.unwrap();
    assert!(!mock.touched(&fx.fp2));
    assert_eq!(mock.count(Stage::Audio, &fp1_new), 1);
    assert_eq!(file_state(&app, &fp1_new), FileState::Done);
    assert_eq!(file_state(&app, &fx.fp1), FileState::Superseded);
    assert_eq!(file_state(&app, &fx.fp2), FileState::Done);
}

#[tokio::test]
async fn test_halted_aggregation_waits_at_idioms() {
    let fx = fixture();
    let app = App::open(fx.config.clone()).unwrap();
    app.db.set_flag(HALT_FLAG, true).unwrap();

    let mock = Arc::new(MockExecutors::default());
    let controller = app.controller(mock.clone());
    controller.sync_sources().await.unwrap();

    let summary = controller.run_once().await.unwrap();
    assert!(summary.halted);
    assert_eq!(mock.count_stage(Stage::Idioms), 0);
    let status = app.registry().get_status(&fx.fp1).unwrap();
    assert_eq!(status.state_of(Stage::Transcript), StageState::Done);
    assert_eq!(status.state_of(Stage::Idioms), StageState::Pending);

    commands::reconcile_index(&app.aggregator()).unwrap();
    let summary = controller.run_once().await.unwrap();
    assert!(!summary.halted);
    assert_eq!(summary.files_processed, 2);
}

#[tokio::test]
async fn test_empty_transcript_fails_stage_until_blocked() {
    let fx = fixture();
    let app = App::open(fx.config.clone()).unwrap();
    let mock = Arc::new(MockExecutors::with_fault(Stage::Transcript, &fx.fp1, Fault::Empty));
    let controller = app.controller(mock.clone());
    controller.sync_sources().await.unwrap();

    let first = controller.run_once().await.unwrap();
    assert_eq!(first.stages_failed, 1);
    let status = app.registry().get_status(&fx.fp1).unwrap();
    assert_eq!(status.state_of(Stage::Audio), StageState::Done);
    assert_eq!(status.state_of(Stage::Transcript), StageState::Failed);
    assert!(status
        .get(Stage::Transcript)
        .and_then(|r| r.last_error.as_deref())
        .unwrap_or_default()
        .contains("empty transcript"));
    assert!(!controller.layout().path_for(Stage::Transcript, &fx.fp1).exists());
    assert_eq!(mock.count(Stage::Idioms, &fx.fp1), 0);

    controller.run_once().await.unwrap();
    assert_eq!(file_state(&app, &fx.fp1), FileState::Blocked);
    assert_eq!(mock.count(Stage::Transcript, &fx.fp1), 2);
    assert_eq!(mock.count(Stage::Audio, &fx.fp1), 1);
    assert_eq!(file_state(&app, &fx.fp2), FileState::Done);
}

#[tokio::test]
async fn test_empty_transcript_on_disk_is_not_reused() {
    let fx = fixture();
    let app = App::open(fx.config.clone()).unwrap();
    let mock = Arc::new(MockExecutors::default());
    let controller = app.controller(mock.clone());
    controller.sync_sources().await.unwrap();

    // Left behind by an earlier run that was killed before recording it
    let layout = controller.layout();
    layout.ensure_dirs().unwrap();
    std::fs::write(
        layout.path_for(Stage::Transcript, &fx.fp1),
        r#"{"language":"zh","sentences":[]}"#,
    )
    .unwrap();

    controller.run_once().await.unwrap();
    assert_eq!(mock.count(Stage::Transcript, &fx.fp1), 1);
    assert_eq!(file_state(&app, &fx.fp1), FileState::Done);
}

#[tokio::test]
async fn test_audio_without_samples_fails_stage() {
    let fx = fixture();
    let app = App::open(fx.config.clone()).unwrap();
    let mock = Arc::new(MockExecutors::with_fault(Stage::Audio, &fx.fp2, Fault::Empty));
    let controller = app.controller(mock.clone());
    controller.sync_sources().await.unwrap();

    controller.run_once().await.unwrap();
    let status = app.registry().get_status(&fx.fp2).unwrap();
    assert_eq!(status.state_of(Stage::Audio), StageState::Failed);
    assert!(status
        .get(Stage::Audio)
        .and_then(|r| r.last_error.as_deref())
        .unwrap_or_default()
        .contains("no samples"));
    assert_eq!(mock.count(Stage::Transcript, &fx.fp2), 0);

    let target = controller.layout().path_for(Stage::Audio, &fx.fp2);
    assert!(!target.exists());
    assert!(!chengyu_clips::worker::artifacts::partial_path(&target).exists());
}

#[tokio::test]
async fn test_clip_names_do_not_collide_across_files_of_one_episode() {
    let fx = fixture();
    // A second cut of episode 1 with different bytes
    std::fs::write(fx.raw.join("ep01_director.mp4"), b"episode one, director's cut").unwrap();
    let fp_cut = fingerprint_file(&fx.raw.join("ep01_director.mp4")).unwrap();

    let app = App::open(fx.config.clone()).unwrap();
    let controller = app.controller(Arc::new(MockExecutors::default()));
    controller.sync_sources().await.unwrap();
    controller.run_once().await.unwrap();
    assert_eq!(file_state(&app, &fx.fp1), FileState::Done);
    assert_eq!(file_state(&app, &fp_cut), FileState::Done);

    // Both files carry the same transcript, so whichever ran second had its
    // detections rejected as duplicates. Give that one a detection a few
    // milliseconds later, which lands in the same clip second.
    let aggregator = app.aggregator();
    let drill = commands::get_idiom_occurrences(&aggregator, "落荒而逃").unwrap();
    let owned = drill
        .occurrences
        .iter()
        .find(|o| o.episode_number == 1)
        .unwrap()
        .clone();
    let other = if owned.source_fingerprint == fx.fp1 {
        fp_cut.clone()
    } else {
        fx.fp1.clone()
    };
    assert!(owned.clip_path.as_deref().unwrap().ends_with("落荒而逃_1_6s.mp4"));

    let span = BatchSpan {
        source_fingerprint: other.clone(),
        episode_number: 1,
        batch_index: 0,
        first_sentence: 0,
        sentences: vec![TranscriptSentence {
            text: "韩立落荒而逃".into(),
            start: 6.52,
            end: 7.6,
            words: vec![],
        }],
    };
    let outcome = aggregator
        .ingest_response(span, r#"[{"word":"落荒而逃","index":0}]"#)
        .unwrap();
    assert_eq!(outcome.accepted.len(), 1);

    let requests = aggregator
        .clip_requests(&other, fx.config.clip_padding_start, fx.config.clip_padding_end, None)
        .unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].file_name, "落荒而逃_1_6s_2.mp4");
}
