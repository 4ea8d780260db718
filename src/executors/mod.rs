//! Stage executors: the external tools each stage delegates to.
//!
//! The controller only sees the `StageExecutors` trait, so tests can drive
//! the whole pipeline with in-process fakes.

pub mod ffmpeg;
pub mod transcribe;

pub use ffmpeg::Ffmpeg;
pub use transcribe::{parse_whisper_json, Whisper};

use crate::aggregator::{BatchSpan, ClipRequest};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::ollama::OllamaClient;
use crate::transcript::Transcript;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Work behind each stage. Every call must return `AppError::Cancelled`
/// promptly once `cancel` fires, and must not leave a file at `output`
/// unless it succeeded.
pub trait StageExecutors: Send + Sync + 'static {
    /// Write a mono WAV of `video` to `output`.
    fn extract_audio(
        &self,
        video: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn transcribe(
        &self,
        audio: &Path,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Transcript, AppError>> + Send;

    /// Raw detector reply for one batch. Parsing is left to the aggregator.
    fn detect_idioms(
        &self,
        span: &BatchSpan,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<String, AppError>> + Send;

    fn cut_clip(
        &self,
        video: &Path,
        request: &ClipRequest,
        output: &Path,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Production executors: ffmpeg, whisper-cli and Ollama.
#[derive(Clone)]
pub struct ToolExecutors {
    pub ffmpeg: Ffmpeg,
    pub whisper: Whisper,
    pub ollama: OllamaClient,
}

impl ToolExecutors {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            ffmpeg: Ffmpeg::new(&config.ffmpeg_path, config.sample_rate),
            whisper: Whisper::new(
                &config.whisper_cli_path,
                &config.whisper_model_path,
                &config.language,
            ),
            ollama: OllamaClient::new(
                &config.ollama_url,
                &config.ollama_model,
                Duration::from_secs(config.llm_timeout_secs),
            ),
        }
    }
}

impl StageExecutors for ToolExecutors {
    async fn extract_audio(
        &self,
        video: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        self.ffmpeg.extract_audio(video, output, cancel).await
    }

    async fn transcribe(&self, audio: &Path, cancel: &CancellationToken) -> Result<Transcript, AppError> {
        self.whisper.transcribe(audio, cancel).await
    }

    async fn detect_idioms(&self, span: &BatchSpan, cancel: &CancellationToken) -> Result<String, AppError> {
        self.ollama.detect_idioms(&span.numbered_lines(), cancel).await
    }

    async fn cut_clip(
        &self,
        video: &Path,
        request: &ClipRequest,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        self.ffmpeg
            .cut_clip(video, request.start, request.end, output, cancel)
            .await
    }
}
