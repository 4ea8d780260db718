use crate::error::AppError;
use crate::transcript::{Transcript, TranscriptSentence, WordTiming};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// whisper.cpp command-line transcriber.
#[derive(Debug, Clone)]
pub struct Whisper {
    cli_path: PathBuf,
    model_path: PathBuf,
    language: String,
}

impl Whisper {
    pub fn new(cli_path: &Path, model_path: &Path, language: &str) -> Self {
        Self {
            cli_path: cli_path.to_path_buf(),
            model_path: model_path.to_path_buf(),
            language: language.to_string(),
        }
    }

    pub fn cli_path(&self) -> &Path {
        &self.cli_path
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    /// Run whisper-cli on `audio` and parse its full JSON output
    /// (segments with token offsets) into a transcript.
    pub async fn transcribe(
        &self,
        audio: &Path,
        cancel: &CancellationToken,
    ) -> Result<Transcript, AppError> {
        if !audio.exists() {
            return Err(AppError::Io(format!("Audio file not found: {}", audio.display())));
        }
        if !self.model_path.exists() {
            return Err(AppError::Transcription(format!(
                "Model not found: {}",
                self.model_path.display()
            )));
        }

        let output_base = audio.with_extension("whisper");
        log::info!("Running whisper-cli: {}", audio.display());

        let mut child = Command::new(&self.cli_path)
            .arg("-m")
            .arg(&self.model_path)
            .arg("-f")
            .arg(audio)
            .args(["-l", &self.language, "-ojf", "-pp", "-of"])
            .arg(&output_base)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Transcription(format!("Failed to spawn whisper-cli: {}", e)))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Transcription("whisper-cli stderr unavailable".into()))?;
        let mut reader = BufReader::new(stderr).lines();
        let mut last_progress = -1;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("Killing transcription subprocess");
                    let _ = child.kill().await;
                    return Err(AppError::Cancelled);
                }
                line = reader.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(progress) = parse_progress(&line) {
                                if progress / 10 != last_progress / 10 {
                                    log::debug!("Transcription {}%: {}", progress, audio.display());
                                }
                                last_progress = progress;
                            }
                        }
                        Ok(None) => break, // EOF
                        Err(_) => break,
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| AppError::Transcription(format!("Failed to wait for whisper-cli: {}", e)))?;
        if !status.success() {
            return Err(AppError::Transcription(format!(
                "whisper-cli failed with status: {}",
                status
            )));
        }

        let json_path = PathBuf::from(format!("{}.json", output_base.display()));
        let content = std::fs::read_to_string(&json_path).map_err(|e| {
            AppError::Transcription(format!("missing whisper output {}: {}", json_path.display(), e))
        })?;
        let transcript = parse_whisper_json(&content, &self.language)?;
        let _ = std::fs::remove_file(&json_path);

        log::info!(
            "Transcribed {}: {} sentences",
            audio.display(),
            transcript.sentences.len()
        );
        Ok(transcript)
    }
}

#[derive(Debug, Deserialize)]
struct WhisperOutput {
    transcription: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    offsets: WhisperOffsets,
    text: String,
    #[serde(default)]
    tokens: Vec<WhisperToken>,
}

#[derive(Debug, Deserialize)]
struct WhisperToken {
    text: String,
    offsets: Option<WhisperOffsets>,
}

#[derive(Debug, Deserialize)]
struct WhisperOffsets {
    from: i64,
    to: i64,
}

/// Convert whisper.cpp `-ojf` output. Offsets are milliseconds; special
/// tokens (`[_BEG_]`, `[_TT_150]`) are dropped; empty segments are skipped.
pub fn parse_whisper_json(content: &str, language: &str) -> Result<Transcript, AppError> {
    let output: WhisperOutput = serde_json::from_str(content)
        .map_err(|e| AppError::Transcription(format!("unparseable whisper output: {}", e)))?;

    let sentences = output
        .transcription
        .into_iter()
        .filter(|seg| !seg.text.trim().is_empty())
        .map(|seg| {
            let words = seg
                .tokens
                .into_iter()
                .filter(|t| !t.text.starts_with("[_") && !t.text.trim().is_empty())
                .map(|t| WordTiming {
                    word: t.text.trim().to_string(),
                    start: t.offsets.as_ref().map(|o| o.from as f64 / 1000.0),
                    end: t.offsets.as_ref().map(|o| o.to as f64 / 1000.0),
                })
                .collect();
            TranscriptSentence {
                text: seg.text.trim().to_string(),
                start: seg.offsets.from as f64 / 1000.0,
                end: seg.offsets.to as f64 / 1000.0,
                words,
            }
        })
        .collect();

    let transcript = Transcript {
        language: language.to_string(),
        sentences,
    };
    transcript.validate()?;
    Ok(transcript)
}

/// Parse progress percentage from whisper-cli output
fn parse_progress(line: &str) -> Option<i32> {
    if line.contains("progress") {
        for part in line.split_whitespace() {
            if let Some(num_str) = part.strip_suffix('%') {
                if let Ok(num) = num_str.parse::<i32>() {
                    return Some(num.clamp(0, 100));
                }
            }
            if let Ok(num) = part.parse::<i32>() {
                if (0..=100).contains(&num) {
                    return Some(num);
                }
            }
        }
    }
    None
}
