//! Where each stage writes its artifact, and what counts as a valid one.
//!
//! Artifacts are keyed by fingerprint so a changed file never picks up a
//! stale artifact. Everything is written to a temporary name and renamed
//! into place, so a file at the final path is always complete.

use crate::database::Stage;
use crate::error::AppError;
use crate::transcript::Transcript;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_index: i64,
    pub first_sentence: usize,
    pub sentence_count: usize,
    pub accepted: Vec<i64>,
    pub rejected: usize,
    /// The detector's response could not be parsed at all.
    pub malformed: bool,
}

/// Artifact of the idioms stage: what each batch contributed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdiomsArtifact {
    pub fingerprint: String,
    pub episode_number: i64,
    pub batches: Vec<BatchSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipEntry {
    pub occurrence_id: i64,
    pub idiom_text: String,
    pub path: String,
}

/// Artifact of the clips stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipManifest {
    pub fingerprint: String,
    pub episode_number: i64,
    pub clips: Vec<ClipEntry>,
}

#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    work_dir: PathBuf,
    clips_dir: PathBuf,
}

impl ArtifactLayout {
    pub fn new(work_dir: &Path, clips_dir: &Path) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            clips_dir: clips_dir.to_path_buf(),
        }
    }

    pub fn ensure_dirs(&self) -> Result<(), AppError> {
        for dir in ["audio", "transcripts", "idioms", "clips"] {
            std::fs::create_dir_all(self.work_dir.join(dir))?;
        }
        std::fs::create_dir_all(&self.clips_dir)?;
        Ok(())
    }

    /// Final artifact path of `stage` for `fingerprint`.
    pub fn path_for(&self, stage: Stage, fingerprint: &str) -> PathBuf {
        match stage {
            Stage::Audio => self.work_dir.join("audio").join(format!("{}.wav", fingerprint)),
            Stage::Transcript => self
                .work_dir
                .join("transcripts")
                .join(format!("{}.json", fingerprint)),
            Stage::Idioms => self.work_dir.join("idioms").join(format!("{}.json", fingerprint)),
            Stage::Clips => self
                .work_dir
                .join("clips")
                .join(format!("{}.manifest.json", fingerprint)),
        }
    }

    pub fn clip_path(&self, file_name: &str) -> PathBuf {
        self.clips_dir.join(file_name)
    }
}

/// `name.ext` -> `name.partial.ext`, keeping the extension tools key on.
pub fn partial_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}.partial.{}", stem, ext.to_string_lossy()),
        None => format!("{}.partial", stem),
    };
    path.with_file_name(name)
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), AppError> {
    let tmp = partial_path(path);
    {
        let mut file = std::fs::File::create(&tmp)
            .map_err(|e| AppError::Io(format!("{}: {}", tmp.display(), e)))?;
        let json = serde_json::to_vec_pretty(value)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
        .map_err(|e| AppError::Io(format!("{} -> {}: {}", tmp.display(), path.display(), e)))?;
    Ok(())
}

pub fn validate_audio(path: &Path) -> Result<(), AppError> {
    use std::io::Read;
    let mut header = [0u8; 12];
    let mut file = std::fs::File::open(path)
        .map_err(|e| AppError::Media(format!("audio artifact {}: {}", path.display(), e)))?;
    file.read_exact(&mut header)
        .map_err(|_| AppError::Media(format!("audio artifact {} is truncated", path.display())))?;
    if &header[0..4] != b"RIFF" || &header[8..12] != b"WAVE" {
        return Err(AppError::Media(format!(
            "audio artifact {} is not a WAV file",
            path.display()
        )));
    }
    let len = file.metadata()?.len();
    if len <= 44 {
        return Err(AppError::Media(format!(
            "audio artifact {} has no samples",
            path.display()
        )));
    }
    Ok(())
}

/// Playback length of a PCM WAV artifact, from the `fmt ` byte rate and the
/// `data` chunk size. `None` when either is missing.
pub fn wav_duration(path: &Path) -> Result<Option<f64>, AppError> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();

    let mut header = [0u8; 12];
    file.read_exact(&mut header)?;
    if &header[0..4] != b"RIFF" || &header[8..12] != b"WAVE" {
        return Ok(None);
    }

    let mut pos = 12u64;
    let mut byte_rate = None;
    let mut data_len = None;
    while pos + 8 <= len {
        let mut chunk = [0u8; 8];
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(&mut chunk)?;
        let size = u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]) as u64;
        match &chunk[0..4] {
            b"fmt " if size >= 16 => {
                let mut fmt = [0u8; 16];
                file.read_exact(&mut fmt)?;
                byte_rate = Some(u32::from_le_bytes([fmt[8], fmt[9], fmt[10], fmt[11]]));
            }
            b"data" => {
                // Streamed output can leave the size unset
                data_len = Some(size.min(len - pos - 8));
                break;
            }
            _ => {}
        }
        pos += 8 + size + (size & 1);
    }

    match (byte_rate, data_len) {
        (Some(rate), Some(data)) if rate > 0 => Ok(Some(data as f64 / rate as f64)),
        _ => Ok(None),
    }
}

/// A transcript with no sentences is never a finished artifact.
pub fn validate_transcript(path: &Path) -> Result<Transcript, AppError> {
    let transcript = Transcript::load(path)?;
    if transcript.sentences.is_empty() {
        return Err(AppError::Transcription(format!(
            "empty transcript {}",
            path.display()
        )));
    }
    Ok(transcript)
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, AppError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| AppError::Io(format!("{}: {}", path.display(), e)))?;
    Ok(serde_json::from_str(&content)?)
}

pub fn validate_idioms(path: &Path) -> Result<IdiomsArtifact, AppError> {
    load_json(path)
}

/// The manifest must parse and every clip it lists must be on disk.
pub fn validate_clips(path: &Path) -> Result<ClipManifest, AppError> {
    let manifest: ClipManifest = load_json(path)?;
    for clip in &manifest.clips {
        let ok = std::fs::metadata(&clip.path)
            .map(|m| m.len() > 0)
            .unwrap_or(false);
        if !ok {
            return Err(AppError::Media(format!("clip missing or empty: {}", clip.path)));
        }
    }
    Ok(manifest)
}

/// Whether an artifact already on disk can stand in for running `stage`.
pub fn validate(stage: Stage, path: &Path) -> Result<(), AppError> {
    match stage {
        Stage::Audio => validate_audio(path),
        Stage::Transcript => validate_transcript(path).map(|_| ()),
        Stage::Idioms => validate_idioms(path).map(|_| ()),
        Stage::Clips => validate_clips(path).map(|_| ()),
    }
}
