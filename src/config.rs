//! Runtime configuration.
//!
//! Loaded from `config.yaml` in the data directory (or an explicit path).
//! Every field has a default, so a missing file yields a working setup.
//! `OLLAMA_URL` / `OLLAMA_MODEL` may also be set in a `.env` file next to it.

use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "config.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub raw_video_dir: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub clips_dir: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub video_extensions: Vec<String>,

    pub ffmpeg_path: PathBuf,
    pub sample_rate: u32,

    pub whisper_cli_path: PathBuf,
    pub whisper_model_path: PathBuf,
    pub language: String,

    pub ollama_url: String,
    pub ollama_model: String,
    pub llm_timeout_secs: u64,

    /// Consecutive transcript sentences per idiom-detection batch.
    pub batch_size: usize,
    /// Accepted idiom lengths, in characters.
    pub idiom_lengths: Vec<usize>,
    /// Failed attempts per stage before the file is blocked.
    pub max_attempts: u32,

    pub clip_padding_start: f64,
    pub clip_padding_end: f64,

    pub poll_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chengyu-clips");
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let whisper_root = home_dir.join("bin").join("whisper-cpp").join("whisper.cpp");

        Self {
            data_dir,
            raw_video_dir: None,
            work_dir: None,
            clips_dir: None,
            database_path: None,
            video_extensions: ["mp4", "mkv", "avi", "mov"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            sample_rate: 16000,
            whisper_cli_path: whisper_root.join("build").join("bin").join("whisper-cli"),
            whisper_model_path: whisper_root.join("models").join("ggml-medium.bin"),
            language: "zh".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
            ollama_model: "qwen2.5:7b".to_string(),
            llm_timeout_secs: 120,
            batch_size: 15,
            idiom_lengths: vec![4],
            max_attempts: 3,
            clip_padding_start: 0.5,
            clip_padding_end: 0.5,
            poll_interval_secs: 60,
        }
    }
}

impl AppConfig {
    /// Load configuration from `path`, or from `<default data dir>/config.yaml`
    /// when no path is given. A missing default file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let (config_path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (Self::default().data_dir.join(CONFIG_FILE_NAME), false),
        };

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .map_err(|e| AppError::Config(format!("{}: {}", config_path.display(), e)))?;
            let parsed: AppConfig = serde_yaml::from_str(&content)?;
            log::info!("Loaded configuration from {}", config_path.display());
            parsed
        } else if explicit {
            return Err(AppError::Config(format!(
                "config file not found: {}",
                config_path.display()
            )));
        } else {
            log::info!("No config file at {}, using defaults", config_path.display());
            AppConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(url) = load_env_value(&self.data_dir, "OLLAMA_URL") {
            log::info!("Ollama URL loaded from .env");
            self.ollama_url = url;
        }
        if let Some(model) = load_env_value(&self.data_dir, "OLLAMA_MODEL") {
            log::info!("Ollama model loaded from .env");
            self.ollama_model = model;
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.batch_size == 0 {
            return Err(AppError::Config("batch_size must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(AppError::Config("max_attempts must be at least 1".into()));
        }
        if self.idiom_lengths.is_empty() || self.idiom_lengths.contains(&0) {
            return Err(AppError::Config(
                "idiom_lengths must list at least one positive length".into(),
            ));
        }
        if self.clip_padding_start < 0.0 || self.clip_padding_end < 0.0 {
            return Err(AppError::Config("clip padding cannot be negative".into()));
        }
        if self.video_extensions.is_empty() {
            return Err(AppError::Config("video_extensions cannot be empty".into()));
        }
        Ok(())
    }

    pub fn raw_video_dir(&self) -> PathBuf {
        self.raw_video_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("raw_video"))
    }

    pub fn work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("work"))
    }

    pub fn clips_dir(&self) -> PathBuf {
        self.clips_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("output_clips"))
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("chengyu_clips.db"))
    }

    /// Create every directory the pipeline writes into.
    pub fn ensure_directories(&self) -> Result<(), AppError> {
        for dir in [self.data_dir.clone(), self.work_dir(), self.clips_dir()] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| AppError::Io(format!("{}: {}", dir.display(), e)))?;
        }
        if let Some(parent) = self.database_path().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

/// Load a value from the .env file in `dir` by key name
pub fn load_env_value(dir: &Path, key: &str) -> Option<String> {
    let env_path = dir.join(".env");
    let prefix = format!("{}=", key);
    let content = std::fs::read_to_string(&env_path).ok()?;
    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix(&prefix) {
            let value = rest.trim().trim_matches('"').trim_matches('\'');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}
