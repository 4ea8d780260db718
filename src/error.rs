use thiserror::Error;

/// Typed application error hierarchy shared by the registry, the aggregator,
/// the pipeline controller and the operator commands.
///
/// Serializes as a plain string so presentation consumers receive the same
/// `"error message"` shape for every failure, while Rust code gets typed
/// variants that can be matched or propagated with `?`.
#[derive(Debug, Error)]
pub enum AppError {
    /// Unreadable or missing file. Skipped and logged.
    #[error("I/O error: {0}")]
    Io(String),

    /// Audio extraction or clip cutting failed.
    #[error("media error: {0}")]
    Media(String),

    /// Speech-to-text failed or produced unusable output.
    #[error("transcription error: {0}")]
    Transcription(String),

    /// Idiom detection failed (timeout, transport, malformed model output).
    #[error("extraction error: {0}")]
    Extraction(String),

    /// A single detection entry or requested transition is invalid.
    #[error("validation error: {0}")]
    Validation(String),

    /// The incremental frequency index diverged from the occurrence set.
    #[error("consistency error: {0}")]
    Consistency(String),

    #[error("{0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Json(String),

    #[error("config error: {0}")]
    Config(String),

    /// Hard stop requested while a stage was in flight.
    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl AppError {
    /// Stable short name recorded with pipeline errors.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Io(_) => "IoError",
            AppError::Media(_) => "MediaError",
            AppError::Transcription(_) => "TranscriptionError",
            AppError::Extraction(_) => "ExtractionError",
            AppError::Validation(_) => "ValidationError",
            AppError::Consistency(_) => "ConsistencyError",
            AppError::Database(_) => "DatabaseError",
            AppError::NotFound(_) => "NotFound",
            AppError::Json(_) => "JsonError",
            AppError::Config(_) => "ConfigError",
            AppError::Cancelled => "Cancelled",
            AppError::Other(_) => "Other",
        }
    }

    /// Whether a stage failing with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Io(_)
                | AppError::Media(_)
                | AppError::Transcription(_)
                | AppError::Extraction(_)
                | AppError::Json(_)
                | AppError::Other(_)
        )
    }

    /// Only these surface as operator alerts; everything else is contained
    /// at file or batch granularity.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::Consistency(_))
    }
}

impl serde::Serialize for AppError {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

// ── From impls ─────────────────────────────────────────────────────────────

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Json(e.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(e: serde_yaml::Error) -> Self {
        AppError::Config(e.to_string())
    }
}

/// Allows `.map_err(|e| format!("…", e))?` and `ok_or_else(|| format!(…))?`
/// to coerce into AppError without changing the call sites.
impl From<String> for AppError {
    fn from(s: String) -> Self {
        AppError::Other(s)
    }
}

/// Allows `.ok_or("literal string")?` to coerce into AppError.
impl From<&str> for AppError {
    fn from(s: &str) -> Self {
        AppError::Other(s.to_string())
    }
}
