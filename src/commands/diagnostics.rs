use crate::aggregator::HALT_FLAG;
use crate::config::AppConfig;
use crate::database::{Database, PipelineError};
use crate::error::AppError;
use crate::executors::ToolExecutors;
use crate::ollama::OllamaStatus;
use crate::worker::PAUSED_FLAG;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ToolStatus {
    pub path: String,
    pub exists: bool,
    pub version: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DiagnosticsReport {
    pub app_version: String,
    pub database_path: String,
    pub source_file_count: i64,
    pub raw_video_dir: String,
    pub raw_video_dir_exists: bool,
    pub ffmpeg: ToolStatus,
    pub whisper_cli: ToolStatus,
    pub whisper_model: ToolStatus,
    pub ollama: Option<OllamaStatus>,
    pub ollama_error: Option<String>,
    pub paused: bool,
    pub aggregation_halted: bool,
    pub memory_mb: Option<f64>,
    pub recent_errors: Vec<PipelineError>,
}

/// Check every external collaborator the pipeline depends on.
pub async fn get_diagnostics(
    config: &AppConfig,
    db: &Database,
    tools: &ToolExecutors,
) -> Result<DiagnosticsReport, AppError> {
    let stats = db.get_pipeline_stats()?;
    let raw_video_dir = config.raw_video_dir();

    let ffmpeg_version = tools.ffmpeg.version().await;
    let ffmpeg = ToolStatus {
        path: config.ffmpeg_path.to_string_lossy().to_string(),
        exists: ffmpeg_version.is_some(),
        version: ffmpeg_version,
    };
    let whisper_cli = ToolStatus {
        path: tools.whisper.cli_path().to_string_lossy().to_string(),
        exists: tools.whisper.cli_path().exists(),
        version: None,
    };
    let whisper_model = ToolStatus {
        path: tools.whisper.model_path().to_string_lossy().to_string(),
        exists: tools.whisper.model_path().exists(),
        version: None,
    };

    let (ollama, ollama_error) = match tools.ollama.health_check().await {
        Ok(status) => (Some(status), None),
        Err(e) => {
            log::warn!("Ollama health check failed: {}", e);
            (None, Some(e))
        }
    };

    let (memory_mb, _) = super::worker::get_memory_info();

    Ok(DiagnosticsReport {
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        database_path: db.path().to_string_lossy().to_string(),
        source_file_count: stats.total_files,
        raw_video_dir_exists: raw_video_dir.is_dir(),
        raw_video_dir: raw_video_dir.to_string_lossy().to_string(),
        ffmpeg,
        whisper_cli,
        whisper_model,
        ollama,
        ollama_error,
        paused: db.get_flag(PAUSED_FLAG)?,
        aggregation_halted: db.get_flag(HALT_FLAG)?,
        memory_mb,
        recent_errors: db.get_recent_pipeline_errors(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_diagnostics_with_missing_tools() {
        let temp = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.data_dir = temp.path().to_path_buf();
        config.ffmpeg_path = temp.path().join("no-ffmpeg");
        config.whisper_cli_path = temp.path().join("no-whisper");
        config.whisper_model_path = temp.path().join("no-model.bin");
        config.ollama_url = "http://127.0.0.1:9".to_string();
        config.llm_timeout_secs = 2;
        let db = Database::new(&config.database_path()).unwrap();
        let tools = ToolExecutors::from_config(&config);

        let report = get_diagnostics(&config, &db, &tools).await.unwrap();
        assert!(!report.ffmpeg.exists);
        assert!(!report.whisper_cli.exists);
        assert!(!report.whisper_model.exists);
        assert!(report.ollama.is_none());
        assert!(report.ollama_error.is_some());
        assert!(!report.raw_video_dir_exists);
        assert_eq!(report.source_file_count, 0);
        assert!(!report.paused);
    }
}
