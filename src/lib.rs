pub mod aggregator;
pub mod commands;
pub mod config;
pub mod database;
pub mod error;
pub mod executors;
pub mod ollama;
pub mod registry;
pub mod transcript;
pub mod worker;

use aggregator::Aggregator;
use config::AppConfig;
use database::Database;
use error::AppError;
use executors::StageExecutors;
use registry::Registry;
use std::sync::Arc;
use worker::PipelineController;

/// Process-wide state: configuration plus the one open store.
///
/// Opened at startup and closed on shutdown; every component receives the
/// store through this, never through a global.
pub struct App {
    pub config: AppConfig,
    pub db: Arc<Database>,
}

impl App {
    pub fn open(config: AppConfig) -> Result<Self, AppError> {
        config.ensure_directories()?;
        let db_path = config.database_path();
        let db = Database::new(&db_path)?;
        log::info!("Database opened at {}", db_path.display());
        Ok(Self {
            config,
            db: Arc::new(db),
        })
    }

    pub fn registry(&self) -> Registry {
        Registry::new(self.db.clone(), &self.config.video_extensions)
    }

    pub fn aggregator(&self) -> Aggregator {
        Aggregator::new(self.db.clone(), &self.config.idiom_lengths)
    }

    pub fn controller<E: StageExecutors>(&self, executors: Arc<E>) -> PipelineController<E> {
        PipelineController::new(
            self.registry(),
            self.aggregator(),
            executors,
            self.config.clone(),
        )
    }

    /// Checkpoint the store. Call once, after the controller has stopped.
    pub fn shutdown(&self) -> Result<(), AppError> {
        self.db.close()?;
        Ok(())
    }
}
