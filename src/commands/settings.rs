use crate::database::Database;
use crate::error::AppError;
use crate::worker::PAUSED_FLAG;
use std::collections::HashMap;

/// Get a setting value
pub fn get_setting(db: &Database, key: &str) -> Result<Option<String>, AppError> {
    db.get_setting(key).map_err(AppError::from)
}

/// Set a setting value
pub fn set_setting(db: &Database, key: &str, value: &str) -> Result<(), AppError> {
    log::info!("Setting {} = {}", key, value);
    db.set_setting(key, value).map_err(AppError::from)
}

/// Get all settings
pub fn get_all_settings(db: &Database) -> Result<HashMap<String, String>, AppError> {
    db.get_all_settings().map_err(AppError::from)
}

/// Stop the controller from starting new stages. Takes effect at the next
/// stage boundary, also in a controller running in another process.
pub fn pause_pipeline(db: &Database) -> Result<(), AppError> {
    log::info!("Pause requested");
    db.set_flag(PAUSED_FLAG, true).map_err(AppError::from)
}

pub fn resume_pipeline(db: &Database) -> Result<(), AppError> {
    log::info!("Resume requested");
    db.set_flag(PAUSED_FLAG, false).map_err(AppError::from)
}

pub fn is_paused(db: &Database) -> Result<bool, AppError> {
    db.get_flag(PAUSED_FLAG).map_err(AppError::from)
}
