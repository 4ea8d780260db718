use crate::database::{FileState, SourceFile, SourceFileWithStatus, StageRecord};
use crate::error::AppError;
use crate::registry::Registry;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct FileStatusResponse {
    pub file: SourceFile,
    pub state: FileState,
    pub stages: Vec<StageRecord>,
}

/// Full fingerprint for an operator-supplied prefix. Must match exactly one
/// registered file.
pub fn resolve_fingerprint(registry: &Registry, prefix: &str) -> Result<String, AppError> {
    let prefix = prefix.trim().to_lowercase();
    if prefix.is_empty() {
        return Err(AppError::Validation("empty fingerprint".into()));
    }
    let mut matches: Vec<String> = registry
        .database()
        .get_source_files(true)?
        .into_iter()
        .filter(|f| f.fingerprint.starts_with(&prefix))
        .map(|f| f.fingerprint)
        .collect();
    match matches.len() {
        0 => Err(AppError::NotFound(format!("fingerprint {}", prefix))),
        1 => Ok(matches.remove(0)),
        n => Err(AppError::Validation(format!(
            "fingerprint prefix {} is ambiguous ({} files)",
            prefix, n
        ))),
    }
}

fn describe(registry: &Registry, file: SourceFile) -> Result<FileStatusResponse, AppError> {
    let status = registry.get_status(&file.fingerprint)?;
    let state = if file.superseded {
        FileState::Superseded
    } else {
        status.overall()
    };
    Ok(FileStatusResponse {
        file,
        state,
        stages: status.stages,
    })
}

pub fn get_file_status(registry: &Registry, fingerprint: &str) -> Result<FileStatusResponse, AppError> {
    let fingerprint = resolve_fingerprint(registry, fingerprint)?;
    let file = registry
        .database()
        .get_source_file(&fingerprint)?
        .ok_or_else(|| AppError::NotFound(format!("fingerprint {}", fingerprint)))?;
    describe(registry, file)
}

/// Every fingerprint ever registered for the episode, live one first.
pub fn get_episode_status(registry: &Registry, episode_number: i64) -> Result<Vec<FileStatusResponse>, AppError> {
    let files = registry.files_for_episode(episode_number)?;
    if files.is_empty() {
        return Err(AppError::NotFound(format!("episode {}", episode_number)));
    }
    files.into_iter().map(|f| describe(registry, f)).collect()
}

pub fn list_files(registry: &Registry, include_superseded: bool) -> Result<Vec<SourceFileWithStatus>, AppError> {
    Ok(registry.database().get_sources_with_status(include_superseded)?)
}
