use crate::aggregator::{Aggregator, HALT_FLAG};
use crate::database::{FileState, SourceFileWithStatus, Stage, StageState};
use crate::error::AppError;
use crate::registry::{short, Registry};
use serde::Serialize;

#[derive(Debug, Default, Serialize)]
pub struct QueueData {
    pub pending: Vec<SourceFileWithStatus>,
    pub running: Vec<SourceFileWithStatus>,
    pub failed: Vec<SourceFileWithStatus>,
    pub blocked: Vec<SourceFileWithStatus>,
    pub done: Vec<SourceFileWithStatus>,
}

#[derive(Debug, Serialize)]
pub struct QueueStatus {
    pub pending: i64,
    pub running: i64,
    pub failed: i64,
    pub blocked: i64,
    pub done: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Blocked,
    AggregationHalted,
}

/// Conditions that need an operator.
#[derive(Debug, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    pub fingerprint: Option<String>,
    pub episode_number: Option<i64>,
    pub stage: Option<Stage>,
}

/// Live files grouped by derived state, oldest episode first.
pub fn get_queue(registry: &Registry) -> Result<QueueData, AppError> {
    let mut queue = QueueData::default();
    for entry in registry.database().get_sources_with_status(false)? {
        match entry.state {
            FileState::Pending => queue.pending.push(entry),
            FileState::Running => queue.running.push(entry),
            FileState::Failed => queue.failed.push(entry),
            FileState::Blocked => queue.blocked.push(entry),
            FileState::Done => queue.done.push(entry),
            FileState::Superseded => {}
        }
    }
    Ok(queue)
}

pub fn get_queue_status(registry: &Registry) -> Result<QueueStatus, AppError> {
    let queue = get_queue(registry)?;
    let (pending, running, failed, blocked, done) = (
        queue.pending.len() as i64,
        queue.running.len() as i64,
        queue.failed.len() as i64,
        queue.blocked.len() as i64,
        queue.done.len() as i64,
    );
    Ok(QueueStatus {
        pending,
        running,
        failed,
        blocked,
        done,
        total: pending + running + failed + blocked + done,
    })
}

/// Give a blocked or failed file a fresh attempt budget. Completed stages
/// are kept, so processing resumes where it stopped.
pub fn retry_file(registry: &Registry, fingerprint: &str) -> Result<usize, AppError> {
    let file = registry
        .database()
        .get_source_file(fingerprint)?
        .ok_or_else(|| AppError::NotFound(format!("fingerprint {}", fingerprint)))?;
    if file.superseded {
        return Err(AppError::Validation(format!(
            "{} is superseded and will not be processed",
            short(fingerprint)
        )));
    }
    let reset = registry.database().reset_attempts(fingerprint)?;
    if reset == 0 {
        log::info!("Retry {}: nothing blocked or failed", short(fingerprint));
    } else {
        log::info!(
            "Retry episode {} ({}): {} stage(s) reset",
            file.episode_number,
            short(fingerprint),
            reset
        );
    }
    Ok(reset)
}

pub fn get_alerts(registry: &Registry, aggregator: &Aggregator) -> Result<Vec<Alert>, AppError> {
    let mut alerts = Vec::new();

    if aggregator.is_halted()? {
        alerts.push(Alert {
            kind: AlertKind::AggregationHalted,
            message: format!(
                "frequency index diverged from occurrences ({} set); run reconcile",
                HALT_FLAG
            ),
            fingerprint: None,
            episode_number: None,
            stage: None,
        });
    }

    for file in registry.database().get_blocked_files()? {
        let status = registry.get_status(&file.fingerprint)?;
        let blocked = status.stages.iter().find(|r| r.state == StageState::Blocked);
        let message = match blocked {
            Some(record) => format!(
                "{} blocked after {} attempt(s): {}",
                record.stage,
                record.attempts,
                record.last_error.as_deref().unwrap_or("unknown error")
            ),
            None => "blocked".to_string(),
        };
        alerts.push(Alert {
            kind: AlertKind::Blocked,
            message,
            fingerprint: Some(file.fingerprint),
            episode_number: Some(file.episode_number),
            stage: blocked.map(|r| r.stage),
        });
    }

    Ok(alerts)
}
