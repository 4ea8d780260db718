use crate::worker::{ControllerHandle, RunSummary};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ActiveStageInfo {
    pub fingerprint: String,
    pub episode_number: i64,
    pub stage: String,
    pub elapsed_seconds: i64,
}

#[derive(Debug, Serialize)]
pub struct WorkerStatus {
    pub status: String, // "idle" | "processing" | "paused" | "stopped"
    pub current: Option<ActiveStageInfo>,
    pub processed_count: i64,
    pub last_activity: Option<String>,
    pub last_error: Option<String>,
    pub last_run: Option<RunSummary>,
    pub worker_info: WorkerInfo,
}

#[derive(Debug, Serialize)]
pub struct WorkerInfo {
    pub memory_mb: Option<f64>,
    pub memory_percent: Option<f64>,
}

pub async fn get_worker_status(handle: &ControllerHandle, last_run: Option<RunSummary>) -> WorkerStatus {
    let state = handle.state().await;
    let memory_info = get_memory_info();

    let status = if handle.is_stopped() {
        "stopped"
    } else if state.is_processing() {
        "processing"
    } else if state.paused {
        "paused"
    } else {
        "idle"
    };

    WorkerStatus {
        status: status.to_string(),
        current: state.current.as_ref().map(|active| ActiveStageInfo {
            fingerprint: active.fingerprint.clone(),
            episode_number: active.episode_number,
            stage: active.stage.to_string(),
            elapsed_seconds: chrono::Utc::now()
                .signed_duration_since(active.started_at)
                .num_seconds(),
        }),
        processed_count: state.processed_count,
        last_activity: state.last_activity.map(|t| t.to_rfc3339()),
        last_error: state.last_error.clone(),
        last_run,
        worker_info: WorkerInfo {
            memory_mb: memory_info.0,
            memory_percent: memory_info.1,
        },
    }
}

pub(crate) fn get_memory_info() -> (Option<f64>, Option<f64>) {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_memory();

    let total = sys.total_memory();
    if total == 0 {
        return (None, None);
    }
    let used_mb = sys.used_memory() as f64 / 1024.0 / 1024.0;
    let total_mb = total as f64 / 1024.0 / 1024.0;
    (Some(used_mb), Some((used_mb / total_mb) * 100.0))
}
