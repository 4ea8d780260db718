use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Stages and stage states
// ============================================================================

/// The four ordered processing steps applied to every source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Audio,
    Transcript,
    Idioms,
    Clips,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Audio, Stage::Transcript, Stage::Idioms, Stage::Clips];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Transcript => "transcript",
            Self::Idioms => "idioms",
            Self::Clips => "clips",
        }
    }

    /// Position in the stage sequence, starting at 0.
    pub fn order(&self) -> i64 {
        match self {
            Self::Audio => 0,
            Self::Transcript => 1,
            Self::Idioms => 2,
            Self::Clips => 3,
        }
    }

    pub fn previous(&self) -> Option<Stage> {
        match self {
            Self::Audio => None,
            Self::Transcript => Some(Self::Audio),
            Self::Idioms => Some(Self::Transcript),
            Self::Clips => Some(Self::Idioms),
        }
    }

    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::Audio => Some(Self::Transcript),
            Self::Transcript => Some(Self::Idioms),
            Self::Idioms => Some(Self::Clips),
            Self::Clips => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(Self::Audio),
            "transcript" => Ok(Self::Transcript),
            "idioms" => Ok(Self::Idioms),
            "clips" => Ok(Self::Clips),
            other => Err(format!("unknown stage: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Running,
    Done,
    Failed,
    /// Failed `max_attempts` times; waits for an operator retry.
    Blocked,
}

impl Default for StageState {
    fn default() -> Self {
        Self::Pending
    }
}

impl StageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }

    /// Legal edges of the per-stage state machine. `done` has no outgoing
    /// edge; only a fingerprint change (a fresh set of stage rows) resets it.
    pub fn can_transition_to(&self, next: StageState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Failed, Self::Running)
                | (Self::Running, Self::Done)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Blocked)
                | (Self::Blocked, Self::Failed)
        )
    }

    /// States from which the controller may start the stage.
    pub fn is_startable(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StageState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            other => Err(format!("unknown stage state: {}", other)),
        }
    }
}

/// Derived, file-level view over the four stage records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Pending,
    Running,
    Done,
    Failed,
    Blocked,
    Superseded,
}

impl std::fmt::Display for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Superseded => "superseded",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Source files
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    pub id: i64,
    pub path: String,
    pub fingerprint: String,
    pub episode_number: i64,
    pub file_size: Option<i64>,
    pub superseded: bool,
    pub added_date: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub state: StageState,
    pub artifact_path: Option<String>,
    pub last_error: Option<String>,
    pub attempts: i64,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub updated_at: String,
}

/// Ordered stage records for one fingerprint (audio, transcript, idioms, clips).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStatus {
    pub fingerprint: String,
    pub stages: Vec<StageRecord>,
}

impl StageStatus {
    pub fn get(&self, stage: Stage) -> Option<&StageRecord> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    pub fn state_of(&self, stage: Stage) -> StageState {
        self.get(stage).map(|r| r.state).unwrap_or_default()
    }

    pub fn artifact_of(&self, stage: Stage) -> Option<&str> {
        self.get(stage).and_then(|r| r.artifact_path.as_deref())
    }

    /// First stage that is `pending` or `failed`, provided nothing is
    /// running or blocked. `None` means there is nothing to start.
    pub fn resume_point(&self) -> Option<Stage> {
        if self
            .stages
            .iter()
            .any(|r| matches!(r.state, StageState::Running | StageState::Blocked))
        {
            return None;
        }
        Stage::ALL
            .iter()
            .copied()
            .find(|s| self.state_of(*s).is_startable())
    }

    pub fn overall(&self) -> FileState {
        let states: Vec<StageState> = Stage::ALL.iter().map(|s| self.state_of(*s)).collect();
        if states.contains(&StageState::Blocked) {
            FileState::Blocked
        } else if states.iter().all(|s| *s == StageState::Done) {
            FileState::Done
        } else if states.contains(&StageState::Running) {
            FileState::Running
        } else if states.contains(&StageState::Failed) {
            FileState::Failed
        } else {
            FileState::Pending
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFileWithStatus {
    pub file: SourceFile,
    pub status: StageStatus,
    pub state: FileState,
}

/// A schedulable file, as returned to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub fingerprint: String,
    pub path: String,
    pub episode_number: i64,
}

// ============================================================================
// Idiom occurrences and frequency index
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdiomOccurrence {
    pub id: i64,
    /// Canonical (possibly corrected) text.
    pub idiom_text: String,
    pub episode_number: i64,
    pub timestamp_start: f64,
    pub timestamp_end: f64,
    pub source_fingerprint: String,
    pub sentence_index: i64,
    /// Text as transcribed, when it differed from the canonical text.
    pub raw_text: Option<String>,
    pub correction_note: Option<String>,
    pub corrected: bool,
    pub clip_path: Option<String>,
    pub created_at: String,
}

/// Row to insert. Timestamps are milliseconds so the uniqueness key
/// (idiom_text, episode_number, start_ms) compares exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOccurrence {
    pub idiom_text: String,
    pub episode_number: i64,
    pub start_ms: i64,
    pub end_ms: i64,
    pub source_fingerprint: String,
    pub sentence_index: i64,
    pub raw_text: Option<String>,
    pub correction_note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequencyEntry {
    pub total_count: i64,
    /// One episode reference per occurrence, ascending.
    pub episodes: Vec<i64>,
    pub last_updated: String,
}

/// idiom_text -> entry, ordered by idiom text.
pub type FrequencyIndex = BTreeMap<String, FrequencyEntry>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdiomFrequency {
    pub idiom_text: String,
    pub total_count: i64,
    pub episode_count: i64,
    pub last_updated: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    pub occurrence_id: i64,
    pub canonical_text: String,
    pub raw_text: String,
    pub correction_note: Option<String>,
    pub corrected: bool,
    pub episode_number: i64,
    pub timestamp_start: f64,
    pub source_fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rejection {
    pub id: i64,
    pub source_fingerprint: String,
    pub episode_number: i64,
    pub batch_index: i64,
    /// `None` when the whole batch was rejected.
    pub entry_index: Option<i64>,
    pub raw_entry: String,
    pub reason: String,
    pub created_at: String,
}

// ============================================================================
// Pipeline errors and stats
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineError {
    pub id: i64,
    pub stage: String,
    pub fingerprint: Option<String>,
    pub error_kind: String,
    pub message: String,
    pub attempt: i64,
    pub resolved: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageStateCounts {
    pub pending: i64,
    pub running: i64,
    pub done: i64,
    pub failed: i64,
    pub blocked: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStats {
    pub total_files: i64,
    pub superseded_files: i64,
    pub completed_files: i64,
    pub blocked_files: i64,
    pub stages: BTreeMap<String, StageStateCounts>,
    pub total_occurrences: i64,
    pub distinct_idioms: i64,
    pub clips_cut: i64,
    pub rejected_detections: i64,
    pub unresolved_errors: i64,
}
