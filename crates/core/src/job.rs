//! Job domain model: statuses, stages, tiers, tokens, and snapshots.
//!
//! The status state machine is the single authority on which transitions
//! are legal; every registry implementation validates against it before
//! applying a compare-and-swap write.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Priority constants
// ---------------------------------------------------------------------------

/// Priority value for urgent jobs. Dispatched before all others.
pub const PRIORITY_URGENT: i32 = 10;

/// Priority value for normal jobs. Default.
pub const PRIORITY_NORMAL: i32 = 0;

/// Priority value for background jobs. Dispatched last.
pub const PRIORITY_BACKGROUND: i32 = -10;

/// Maximum length of a dataset or table identifier.
const MAX_IDENTIFIER_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Status ID type matching SMALLINT in the database.
pub type StatusId = i16;

/// Background job execution status (1-based IDs match the seed data).
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued = 1,
    Running = 2,
    Completed = 3,
    Failed = 4,
    Canceled = 5,
}

impl JobStatus {
    /// Return the database status ID.
    pub fn id(self) -> StatusId {
        self as StatusId
    }

    /// True for Completed, Failed, and Canceled. Terminal jobs accept no
    /// further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl TryFrom<StatusId> for JobStatus {
    type Error = CoreError;

    fn try_from(id: StatusId) -> Result<Self, Self::Error> {
        match id {
            1 => Ok(Self::Queued),
            2 => Ok(Self::Running),
            3 => Ok(Self::Completed),
            4 => Ok(Self::Failed),
            5 => Ok(Self::Canceled),
            other => Err(CoreError::Internal(format!(
                "Unknown job status id: {other}"
            ))),
        }
    }
}

/// Job status state machine.
pub mod state_machine {
    use super::JobStatus;

    /// Returns the set of valid target statuses reachable from `from`.
    ///
    /// Running -> Queued is the retry re-enqueue path. Terminal states
    /// return an empty slice because no further transitions are allowed.
    pub fn valid_transitions(from: JobStatus) -> &'static [JobStatus] {
        match from {
            JobStatus::Queued => &[JobStatus::Running, JobStatus::Canceled],
            JobStatus::Running => &[
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Canceled,
                JobStatus::Queued,
            ],
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled => &[],
        }
    }

    /// Check whether a transition from `from` to `to` is valid.
    pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
        valid_transitions(from).contains(&to)
    }
}

// ---------------------------------------------------------------------------
// Tier
// ---------------------------------------------------------------------------

/// Resource tier a job is scheduled on. Each tier has its own lane,
/// worker pool, and concurrency limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Cpu,
    Gpu,
}

impl Tier {
    /// All tiers, in lane-startup order.
    pub const ALL: [Tier; 2] = [Tier::Cpu, Tier::Gpu];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(Self::Cpu),
            "gpu" => Ok(Self::Gpu),
            other => Err(CoreError::Validation(format!("Unknown tier: {other}"))),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Pipeline stage a job is currently in. Stages are informational (the
/// status field is authoritative for scheduling); they drive the progress
/// display on the polling client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Queued,
    Starting,
    Preprocessing,
    Training,
    Sampling,
    Evaluation,
    Finalizing,
    Completed,
    Failed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Starting => "starting",
            Self::Preprocessing => "preprocessing",
            Self::Training => "training",
            Self::Sampling => "sampling",
            Self::Evaluation => "evaluation",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Human-readable message shown to polling clients for this stage.
    pub fn message(self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Starting => "Starting",
            Self::Preprocessing => "Preprocessing data",
            Self::Training => "Training models",
            Self::Sampling => "Sampling synthetic rows",
            Self::Evaluation => "Running evaluation",
            Self::Finalizing => "Saving outputs",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }
}

impl std::str::FromStr for Stage {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "starting" => Ok(Self::Starting),
            "preprocessing" => Ok(Self::Preprocessing),
            "training" => Ok(Self::Training),
            "sampling" => Ok(Self::Sampling),
            "evaluation" => Ok(Self::Evaluation),
            "finalizing" => Ok(Self::Finalizing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::Validation(format!("Unknown stage: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

/// Generate a fresh opaque job token.
///
/// Tokens are the only external handle to a job; they are globally
/// unique and immutable for the lifetime of the record.
pub fn new_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Job records
// ---------------------------------------------------------------------------

/// Fields supplied by the submitter when creating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner_id: String,
    pub tier: Tier,
    pub priority: i32,
    /// Opaque run parameters, passed through to the execution adapter.
    pub parameters: serde_json::Value,
    pub max_retries: u16,
}

/// Point-in-time copy of a job record.
///
/// Snapshots are what the registry hands out: mutating a snapshot never
/// affects the stored record.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub token: String,
    pub owner_id: String,
    pub tier: Tier,
    pub priority: i32,
    pub parameters: serde_json::Value,
    pub status: JobStatus,
    pub stage: Stage,
    pub progress_percent: u8,
    pub message: String,
    /// Retained log lines, oldest first, capped server-side.
    pub logs: Vec<String>,
    pub result_ref: Option<String>,
    pub error_summary: Option<String>,
    pub cancel_requested: bool,
    pub retry_count: u16,
    pub max_retries: u16,
    /// Number of execution attempts started (first run plus retries).
    pub attempt_count: u16,
    pub queued_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a dataset or table identifier.
///
/// Rules:
/// - Must not be empty.
/// - Must not exceed `MAX_IDENTIFIER_LEN` characters.
/// - Must contain only alphanumeric, hyphen, or underscore characters.
pub fn validate_identifier(kind: &str, value: &str) -> Result<(), CoreError> {
    if value.is_empty() {
        return Err(CoreError::Validation(format!("{kind} must not be empty")));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(CoreError::Validation(format!(
            "{kind} must not exceed {MAX_IDENTIFIER_LEN} characters"
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(CoreError::Validation(format!(
            "{kind} may only contain alphanumeric, hyphen, or underscore characters"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
