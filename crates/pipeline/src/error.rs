//! Execution failure taxonomy.

use tabsyn_core::retry::FailureKind;

/// Output markers that identify a non-zero exit as a momentary resource
/// shortage rather than bad input. Matched case-insensitively against
/// the retained log tail.
const TRANSIENT_MARKERS: [&str; 3] = [
    "cuda out of memory",
    "resource temporarily unavailable",
    "connection refused",
];

/// Errors produced by a pipeline execution attempt.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The child process could not be launched at all.
    #[error("Failed to launch pipeline: {0}")]
    Spawn(#[from] std::io::Error),

    /// The wall-clock watchdog fired and the child was force-terminated.
    #[error("Pipeline timed out after {elapsed_secs}s and was terminated")]
    Timeout { elapsed_secs: u64 },

    /// The child exited with a non-zero code.
    #[error("Pipeline exited with code {exit_code}")]
    Exit { exit_code: i32, log_tail: String },

    /// The child exited cleanly but the expected artifact is missing.
    #[error("Pipeline output not found at {path}")]
    MissingOutput { path: String },

    /// Cancellation was requested while the run was in flight. Not a
    /// failure: the job ends Canceled, never Failed.
    #[error("Pipeline run canceled")]
    Canceled,
}

impl ExecutionError {
    /// Classify the error for the retry manager.
    ///
    /// Launch failures are always worth another attempt. A non-zero exit
    /// is transient only when the log tail carries a known resource
    /// marker; otherwise the input is bad and retrying cannot help.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Spawn(_) => FailureKind::Transient,
            Self::Exit { log_tail, .. } => {
                let lower = log_tail.to_lowercase();
                if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
                    FailureKind::Transient
                } else {
                    FailureKind::Permanent
                }
            }
            Self::Timeout { .. } | Self::MissingOutput { .. } => FailureKind::Permanent,
            // Cancellation never reaches the retry manager; classify
            // defensively as permanent if it ever does.
            Self::Canceled => FailureKind::Permanent,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
