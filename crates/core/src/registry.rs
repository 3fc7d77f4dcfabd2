//! The [`JobRegistry`] storage seam.
//!
//! The registry is the source of truth for job state. Process memory is
//! only ever a cache: the production implementation lives in `tabsyn-db`
//! (PostgreSQL), while [`crate::memory::MemoryRegistry`] backs tests and
//! single-process deployments.
//!
//! All status changes go through [`JobRegistry::transition`], a
//! compare-and-swap: the caller states the status it believes is current
//! and a mismatch returns [`RegistryError::Conflict`] instead of a silent
//! overwrite. This is what prevents a stale worker from resurrecting a
//! canceled or already-terminal job.

use async_trait::async_trait;

use crate::job::{JobSnapshot, JobStatus, NewJob, Stage, Tier};
use crate::types::Timestamp;

/// Maximum log lines retained per job. Older lines are dropped.
pub const MAX_LOG_LINES: usize = 400;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Job not found: {0}")]
    NotFound(String),

    /// CAS mismatch: the record's current status was not what the caller
    /// expected. The write was not applied.
    #[error("Transition conflict for job {token}: expected {expected:?}, found {actual:?}")]
    Conflict {
        token: String,
        expected: JobStatus,
        actual: JobStatus,
    },

    /// The requested transition is not in the state machine at all,
    /// regardless of the record's current status.
    #[error("Invalid transition: {from:?} -> {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// A durability failure in the backing store. Fatal to the calling
    /// operation; callers retry with backoff rather than dropping the
    /// write.
    #[error("Registry storage error: {0}")]
    Storage(String),
}

// ---------------------------------------------------------------------------
// Transition fields
// ---------------------------------------------------------------------------

/// Optional fields applied together with a status transition.
///
/// Timestamps are owned by the registry itself: `started_at` is stamped
/// on entry to Running and `finished_at` exactly once on the first
/// terminal transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    /// Artifact reference, set on Completed.
    pub result_ref: Option<String>,
    /// Sanitized error text, set on Failed.
    pub error_summary: Option<String>,
    /// Increment `retry_count` (the Running -> Queued retry path).
    pub increment_retry: bool,
    /// Earliest time the job becomes eligible for dequeue again
    /// (retry backoff gate).
    pub next_attempt_at: Option<Timestamp>,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was still queued and is now terminally Canceled.
    Canceled,
    /// The job is running; the cooperative cancel flag was set and the
    /// worker will perform the terminal transition.
    Flagged,
    /// The job had already reached a terminal state.
    AlreadyTerminal,
}

/// Per-tier backlog counts, used for the optimistic capacity pre-check
/// at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierCounts {
    pub queued: u32,
    pub running: u32,
}

// ---------------------------------------------------------------------------
// JobRegistry
// ---------------------------------------------------------------------------

/// Durable store of job records.
///
/// Writes must be committed before the call returns. Reads return
/// point-in-time snapshots and never block writers.
#[async_trait]
pub trait JobRegistry: Send + Sync {
    /// Create a Queued job and return its token.
    async fn create(&self, job: NewJob) -> Result<String, RegistryError>;

    /// Fetch a snapshot of a job by token.
    async fn get(&self, token: &str) -> Result<JobSnapshot, RegistryError>;

    /// Compare-and-swap status transition.
    ///
    /// Validates the transition against the state machine, then applies
    /// it only if the record's current status equals `expected`.
    async fn transition(
        &self,
        token: &str,
        expected: JobStatus,
        next: JobStatus,
        fields: TransitionFields,
    ) -> Result<(), RegistryError>;

    /// Update stage and progress for a Running job.
    ///
    /// Progress is clamped so the stored percentage never decreases; the
    /// update is silently ignored when the job is no longer Running, so a
    /// stale adapter cannot touch a canceled or terminal record.
    async fn update_progress(
        &self,
        token: &str,
        stage: Stage,
        percent: u8,
        message: Option<&str>,
    ) -> Result<(), RegistryError>;

    /// Append one line to the job log. The retained log is capped at
    /// [`MAX_LOG_LINES`]; the oldest lines are discarded first.
    async fn append_log(&self, token: &str, line: &str) -> Result<(), RegistryError>;

    /// Request cancellation. Queued jobs are canceled directly; Running
    /// jobs get the cooperative flag set for the worker to observe.
    async fn request_cancel(&self, token: &str) -> Result<CancelOutcome, RegistryError>;

    /// Number of Queued-or-Running jobs for an owner.
    async fn active_count(&self, owner_id: &str) -> Result<u32, RegistryError>;

    /// Queued/Running counts for a tier.
    async fn tier_counts(&self, tier: Tier) -> Result<TierCounts, RegistryError>;

    /// Highest-priority dequeue candidate for a tier: Queued, backoff
    /// elapsed, ordered by priority descending then queued_at ascending
    /// (FIFO within a priority band).
    async fn next_queued(&self, tier: Tier) -> Result<Option<JobSnapshot>, RegistryError>;

    /// Recent jobs for an owner, newest first.
    async fn list_for_owner(
        &self,
        owner_id: &str,
        limit: u32,
    ) -> Result<Vec<JobSnapshot>, RegistryError>;
}
