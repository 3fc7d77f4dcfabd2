//! Row model for the `jobs` table.

use sqlx::FromRow;

use tabsyn_core::job::{JobSnapshot, JobStatus, Stage, Tier};
use tabsyn_core::registry::RegistryError;
use tabsyn_core::types::Timestamp;

/// A row from the `jobs` table.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: i64,
    pub token: String,
    pub owner_id: String,
    pub tier: String,
    pub priority: i32,
    pub parameters: serde_json::Value,
    pub status_id: i16,
    pub stage: String,
    pub progress_percent: i16,
    pub progress_message: String,
    pub result_ref: Option<String>,
    pub error_summary: Option<String>,
    pub cancel_requested: bool,
    pub retry_count: i16,
    pub max_retries: i16,
    pub attempt_count: i16,
    pub next_attempt_at: Option<Timestamp>,
    pub queued_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl JobRow {
    /// Convert the row into a domain snapshot.
    ///
    /// A row that fails enum parsing indicates corruption and surfaces
    /// as a storage error rather than a panic.
    pub fn into_snapshot(self, logs: Vec<String>) -> Result<JobSnapshot, RegistryError> {
        let status = JobStatus::try_from(self.status_id)
            .map_err(|e| RegistryError::Storage(e.to_string()))?;
        let tier: Tier = self
            .tier
            .parse()
            .map_err(|e: tabsyn_core::error::CoreError| RegistryError::Storage(e.to_string()))?;
        let stage: Stage = self
            .stage
            .parse()
            .map_err(|e: tabsyn_core::error::CoreError| RegistryError::Storage(e.to_string()))?;

        Ok(JobSnapshot {
            token: self.token,
            owner_id: self.owner_id,
            tier,
            priority: self.priority,
            parameters: self.parameters,
            status,
            stage,
            progress_percent: self.progress_percent.clamp(0, 100) as u8,
            message: self.progress_message,
            logs,
            result_ref: self.result_ref,
            error_summary: self.error_summary,
            cancel_requested: self.cancel_requested,
            retry_count: self.retry_count.max(0) as u16,
            max_retries: self.max_retries.max(0) as u16,
            attempt_count: self.attempt_count.max(0) as u16,
            queued_at: self.queued_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            updated_at: self.updated_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
