//! In-memory [`JobRegistry`] implementation.
//!
//! Backs tests and single-process deployments. State lives in one
//! mutex-guarded map; every accessor returns a point-in-time copy, so
//! concurrent pollers never observe a half-applied update. Not durable:
//! production deployments use the PostgreSQL registry in `tabsyn-db`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::job::{self, JobSnapshot, JobStatus, NewJob, Stage, Tier};
use crate::registry::{
    CancelOutcome, JobRegistry, RegistryError, TierCounts, TransitionFields, MAX_LOG_LINES,
};
use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

struct JobRecord {
    /// Monotonic insertion sequence, the FIFO tie-break within a
    /// priority band.
    seq: u64,
    token: String,
    owner_id: String,
    tier: Tier,
    priority: i32,
    parameters: serde_json::Value,
    status: JobStatus,
    stage: Stage,
    progress_percent: u8,
    message: String,
    logs: VecDeque<String>,
    result_ref: Option<String>,
    error_summary: Option<String>,
    cancel_requested: bool,
    retry_count: u16,
    max_retries: u16,
    attempt_count: u16,
    next_attempt_at: Option<Timestamp>,
    queued_at: Timestamp,
    started_at: Option<Timestamp>,
    finished_at: Option<Timestamp>,
    updated_at: Timestamp,
}

impl JobRecord {
    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            token: self.token.clone(),
            owner_id: self.owner_id.clone(),
            tier: self.tier,
            priority: self.priority,
            parameters: self.parameters.clone(),
            status: self.status,
            stage: self.stage,
            progress_percent: self.progress_percent,
            message: self.message.clone(),
            logs: self.logs.iter().cloned().collect(),
            result_ref: self.result_ref.clone(),
            error_summary: self.error_summary.clone(),
            cancel_requested: self.cancel_requested,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            attempt_count: self.attempt_count,
            queued_at: self.queued_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            updated_at: self.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryRegistry
// ---------------------------------------------------------------------------

/// Mutex-guarded in-memory job store.
#[derive(Default)]
pub struct MemoryRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, JobRecord>,
    next_seq: u64,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRegistry for MemoryRegistry {
    async fn create(&self, job: NewJob) -> Result<String, RegistryError> {
        let token = job::new_token();
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(
            token.clone(),
            JobRecord {
                seq,
                token: token.clone(),
                owner_id: job.owner_id,
                tier: job.tier,
                priority: job.priority,
                parameters: job.parameters,
                status: JobStatus::Queued,
                stage: Stage::Queued,
                progress_percent: 0,
                message: Stage::Queued.message().to_string(),
                logs: VecDeque::new(),
                result_ref: None,
                error_summary: None,
                cancel_requested: false,
                retry_count: 0,
                max_retries: job.max_retries,
                attempt_count: 0,
                next_attempt_at: None,
                queued_at: now,
                started_at: None,
                finished_at: None,
                updated_at: now,
            },
        );
        Ok(token)
    }

    async fn get(&self, token: &str) -> Result<JobSnapshot, RegistryError> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .jobs
            .get(token)
            .map(JobRecord::snapshot)
            .ok_or_else(|| RegistryError::NotFound(token.to_string()))
    }

    async fn transition(
        &self,
        token: &str,
        expected: JobStatus,
        next: JobStatus,
        fields: TransitionFields,
    ) -> Result<(), RegistryError> {
        if !job::state_machine::can_transition(expected, next) {
            return Err(RegistryError::InvalidTransition {
                from: expected,
                to: next,
            });
        }

        let now = Utc::now();
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let record = inner
            .jobs
            .get_mut(token)
            .ok_or_else(|| RegistryError::NotFound(token.to_string()))?;

        if record.status != expected {
            return Err(RegistryError::Conflict {
                token: token.to_string(),
                expected,
                actual: record.status,
            });
        }

        record.status = next;
        record.updated_at = now;
        match next {
            JobStatus::Running => {
                record.started_at = Some(now);
                record.attempt_count = record.attempt_count.saturating_add(1);
                record.next_attempt_at = None;
                record.stage = Stage::Starting;
                record.message = Stage::Starting.message().to_string();
            }
            JobStatus::Queued => {
                if fields.increment_retry {
                    record.retry_count = record.retry_count.saturating_add(1).min(record.max_retries);
                }
                record.next_attempt_at = fields.next_attempt_at;
                record.stage = Stage::Queued;
                record.message = Stage::Queued.message().to_string();
            }
            JobStatus::Completed => {
                record.finished_at.get_or_insert(now);
                record.progress_percent = 100;
                record.stage = Stage::Completed;
                record.message = Stage::Completed.message().to_string();
                record.result_ref = fields.result_ref;
            }
            JobStatus::Failed => {
                record.finished_at.get_or_insert(now);
                record.stage = Stage::Failed;
                record.message = Stage::Failed.message().to_string();
                record.error_summary = fields.error_summary;
            }
            JobStatus::Canceled => {
                record.finished_at.get_or_insert(now);
                record.message = "Canceled".to_string();
            }
        }
        Ok(())
    }

    async fn update_progress(
        &self,
        token: &str,
        stage: Stage,
        percent: u8,
        message: Option<&str>,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let record = inner
            .jobs
            .get_mut(token)
            .ok_or_else(|| RegistryError::NotFound(token.to_string()))?;

        // Stale adapters must not touch a job that left Running.
        if record.status != JobStatus::Running {
            return Ok(());
        }

        record.stage = stage;
        record.progress_percent = record.progress_percent.max(percent.min(100));
        record.message = message
            .map(str::to_string)
            .unwrap_or_else(|| stage.message().to_string());
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn append_log(&self, token: &str, line: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let record = inner
            .jobs
            .get_mut(token)
            .ok_or_else(|| RegistryError::NotFound(token.to_string()))?;

        record.logs.push_back(line.trim_end().to_string());
        while record.logs.len() > MAX_LOG_LINES {
            record.logs.pop_front();
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn request_cancel(&self, token: &str) -> Result<CancelOutcome, RegistryError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let record = inner
            .jobs
            .get_mut(token)
            .ok_or_else(|| RegistryError::NotFound(token.to_string()))?;

        match record.status {
            status if status.is_terminal() => Ok(CancelOutcome::AlreadyTerminal),
            JobStatus::Queued => {
                record.cancel_requested = true;
                record.status = JobStatus::Canceled;
                record.finished_at = Some(now);
                record.message = "Canceled".to_string();
                record.updated_at = now;
                Ok(CancelOutcome::Canceled)
            }
            _ => {
                record.cancel_requested = true;
                record.updated_at = now;
                Ok(CancelOutcome::Flagged)
            }
        }
    }

    async fn active_count(&self, owner_id: &str) -> Result<u32, RegistryError> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        Ok(inner
            .jobs
            .values()
            .filter(|r| r.owner_id == owner_id && !r.status.is_terminal())
            .count() as u32)
    }

    async fn tier_counts(&self, tier: Tier) -> Result<TierCounts, RegistryError> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut counts = TierCounts {
            queued: 0,
            running: 0,
        };
        for record in inner.jobs.values().filter(|r| r.tier == tier) {
            match record.status {
                JobStatus::Queued => counts.queued += 1,
                JobStatus::Running => counts.running += 1,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn next_queued(&self, tier: Tier) -> Result<Option<JobSnapshot>, RegistryError> {
        let now = Utc::now();
        let inner = self.inner.lock().expect("registry lock poisoned");
        Ok(inner
            .jobs
            .values()
            .filter(|r| {
                r.tier == tier
                    && r.status == JobStatus::Queued
                    && r.next_attempt_at.map_or(true, |at| at <= now)
            })
            .min_by_key(|r| (std::cmp::Reverse(r.priority), r.queued_at, r.seq))
            .map(JobRecord::snapshot))
    }

    async fn list_for_owner(
        &self,
        owner_id: &str,
        limit: u32,
    ) -> Result<Vec<JobSnapshot>, RegistryError> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut jobs: Vec<&JobRecord> = inner
            .jobs
            .values()
            .filter(|r| r.owner_id == owner_id)
            .collect();
        jobs.sort_by_key(|r| std::cmp::Reverse(r.seq));
        Ok(jobs
            .into_iter()
            .take(limit as usize)
            .map(JobRecord::snapshot)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
