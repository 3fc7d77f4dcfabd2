//! PostgreSQL implementation of the job registry.
//!
//! Every status change is a single guarded UPDATE: the WHERE clause
//! carries both the token and the expected status, so the compare and
//! the swap commit atomically. `rows_affected == 0` distinguishes a lost
//! CAS race from a missing record via one follow-up read.

use async_trait::async_trait;
use sqlx::PgPool;

use tabsyn_core::job::{state_machine, JobSnapshot, JobStatus, NewJob, Stage, Tier};
use tabsyn_core::registry::{
    CancelOutcome, JobRegistry, RegistryError, TierCounts, TransitionFields, MAX_LOG_LINES,
};

use crate::models::job::JobRow;

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, token, owner_id, tier, priority, parameters, \
    status_id, stage, progress_percent, progress_message, \
    result_ref, error_summary, cancel_requested, \
    retry_count, max_retries, attempt_count, next_attempt_at, \
    queued_at, started_at, finished_at, created_at, updated_at";

/// Durable job registry backed by the `jobs` / `job_logs` tables.
pub struct PgJobRegistry {
    pool: PgPool,
}

impl PgJobRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn storage(err: sqlx::Error) -> RegistryError {
        RegistryError::Storage(err.to_string())
    }

    async fn fetch_row(&self, token: &str) -> Result<Option<JobRow>, RegistryError> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE token = $1");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::storage)
    }

    async fn fetch_logs(&self, job_id: i64) -> Result<Vec<String>, RegistryError> {
        sqlx::query_scalar::<_, String>(
            "SELECT line FROM job_logs WHERE job_id = $1 ORDER BY id ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::storage)
    }

    async fn snapshot_with_logs(&self, row: JobRow) -> Result<JobSnapshot, RegistryError> {
        let logs = self.fetch_logs(row.id).await?;
        row.into_snapshot(logs)
    }

    /// Resolve a CAS miss into Conflict or NotFound.
    async fn conflict_for(
        &self,
        token: &str,
        expected: JobStatus,
    ) -> Result<RegistryError, RegistryError> {
        match self.fetch_row(token).await? {
            Some(row) => {
                let actual = JobStatus::try_from(row.status_id)
                    .map_err(|e| RegistryError::Storage(e.to_string()))?;
                Ok(RegistryError::Conflict {
                    token: token.to_string(),
                    expected,
                    actual,
                })
            }
            None => Ok(RegistryError::NotFound(token.to_string())),
        }
    }
}

#[async_trait]
impl JobRegistry for PgJobRegistry {
    async fn create(&self, job: NewJob) -> Result<String, RegistryError> {
        let token = tabsyn_core::job::new_token();
        sqlx::query(
            "INSERT INTO jobs \
                 (token, owner_id, tier, priority, parameters, status_id, \
                  stage, progress_message, max_retries) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&token)
        .bind(&job.owner_id)
        .bind(job.tier.as_str())
        .bind(job.priority)
        .bind(&job.parameters)
        .bind(JobStatus::Queued.id())
        .bind(Stage::Queued.as_str())
        .bind(Stage::Queued.message())
        .bind(job.max_retries as i16)
        .execute(&self.pool)
        .await
        .map_err(Self::storage)?;

        Ok(token)
    }

    async fn get(&self, token: &str) -> Result<JobSnapshot, RegistryError> {
        let row = self
            .fetch_row(token)
            .await?
            .ok_or_else(|| RegistryError::NotFound(token.to_string()))?;
        self.snapshot_with_logs(row).await
    }

    async fn transition(
        &self,
        token: &str,
        expected: JobStatus,
        next: JobStatus,
        fields: TransitionFields,
    ) -> Result<(), RegistryError> {
        if !state_machine::can_transition(expected, next) {
            return Err(RegistryError::InvalidTransition {
                from: expected,
                to: next,
            });
        }

        let result = match next {
            JobStatus::Running => {
                sqlx::query(
                    "UPDATE jobs \
                     SET status_id = $3, started_at = NOW(), \
                         attempt_count = attempt_count + 1, next_attempt_at = NULL, \
                         stage = $4, progress_message = $5, updated_at = NOW() \
                     WHERE token = $1 AND status_id = $2",
                )
                .bind(token)
                .bind(expected.id())
                .bind(next.id())
                .bind(Stage::Starting.as_str())
                .bind(Stage::Starting.message())
                .execute(&self.pool)
                .await
            }
            JobStatus::Queued => {
                let increment: i16 = if fields.increment_retry { 1 } else { 0 };
                sqlx::query(
                    "UPDATE jobs \
                     SET status_id = $3, \
                         retry_count = LEAST(retry_count + $4, max_retries), \
                         next_attempt_at = $5, \
                         stage = $6, progress_message = $7, updated_at = NOW() \
                     WHERE token = $1 AND status_id = $2",
                )
                .bind(token)
                .bind(expected.id())
                .bind(next.id())
                .bind(increment)
                .bind(fields.next_attempt_at)
                .bind(Stage::Queued.as_str())
                .bind(Stage::Queued.message())
                .execute(&self.pool)
                .await
            }
            JobStatus::Completed => {
                sqlx::query(
                    "UPDATE jobs \
                     SET status_id = $3, result_ref = $4, progress_percent = 100, \
                         stage = $5, progress_message = $6, \
                         finished_at = COALESCE(finished_at, NOW()), updated_at = NOW() \
                     WHERE token = $1 AND status_id = $2",
                )
                .bind(token)
                .bind(expected.id())
                .bind(next.id())
                .bind(fields.result_ref)
                .bind(Stage::Completed.as_str())
                .bind(Stage::Completed.message())
                .execute(&self.pool)
                .await
            }
            JobStatus::Failed => {
                sqlx::query(
                    "UPDATE jobs \
                     SET status_id = $3, error_summary = $4, \
                         stage = $5, progress_message = $6, \
                         finished_at = COALESCE(finished_at, NOW()), updated_at = NOW() \
                     WHERE token = $1 AND status_id = $2",
                )
                .bind(token)
                .bind(expected.id())
                .bind(next.id())
                .bind(fields.error_summary)
                .bind(Stage::Failed.as_str())
                .bind(Stage::Failed.message())
                .execute(&self.pool)
                .await
            }
            JobStatus::Canceled => {
                sqlx::query(
                    "UPDATE jobs \
                     SET status_id = $3, progress_message = 'Canceled', \
                         finished_at = COALESCE(finished_at, NOW()), updated_at = NOW() \
                     WHERE token = $1 AND status_id = $2",
                )
                .bind(token)
                .bind(expected.id())
                .bind(next.id())
                .execute(&self.pool)
                .await
            }
        };

        let result = result.map_err(Self::storage)?;
        if result.rows_affected() == 0 {
            return Err(self.conflict_for(token, expected).await?);
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
        let result = sqlx::query(
            "UPDATE jobs \
             SET stage = $3, \
                 progress_percent = GREATEST(progress_percent, LEAST($4, 100)), \
                 progress_message = $5, updated_at = NOW() \
             WHERE token = $1 AND status_id = $2",
        )
        .bind(token)
        .bind(JobStatus::Running.id())
        .bind(stage.as_str())
        .bind(percent.min(100) as i16)
        .bind(message.unwrap_or(stage.message()))
        .execute(&self.pool)
        .await
        .map_err(Self::storage)?;

        // Zero rows means the job left Running; the stale update is
        // dropped unless the token never existed at all.
        if result.rows_affected() == 0 && self.fetch_row(token).await?.is_none() {
            return Err(RegistryError::NotFound(token.to_string()));
        }
        Ok(())
    }

    async fn append_log(&self, token: &str, line: &str) -> Result<(), RegistryError> {
        let result = sqlx::query(
            "INSERT INTO job_logs (job_id, line) \
             SELECT id, $2 FROM jobs WHERE token = $1",
        )
        .bind(token)
        .bind(line.trim_end())
        .execute(&self.pool)
        .await
        .map_err(Self::storage)?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(token.to_string()));
        }

        // Prune beyond the retention cap.
        sqlx::query(
            "DELETE FROM job_logs \
             WHERE job_id = (SELECT id FROM jobs WHERE token = $1) \
               AND id NOT IN ( \
                   SELECT id FROM job_logs \
                   WHERE job_id = (SELECT id FROM jobs WHERE token = $1) \
                   ORDER BY id DESC LIMIT $2 \
               )",
        )
        .bind(token)
        .bind(MAX_LOG_LINES as i64)
        .execute(&self.pool)
        .await
        .map_err(Self::storage)?;

        Ok(())
    }

    async fn request_cancel(&self, token: &str) -> Result<CancelOutcome, RegistryError> {
        // Queued jobs cancel directly.
        let canceled = sqlx::query(
            "UPDATE jobs \
             SET status_id = $3, cancel_requested = TRUE, \
                 progress_message = 'Canceled', \
                 finished_at = COALESCE(finished_at, NOW()), updated_at = NOW() \
             WHERE token = $1 AND status_id = $2",
        )
        .bind(token)
        .bind(JobStatus::Queued.id())
        .bind(JobStatus::Canceled.id())
        .execute(&self.pool)
        .await
        .map_err(Self::storage)?;
        if canceled.rows_affected() > 0 {
            return Ok(CancelOutcome::Canceled);
        }

        // Running jobs get the cooperative flag; the worker finishes the
        // terminal transition.
        let flagged = sqlx::query(
            "UPDATE jobs SET cancel_requested = TRUE, updated_at = NOW() \
             WHERE token = $1 AND status_id = $2",
        )
        .bind(token)
        .bind(JobStatus::Running.id())
        .execute(&self.pool)
        .await
        .map_err(Self::storage)?;
        if flagged.rows_affected() > 0 {
            return Ok(CancelOutcome::Flagged);
        }

        match self.fetch_row(token).await? {
            Some(_) => Ok(CancelOutcome::AlreadyTerminal),
            None => Err(RegistryError::NotFound(token.to_string())),
        }
    }

    async fn active_count(&self, owner_id: &str) -> Result<u32, RegistryError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE owner_id = $1 AND status_id IN ($2, $3)",
        )
        .bind(owner_id)
        .bind(JobStatus::Queued.id())
        .bind(JobStatus::Running.id())
        .fetch_one(&self.pool)
        .await
        .map_err(Self::storage)?;
        Ok(count as u32)
    }

    async fn tier_counts(&self, tier: Tier) -> Result<TierCounts, RegistryError> {
        let (queued, running): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*) FILTER (WHERE status_id = $2), \
                    COUNT(*) FILTER (WHERE status_id = $3) \
             FROM jobs WHERE tier = $1",
        )
        .bind(tier.as_str())
        .bind(JobStatus::Queued.id())
        .bind(JobStatus::Running.id())
        .fetch_one(&self.pool)
        .await
        .map_err(Self::storage)?;
        Ok(TierCounts {
            queued: queued as u32,
            running: running as u32,
        })
    }

    async fn next_queued(&self, tier: Tier) -> Result<Option<JobSnapshot>, RegistryError> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE tier = $1 AND status_id = $2 \
               AND (next_attempt_at IS NULL OR next_attempt_at <= NOW()) \
             ORDER BY priority DESC, queued_at ASC, id ASC \
             LIMIT 1"
        );
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(tier.as_str())
            .bind(JobStatus::Queued.id())
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::storage)?;

        match row {
            Some(row) => Ok(Some(self.snapshot_with_logs(row).await?)),
            None => Ok(None),
        }
    }

    async fn list_for_owner(
        &self,
        owner_id: &str,
        limit: u32,
    ) -> Result<Vec<JobSnapshot>, RegistryError> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE owner_id = $1 \
             ORDER BY queued_at DESC, id DESC \
             LIMIT $2"
        );
        let rows = sqlx::query_as::<_, JobRow>(&query)
            .bind(owner_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(Self::storage)?;

        // History listings omit the log tail; `get` serves it per job.
        rows.into_iter().map(|row| row.into_snapshot(Vec::new())).collect()
    }
}
