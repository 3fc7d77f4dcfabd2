//! Failure and retry management.
//!
//! Applies the retry policy after a failed execution attempt: transient
//! errors re-enqueue the same token with a backoff gate while the budget
//! lasts, everything else is a terminal failure with a sanitized error
//! summary. The full error detail always lands in the job log.

use chrono::Utc;
use std::time::Duration;

use tabsyn_core::job::{JobSnapshot, JobStatus};
use tabsyn_core::registry::{JobRegistry, RegistryError, TransitionFields};
use tabsyn_core::retry::{should_retry, RetryPolicy};
use tabsyn_pipeline::ExecutionError;

/// Maximum characters of error text exposed to polling clients.
const MAX_SUMMARY_CHARS: usize = 500;

/// What the failure manager decided to do with a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Re-enqueued for another attempt after `delay`.
    Retried { delay: Duration },
    /// Terminally failed with this client-facing summary.
    Failed { summary: String },
}

pub struct FailureManager {
    policy: RetryPolicy,
}

impl FailureManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Record a failed attempt for a Running job and either re-enqueue
    /// it or fail it terminally.
    pub async fn handle(
        &self,
        registry: &dyn JobRegistry,
        job: &JobSnapshot,
        error: &ExecutionError,
    ) -> Result<Disposition, RegistryError> {
        let kind = error.failure_kind();

        if should_retry(kind, job.retry_count, job.max_retries) {
            let delay = self.policy.backoff(job.retry_count);
            let next_attempt_at =
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();

            registry
                .append_log(
                    &job.token,
                    &format!(
                        "Attempt {} failed ({error}); retrying in {}s",
                        job.attempt_count,
                        delay.as_secs()
                    ),
                )
                .await?;
            registry
                .transition(
                    &job.token,
                    JobStatus::Running,
                    JobStatus::Queued,
                    TransitionFields {
                        increment_retry: true,
                        next_attempt_at: Some(next_attempt_at),
                        ..Default::default()
                    },
                )
                .await?;

            tracing::warn!(
                token = %job.token,
                retry_count = job.retry_count + 1,
                max_retries = job.max_retries,
                delay_secs = delay.as_secs(),
                "Transient failure, job re-enqueued",
            );
            Ok(Disposition::Retried { delay })
        } else {
            let summary = sanitize_error(&error.to_string());

            registry
                .append_log(&job.token, &format!("Job failed: {error}"))
                .await?;
            registry
                .transition(
                    &job.token,
                    JobStatus::Running,
                    JobStatus::Failed,
                    TransitionFields {
                        error_summary: Some(summary.clone()),
                        ..Default::default()
                    },
                )
                .await?;

            tracing::error!(token = %job.token, error = %error, "Job terminally failed");
            Ok(Disposition::Failed { summary })
        }
    }
}

/// Collapse an error into a single client-safe line.
///
/// Full detail stays in the server-side job log; clients get at most
/// [`MAX_SUMMARY_CHARS`] characters with newlines flattened.
pub fn sanitize_error(text: &str) -> String {
    let flat: String = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if flat.chars().count() <= MAX_SUMMARY_CHARS {
        return flat;
    }
    let mut truncated: String = flat.chars().take(MAX_SUMMARY_CHARS).collect();
    truncated.push('…');
    truncated
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tabsyn_core::job::{NewJob, Tier};
    use tabsyn_core::memory::MemoryRegistry;

    use super::*;

    async fn running_job(registry: &MemoryRegistry, max_retries: u16) -> JobSnapshot {
        let token = registry
            .create(NewJob {
                owner_id: "owner".to_string(),
                tier: Tier::Cpu,
                priority: 0,
                parameters: serde_json::json!({}),
                max_retries,
            })
            .await
            .unwrap();
        registry
            .transition(
                &token,
                JobStatus::Queued,
                JobStatus::Running,
                TransitionFields::default(),
            )
            .await
            .unwrap();
        registry.get(&token).await.unwrap()
    }

    fn manager() -> FailureManager {
        FailureManager::new(RetryPolicy {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        })
    }

    #[tokio::test]
    async fn transient_failure_reenqueues_with_incremented_retry() {
        let registry = MemoryRegistry::new();
        let job = running_job(&registry, 3).await;
        let error = ExecutionError::Spawn(std::io::Error::other("fork failed"));

        let disposition = manager().handle(&registry, &job, &error).await.unwrap();
        assert_matches!(disposition, Disposition::Retried { .. });

        let snapshot = registry.get(&job.token).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Queued);
        assert_eq!(snapshot.retry_count, 1);
        assert!(snapshot.logs.iter().any(|l| l.contains("retrying")));
    }

    #[tokio::test]
    async fn permanent_failure_is_terminal_with_summary() {
        let registry = MemoryRegistry::new();
        let job = running_job(&registry, 3).await;
        let error = ExecutionError::Exit {
            exit_code: 1,
            log_tail: "ValueError: bad input".to_string(),
        };

        let disposition = manager().handle(&registry, &job, &error).await.unwrap();
        assert_matches!(disposition, Disposition::Failed { .. });

        let snapshot = registry.get(&job.token).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.retry_count, 0);
        assert!(snapshot.error_summary.is_some());
        assert!(snapshot.finished_at.is_some());
    }

    #[tokio::test]
    async fn exhausted_budget_fails_even_transient_errors() {
        let registry = MemoryRegistry::new();
        let job = running_job(&registry, 0).await;
        let error = ExecutionError::Spawn(std::io::Error::other("fork failed"));

        let disposition = manager().handle(&registry, &job, &error).await.unwrap();
        assert_matches!(disposition, Disposition::Failed { .. });
    }

    #[test]
    fn sanitize_flattens_and_truncates() {
        let summary = sanitize_error("line one\nline two\ttabbed");
        assert_eq!(summary, "line one line two tabbed");

        let long = "x".repeat(2000);
        let summary = sanitize_error(&long);
        assert_eq!(summary.chars().count(), 501);
        assert!(summary.ends_with('…'));
    }
}
