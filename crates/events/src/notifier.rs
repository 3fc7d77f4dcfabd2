//! One-shot terminal notification.
//!
//! [`CompletionNotifier::notify`] is invoked by the worker after the
//! terminal registry write has committed. It publishes the matching bus
//! event and, when configured, delivers it to the external webhook sink.
//! The call is idempotent per (token, terminal status): re-invocations
//! after a crash-and-redeliver are absorbed here, never re-fired. A
//! delivery failure is logged and dropped — it must not roll back or
//! re-trigger the state transition that preceded it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tabsyn_core::job::{JobSnapshot, JobStatus};

use crate::bus::{
    EventBus, JobEvent, EVENT_JOB_CANCELED, EVENT_JOB_COMPLETED, EVENT_JOB_FAILED,
};
use crate::webhook::WebhookDelivery;

/// Fires the terminal side effect for finished jobs.
pub struct CompletionNotifier {
    bus: Arc<EventBus>,
    webhook_url: Option<String>,
    webhook: WebhookDelivery,
    /// Idempotency keys for notifications already fired. Bounded by the
    /// number of jobs this process has finished.
    sent: Mutex<HashSet<(String, JobStatus)>>,
}

impl CompletionNotifier {
    pub fn new(bus: Arc<EventBus>, webhook_url: Option<String>) -> Self {
        Self {
            bus,
            webhook_url,
            webhook: WebhookDelivery::new(),
            sent: Mutex::new(HashSet::new()),
        }
    }

    /// Fire the notification for a terminal snapshot.
    ///
    /// Non-terminal snapshots and repeat invocations are no-ops.
    pub async fn notify(&self, snapshot: &JobSnapshot) {
        let event_type = match snapshot.status {
            JobStatus::Completed => EVENT_JOB_COMPLETED,
            JobStatus::Failed => EVENT_JOB_FAILED,
            JobStatus::Canceled => EVENT_JOB_CANCELED,
            JobStatus::Queued | JobStatus::Running => return,
        };

        {
            let mut sent = self.sent.lock().expect("notifier lock poisoned");
            if !sent.insert((snapshot.token.clone(), snapshot.status)) {
                tracing::debug!(token = %snapshot.token, "Notification already fired, skipping");
                return;
            }
        }

        let event = JobEvent::new(event_type, snapshot.token.clone()).with_payload(
            serde_json::json!({
                "status": snapshot.status,
                "stage": snapshot.stage,
                "resultRef": snapshot.result_ref,
                "error": snapshot.error_summary,
            }),
        );

        self.bus.publish(event.clone());
        tracing::info!(token = %snapshot.token, event_type, "Terminal notification fired");

        if let Some(url) = &self.webhook_url {
            if let Err(e) = self.webhook.deliver(url, &event).await {
                // The job already reached its terminal state; a lost
                // webhook must not affect it.
                tracing::error!(token = %snapshot.token, error = %e, "Webhook notification lost");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tabsyn_core::job::{Stage, Tier};

    use super::*;

    fn snapshot(status: JobStatus) -> JobSnapshot {
        JobSnapshot {
            token: "tok-1".to_string(),
            owner_id: "owner".to_string(),
            tier: Tier::Cpu,
            priority: 0,
            parameters: serde_json::json!({}),
            status,
            stage: Stage::Completed,
            progress_percent: 100,
            message: "Completed".to_string(),
            logs: Vec::new(),
            result_ref: Some("out.csv".to_string()),
            error_summary: None,
            cancel_requested: false,
            retry_count: 0,
            max_retries: 3,
            attempt_count: 1,
            queued_at: Utc::now(),
            started_at: Some(Utc::now()),
            finished_at: Some(Utc::now()),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn fires_exactly_once_per_token_and_status() {
        let bus = Arc::new(EventBus::default());
        let notifier = CompletionNotifier::new(Arc::clone(&bus), None);
        let mut rx = bus.subscribe();

        let snap = snapshot(JobStatus::Completed);
        notifier.notify(&snap).await;
        notifier.notify(&snap).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EVENT_JOB_COMPLETED);
        assert_eq!(event.payload["resultRef"], "out.csv");

        // The second notify must have been absorbed.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn canceled_jobs_never_emit_a_failure_event() {
        let bus = Arc::new(EventBus::default());
        let notifier = CompletionNotifier::new(Arc::clone(&bus), None);
        let mut rx = bus.subscribe();

        notifier.notify(&snapshot(JobStatus::Canceled)).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, EVENT_JOB_CANCELED);
    }

    #[tokio::test]
    async fn non_terminal_snapshots_are_ignored() {
        let bus = Arc::new(EventBus::default());
        let notifier = CompletionNotifier::new(Arc::clone(&bus), None);
        let mut rx = bus.subscribe();

        notifier.notify(&snapshot(JobStatus::Running)).await;
        notifier.notify(&snapshot(JobStatus::Queued)).await;

        assert!(rx.try_recv().is_err());
    }
}
