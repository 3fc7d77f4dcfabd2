//! In-process event bus backed by a `tokio::sync::broadcast` channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Progress update while a job is running.
pub const EVENT_JOB_PROGRESS: &str = "job.progress";

/// Job completed successfully.
pub const EVENT_JOB_COMPLETED: &str = "job.completed";

/// Job failed terminally.
pub const EVENT_JOB_FAILED: &str = "job.failed";

/// Job was canceled (by the owner or an operator).
pub const EVENT_JOB_CANCELED: &str = "job.canceled";

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

/// A job lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    /// Dot-separated event name, e.g. `"job.completed"`.
    pub event_type: String,
    /// Token of the job the event concerns.
    pub token: String,
    /// Free-form JSON payload carrying event-specific data.
    pub payload: serde_json::Value,
    /// When the event was created (UTC).
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    /// Create a new event with an empty payload.
    pub fn new(event_type: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            token: token.into(),
            payload: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    /// Set the JSON payload for the event.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// In-process fan-out event bus.
///
/// Wraps a [`broadcast::Sender`] so that any number of subscribers can
/// independently receive every published [`JobEvent`].
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are
    /// dropped and slow receivers observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped.
    pub fn publish(&self, event: JobEvent) {
        // Ignore the SendError — it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events published on this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
