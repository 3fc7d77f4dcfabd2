//! Job lifecycle events and terminal notifications.
//!
//! - [`EventBus`] — in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`JobEvent`] — the canonical job event envelope.
//! - [`CompletionNotifier`] — one-shot terminal side effect, idempotent
//!   per (token, terminal status).
//! - [`WebhookDelivery`] — external delivery with bounded retry.

pub mod bus;
pub mod notifier;
pub mod webhook;

pub use bus::{
    EventBus, JobEvent, EVENT_JOB_CANCELED, EVENT_JOB_COMPLETED, EVENT_JOB_FAILED,
    EVENT_JOB_PROGRESS,
};
pub use notifier::CompletionNotifier;
pub use webhook::WebhookDelivery;
