//! TabSyn domain core.
//!
//! Pure domain logic shared by the API server and the worker: the job
//! model and state machine, the [`registry::JobRegistry`] storage seam,
//! the per-tier [`capacity::CapacityController`], retry policy, and the
//! entitlement lookup seam. This crate has no internal dependencies so
//! it can be used from every other workspace member.

pub mod capacity;
pub mod entitlement;
pub mod error;
pub mod job;
pub mod memory;
pub mod registry;
pub mod retry;
pub mod types;
