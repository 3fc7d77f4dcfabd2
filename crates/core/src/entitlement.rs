//! Entitlement lookup seam.
//!
//! Which tier an owner runs on, at what priority, and with how many
//! retries is decided outside this system (subscriptions, quotas). The
//! submitter only ever talks to this trait; the API crate provides an
//! environment-configured implementation.

use crate::job::Tier;

/// Scheduling entitlement resolved for an owner. The tier is never
/// caller-supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entitlement {
    pub tier: Tier,
    pub priority: i32,
    pub max_retries: u16,
}

pub trait EntitlementProvider: Send + Sync {
    fn entitlement_for(&self, owner_id: &str) -> Entitlement;
}
