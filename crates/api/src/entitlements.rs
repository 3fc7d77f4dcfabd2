//! Environment-backed entitlement lookup.
//!
//! The real authority on tiers and quotas (subscriptions, billing) lives
//! outside this system. This implementation reads a static owner list
//! from the environment: owners named in `TABSYN_GPU_OWNERS` run on the
//! GPU tier at urgent priority, everyone else runs on CPU at normal
//! priority.

use std::collections::HashSet;

use tabsyn_core::entitlement::{Entitlement, EntitlementProvider};
use tabsyn_core::job::{Tier, PRIORITY_NORMAL, PRIORITY_URGENT};

/// Default retry budget for new jobs.
const DEFAULT_MAX_RETRIES: u16 = 3;

pub struct EnvEntitlements {
    gpu_owners: HashSet<String>,
    max_retries: u16,
}

impl EnvEntitlements {
    /// Read `TABSYN_GPU_OWNERS` (comma-separated owner ids) and
    /// `TABSYN_MAX_RETRIES`.
    pub fn from_env() -> Self {
        let gpu_owners = std::env::var("TABSYN_GPU_OWNERS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let max_retries = std::env::var("TABSYN_MAX_RETRIES")
            .unwrap_or_else(|_| DEFAULT_MAX_RETRIES.to_string())
            .parse()
            .expect("TABSYN_MAX_RETRIES must be a valid u16");
        Self {
            gpu_owners,
            max_retries,
        }
    }

    pub fn new(gpu_owners: impl IntoIterator<Item = String>, max_retries: u16) -> Self {
        Self {
            gpu_owners: gpu_owners.into_iter().collect(),
            max_retries,
        }
    }
}

impl EntitlementProvider for EnvEntitlements {
    fn entitlement_for(&self, owner_id: &str) -> Entitlement {
        if self.gpu_owners.contains(owner_id) {
            Entitlement {
                tier: Tier::Gpu,
                priority: PRIORITY_URGENT,
                max_retries: self.max_retries,
            }
        } else {
            Entitlement {
                tier: Tier::Cpu,
                priority: PRIORITY_NORMAL,
                max_retries: self.max_retries,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
