//! Per-tier admission control.
//!
//! [`CapacityController`] enforces two limits before a worker may start
//! executing a job: a per-tier cap on concurrently Running jobs (e.g. one
//! on the GPU tier) and, when enabled, at most one active job per owner.
//! Check-and-increment happens under one lock so two workers can never
//! both admit past the limit. Release is RAII: dropping the
//! [`AdmitPermit`] gives the slot back exactly once, on every exit path.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::job::Tier;

/// Per-tier concurrency limits and owner enforcement switch.
#[derive(Debug, Clone)]
pub struct CapacityConfig {
    /// Maximum concurrently Running jobs on the CPU tier.
    pub cpu_limit: usize,
    /// Maximum concurrently Running jobs on the GPU tier. One by default:
    /// a second training process on the same device risks OOM.
    pub gpu_limit: usize,
    /// Enforce at most one Queued-or-Running job per owner.
    pub single_active: bool,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            cpu_limit: 2,
            gpu_limit: 1,
            single_active: true,
        }
    }
}

impl CapacityConfig {
    pub fn limit_for(&self, tier: Tier) -> usize {
        match tier {
            Tier::Cpu => self.cpu_limit,
            Tier::Gpu => self.gpu_limit,
        }
    }
}

/// Outcome of an admission attempt.
#[derive(Debug)]
pub enum Admission {
    /// A slot was reserved. Dropping the permit releases it.
    Admitted(AdmitPermit),
    /// The tier is at its Running limit.
    AtCapacity,
    /// The owner already holds an active slot and single-active
    /// enforcement is on.
    OwnerBusy,
}

struct TierSlots {
    limit: usize,
    running: Mutex<usize>,
    /// Signaled once per release so one blocked worker re-races for the
    /// slot. `notify_one` stores a permit when nobody is waiting yet,
    /// which closes the check-then-wait window in [`CapacityController::admit`].
    released: Notify,
}

struct Inner {
    tiers: HashMap<Tier, TierSlots>,
    owners: Mutex<HashSet<String>>,
    single_active: bool,
}

/// Shared admission controller. Cheap to clone.
#[derive(Clone)]
pub struct CapacityController {
    inner: Arc<Inner>,
}

impl CapacityController {
    pub fn new(config: CapacityConfig) -> Self {
        let tiers = Tier::ALL
            .into_iter()
            .map(|tier| {
                (
                    tier,
                    TierSlots {
                        limit: config.limit_for(tier),
                        running: Mutex::new(0),
                        released: Notify::new(),
                    },
                )
            })
            .collect();
        Self {
            inner: Arc::new(Inner {
                tiers,
                owners: Mutex::new(HashSet::new()),
                single_active: config.single_active,
            }),
        }
    }

    fn slots(&self, tier: Tier) -> &TierSlots {
        self.inner
            .tiers
            .get(&tier)
            .expect("all tiers are registered at construction")
    }

    /// Attempt to reserve a slot without waiting.
    pub fn try_admit(&self, tier: Tier, owner_id: &str) -> Admission {
        // Lock order: owners before the tier counter, same as release.
        let mut owners = self.inner.owners.lock().expect("capacity lock poisoned");
        if self.inner.single_active && owners.contains(owner_id) {
            return Admission::OwnerBusy;
        }

        let slots = self.slots(tier);
        let mut running = slots.running.lock().expect("capacity lock poisoned");
        if *running >= slots.limit {
            return Admission::AtCapacity;
        }

        *running += 1;
        owners.insert(owner_id.to_string());
        Admission::Admitted(AdmitPermit {
            inner: Arc::clone(&self.inner),
            tier,
            owner_id: owner_id.to_string(),
        })
    }

    /// Reserve a slot, waiting for a release when the tier is full.
    ///
    /// Never waits on `OwnerBusy`: that is returned immediately so the
    /// caller can skip the job instead of deadlocking on its own owner.
    pub async fn admit(&self, tier: Tier, owner_id: &str) -> Admission {
        loop {
            // Register for the release signal before checking, so a slot
            // freed between the check and the await is not missed.
            let notified = self.slots(tier).released.notified();
            match self.try_admit(tier, owner_id) {
                Admission::AtCapacity => notified.await,
                decided => return decided,
            }
        }
    }

    /// Currently admitted count for a tier.
    pub fn running_count(&self, tier: Tier) -> usize {
        *self.slots(tier).running.lock().expect("capacity lock poisoned")
    }
}

/// RAII admission slot. Releasing happens in `Drop`, which makes the
/// "exactly once, on every exit path" guarantee structural rather than
/// something each call site has to remember.
pub struct AdmitPermit {
    inner: Arc<Inner>,
    tier: Tier,
    owner_id: String,
}

impl std::fmt::Debug for AdmitPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmitPermit")
            .field("tier", &self.tier)
            .field("owner_id", &self.owner_id)
            .finish_non_exhaustive()
    }
}

impl Drop for AdmitPermit {
    fn drop(&mut self) {
        let mut owners = self.inner.owners.lock().expect("capacity lock poisoned");
        owners.remove(&self.owner_id);

        let slots = self
            .inner
            .tiers
            .get(&self.tier)
            .expect("all tiers are registered at construction");
        let mut running = slots.running.lock().expect("capacity lock poisoned");
        *running = running.saturating_sub(1);
        drop(running);
        drop(owners);

        slots.released.notify_one();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;

    fn controller(cpu: usize, gpu: usize, single_active: bool) -> CapacityController {
        CapacityController::new(CapacityConfig {
            cpu_limit: cpu,
            gpu_limit: gpu,
            single_active,
        })
    }

    #[tokio::test]
    async fn admits_up_to_the_tier_limit() {
        let ctrl = controller(2, 1, false);

        let a = ctrl.try_admit(Tier::Cpu, "a");
        let b = ctrl.try_admit(Tier::Cpu, "b");
        assert_matches!(a, Admission::Admitted(_));
        assert_matches!(b, Admission::Admitted(_));
        assert_matches!(ctrl.try_admit(Tier::Cpu, "c"), Admission::AtCapacity);
        assert_eq!(ctrl.running_count(Tier::Cpu), 2);
    }

    #[tokio::test]
    async fn tiers_are_independent() {
        let ctrl = controller(1, 1, false);

        let _cpu = ctrl.try_admit(Tier::Cpu, "a");
        assert_matches!(ctrl.try_admit(Tier::Gpu, "b"), Admission::Admitted(_));
    }

    #[tokio::test]
    async fn dropping_the_permit_releases_the_slot() {
        let ctrl = controller(1, 1, false);

        let permit = match ctrl.try_admit(Tier::Gpu, "a") {
            Admission::Admitted(p) => p,
            _ => panic!("first admit must succeed"),
        };
        assert_matches!(ctrl.try_admit(Tier::Gpu, "b"), Admission::AtCapacity);

        drop(permit);
        assert_eq!(ctrl.running_count(Tier::Gpu), 0);
        assert_matches!(ctrl.try_admit(Tier::Gpu, "b"), Admission::Admitted(_));
    }

    #[tokio::test]
    async fn owner_with_active_slot_is_busy() {
        let ctrl = controller(4, 1, true);

        let permit = match ctrl.try_admit(Tier::Cpu, "a") {
            Admission::Admitted(p) => p,
            _ => panic!("first admit must succeed"),
        };
        assert_matches!(ctrl.try_admit(Tier::Cpu, "a"), Admission::OwnerBusy);
        // A different owner still fits.
        assert_matches!(ctrl.try_admit(Tier::Cpu, "b"), Admission::Admitted(_));

        drop(permit);
        assert_matches!(ctrl.try_admit(Tier::Cpu, "a"), Admission::Admitted(_));
    }

    #[tokio::test]
    async fn owner_enforcement_can_be_disabled() {
        let ctrl = controller(4, 1, false);

        let _first = ctrl.try_admit(Tier::Cpu, "a");
        assert_matches!(ctrl.try_admit(Tier::Cpu, "a"), Admission::Admitted(_));
    }

    #[tokio::test]
    async fn blocked_admit_wakes_on_release() {
        let ctrl = controller(1, 1, false);

        let permit = match ctrl.try_admit(Tier::Cpu, "a") {
            Admission::Admitted(p) => p,
            _ => panic!("first admit must succeed"),
        };

        let waiter = {
            let ctrl = ctrl.clone();
            tokio::spawn(async move { ctrl.admit(Tier::Cpu, "b").await })
        };

        // Give the waiter time to park on the notify.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        let admission = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must wake after release")
            .unwrap();
        assert_matches!(admission, Admission::Admitted(_));
    }

    #[tokio::test]
    async fn admit_returns_owner_busy_without_waiting() {
        let ctrl = controller(2, 1, true);

        let _permit = ctrl.try_admit(Tier::Cpu, "a");
        let admission = tokio::time::timeout(Duration::from_millis(200), ctrl.admit(Tier::Cpu, "a"))
            .await
            .expect("owner-busy must not block");
        assert_matches!(admission, Admission::OwnerBusy);
    }
}
