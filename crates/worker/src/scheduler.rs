//! Wires the lanes together and owns shutdown.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tabsyn_core::capacity::CapacityController;
use tabsyn_core::job::Tier;
use tabsyn_core::registry::JobRegistry;
use tabsyn_events::{CompletionNotifier, EventBus};
use tabsyn_pipeline::runner::PipelineRunner;

use crate::config::WorkerConfig;
use crate::failure::FailureManager;
use crate::lane::{worker_loop, LaneContext};

/// Running worker pool: one lane per tier, a fixed set of worker loops
/// per lane.
pub struct Scheduler {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn all lanes and return the running scheduler.
    pub fn start(
        registry: Arc<dyn JobRegistry>,
        runner: Arc<dyn PipelineRunner>,
        bus: Arc<EventBus>,
        config: WorkerConfig,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let capacity = CapacityController::new(config.capacity());
        let notifier = Arc::new(CompletionNotifier::new(
            Arc::clone(&bus),
            config.webhook_url.clone(),
        ));
        let failures = Arc::new(FailureManager::new(config.retry.clone()));
        let config = Arc::new(config);

        let mut handles = Vec::new();
        for tier in Tier::ALL {
            for worker_idx in 0..config.workers_for(tier) {
                let ctx = LaneContext {
                    tier,
                    registry: Arc::clone(&registry),
                    capacity: capacity.clone(),
                    runner: Arc::clone(&runner),
                    bus: Arc::clone(&bus),
                    notifier: Arc::clone(&notifier),
                    failures: Arc::clone(&failures),
                    config: Arc::clone(&config),
                };
                handles.push(tokio::spawn(worker_loop(
                    ctx,
                    worker_idx,
                    shutdown.child_token(),
                )));
            }
            tracing::info!(
                tier = %tier,
                workers = config.workers_for(tier),
                "Lane started",
            );
        }

        Self { shutdown, handles }
    }

    /// Signal all workers to stop and wait for them to drain.
    ///
    /// Workers finish the job they are currently executing; queued jobs
    /// stay in the registry for the next process start.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
