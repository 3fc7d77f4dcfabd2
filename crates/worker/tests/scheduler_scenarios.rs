//! End-to-end scheduler behaviour against the in-memory registry.
//!
//! Fake runners make the scheduling properties deterministic; the
//! timeout scenario drives the real subprocess runner with `/bin/sh`
//! fixture scripts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use tabsyn_core::job::{JobSnapshot, JobStatus, NewJob, Tier};
use tabsyn_core::memory::MemoryRegistry;
use tabsyn_core::registry::JobRegistry;
use tabsyn_core::retry::RetryPolicy;
use tabsyn_events::bus::{EVENT_JOB_CANCELED, EVENT_JOB_FAILED};
use tabsyn_events::EventBus;
use tabsyn_pipeline::runner::{
    PipelineOutcome, PipelineRunner, RunRequest, RunnerConfig, SubprocessRunner,
};
use tabsyn_pipeline::ExecutionError;
use tabsyn_worker::config::WorkerConfig;
use tabsyn_worker::scheduler::Scheduler;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn fast_config(cpu_limit: usize, gpu_limit: usize, workers_per_tier: Option<usize>) -> WorkerConfig {
    WorkerConfig {
        cpu_limit,
        gpu_limit,
        workers_per_tier,
        single_active: true,
        poll_interval: Duration::from_millis(20),
        cancel_poll_interval: Duration::from_millis(20),
        pipeline_timeout: Duration::from_secs(10),
        kill_grace: Duration::from_millis(500),
        retry: RetryPolicy {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
        python_bin: "/bin/sh".into(),
        script_path: "unused".into(),
        working_dir: ".".into(),
        data_root: ".".into(),
        gpu_devices: "0".to_string(),
        webhook_url: None,
    }
}

fn new_job(owner: &str, tier: Tier, max_retries: u16) -> NewJob {
    NewJob {
        owner_id: owner.to_string(),
        tier,
        priority: 0,
        parameters: serde_json::json!({"dataset": "AIDS", "table": "patients"}),
        max_retries,
    }
}

/// Poll the registry until the job reaches `status` or the deadline
/// passes.
async fn wait_for_status(
    registry: &MemoryRegistry,
    token: &str,
    status: JobStatus,
) -> JobSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = registry.get(token).await.unwrap();
        if snapshot.status == status {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {token} did not reach {status:?}; currently {:?}",
            snapshot.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// What a fake execution attempt should do.
enum Behavior {
    /// Sleep, then succeed (respecting cancellation).
    Succeed { delay: Duration },
    /// Exit non-zero with the given log tail.
    Exit { exit_code: i32, log_tail: &'static str },
    /// Fail to launch (classified transient).
    LaunchFailure,
    /// Park until the cancellation token fires.
    HangUntilCancel,
}

/// Deterministic in-process runner that also tracks peak concurrency.
struct FakeRunner {
    behavior: Behavior,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeRunner {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PipelineRunner for FakeRunner {
    async fn run(&self, request: RunRequest) -> Result<PipelineOutcome, ExecutionError> {
        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);

        let result = match &self.behavior {
            Behavior::Succeed { delay } => {
                tokio::select! {
                    () = tokio::time::sleep(*delay) => Ok(PipelineOutcome {
                        exit_code: 0,
                        result_ref: format!("generated/{}.csv", request.token),
                        duration: *delay,
                    }),
                    () = request.cancel.cancelled() => Err(ExecutionError::Canceled),
                }
            }
            Behavior::Exit { exit_code, log_tail } => Err(ExecutionError::Exit {
                exit_code: *exit_code,
                log_tail: (*log_tail).to_string(),
            }),
            Behavior::LaunchFailure => Err(ExecutionError::Spawn(std::io::Error::other(
                "interpreter not found",
            ))),
            Behavior::HangUntilCancel => {
                request.cancel.cancelled().await;
                Err(ExecutionError::Canceled)
            }
        };

        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

struct Harness {
    registry: Arc<MemoryRegistry>,
    bus: Arc<EventBus>,
    scheduler: Scheduler,
}

fn start(config: WorkerConfig, runner: Arc<dyn PipelineRunner>) -> Harness {
    let registry = Arc::new(MemoryRegistry::new());
    let bus = Arc::new(EventBus::default());
    let scheduler = Scheduler::start(
        Arc::clone(&registry) as Arc<dyn JobRegistry>,
        runner,
        Arc::clone(&bus),
        config,
    );
    Harness {
        registry,
        bus,
        scheduler,
    }
}

// ---------------------------------------------------------------------------
// Scenario A: free slot, immediate pickup
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queued_job_is_picked_up_and_completed() {
    let runner = FakeRunner::new(Behavior::Succeed {
        delay: Duration::from_millis(30),
    });
    let h = start(fast_config(1, 1, None), runner);

    let token = h.registry.create(new_job("alice", Tier::Cpu, 3)).await.unwrap();
    let snapshot = wait_for_status(&h.registry, &token, JobStatus::Completed).await;

    assert_eq!(snapshot.progress_percent, 100);
    assert_eq!(snapshot.attempt_count, 1);
    assert!(snapshot.result_ref.as_deref().unwrap().contains(&token));
    assert!(snapshot.started_at.is_some());
    assert!(snapshot.finished_at.is_some());

    h.scheduler.shutdown().await;
}

// ---------------------------------------------------------------------------
// Scenario B: one active job per owner
// ---------------------------------------------------------------------------

#[tokio::test]
async fn same_owner_jobs_never_run_concurrently() {
    let runner = FakeRunner::new(Behavior::Succeed {
        delay: Duration::from_millis(100),
    });
    // Two slots and two workers: only the owner rule can serialize them.
    let h = start(fast_config(2, 1, Some(2)), Arc::clone(&runner) as _);

    let first = h.registry.create(new_job("alice", Tier::Cpu, 3)).await.unwrap();
    let second = h.registry.create(new_job("alice", Tier::Cpu, 3)).await.unwrap();

    wait_for_status(&h.registry, &first, JobStatus::Completed).await;
    wait_for_status(&h.registry, &second, JobStatus::Completed).await;

    assert_eq!(runner.peak_concurrency(), 1);

    h.scheduler.shutdown().await;
}

// ---------------------------------------------------------------------------
// Scenario C: tier limit serializes the GPU lane
// ---------------------------------------------------------------------------

#[tokio::test]
async fn gpu_jobs_queue_behind_the_tier_limit() {
    let runner = FakeRunner::new(Behavior::Succeed {
        delay: Duration::from_millis(100),
    });
    // Two workers race for one GPU slot.
    let h = start(fast_config(1, 1, Some(2)), Arc::clone(&runner) as _);

    let first = h.registry.create(new_job("alice", Tier::Gpu, 3)).await.unwrap();
    let second = h.registry.create(new_job("bob", Tier::Gpu, 3)).await.unwrap();

    let first_done = wait_for_status(&h.registry, &first, JobStatus::Completed).await;
    let second_done = wait_for_status(&h.registry, &second, JobStatus::Completed).await;

    assert_eq!(runner.peak_concurrency(), 1);
    // The second run started only after the first finished.
    assert!(second_done.started_at.unwrap() >= first_done.finished_at.unwrap());

    h.scheduler.shutdown().await;
}

// ---------------------------------------------------------------------------
// Capacity invariant under a submission flood
// ---------------------------------------------------------------------------

#[tokio::test]
async fn running_count_never_exceeds_the_tier_limit_under_flood() {
    let runner = FakeRunner::new(Behavior::Succeed {
        delay: Duration::from_millis(40),
    });
    let h = start(fast_config(2, 1, Some(4)), Arc::clone(&runner) as _);

    let mut tokens = Vec::new();
    for i in 0..12 {
        tokens.push(
            h.registry
                .create(new_job(&format!("owner-{i}"), Tier::Cpu, 3))
                .await
                .unwrap(),
        );
    }

    for token in &tokens {
        wait_for_status(&h.registry, token, JobStatus::Completed).await;
    }
    assert!(
        runner.peak_concurrency() <= 2,
        "tier limit breached: peak {}",
        runner.peak_concurrency()
    );

    h.scheduler.shutdown().await;
}

// ---------------------------------------------------------------------------
// Scenario D: permanent failure, no retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn nonzero_exit_without_transient_marker_fails_immediately() {
    let runner = FakeRunner::new(Behavior::Exit {
        exit_code: 1,
        log_tail: "ValueError: unknown column kind",
    });
    let h = start(fast_config(1, 1, None), runner);

    let token = h.registry.create(new_job("alice", Tier::Cpu, 3)).await.unwrap();
    let snapshot = wait_for_status(&h.registry, &token, JobStatus::Failed).await;

    assert_eq!(snapshot.retry_count, 0);
    assert_eq!(snapshot.attempt_count, 1);
    assert!(snapshot.error_summary.as_deref().unwrap().contains("exit"));

    h.scheduler.shutdown().await;
}

// ---------------------------------------------------------------------------
// Retry bound: transient failures exhaust the budget
// ---------------------------------------------------------------------------

#[tokio::test]
async fn always_transient_job_fails_after_max_retries_plus_one_attempts() {
    let runner = FakeRunner::new(Behavior::LaunchFailure);
    let h = start(fast_config(1, 1, None), runner);

    let token = h.registry.create(new_job("alice", Tier::Cpu, 2)).await.unwrap();
    let snapshot = wait_for_status(&h.registry, &token, JobStatus::Failed).await;

    assert_eq!(snapshot.attempt_count, 3, "max_retries + 1 attempts");
    assert_eq!(snapshot.retry_count, 2);

    h.scheduler.shutdown().await;
}

// ---------------------------------------------------------------------------
// Scenario F: cancellation is not a failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn canceling_a_running_job_terminates_without_failure_notification() {
    let runner = FakeRunner::new(Behavior::HangUntilCancel);
    let h = start(fast_config(1, 1, None), Arc::clone(&runner) as _);
    let mut events = h.bus.subscribe();

    let token = h.registry.create(new_job("alice", Tier::Cpu, 3)).await.unwrap();
    wait_for_status(&h.registry, &token, JobStatus::Running).await;

    h.registry.request_cancel(&token).await.unwrap();
    let snapshot = wait_for_status(&h.registry, &token, JobStatus::Canceled).await;
    assert!(snapshot.error_summary.is_none());

    // Capacity was released: a fresh job reaches Running on the same slot.
    let second = h.registry.create(new_job("bob", Tier::Cpu, 3)).await.unwrap();
    wait_for_status(&h.registry, &second, JobStatus::Running).await;
    h.registry.request_cancel(&second).await.unwrap();
    wait_for_status(&h.registry, &second, JobStatus::Canceled).await;

    // Let the notifier settle, then drain the bus: cancel notifications
    // are fine, a failure is not.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut saw_canceled = false;
    while let Ok(event) = events.try_recv() {
        assert_ne!(event.event_type, EVENT_JOB_FAILED);
        if event.event_type == EVENT_JOB_CANCELED && event.token == token {
            saw_canceled = true;
        }
    }
    assert!(saw_canceled, "terminal cancel notification expected");

    h.scheduler.shutdown().await;
}

// ---------------------------------------------------------------------------
// Scenario E: wall-clock timeout with the real subprocess runner
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hung_subprocess_times_out_and_releases_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let script_path = dir.path().join("pipeline.sh");
    // The "hang" dataset sleeps past the timeout; everything else
    // succeeds instantly.
    std::fs::write(
        &script_path,
        "if [ \"$2\" = \"hang\" ]; then sleep 30; fi\nexit 0\n",
    )
    .unwrap();

    let data_root = dir.path().join("data");
    let out = data_root.join("synthetic/ok/SingleTable/single_table/patients.csv");
    std::fs::create_dir_all(out.parent().unwrap()).unwrap();
    std::fs::write(out, "a\n1\n").unwrap();

    let runner = Arc::new(SubprocessRunner::new(RunnerConfig {
        python_bin: "/bin/sh".into(),
        script_path,
        working_dir: dir.path().to_path_buf(),
        data_root,
        pythonpath: None,
        timeout: Duration::from_millis(400),
        kill_grace: Duration::from_millis(300),
        gpu_devices: "0".to_string(),
    }));
    let h = start(fast_config(1, 1, None), runner);

    let hung = h
        .registry
        .create(NewJob {
            owner_id: "alice".to_string(),
            tier: Tier::Cpu,
            priority: 0,
            parameters: serde_json::json!({"dataset": "hang", "table": "patients"}),
            max_retries: 3,
        })
        .await
        .unwrap();

    let snapshot = wait_for_status(&h.registry, &hung, JobStatus::Failed).await;
    assert!(
        snapshot.error_summary.as_deref().unwrap().contains("timed out"),
        "summary: {:?}",
        snapshot.error_summary
    );
    assert_eq!(snapshot.retry_count, 0, "timeouts are not retried");

    // The slot is free again: a healthy job completes.
    let ok = h
        .registry
        .create(NewJob {
            owner_id: "bob".to_string(),
            tier: Tier::Cpu,
            priority: 0,
            parameters: serde_json::json!({"dataset": "ok", "table": "patients"}),
            max_retries: 3,
        })
        .await
        .unwrap();
    wait_for_status(&h.registry, &ok, JobStatus::Completed).await;

    h.scheduler.shutdown().await;
}

// ---------------------------------------------------------------------------
// Priority ordering within a lane
// ---------------------------------------------------------------------------

#[tokio::test]
async fn urgent_jobs_jump_the_queue() {
    let runner = FakeRunner::new(Behavior::Succeed {
        delay: Duration::from_millis(150),
    });
    // One worker, one slot: strictly sequential.
    let h = start(fast_config(1, 1, None), runner);

    // Park a job in the single slot so the next two queue up behind it.
    let blocker = h.registry.create(new_job("blocker", Tier::Cpu, 3)).await.unwrap();
    wait_for_status(&h.registry, &blocker, JobStatus::Running).await;

    let normal = h.registry.create(new_job("norm", Tier::Cpu, 3)).await.unwrap();
    let urgent = h
        .registry
        .create(NewJob {
            owner_id: "vip".to_string(),
            tier: Tier::Cpu,
            priority: 10,
            parameters: serde_json::json!({"dataset": "AIDS", "table": "patients"}),
            max_retries: 3,
        })
        .await
        .unwrap();

    let urgent_done = wait_for_status(&h.registry, &urgent, JobStatus::Completed).await;
    let normal_done = wait_for_status(&h.registry, &normal, JobStatus::Completed).await;

    assert!(urgent_done.started_at.unwrap() <= normal_done.started_at.unwrap());

    h.scheduler.shutdown().await;
}
