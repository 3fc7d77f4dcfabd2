//! Per-tier worker loop.
//!
//! A worker wakes on its poll tick, drains the lane queue, and processes
//! one job at a time to completion: admission, CAS claim, adapter run,
//! terminal transition, notification, capacity release. The claim CAS is
//! the worker's lease — a second worker racing for the same token loses
//! the CAS and simply moves on.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tabsyn_core::capacity::{AdmitPermit, Admission, CapacityController};
use tabsyn_core::job::{JobSnapshot, JobStatus, Tier};
use tabsyn_core::registry::{JobRegistry, RegistryError, TransitionFields};
use tabsyn_events::bus::{EventBus, JobEvent, EVENT_JOB_PROGRESS};
use tabsyn_events::CompletionNotifier;
use tabsyn_pipeline::runner::{PipelineRunner, ProgressEvent, RunRequest};
use tabsyn_pipeline::{ExecutionError, RunParams};

use crate::config::WorkerConfig;
use crate::failure::{sanitize_error, FailureManager};

/// Buffer size for the adapter progress channel.
const PROGRESS_BUFFER: usize = 256;

/// Attempts for registry writes that must not be dropped (terminal
/// transitions), with a short pause between them.
const WRITE_RETRIES: usize = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Shared dependencies for one lane's workers.
#[derive(Clone)]
pub struct LaneContext {
    pub tier: Tier,
    pub registry: Arc<dyn JobRegistry>,
    pub capacity: CapacityController,
    pub runner: Arc<dyn PipelineRunner>,
    pub bus: Arc<EventBus>,
    pub notifier: Arc<CompletionNotifier>,
    pub failures: Arc<FailureManager>,
    pub config: Arc<WorkerConfig>,
}

/// Long-lived worker loop. Runs until the shutdown token fires.
pub async fn worker_loop(ctx: LaneContext, worker_idx: usize, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(ctx.config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tracing::info!(tier = %ctx.tier, worker_idx, "Worker started");

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // Drain the queue before going back to sleep.
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match process_next(&ctx, &shutdown).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    // Registry trouble: give the store a tick to recover.
                    tracing::error!(tier = %ctx.tier, worker_idx, error = %e, "Dequeue cycle failed");
                    break;
                }
            }
        }
    }

    tracing::info!(tier = %ctx.tier, worker_idx, "Worker stopped");
}

/// Process at most one queued job. Returns `Ok(true)` when a job was
/// handled (claimed by us or lost to a racing worker) and the queue
/// should be polled again immediately.
async fn process_next(
    ctx: &LaneContext,
    shutdown: &CancellationToken,
) -> Result<bool, RegistryError> {
    let Some(job) = ctx.registry.next_queued(ctx.tier).await? else {
        return Ok(false);
    };

    // Admission blocks while the tier is at capacity; a release or
    // shutdown wakes it.
    let permit = tokio::select! {
        () = shutdown.cancelled() => return Ok(false),
        admission = ctx.capacity.admit(ctx.tier, &job.owner_id) => match admission {
            Admission::Admitted(permit) => permit,
            Admission::OwnerBusy => {
                // The owner's previous job is still active (a retry race);
                // leave the token queued for a later tick.
                tracing::debug!(token = %job.token, owner_id = %job.owner_id, "Owner busy, deferring job");
                return Ok(false);
            }
            // `admit` waits out AtCapacity; treat a spurious one as an
            // empty wake-up.
            Admission::AtCapacity => return Ok(false),
        }
    };

    // Claim. Losing the CAS means another worker took it or a cancel
    // landed first; either way this slot is free again.
    match ctx
        .registry
        .transition(
            &job.token,
            JobStatus::Queued,
            JobStatus::Running,
            TransitionFields::default(),
        )
        .await
    {
        Ok(()) => {}
        Err(RegistryError::Conflict { .. }) => {
            drop(permit);
            return Ok(true);
        }
        Err(e) => {
            drop(permit);
            return Err(e);
        }
    }

    execute_claimed(ctx, &job, permit).await;
    Ok(true)
}

/// Drive one claimed job to a terminal state. The permit is released on
/// every exit path by drop.
async fn execute_claimed(ctx: &LaneContext, job: &JobSnapshot, permit: AdmitPermit) {
    let token = job.token.clone();

    tracing::info!(
        token = %token,
        tier = %ctx.tier,
        owner_id = %job.owner_id,
        attempt = job.attempt_count + 1,
        "Job claimed",
    );

    let params: RunParams = match serde_json::from_value(job.parameters.clone()) {
        Ok(params) => params,
        Err(e) => {
            // Unparseable parameters can never succeed; fail terminally.
            let summary = sanitize_error(&format!("Invalid run parameters: {e}"));
            terminal_transition(
                ctx,
                &token,
                JobStatus::Failed,
                TransitionFields {
                    error_summary: Some(summary),
                    ..Default::default()
                },
            )
            .await;
            notify_terminal(ctx, &token).await;
            drop(permit);
            return;
        }
    };

    // Cooperative cancellation: a watcher polls the registry flag and
    // trips the token the adapter's output loop selects on.
    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(cancel_watcher(
        Arc::clone(&ctx.registry),
        token.clone(),
        cancel.clone(),
        ctx.config.cancel_poll_interval,
    ));

    // Progress consumer: adapter events become registry writes and bus
    // events.
    let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_BUFFER);
    let consumer = tokio::spawn(progress_consumer(
        Arc::clone(&ctx.registry),
        Arc::clone(&ctx.bus),
        token.clone(),
        progress_rx,
    ));

    let result = ctx
        .runner
        .run(RunRequest {
            token: token.clone(),
            params,
            tier: ctx.tier,
            cancel: cancel.clone(),
            progress: progress_tx,
        })
        .await;

    // Flush pending progress writes before the terminal CAS so a late
    // update cannot race the terminal state.
    let _ = consumer.await;
    watcher.abort();

    match result {
        Ok(outcome) => {
            terminal_transition(
                ctx,
                &token,
                JobStatus::Completed,
                TransitionFields {
                    result_ref: Some(outcome.result_ref.clone()),
                    ..Default::default()
                },
            )
            .await;
            tracing::info!(
                token = %token,
                duration_secs = outcome.duration.as_secs(),
                "Job completed",
            );
        }
        Err(ExecutionError::Canceled) => {
            terminal_transition(ctx, &token, JobStatus::Canceled, TransitionFields::default())
                .await;
            tracing::info!(token = %token, "Job canceled");
        }
        Err(error) => match ctx.registry.get(&token).await {
            // A cancel that landed while the attempt was dying wins over
            // retry: the owner asked for the job to stop.
            Ok(current) if current.cancel_requested => {
                terminal_transition(ctx, &token, JobStatus::Canceled, TransitionFields::default())
                    .await;
                tracing::info!(token = %token, "Job canceled during failing attempt");
            }
            Ok(current) => {
                if let Err(e) = ctx.failures.handle(ctx.registry.as_ref(), &current, &error).await {
                    tracing::error!(token = %token, error = %e, "Failed to record job failure");
                }
            }
            Err(e) => {
                tracing::error!(token = %token, error = %e, "Failed to load job for failure handling");
            }
        },
    }

    notify_terminal(ctx, &token).await;
    drop(permit);
}

/// Apply a terminal transition, retrying storage failures with backoff.
/// A CAS conflict is final (someone else already settled the job).
async fn terminal_transition(
    ctx: &LaneContext,
    token: &str,
    next: JobStatus,
    fields: TransitionFields,
) {
    for attempt in 1..=WRITE_RETRIES {
        match ctx
            .registry
            .transition(token, JobStatus::Running, next, fields.clone())
            .await
        {
            Ok(()) => return,
            Err(e @ RegistryError::Storage(_)) if attempt < WRITE_RETRIES => {
                tracing::warn!(token, attempt, error = %e, "Terminal write failed, retrying");
                tokio::time::sleep(WRITE_RETRY_DELAY).await;
            }
            Err(e) => {
                tracing::error!(token, error = %e, "Terminal transition not applied");
                return;
            }
        }
    }
}

/// Fire the completion notifier if the job is terminal.
async fn notify_terminal(ctx: &LaneContext, token: &str) {
    match ctx.registry.get(token).await {
        Ok(snapshot) if snapshot.status.is_terminal() => {
            ctx.notifier.notify(&snapshot).await;
        }
        Ok(_) => {} // re-enqueued for retry; nothing to announce
        Err(e) => {
            tracing::error!(token, error = %e, "Failed to load job for notification");
        }
    }
}

/// Translate adapter progress events into registry writes and bus
/// events.
async fn progress_consumer(
    registry: Arc<dyn JobRegistry>,
    bus: Arc<EventBus>,
    token: String,
    mut rx: mpsc::Receiver<ProgressEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            ProgressEvent::Line(line) => {
                if let Err(e) = registry.append_log(&token, &line).await {
                    tracing::warn!(token = %token, error = %e, "Failed to append log line");
                }
            }
            ProgressEvent::Progress { stage, percent } => {
                if let Err(e) = registry.update_progress(&token, stage, percent, None).await {
                    tracing::warn!(token = %token, error = %e, "Failed to update progress");
                }
                bus.publish(
                    JobEvent::new(EVENT_JOB_PROGRESS, token.as_str()).with_payload(
                        serde_json::json!({
                            "stage": stage,
                            "percent": percent,
                        }),
                    ),
                );
            }
        }
    }
}

/// Poll the registry's cancel flag and trip the adapter's cancellation
/// token when it is set. Exits on its own once the job leaves Running.
async fn cancel_watcher(
    registry: Arc<dyn JobRegistry>,
    token: String,
    cancel: CancellationToken,
    poll_interval: Duration,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match registry.get(&token).await {
            Ok(snapshot) if snapshot.cancel_requested => {
                cancel.cancel();
                return;
            }
            Ok(snapshot) if snapshot.status != JobStatus::Running => return,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(token = %token, error = %e, "Cancel watcher read failed");
            }
        }
    }
}
