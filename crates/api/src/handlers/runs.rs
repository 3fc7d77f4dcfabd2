//! Handlers for the `/runs` resource: submission, status polling,
//! cancellation, and run history.
//!
//! Submission always enqueues and returns 202; there is no synchronous
//! execution path. Execution errors never surface here — they reach
//! clients only through the job's terminal state on the status endpoint.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use validator::Validate;

use tabsyn_core::job::{validate_identifier, JobSnapshot, JobStatus, NewJob, Stage};
use tabsyn_core::registry::CancelOutcome;
use tabsyn_core::types::Timestamp;
use tabsyn_pipeline::RunParams;

use crate::error::{AppError, AppResult};
use crate::extract::OwnerId;
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// DTOs
// ---------------------------------------------------------------------------

/// Request body for `POST /api/v1/runs`.
///
/// The tier is deliberately absent: it comes from the owner's
/// entitlement, never from the caller.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRun {
    #[validate(length(min = 1, max = 64))]
    pub dataset: String,
    #[validate(length(min = 1, max = 64))]
    pub table: String,
    #[serde(default)]
    #[validate(length(min = 1, max = 64))]
    pub run_name: Option<String>,
    #[serde(default)]
    #[validate(range(min = 1, max = 500))]
    pub epochs_vae: Option<u32>,
    #[serde(default)]
    #[validate(range(min = 1, max = 500))]
    pub epochs_gnn: Option<u32>,
    #[serde(default)]
    #[validate(range(min = 1, max = 500))]
    pub epochs_diff: Option<u32>,
    #[serde(default)]
    #[validate(range(min = 1, max = 1_000_000))]
    pub num_samples: Option<u32>,
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Response for a successful submission.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub token: String,
    pub status: JobStatus,
}

/// Point-in-time status payload for pollers.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub stage: Stage,
    pub progress_percentage: u8,
    pub message: String,
    /// Tail of the job log, oldest line first.
    pub log: Vec<String>,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusResponse {
    fn from_snapshot(snapshot: JobSnapshot, log_tail: usize) -> Self {
        let log_start = snapshot.logs.len().saturating_sub(log_tail);
        Self {
            stage: snapshot.stage,
            progress_percentage: snapshot.progress_percent,
            message: snapshot.message,
            log: snapshot.logs[log_start..].to_vec(),
            status: snapshot.status,
            result_token: snapshot.result_ref,
            error: snapshot.error_summary,
        }
    }
}

/// One entry in the run history listing.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub token: String,
    pub status: JobStatus,
    pub stage: Stage,
    pub progress_percentage: u8,
    pub queued_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_token: Option<String>,
}

impl From<JobSnapshot> for RunSummary {
    fn from(snapshot: JobSnapshot) -> Self {
        Self {
            token: snapshot.token,
            status: snapshot.status,
            stage: snapshot.stage,
            progress_percentage: snapshot.progress_percent,
            queued_at: snapshot.queued_at,
            finished_at: snapshot.finished_at,
            result_token: snapshot.result_ref,
        }
    }
}

/// Response for a cancellation request.
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub token: String,
    /// `"canceled"` when the job was still queued, `"canceling"` when
    /// the running worker was signaled.
    pub status: &'static str,
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /api/v1/runs
///
/// Validate, resolve the owner's entitlement, enforce single-active and
/// the optional backlog pre-check, create the Queued record, and return
/// 202 with the polling token.
pub async fn submit_run(
    OwnerId(owner_id): OwnerId,
    State(state): State<AppState>,
    Json(input): Json<SubmitRun>,
) -> AppResult<impl IntoResponse> {
    input.validate()?;
    validate_identifier("Dataset", &input.dataset)?;
    validate_identifier("Table", &input.table)?;
    if let Some(run_name) = &input.run_name {
        validate_identifier("Run name", run_name)?;
    }

    let entitlement = state.entitlements.entitlement_for(&owner_id);

    if state.config.single_active && state.registry.active_count(&owner_id).await? > 0 {
        return Err(AppError::OwnerBusy);
    }

    if let Some(depth) = state.config.max_queue_depth {
        let counts = state.registry.tier_counts(entitlement.tier).await?;
        if counts.queued >= depth {
            return Err(AppError::TierAtCapacity);
        }
    }

    let parameters = run_parameters(&input)?;
    let token = state
        .registry
        .create(NewJob {
            owner_id: owner_id.clone(),
            tier: entitlement.tier,
            priority: entitlement.priority,
            parameters,
            max_retries: entitlement.max_retries,
        })
        .await?;

    tracing::info!(
        token = %token,
        owner_id = %owner_id,
        tier = %entitlement.tier,
        dataset = %input.dataset,
        "Run submitted",
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            token,
            status: JobStatus::Queued,
        }),
    ))
}

/// Normalize the submission into the adapter's parameter contract,
/// letting [`RunParams`] fill the defaults.
fn run_parameters(input: &SubmitRun) -> AppResult<serde_json::Value> {
    let mut map = serde_json::Map::new();
    map.insert("dataset".into(), input.dataset.clone().into());
    map.insert("table".into(), input.table.clone().into());
    if let Some(run_name) = &input.run_name {
        map.insert("run_name".into(), run_name.clone().into());
    }
    if let Some(epochs_vae) = input.epochs_vae {
        map.insert("epochs_vae".into(), epochs_vae.into());
    }
    if let Some(epochs_gnn) = input.epochs_gnn {
        map.insert("epochs_gnn".into(), epochs_gnn.into());
    }
    if let Some(epochs_diff) = input.epochs_diff {
        map.insert("epochs_diff".into(), epochs_diff.into());
    }
    if let Some(num_samples) = input.num_samples {
        map.insert("num_samples".into(), num_samples.into());
    }
    if let Some(seed) = input.seed {
        map.insert("seed".into(), seed.into());
    }

    let params: RunParams = serde_json::from_value(serde_json::Value::Object(map))
        .map_err(|e| AppError::BadRequest(format!("Invalid run parameters: {e}")))?;
    serde_json::to_value(&params)
        .map_err(|e| AppError::BadRequest(format!("Invalid run parameters: {e}")))
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// GET /api/v1/runs/{token}/status
///
/// Read-only snapshot for pollers. The token is the capability: anyone
/// holding it may poll, and any number of concurrent pollers is fine.
pub async fn run_status(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> AppResult<impl IntoResponse> {
    let snapshot = state.registry.get(&token).await?;
    Ok(Json(StatusResponse::from_snapshot(
        snapshot,
        state.config.log_tail,
    )))
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// GET /api/v1/runs
///
/// The owner's recent runs, newest first.
pub async fn list_runs(
    OwnerId(owner_id): OwnerId,
    State(state): State<AppState>,
) -> AppResult<impl IntoResponse> {
    let runs = state
        .registry
        .list_for_owner(&owner_id, state.config.history_limit)
        .await?;
    let summaries: Vec<RunSummary> = runs.into_iter().map(RunSummary::from).collect();
    Ok(Json(DataResponse { data: summaries }))
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

/// POST /api/v1/runs/{token}/cancel
///
/// Cancel a queued or running run. Only the owner may cancel. Returns
/// 202 (the cancel is accepted, completion is asynchronous for running
/// jobs), or 409 when the run already finished.
pub async fn cancel_run(
    OwnerId(owner_id): OwnerId,
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> AppResult<impl IntoResponse> {
    let snapshot = state.registry.get(&token).await?;
    if snapshot.owner_id != owner_id {
        return Err(AppError::Forbidden(
            "Cannot cancel another owner's run".to_string(),
        ));
    }

    let outcome = state.registry.request_cancel(&token).await?;
    let status = match outcome {
        CancelOutcome::Canceled => "canceled",
        CancelOutcome::Flagged => "canceling",
        CancelOutcome::AlreadyTerminal => {
            return Err(AppError::Core(tabsyn_core::error::CoreError::Conflict(
                "Run is already in a terminal state".to_string(),
            )));
        }
    };

    tracing::info!(token = %token, owner_id = %owner_id, outcome = status, "Run cancellation requested");

    Ok((StatusCode::ACCEPTED, Json(CancelResponse { token, status })))
}
