use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use tabsyn_core::error::CoreError;
use tabsyn_core::registry::RegistryError;

/// Application-level error type for HTTP handlers.
///
/// Wraps domain and registry errors and adds the submission rejection
/// reasons. Implements [`IntoResponse`] to produce consistent JSON error
/// responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `tabsyn-core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A registry error (not found, CAS conflict, storage).
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The owner already has a queued or running job.
    #[error("Owner already has an active job")]
    OwnerBusy,

    /// The tier's backlog is full (optimistic pre-check).
    #[error("Tier is at capacity, try again later")]
    TierAtCapacity,

    /// The caller is not allowed to touch this job.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Identity header missing or empty.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::BadRequest(errors.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // --- CoreError variants ---
            AppError::Core(core) => match core {
                CoreError::NotFound { entity, id } => (
                    StatusCode::NOT_FOUND,
                    "NOT_FOUND",
                    format!("{entity} {id} not found"),
                ),
                CoreError::Validation(msg) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
                }
                CoreError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
                CoreError::Internal(msg) => {
                    tracing::error!(error = %msg, "Internal core error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "An internal error occurred".to_string(),
                    )
                }
            },

            // --- Registry errors ---
            AppError::Registry(registry) => match registry {
                RegistryError::NotFound(token) => (
                    StatusCode::NOT_FOUND,
                    "NOT_FOUND",
                    format!("Run {token} not found"),
                ),
                RegistryError::Conflict { .. } | RegistryError::InvalidTransition { .. } => (
                    StatusCode::CONFLICT,
                    "CONFLICT",
                    registry.to_string(),
                ),
                RegistryError::Storage(msg) => {
                    tracing::error!(error = %msg, "Registry storage error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "An internal error occurred".to_string(),
                    )
                }
            },

            // --- Submission rejections ---
            AppError::OwnerBusy => (
                StatusCode::CONFLICT,
                "OWNER_BUSY",
                "A job for this owner is already queued or running".to_string(),
            ),
            AppError::TierAtCapacity => (
                StatusCode::TOO_MANY_REQUESTS,
                "TIER_AT_CAPACITY",
                "The tier's queue is full, try again later".to_string(),
            ),

            // --- HTTP-specific errors ---
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone()),
            AppError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone())
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}
