//! Request extractors.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::AppError;

/// Header carrying the caller's identity, set by the fronting
/// authentication layer.
pub const OWNER_ID_HEADER: &str = "x-owner-id";

/// The authenticated owner of the request.
///
/// Authentication itself happens upstream; by the time a request reaches
/// this service the proxy has resolved the session and injected the
/// owner id header. A missing or empty header is rejected with 401.
#[derive(Debug, Clone)]
pub struct OwnerId(pub String);

impl<S> FromRequestParts<S> for OwnerId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(OWNER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| OwnerId(value.to_string()))
            .ok_or_else(|| AppError::Unauthorized(format!("{OWNER_ID_HEADER} header required")))
    }
}
