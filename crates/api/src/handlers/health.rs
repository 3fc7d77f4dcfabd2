//! Health check handler.

use axum::Json;

/// GET /health
///
/// Liveness probe. Database reachability is verified at startup; this
/// endpoint only reports that the HTTP layer is serving.
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
