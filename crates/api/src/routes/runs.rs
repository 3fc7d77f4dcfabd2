use axum::routing::{get, post};
use axum::Router;

use crate::handlers::runs;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/runs", post(runs::submit_run).get(runs::list_runs))
        .route("/runs/{token}/status", get(runs::run_status))
        .route("/runs/{token}/cancel", post(runs::cancel_run))
}
