use axum::{extract::State, response::IntoResponse, Json};

use crate::state::AppState;

/// `GET /api/v1/metrics` -- a JSON snapshot of the process-wide counters
/// and histograms, per §4.J. No external metrics sink; this is the sink.
pub async fn get_metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}
