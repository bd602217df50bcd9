pub mod auth;
pub mod broadcaster;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod http;
pub mod metrics;
pub mod rate_limit;
pub mod registry;
pub mod repo;
pub mod state;
pub mod ws;

pub use state::AppState;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

/// Wires every route the gateway answers: the single `/api/ws` upgrade
/// endpoint (§6), health probes, the metrics snapshot, and the admin
/// surface over the offline queue and session revocation (§4.I/§4.B).
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/ws", get(ws::ws_handler))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/api/v1/metrics", get(http::metrics::get_metrics))
        .route(
            "/api/v1/admin/offline-queue",
            get(http::admin::list_offline_queue),
        )
        .route(
            "/api/v1/admin/offline-queue/sweep",
            post(http::admin::sweep_offline_queue),
        )
        .route(
            "/api/v1/admin/sessions/:session_id/revoke",
            post(http::admin::revoke_session),
        )
        .fallback(fallback_404)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback_404() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "code": "NOT_FOUND", "message": "no such route" })),
    )
}

mod health {
    use axum::response::IntoResponse;

    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }

    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
