use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use protocol::Identity;
use serde::{Deserialize, Serialize};

use crate::auth::extract_bearer;
use crate::http::response::internal_error;
use crate::state::AppState;

/// `admin`-gated routes aren't reachable through the closed topic set --
/// they're the operational surface over the offline queue and session
/// revocation the gateway needs for itself, not a handler. Guards every
/// handler the same way: decode the bearer token, require `Role::Admin`.
async fn require_admin(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Identity, axum::response::Response> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer);

    let identity = match token {
        Some(token) => state.auth.verify_in_message(&state.pool, token).await.ok(),
        None => None,
    };

    match identity {
        Some(identity) if identity.role.satisfies(protocol::AuthRequirement::Admin) => Ok(identity),
        _ => Err((StatusCode::FORBIDDEN, "admin role required").into_response()),
    }
}

#[derive(Debug, Deserialize)]
pub struct OfflineQueueQuery {
    principal_id: String,
    topic: String,
}

#[derive(Debug, Serialize)]
struct OfflineMessageView {
    id: uuid::Uuid,
    envelope: serde_json::Value,
}

/// `GET /api/v1/admin/offline-queue?principal_id=...&topic=...` -- the
/// undelivered backlog for one `(principalId, topic)` pair, per §4.I.
pub async fn list_offline_queue(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<OfflineQueueQuery>,
) -> impl IntoResponse {
    if let Err(resp) = require_admin(&state, &headers).await {
        return resp;
    }

    match crate::repo::offline_queue::fetch_undelivered(&state.pool, &query.principal_id, &query.topic)
        .await
    {
        Ok(rows) => {
            let views: Vec<OfflineMessageView> = rows
                .into_iter()
                .map(|r| OfflineMessageView {
                    id: r.id,
                    envelope: r.envelope_json,
                })
                .collect();
            Json(views).into_response()
        }
        Err(err) => internal_error(err),
    }
}

/// `POST /api/v1/admin/sessions/:session_id/revoke` -- marks the session
/// revoked and immediately downgrades every live connection holding that
/// session to anonymous, revoking any subscription it no longer satisfies,
/// per the push-propagated revocation note in §4.B.
pub async fn revoke_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    if let Err(resp) = require_admin(&state, &headers).await {
        return resp;
    }

    if let Err(err) = crate::repo::sessions::revoke(&state.pool, &session_id).await {
        return internal_error(err);
    }

    let downgraded = downgrade_connections_with_session(&state, &session_id).await;
    Json(serde_json::json!({ "revoked": true, "connections_downgraded": downgraded })).into_response()
}

async fn downgrade_connections_with_session(state: &AppState, session_id: &str) -> usize {
    let connections = state.connections.read().await;
    let mut downgraded = 0usize;

    for (conn_id, handle) in connections.iter() {
        let matches = handle.identity.read().await.session_id.as_deref() == Some(session_id);
        if !matches {
            continue;
        }

        {
            let mut identity = handle.identity.write().await;
            *identity = Identity::anonymous();
        }
        let revoked_topics = state
            .registry
            .revoke_unsatisfied(*conn_id, &Identity::anonymous());
        for topic in revoked_topics {
            state.metrics.unsubscribe(topic.as_wire_str());
        }
        crate::broadcaster::try_enqueue(
            handle,
            protocol::ServerEnvelope::error(
                protocol::error_codes::TOKEN_EXPIRED,
                "session revoked",
                None,
                None,
            ),
        );
        downgraded += 1;
    }

    downgraded
}

/// `POST /api/v1/admin/offline-queue/sweep` -- runs the expiry sweep on
/// demand, independent of the periodic background task started from
/// `main.rs`.
pub async fn sweep_offline_queue(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(resp) = require_admin(&state, &headers).await {
        return resp;
    }

    match crate::repo::offline_queue::sweep_expired(&state.pool).await {
        Ok(deleted) => Json(serde_json::json!({ "deleted": deleted })).into_response(),
        Err(err) => internal_error(err),
    }
}
