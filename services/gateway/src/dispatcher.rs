use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use protocol::{ClientEnvelope, Identity, ServerEnvelope, Topic, error_codes};
use tokio::sync::{RwLock, oneshot};
use tracing::{Instrument, instrument};

use crate::broadcaster::try_enqueue;
use crate::error::GatewayError;
use crate::handlers::ConnectContext;
use crate::registry::ConnectionId;
use crate::state::{AppState, ConnectionHandle};

enum CancelReason {
    Superseded,
    ConnectionClosed,
}

struct PendingEntry {
    #[allow(dead_code)]
    deadline: Instant,
    cancel: oneshot::Sender<CancelReason>,
}

/// Dispatcher-owned map `(connectionId, requestId) -> resolver`, per the
/// "promise/deferred tables" redesign note. Handler work for REQUEST runs
/// on a spawned task rather than the connection's reader task; this map is
/// the only thing that may complete or cancel an entry, and it is never
/// mutated from outside a single-owner task without going through `&self`.
pub struct Dispatcher {
    request_timeout: Duration,
    pending: RwLock<HashMap<(ConnectionId, String), PendingEntry>>,
}

impl Dispatcher {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            pending: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a new pending request. If one was already pending with
    /// the same `(connectionId, requestId)`, it is cancelled and its own
    /// task will resolve it with ERROR 4005, per §4.F's collision rule.
    async fn begin_request(
        &self,
        connection_id: ConnectionId,
        request_id: String,
    ) -> oneshot::Receiver<CancelReason> {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + self.request_timeout;
        let mut pending = self.pending.write().await;
        if let Some(old) = pending.insert((connection_id, request_id), PendingEntry { deadline, cancel: tx }) {
            let _ = old.cancel.send(CancelReason::Superseded);
        }
        rx
    }

    async fn finish_request(&self, connection_id: ConnectionId, request_id: &str) {
        self.pending
            .write()
            .await
            .remove(&(connection_id, request_id.to_owned()));
    }

    /// Cancels every pending request owned by `connection_id` -- called on
    /// connection close, per §4.D.
    pub async fn cancel_owned_by(&self, connection_id: ConnectionId) {
        let mut pending = self.pending.write().await;
        let keys: Vec<_> = pending
            .keys()
            .filter(|(c, _)| *c == connection_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(entry) = pending.remove(&key) {
                let _ = entry.cancel.send(CancelReason::ConnectionClosed);
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

/// Routes one decoded, rate-checked inbound envelope, per §4.F.
#[instrument(skip(state, handle, identity, envelope), fields(connection_id = %ctx.connection_id))]
pub async fn dispatch(
    state: &AppState,
    ctx: &ConnectContext,
    handle: &ConnectionHandle,
    identity: &Arc<RwLock<Identity>>,
    envelope: ClientEnvelope,
) {
    match envelope {
        ClientEnvelope::Subscribe { topics, auth_token } => {
            dispatch_subscribe(state, ctx, handle, identity, topics, auth_token).await;
        }
        ClientEnvelope::Unsubscribe { topics } => {
            dispatch_unsubscribe(state, ctx, handle, identity, topics).await;
        }
        ClientEnvelope::Request {
            topic,
            action,
            request_id,
            data,
        } => {
            dispatch_request(state, ctx, handle, identity, topic, action, request_id, data).await;
        }
        ClientEnvelope::Command {
            topic,
            action,
            request_id,
            data,
        } => {
            dispatch_command(state, ctx, handle, identity, topic, action, request_id, data).await;
        }
    }
}

async fn dispatch_subscribe(
    state: &AppState,
    ctx: &ConnectContext,
    handle: &ConnectionHandle,
    identity_lock: &Arc<RwLock<Identity>>,
    topics: Vec<String>,
    auth_token: Option<String>,
) {
    if let Some(token) = auth_token {
        match state.auth.verify_in_message(&state.pool, &token).await {
            Ok(upgraded) => *identity_lock.write().await = upgraded,
            Err(crate::auth::TokenError::Expired) => {
                try_enqueue(
                    handle,
                    ServerEnvelope::error(error_codes::TOKEN_EXPIRED, "token expired", None, None),
                );
            }
            Err(crate::auth::TokenError::Invalid) => {
                try_enqueue(
                    handle,
                    ServerEnvelope::error(error_codes::INVALID_TOKEN, "invalid authentication token", None, None),
                );
            }
        }
    }

    let identity = identity_lock.read().await.clone();
    let (succeeded, failed) = state.registry.subscribe(ctx.connection_id, &identity, &topics);

    for failure in &failed {
        state.metrics.error(failure.error.wire_code());
        try_enqueue(
            handle,
            ServerEnvelope::error(
                failure.error.wire_code(),
                failure.error.to_string(),
                None,
                Some(failure.topic.clone()),
            ),
        );
    }

    if !succeeded.is_empty() {
        let topic_strs: Vec<String> = succeeded.iter().map(|t| t.as_wire_str().to_owned()).collect();
        try_enqueue(
            handle,
            ServerEnvelope::ack("subscribe", Some(topic_strs), None),
        );

        for topic in &succeeded {
            state.metrics.subscribe(topic.as_wire_str());
            spawn_audit(state, ctx.connection_id, &identity, *topic, "subscribe");
            if let Some(h) = state.handlers.get(*topic) {
                if let Some(initial) = h.on_subscribe(ctx, &identity).await {
                    try_enqueue(
                        handle,
                        ServerEnvelope::data(topic.as_wire_str(), Some("initial".to_owned()), None, initial),
                    );
                }
            }
            replay_offline_messages(state, handle, &identity, *topic).await;
        }
    }
}

/// Fires the best-effort subscribe/unsubscribe audit row on a detached
/// task -- never awaited inline, per `repo::audit::record`'s own contract.
fn spawn_audit(state: &AppState, connection_id: ConnectionId, identity: &Identity, topic: Topic, action: &'static str) {
    let pool = state.pool.clone();
    let principal_id = identity.principal_id.clone();
    let topic_str = topic.as_wire_str();
    tokio::spawn(async move {
        crate::repo::audit::record(&pool, connection_id, principal_id.as_deref(), topic_str, action).await;
    });
}

async fn replay_offline_messages(
    state: &AppState,
    handle: &ConnectionHandle,
    identity: &Identity,
    topic: Topic,
) {
    let Some(principal_id) = &identity.principal_id else {
        return;
    };
    let messages = crate::repo::offline_queue::fetch_undelivered(
        &state.pool,
        principal_id,
        topic.as_wire_str(),
    )
    .await
    .unwrap_or_default();

    for message in messages {
        if let Ok(envelope) = serde_json::from_value::<ServerEnvelope>(message.envelope_json.clone()) {
            try_enqueue(handle, envelope);
        }
        let _ = crate::repo::offline_queue::mark_delivered(&state.pool, message.id).await;
    }
}

async fn dispatch_unsubscribe(
    state: &AppState,
    ctx: &ConnectContext,
    handle: &ConnectionHandle,
    identity_lock: &Arc<RwLock<Identity>>,
    topics: Vec<String>,
) {
    let identity = identity_lock.read().await.clone();
    let removed = state.registry.unsubscribe(ctx.connection_id, &topics);
    for topic in &removed {
        state.metrics.unsubscribe(topic.as_wire_str());
        spawn_audit(state, ctx.connection_id, &identity, *topic, "unsubscribe");
        if let Some(h) = state.handlers.get(*topic) {
            h.on_unsubscribe(ctx, &identity).await;
        }
    }
    try_enqueue(handle, ServerEnvelope::ack("unsubscribe", Some(topics), None));
}

fn auth_error_for(identity: &Identity, topic: &str) -> GatewayError {
    if identity.is_anonymous() {
        GatewayError::AuthRequired {
            topic: topic.to_owned(),
        }
    } else {
        GatewayError::RoleRequired {
            topic: topic.to_owned(),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_request(
    state: &AppState,
    ctx: &ConnectContext,
    handle: &ConnectionHandle,
    identity_lock: &Arc<RwLock<Identity>>,
    topic_str: String,
    action: String,
    request_id: String,
    data: serde_json::Value,
) {
    let identity = identity_lock.read().await.clone();

    let Some(topic) = Topic::parse(&topic_str) else {
        let err = GatewayError::NotFound(topic_str.clone());
        state.metrics.error(err.wire_code());
        try_enqueue(
            handle,
            ServerEnvelope::error(err.wire_code(), err.to_string(), Some(request_id), Some(topic_str)),
        );
        return;
    };

    if !identity.role.satisfies(topic.auth_requirement()) {
        let err = auth_error_for(&identity, &topic_str);
        state.metrics.error(err.wire_code());
        try_enqueue(
            handle,
            ServerEnvelope::error(err.wire_code(), err.to_string(), Some(request_id), Some(topic_str)),
        );
        return;
    }

    let Some(handler) = state.handlers.get(topic) else {
        let err = GatewayError::NotFound(topic_str.clone());
        try_enqueue(
            handle,
            ServerEnvelope::error(err.wire_code(), err.to_string(), Some(request_id), Some(topic_str)),
        );
        return;
    };

    let cancel_rx = state
        .dispatcher
        .begin_request(ctx.connection_id, request_id.clone())
        .await;

    let outbound = handle.outbound.clone();
    let metrics = state.metrics.clone();
    let dispatcher = state.dispatcher.clone();
    let request_timeout = state.dispatcher.request_timeout();
    let connection_id = ctx.connection_id;
    let topic_wire = topic.as_wire_str().to_owned();

    tokio::spawn(
        async move {
            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                reason = cancel_rx => {
                    if let Ok(CancelReason::Superseded) = reason {
                        let _ = outbound.try_send(ServerEnvelope::error(
                            error_codes::REQUEST_SUPERSEDED,
                            "request superseded by a new requestId",
                            Some(request_id.clone()),
                            Some(topic_wire.clone()),
                        ));
                    }
                    // Whoever cancelled us already owns (or has already
                    // removed) the `pending` entry for this key: on
                    // Superseded it's the successor's `begin_request` that
                    // did the `insert`, and on ConnectionClosed
                    // `cancel_owned_by` already removed it before sending.
                    // Calling `finish_request` here would delete whatever
                    // now lives under this key instead of our own.
                    return;
                }
                result = tokio::time::timeout(request_timeout, handler.request(&identity, &action, data)) => result,
            };

            match outcome {
                Ok(Ok(reply)) => {
                    let _ = outbound.try_send(ServerEnvelope::data(
                        topic_wire.clone(),
                        Some(action.clone()),
                        Some(request_id.clone()),
                        reply,
                    ));
                }
                Ok(Err(err)) => {
                    metrics.error(err.wire_code());
                    let _ = outbound.try_send(ServerEnvelope::error(
                        err.wire_code(),
                        err.to_string(),
                        Some(request_id.clone()),
                        Some(topic_wire.clone()),
                    ));
                }
                Err(_elapsed) => {
                    metrics.error(error_codes::REQUEST_TIMEOUT);
                    let _ = outbound.try_send(ServerEnvelope::error(
                        error_codes::REQUEST_TIMEOUT,
                        "request timed out",
                        Some(request_id.clone()),
                        Some(topic_wire.clone()),
                    ));
                }
            }

            metrics.request_latency(started.elapsed());
            dispatcher.finish_request(connection_id, &request_id).await;
        }
        .in_current_span(),
    );
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_command(
    state: &AppState,
    _ctx: &ConnectContext,
    handle: &ConnectionHandle,
    identity_lock: &Arc<RwLock<Identity>>,
    topic_str: String,
    action: String,
    request_id: Option<String>,
    data: serde_json::Value,
) {
    let identity = identity_lock.read().await.clone();

    let Some(topic) = Topic::parse(&topic_str) else {
        let err = GatewayError::NotFound(topic_str.clone());
        try_enqueue(
            handle,
            ServerEnvelope::error(err.wire_code(), err.to_string(), request_id, Some(topic_str)),
        );
        return;
    };

    // COMMAND enforces auth even on topics that otherwise allow optional auth.
    let satisfies = match topic.auth_requirement() {
        protocol::AuthRequirement::Optional => !identity.is_anonymous(),
        other => identity.role.satisfies(other),
    };
    if !satisfies {
        let err = auth_error_for(&identity, &topic_str);
        state.metrics.error(err.wire_code());
        try_enqueue(
            handle,
            ServerEnvelope::error(err.wire_code(), err.to_string(), request_id, Some(topic_str)),
        );
        return;
    }

    let Some(handler) = state.handlers.get(topic) else {
        let err = GatewayError::NotFound(topic_str.clone());
        try_enqueue(
            handle,
            ServerEnvelope::error(err.wire_code(), err.to_string(), request_id, Some(topic_str)),
        );
        return;
    };

    match handler.command(&identity, &action, data).await {
        Ok(()) => {
            try_enqueue(handle, ServerEnvelope::ack("command", None, request_id));
        }
        Err(err) => {
            state.metrics.error(err.wire_code());
            try_enqueue(
                handle,
                ServerEnvelope::error(err.wire_code(), err.to_string(), request_id, Some(topic.as_wire_str().to_owned())),
            );
        }
    }
}
