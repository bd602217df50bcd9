//! The `/api/ws` endpoint: handshake, and the per-connection reader/writer
//! task pair that implements the §4.D state machine.
//!
//! Per the "callback-style WebSocket events" redesign note, a connection is
//! two cooperative tasks rather than an event-driven callback chain: the
//! task spawned by `on_upgrade` runs the read loop directly, and it spawns
//! a second task for the write loop. The two communicate only through the
//! connection's bounded outbound channel and a `shutdown` broadcast the
//! write loop uses to tell the reader (and vice versa) to stop.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use protocol::{close_codes, error_codes, ClientEnvelope, Identity, ServerEnvelope};
use serde::Deserialize;
use tokio::sync::Notify;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::auth::extract_device_id;
use crate::broadcaster::try_enqueue;
use crate::dispatcher;
use crate::handlers::ConnectContext;
use crate::rate_limit::TokenBucket;
use crate::registry::ConnectionId;
use crate::state::{AppState, ConnectionHandle, ConnectionState};

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    token: Option<String>,
}

/// One frame too large, or an inbound message that violates the WebSocket
/// framing itself, always ends the connection with close code 1002, per
/// §4.A/§4.D. Everything else keeps the socket open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseOutcome {
    Normal,
    ProtocolError,
    SlowConsumer,
}

impl CloseOutcome {
    fn code(self) -> u16 {
        match self {
            CloseOutcome::Normal => close_codes::NORMAL,
            CloseOutcome::ProtocolError => close_codes::PROTOCOL_ERROR,
            CloseOutcome::SlowConsumer => close_codes::TRY_AGAIN_LATER,
        }
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<ConnectQuery>,
) -> impl IntoResponse {
    if !state.handshake_limiter.try_accept(addr.ip()).await {
        return (StatusCode::TOO_MANY_REQUESTS, "too many connection attempts").into_response();
    }

    let identity = state
        .auth
        .verify_at_connect(&state.pool, &headers, query.token.as_deref())
        .await;
    let device_id = extract_device_id(&headers);

    ws.on_upgrade(move |socket| handle_socket(socket, state, identity, device_id))
}

#[instrument(skip(socket, state, identity), fields(connection_id))]
async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    identity: Identity,
    device_id: Option<String>,
) {
    let connection_id: ConnectionId = Uuid::new_v4();
    tracing::Span::current().record("connection_id", tracing::field::display(connection_id));

    let (outbound_tx, outbound_rx) = tokio::sync::mpsc::channel(state.config.write_queue_capacity);
    let handle = ConnectionHandle::new(outbound_tx, identity);
    let ctx = ConnectContext {
        connection_id,
        device_id,
    };

    state.register_connection(connection_id, handle.clone()).await;
    state.metrics.connection_opened();

    handle.set_state(ConnectionState::Open);
    try_enqueue(&handle, ServerEnvelope::ack("connect", None, None));
    info!("connection established");

    let (sink, stream) = socket.split();
    let shutdown = std::sync::Arc::new(Notify::new());
    let rate_bucket = TokenBucket::new(
        state.config.rate_limit_conn_capacity,
        state.config.rate_limit_conn_refill_per_sec,
    );

    let writer = tokio::spawn(write_loop(
        sink,
        outbound_rx,
        handle.clone(),
        state.clone(),
        connection_id,
        shutdown.clone(),
    ));

    let reader_outcome = read_loop(stream, &state, &ctx, &handle, &rate_bucket, &shutdown).await;
    shutdown.notify_waiters();

    let writer_outcome = match writer.await {
        Ok(outcome) => outcome,
        Err(_) => CloseOutcome::Normal,
    };

    let close_outcome = if reader_outcome == CloseOutcome::Normal {
        writer_outcome
    } else {
        reader_outcome
    };

    handle.set_state(ConnectionState::Closed);
    state.unregister_connection(connection_id).await;
    state.metrics.connection_closed(close_outcome.code());
    info!(close_code = close_outcome.code(), "connection closed");
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    state: &AppState,
    ctx: &ConnectContext,
    handle: &ConnectionHandle,
    rate_bucket: &TokenBucket,
    shutdown: &Notify,
) -> CloseOutcome {
    loop {
        tokio::select! {
            _ = shutdown.notified() => return CloseOutcome::Normal,
            msg = stream.next() => {
                match msg {
                    None => return CloseOutcome::Normal,
                    Some(Err(err)) => {
                        warn!(error = %err, "websocket read error");
                        return CloseOutcome::ProtocolError;
                    }
                    Some(Ok(Message::Close(_))) => return CloseOutcome::Normal,
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Binary(_))) => {
                        try_enqueue(
                            handle,
                            ServerEnvelope::error(
                                error_codes::INVALID_FORMAT,
                                "binary frames are not supported",
                                None,
                                None,
                            ),
                        );
                        continue;
                    }
                    Some(Ok(Message::Text(text))) => {
                        state.metrics.message_in();

                        if text.len() > protocol::MAX_FRAME_BYTES {
                            state.metrics.error(error_codes::INVALID_FORMAT);
                            try_enqueue(
                                handle,
                                ServerEnvelope::error(
                                    error_codes::INVALID_FORMAT,
                                    "frame exceeds the 64KiB limit",
                                    None,
                                    None,
                                ),
                            );
                            return CloseOutcome::ProtocolError;
                        }

                        if !rate_bucket.try_consume() {
                            state.metrics.rate_limit_drop();
                            try_enqueue(
                                handle,
                                ServerEnvelope::error(
                                    error_codes::RATE_LIMITED,
                                    "rate limited",
                                    None,
                                    None,
                                ),
                            );
                            continue;
                        }

                        match protocol::decode_client_envelope(&text) {
                            Ok(envelope) => dispatch_one(state, ctx, handle, envelope).await,
                            Err(err) => {
                                state.metrics.error(err.wire_code());
                                try_enqueue(
                                    handle,
                                    ServerEnvelope::error(err.wire_code(), err.message(), None, None),
                                );
                            }
                        }
                    }
                }
            }
        }
    }
}

async fn dispatch_one(
    state: &AppState,
    ctx: &ConnectContext,
    handle: &ConnectionHandle,
    envelope: ClientEnvelope,
) {
    dispatcher::dispatch(state, ctx, handle, &handle.identity, envelope).await;
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: tokio::sync::mpsc::Receiver<ServerEnvelope>,
    handle: ConnectionHandle,
    state: AppState,
    connection_id: ConnectionId,
    shutdown: std::sync::Arc<Notify>,
) -> CloseOutcome {
    let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval);
    heartbeat.tick().await;
    let mut slow_check = tokio::time::interval(Duration::from_secs(1));
    let mut shutdown_rx = state.shutdown_tx.subscribe();
    let mut shutting_down = false;
    let mut shutdown_deadline: Option<tokio::time::Instant> = None;

    let outcome = loop {
        let expires_at = handle.identity.read().await.expires_at;

        tokio::select! {
            biased;

            _ = shutdown.notified() => break CloseOutcome::Normal,

            maybe_env = rx.recv() => {
                match maybe_env {
                    Some(envelope) => {
                        if sink.send(Message::Text(envelope.to_json().into())).await.is_err() {
                            break CloseOutcome::ProtocolError;
                        }
                        state.metrics.message_out();
                        // The queue has fully drained once the sender side
                        // reports every permit back -- clear the
                        // slow-consumer marker so a connection that caught
                        // up isn't reaped for having been full at some
                        // earlier instant.
                        if handle.outbound.capacity() == handle.outbound.max_capacity() {
                            *handle.full_since.lock().expect("full_since lock") = None;
                        }
                    }
                    None => break CloseOutcome::Normal,
                }
            }

            _ = heartbeat.tick() => {
                let env = ServerEnvelope::system("heartbeat");
                if sink.send(Message::Text(env.to_json().into())).await.is_err() {
                    break CloseOutcome::ProtocolError;
                }
            }

            _ = slow_check.tick() => {
                let full_since = *handle.full_since.lock().expect("full_since lock");
                if let Some(since) = full_since {
                    if since.elapsed() > state.config.slow_consumer_timeout {
                        handle.set_state(ConnectionState::Draining);
                        let env = ServerEnvelope::error(
                            close_codes::TRY_AGAIN_LATER as u32,
                            "service busy",
                            None,
                            None,
                        );
                        let _ = sink.send(Message::Text(env.to_json().into())).await;
                        state.metrics.slow_consumer_disconnect();
                        break CloseOutcome::SlowConsumer;
                    }
                }
            }

            _ = sleep_until_expiry(expires_at), if expires_at.is_some() => {
                handle_expiry(&state, connection_id, &handle, &mut sink).await;
            }

            _ = shutdown_rx.recv(), if !shutting_down => {
                shutting_down = true;
                handle.set_state(ConnectionState::Draining);
                let env = ServerEnvelope::system("shutdown");
                let _ = sink.send(Message::Text(env.to_json().into())).await;
                shutdown_deadline = Some(tokio::time::Instant::now() + state.config.shutdown_grace_period);
            }

            _ = sleep_until(shutdown_deadline), if shutdown_deadline.is_some() => {
                break CloseOutcome::Normal;
            }
        }
    };

    let _ = sink
        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
            code: outcome.code(),
            reason: "".into(),
        })))
        .await;
    let _ = sink.close().await;
    outcome
}

async fn sleep_until_expiry(expires_at: Option<i64>) {
    match expires_at {
        Some(ts) => {
            let now = chrono::Utc::now().timestamp();
            let secs = (ts - now).max(0) as u64;
            tokio::time::sleep(Duration::from_secs(secs)).await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(instant) => tokio::time::sleep_until(instant).await,
        None => std::future::pending().await,
    }
}

/// Fires on a scheduled token-expiry tick: downgrades the connection's
/// identity to anonymous, revokes subscriptions the anonymous role no
/// longer satisfies, and sends the ERROR 4401 notice -- the connection
/// itself stays open, per §4.B's expiry-propagation rule.
async fn handle_expiry(
    state: &AppState,
    connection_id: ConnectionId,
    handle: &ConnectionHandle,
    sink: &mut SplitSink<WebSocket, Message>,
) {
    {
        let mut identity = handle.identity.write().await;
        *identity = Identity::anonymous();
    }

    let revoked = state
        .registry
        .revoke_unsatisfied(connection_id, &Identity::anonymous());
    for topic in revoked {
        state.metrics.unsubscribe(topic.as_wire_str());
    }

    state.metrics.error(error_codes::TOKEN_EXPIRED);
    let env = ServerEnvelope::error(error_codes::TOKEN_EXPIRED, "token expired", None, None);
    let _ = sink.send(Message::Text(env.to_json().into())).await;
}
