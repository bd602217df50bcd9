use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use protocol::{Identity, ServerEnvelope};
use sqlx::PgPool;
use tokio::sync::{broadcast, mpsc, RwLock};

use crate::auth::AuthVerifier;
use crate::broadcaster::Broadcaster;
use crate::config::GatewayConfig;
use crate::dispatcher::Dispatcher;
use crate::handlers::HandlerTable;
use crate::metrics::GatewayMetrics;
use crate::rate_limit::TokenBucket;
use crate::registry::{ConnectionId, SubscriptionRegistry};

/// Where a connection sits in the §4.D state machine. Read by the
/// connection's own tasks only; nothing outside a connection ever writes
/// this directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Open,
    Draining,
    Closed,
}

/// A live connection's write side, as seen by everything outside the
/// connection's own tasks: the bounded outbound queue and a shared view of
/// its current identity (mutated only by the connection's reader, per the
/// `Connection` ownership invariant, but read by the broadcaster and the
/// expiry timer).
#[derive(Clone)]
pub struct ConnectionHandle {
    pub outbound: mpsc::Sender<ServerEnvelope>,
    pub identity: Arc<RwLock<Identity>>,
    /// Set the instant the outbound queue was first observed full, cleared
    /// on the next successful enqueue. The connection's own heartbeat tick
    /// checks this against `slow_consumer_timeout` (§4.D) -- nothing else
    /// reads it.
    pub full_since: Arc<Mutex<Option<Instant>>>,
    pub state: Arc<Mutex<ConnectionState>>,
}

impl ConnectionHandle {
    pub fn new(outbound: mpsc::Sender<ServerEnvelope>, identity: Identity) -> Self {
        Self {
            outbound,
            identity: Arc::new(RwLock::new(identity)),
            full_since: Arc::new(Mutex::new(None)),
            state: Arc::new(Mutex::new(ConnectionState::Handshaking)),
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock().expect("connection state lock") = state;
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state.lock().expect("connection state lock")
    }
}

pub type ConnectionTable = Arc<RwLock<HashMap<ConnectionId, ConnectionHandle>>>;

/// The single value constructed at startup containing the registry,
/// rate limiters, handler table, and everything else a connection needs,
/// per the "global singletons" redesign note. Connections are spawned
/// from a clone of this.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<GatewayConfig>,
    pub auth: Arc<AuthVerifier>,
    pub registry: Arc<SubscriptionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub handlers: Arc<HandlerTable>,
    pub metrics: Arc<GatewayMetrics>,
    pub connections: ConnectionTable,
    pub handshake_limiter: Arc<IpRateLimiter>,
    pub broadcaster: Arc<Broadcaster>,
    /// Fired once, process-wide, when shutdown begins. Every connection's
    /// write loop subscribes and sends the SYSTEM `shutdown` notice on the
    /// first tick it observes, per §5's Draining sequence.
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    pub fn new(pool: PgPool, config: GatewayConfig) -> Self {
        let auth = Arc::new(AuthVerifier::new(config.jwt_secret.clone()));
        let handshake_limiter = Arc::new(IpRateLimiter::new(config.rate_limit_ip_capacity));
        let config = Arc::new(config);
        let registry = Arc::new(SubscriptionRegistry::new());
        let connections: ConnectionTable = Arc::new(RwLock::new(HashMap::new()));
        let metrics = Arc::new(GatewayMetrics::new());
        let broadcaster = Arc::new(Broadcaster::new(
            registry.clone(),
            connections.clone(),
            pool.clone(),
            metrics.clone(),
            config.offline_message_retention,
            config.offline_message_max_per_principal_topic,
        ));
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            pool,
            auth,
            registry,
            dispatcher: Arc::new(Dispatcher::new(config.request_timeout)),
            handlers: Arc::new(HandlerTable::with_defaults()),
            metrics,
            connections,
            handshake_limiter,
            broadcaster,
            shutdown_tx,
            config,
        }
    }

    pub async fn register_connection(&self, id: ConnectionId, handle: ConnectionHandle) {
        self.connections.write().await.insert(id, handle);
    }

    pub async fn unregister_connection(&self, id: ConnectionId) {
        self.connections.write().await.remove(&id);
        self.registry.on_connection_closed(id);
        self.dispatcher.cancel_owned_by(id).await;
    }

    /// Announces process shutdown to every live connection. Called once
    /// from `main.rs`'s graceful-shutdown future; each connection's write
    /// loop reacts by sending its own SYSTEM `shutdown` notice and starting
    /// its grace-period countdown.
    pub fn begin_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Per-remote-IP handshake throttle (`B_ip`), separate from each
/// connection's own token bucket since it must exist before a connection
/// is accepted.
pub struct IpRateLimiter {
    capacity: u32,
    buckets: RwLock<HashMap<std::net::IpAddr, Arc<TokenBucket>>>,
}

impl IpRateLimiter {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub async fn try_accept(&self, addr: std::net::IpAddr) -> bool {
        let bucket = {
            let read = self.buckets.read().await;
            read.get(&addr).cloned()
        };
        let bucket = match bucket {
            Some(b) => b,
            None => {
                let mut write = self.buckets.write().await;
                write
                    .entry(addr)
                    .or_insert_with(|| Arc::new(TokenBucket::new(self.capacity, self.capacity)))
                    .clone()
            }
        };
        bucket.try_consume()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn ip_rate_limiter_throttles_per_address() {
        let limiter = IpRateLimiter::new(2);
        let addr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        assert!(limiter.try_accept(addr).await);
        assert!(limiter.try_accept(addr).await);
        assert!(!limiter.try_accept(addr).await);
    }

    #[tokio::test]
    async fn ip_rate_limiter_tracks_addresses_independently() {
        let limiter = IpRateLimiter::new(1);
        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let b = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        assert!(limiter.try_accept(a).await);
        assert!(limiter.try_accept(b).await);
        assert!(!limiter.try_accept(a).await);
    }
}
