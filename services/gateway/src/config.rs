use std::env;
use std::time::Duration;

/// Process configuration, read once at startup from environment variables
/// (optionally loaded from a local `.env` in development).
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub database_url: String,
    pub jwt_secret: Vec<u8>,
    pub log_level: String,
    /// Connection token bucket capacity, `B_conn`.
    pub rate_limit_conn_capacity: u32,
    /// Connection token bucket refill rate, `R_conn` (tokens/second).
    pub rate_limit_conn_refill_per_sec: u32,
    /// Handshake-tier per-IP token bucket capacity, `B_ip`.
    pub rate_limit_ip_capacity: u32,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
    pub slow_consumer_timeout: Duration,
    pub write_queue_capacity: usize,
    pub offline_message_retention: chrono::Duration,
    /// Per-`(principalId, topic)` cap on undelivered Offline Messages --
    /// the source material never pins a number, so this is left
    /// configurable (§9 Open Questions).
    pub offline_message_max_per_principal_topic: i64,
    pub offline_sweep_interval: Duration,
    pub shutdown_grace_period: Duration,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned()),
            database_url: env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            jwt_secret: env::var("JWT_SECRET")
                .expect("JWT_SECRET must be set")
                .into_bytes(),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned()),
            rate_limit_conn_capacity: parse_env_or("RATE_LIMIT_CONN_CAPACITY", 30),
            rate_limit_conn_refill_per_sec: parse_env_or("RATE_LIMIT_CONN_REFILL_PER_SEC", 10),
            rate_limit_ip_capacity: parse_env_or("RATE_LIMIT_IP_CAPACITY", 5),
            heartbeat_interval: Duration::from_secs(parse_env_or("HEARTBEAT_INTERVAL_SECS", 30)),
            request_timeout: Duration::from_secs(parse_env_or("REQUEST_TIMEOUT_SECS", 10)),
            slow_consumer_timeout: Duration::from_secs(parse_env_or(
                "SLOW_CONSUMER_TIMEOUT_SECS",
                5,
            )),
            write_queue_capacity: parse_env_or("WRITE_QUEUE_CAPACITY", 1024),
            offline_message_retention: chrono::Duration::days(parse_env_or(
                "OFFLINE_MESSAGE_RETENTION_DAYS",
                7,
            )),
            offline_message_max_per_principal_topic: parse_env_or(
                "OFFLINE_MESSAGE_MAX_PER_PRINCIPAL_TOPIC",
                1000,
            ),
            offline_sweep_interval: Duration::from_secs(parse_env_or(
                "OFFLINE_SWEEP_INTERVAL_SECS",
                3600,
            )),
            shutdown_grace_period: Duration::from_secs(parse_env_or(
                "SHUTDOWN_GRACE_PERIOD_SECS",
                5,
            )),
        }
    }
}

fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
