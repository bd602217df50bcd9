use std::net::SocketAddr;

use gateway::config::GatewayConfig;
use gateway::db;
use gateway::state::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = GatewayConfig::from_env();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .init();

    info!("connecting to database...");
    let pool = db::create_pool(&config.database_url).await;
    db::run_migrations(&pool).await;
    info!("migrations applied");

    let bind_addr = config.bind_addr.clone();
    let sweep_interval = config.offline_sweep_interval;
    let state = AppState::new(pool, config);

    tokio::spawn(offline_queue_sweep_loop(state.clone(), sweep_interval));

    let router = gateway::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "gateway listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state))
    .await
    .expect("server error");
    info!("gateway shut down gracefully");
}

/// Periodically deletes expired Offline Messages, per §4.I's retention
/// note. Runs for the lifetime of the process; errors are logged and the
/// loop continues on the next tick.
async fn offline_queue_sweep_loop(state: AppState, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match gateway::repo::offline_queue::sweep_expired(&state.pool).await {
            Ok(deleted) if deleted > 0 => info!(deleted, "swept expired offline messages"),
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "offline queue sweep failed"),
        }
    }
}

/// Waits for SIGTERM or Ctrl-C (SIGINT), announces shutdown to every live
/// connection, then gives them the configured grace period to drain
/// before returning -- per §5's Draining shutdown sequence.
async fn shutdown_signal(state: AppState) {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }

    state.begin_shutdown();
    tokio::time::sleep(state.config.shutdown_grace_period).await;
}
