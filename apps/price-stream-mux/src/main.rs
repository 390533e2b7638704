//! Price Stream Multiplexer Binary
//!
//! Runs one multiplexer against the configured feed, subscribes a watchlist,
//! logs ticks and status transitions, and serves health and metrics.
//!
//! # Usage
//!
//! ```bash
//! PRICE_STREAM_URL=wss://feed.example/ws \
//! PRICE_STREAM_SYMBOLS="EUR/USD,gold,SPX" \
//! cargo run --bin price-stream-mux
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `PRICE_STREAM_URL`: Feed WebSocket URL
//!
//! ## Optional
//! - `PRICE_STREAM_SYMBOLS`: Comma-separated watchlist (default: empty)
//! - `PRICE_STREAM_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `PRICE_STREAM_BATCH_WINDOW_MS`: Subscription batch window (default: 50)
//! - `PRICE_STREAM_MAX_SYMBOLS`: Distinct symbol cap (default: 500)
//! - `PRICE_STREAM_*`: Heartbeat and reconnect tuning, see `ServiceConfig`
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: price-stream-mux)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use price_stream_mux::infrastructure::telemetry;
use price_stream_mux::{
    ConnectionState, HealthServer, HealthServerState, Multiplexer, PriceTick, ServiceConfig,
    StatusEvent, WebSocketConnector, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Grace period for the health server to drain after shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting price stream multiplexer");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = ServiceConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let multiplexer_config = config.multiplexer_config();
    let connector = WebSocketConnector::new(config.url.clone(), multiplexer_config.heartbeat.clone());
    let multiplexer = Arc::new(Multiplexer::new(Arc::new(connector), multiplexer_config));

    multiplexer.on_price_update(Arc::new(log_tick));
    multiplexer.on_connection_status(Arc::new(log_status));

    // Initialize health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&multiplexer),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    if !config.symbols.is_empty() {
        multiplexer.subscribe(&config.symbols)?;
    }

    match multiplexer.connect().await {
        ConnectionState::Connected => tracing::info!("Price stream ready"),
        state => tracing::warn!(state = %state, "First connection attempt failed, retrying"),
    }

    await_shutdown(shutdown_token).await;

    multiplexer.disconnect();
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, health_task).await.is_err() {
        tracing::warn!("Health server did not stop in time");
    }

    tracing::info!(stats = ?multiplexer.stats(), "Price stream multiplexer stopped");
    Ok(())
}

fn log_tick(tick: &PriceTick) {
    tracing::debug!(
        symbol = %tick.symbol,
        label = %tick.label,
        price = %tick.price,
        change = %tick.change,
        change_percent = %tick.change_percent,
        "Price update"
    );
}

fn log_status(event: &StatusEvent) {
    tracing::info!(
        from = %event.previous,
        to = %event.state,
        attempt = event.attempt,
        reason = event.reason.as_deref().unwrap_or(""),
        "Feed status"
    );
}

/// Log the parsed configuration.
fn log_config(config: &ServiceConfig) {
    tracing::info!(
        url = %config.url,
        symbols = config.symbols.len(),
        health_port = config.server.health_port,
        batch_window_ms = u64::try_from(config.multiplexer.batch_window.as_millis()).unwrap_or(u64::MAX),
        max_symbols = config.multiplexer.max_symbols,
        "Configuration loaded"
    );
    tracing::debug!(
        heartbeat_interval_secs = config.feed.heartbeat_interval.as_secs(),
        heartbeat_timeout_secs = config.feed.heartbeat_timeout.as_secs(),
        max_reconnect_attempts = config.feed.max_reconnect_attempts,
        "Feed settings"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
