//! Market Stream Binary
//!
//! Connects to the market data feed and keeps candle and trade consumers
//! alive for the configured tokens.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-stream
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `MARKET_FEED_URL`: Feed WebSocket endpoint (`ws://` or `wss://`)
//!
//! ## Optional
//! - `MARKET_FEED_TOKENS`: Comma-separated tokens to follow (default: none)
//! - `MARKET_FEED_INTERVALS`: Comma-separated candle intervals (default: 1m)
//! - `MARKET_FEED_SESSION_FILE`: Persist the session id here (default: in-memory)
//! - `MARKET_FEED_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `MARKET_FEED_HEARTBEAT_INTERVAL_SECS`, `MARKET_FEED_PONG_TIMEOUT_SECS`,
//!   `MARKET_FEED_HANDSHAKE_TIMEOUT_SECS`: Liveness tuning
//! - `MARKET_FEED_RECONNECT_DELAY_INITIAL_MS`, `MARKET_FEED_RECONNECT_DELAY_MAX_SECS`,
//!   `MARKET_FEED_RECONNECT_DELAY_MULTIPLIER`, `MARKET_FEED_MAX_RECONNECT_ATTEMPTS`:
//!   Backoff tuning
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: market-stream)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use market_stream::infrastructure::health::{HealthServer, HealthServerState};
use market_stream::infrastructure::telemetry;
use market_stream::{
    EventKind, EventStream, FeedConfig, FeedEvent, FileSessionStore, MarketFeed,
    MemorySessionStore, SessionStore, WebSocketConnector, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider was already installed");
    }

    load_dotenv();

    let _telemetry_guard = telemetry::init()?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting market stream");

    let _metrics_handle = init_metrics()?;

    let config = FeedConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let session: Arc<dyn SessionStore> = match &config.session_file {
        Some(path) => Arc::new(FileSessionStore::new(path)),
        None => Arc::new(MemorySessionStore::new()),
    };
    let connector = Arc::new(WebSocketConnector::new(config.url.clone()));
    let feed = Arc::new(MarketFeed::from_config(&config, connector, session));

    // Spawn health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&feed),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    let health_handle = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Log feed activity
    let events = feed.events(&[
        EventKind::Connected,
        EventKind::Disconnected,
        EventKind::Reconnecting,
        EventKind::ConnectionError,
        EventKind::Kline,
        EventKind::Trade,
    ]);
    let logger_handle = tokio::spawn(log_events(events, shutdown_token.clone()));

    feed.connect();

    let mut kline_consumers = Vec::new();
    let mut trade_consumers = Vec::new();
    for token in &config.tokens {
        for &interval in &config.intervals {
            kline_consumers.push(feed.kline_consumer(token, interval));
        }
        trade_consumers.push(feed.trade_consumer(token));
    }

    tracing::info!(
        kline_consumers = kline_consumers.len(),
        trade_consumers = trade_consumers.len(),
        "Market stream ready"
    );

    await_shutdown().await?;

    drop(kline_consumers);
    drop(trade_consumers);
    feed.teardown();
    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
    let joined = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let _ = health_handle.await;
        let _ = logger_handle.await;
    })
    .await;
    if joined.is_err() {
        tracing::warn!("Shutdown timed out");
    }

    tracing::info!("Market stream stopped");
    Ok(())
}

/// Log feed events until shutdown.
async fn log_events(mut events: EventStream, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.next() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            FeedEvent::Connected {
                connection_id,
                replayed,
            } => {
                tracing::info!(connection_id = %connection_id, replayed, "Feed connected");
            }
            FeedEvent::Disconnected => tracing::info!("Feed disconnected"),
            FeedEvent::Reconnecting { attempt, delay } => {
                tracing::info!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Feed reconnecting"
                );
            }
            FeedEvent::ConnectionError { message } => {
                tracing::error!(error = %message, "Feed connection failed");
            }
            FeedEvent::Kline {
                token,
                interval,
                point,
            } => {
                tracing::debug!(
                    token = %token,
                    interval = interval.as_str(),
                    timestamp = point.timestamp,
                    close = %point.close,
                    "Kline update"
                );
            }
            FeedEvent::Trade { token, tick } => {
                tracing::debug!(
                    token = %token,
                    trade_id = %tick.trade_id,
                    price = %tick.price,
                    quantity = %tick.quantity,
                    "Trade"
                );
            }
            FeedEvent::Latency { latency_ms } => tracing::trace!(latency_ms, "Latency"),
        }
    }
}

/// Load .env file from current or ancestor directories.
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

/// Log the parsed configuration.
fn log_config(config: &FeedConfig) {
    let intervals: Vec<&str> = config.intervals.iter().map(|i| i.as_str()).collect();
    tracing::info!(
        url = %config.url,
        tokens = ?config.tokens,
        intervals = ?intervals,
        health_port = config.server.health_port,
        session_file = ?config.session_file,
        "Configuration loaded"
    );
    tracing::debug!(
        heartbeat_secs = config.websocket.heartbeat_interval.as_secs(),
        pong_timeout_secs = config.websocket.pong_timeout.as_secs(),
        max_reconnect_attempts = config.websocket.max_reconnect_attempts,
        keep_alive_routes = ?config.routes.keep_alive_prefixes,
        "Feed settings"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                tracing::info!("Received Ctrl+C, initiating shutdown");
            }
            _ = terminate.recv() => {
                tracing::info!("Received SIGTERM, initiating shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        tracing::info!("Received Ctrl+C, initiating shutdown");
    }

    Ok(())
}
