#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Stream - Real-time Market Data Subscription Core
//!
//! Maintains a single connection to a market data feed, shares ref-counted
//! channel subscriptions between any number of short-lived consumers, and
//! caches bounded candle and trade history for them to read.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Market data and subscription types
//!   - `market`: Channels, intervals, candles, trades
//!   - `subscription`: Canonical keys and the ref-counted registry
//!   - `connection`: Connection lifecycle state
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Feed transport, session persistence, status source
//!   - `services`: Event bus, multiplexer, store, consumer handles
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `feed`: WebSocket and loopback transports, codec, connection manager
//!   - `runtime`: `MarketFeed` composition root
//!   - `config`: Environment configuration
//!   - `health`: Health check and diagnostics HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//!                        ┌──────────────┐  frames   ┌────────────────────┐
//!  consumers ─subscribe─▶│ Multiplexer  │──────────▶│ ConnectionManager  │◀──▶ feed
//!      ▲                 └──────────────┘           └─────────┬──────────┘
//!      │                                                      │ events
//!      │                 ┌──────────────┐  ingest   ┌─────────▼──────────┐
//!      └──── snapshot ───│    Store     │◀──────────│      EventBus      │
//!                        └──────────────┘           └────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Market data types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::connection::{ConnectionState, ConnectionStatus};
pub use domain::market::{CandlePoint, Channel, Interval, Token, TradeTick};
pub use domain::subscription::{SubscriptionKey, SubscriptionOp};

// Application services
pub use application::ports::{FeedConnector, SessionStore, TransportError};
pub use application::services::{
    ConnectionStatusConsumer, EventBus, EventKind, FeedEvent, KlineConsumer, MarketDataStore,
    SubscriptionHandle, SubscriptionMultiplexer, TradeConsumer,
};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, FeedConfig, RouteSettings, ServerSettings, WebSocketSettings,
};

// Feed adapters
pub use infrastructure::feed::{
    ConnectionConfig, ConnectionManager, LoopbackConnector, LoopbackServer, WebSocketConnector,
};

// Runtime
pub use infrastructure::runtime::{EventStream, FeedDiagnostics, MarketFeed};

// Session stores
pub use infrastructure::session::{FileSessionStore, MemorySessionStore};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{
    TelemetryConfig, TelemetryError, TelemetryGuard, init as init_telemetry,
};
