//! Market Feed Runtime
//!
//! Composition root for the subscription core. [`MarketFeed`] owns one of
//! each component, wires inbound market data from the bus into the store
//! and applies the route keep-alive policy.
//!
//! ```text
//!  consumers ──subscribe──▶ Multiplexer ──frames──▶ ConnectionManager ──▶ feed
//!      ▲                                                   │
//!      └──snapshot── Store ◀──ingest── EventBus ◀──events──┘
//! ```

pub mod events;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::application::ports::{ConnectionStatusSource, FeedConnector, SessionStore};
use crate::application::services::consumer::{
    ConnectionStatusConsumer, KlineConsumer, TradeConsumer,
};
use crate::application::services::event_bus::{EventBus, EventKind, FeedEvent, listener};
use crate::application::services::multiplexer::SubscriptionMultiplexer;
use crate::application::services::store::{MarketDataStore, StoreStats};
use crate::domain::connection::{ConnectionState, ConnectionStatus};
use crate::domain::market::{CandlePoint, Interval, TradeTick};
use crate::infrastructure::config::{FeedConfig, RouteSettings};
use crate::infrastructure::feed::connection::{ConnectionConfig, ConnectionManager};

pub use events::EventStream;

// =============================================================================
// Diagnostics
// =============================================================================

/// Read-only snapshot of the feed for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedDiagnostics {
    /// Connection status.
    pub status: ConnectionStatus,
    /// Server-assigned session id.
    pub connection_id: Option<String>,
    /// Last heartbeat round trip.
    pub latency_ms: Option<u64>,
    /// Current reconnect attempt.
    pub reconnect_attempt: u32,
    /// Last transport error.
    pub last_error: Option<String>,
    /// Whether subscription frames are being sent.
    pub link_up: bool,
    /// Active subscription keys.
    pub subscriptions: Vec<String>,
    /// Reference count per active key.
    pub ref_counts: BTreeMap<String, usize>,
    /// Listener count per event.
    pub listeners: BTreeMap<&'static str, usize>,
    /// Cache sizes.
    pub store: StoreStats,
    /// Cache revision.
    pub store_revision: u64,
    /// Frames dropped at the codec boundary.
    pub protocol_errors: u64,
    /// Unsubscribes for inactive keys and mismatched acks.
    pub registry_mismatches: u64,
    /// Listener panics caught by the bus.
    pub listener_panics: u64,
}

// =============================================================================
// Market Feed
// =============================================================================

/// Owns the connection, multiplexer, store and event bus.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use market_stream::domain::market::Interval;
/// use market_stream::infrastructure::config::RouteSettings;
/// use market_stream::infrastructure::feed::{ConnectionConfig, LoopbackConnector};
/// use market_stream::infrastructure::runtime::MarketFeed;
/// use market_stream::infrastructure::session::MemorySessionStore;
///
/// let (connector, _server) = LoopbackConnector::new();
/// let feed = MarketFeed::new(
///     Arc::new(connector),
///     Arc::new(MemorySessionStore::new()),
///     ConnectionConfig::default(),
///     RouteSettings::default(),
/// );
///
/// let candles = feed.kline_consumer("SOL", Interval::OneMinute);
/// assert!(candles.snapshot().is_empty());
/// assert_eq!(feed.diagnostics().subscriptions, vec!["SOL:kline:1m".to_string()]);
/// ```
pub struct MarketFeed {
    bus: Arc<EventBus>,
    mux: Arc<SubscriptionMultiplexer>,
    store: Arc<MarketDataStore>,
    connection: Arc<ConnectionManager>,
    session: Arc<dyn SessionStore>,
    routes: RouteSettings,
}

impl std::fmt::Debug for MarketFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketFeed")
            .field("connection", &self.connection)
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

impl MarketFeed {
    /// Build a feed. Nothing connects until [`MarketFeed::connect`].
    #[must_use]
    pub fn new(
        connector: Arc<dyn FeedConnector>,
        session: Arc<dyn SessionStore>,
        config: ConnectionConfig,
        routes: RouteSettings,
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        let (mux, outbound) = SubscriptionMultiplexer::new();
        let mux = Arc::new(mux);
        let store = Arc::new(MarketDataStore::new());

        let connection = Arc::new(ConnectionManager::new(
            connector,
            Arc::clone(&session),
            Arc::clone(&mux),
            outbound,
            Arc::clone(&bus),
            config,
        ));

        register_ingest(&bus, &store);

        Self {
            bus,
            mux,
            store,
            connection,
            session,
            routes,
        }
    }

    /// Build a feed from loaded configuration.
    #[must_use]
    pub fn from_config(
        config: &FeedConfig,
        connector: Arc<dyn FeedConnector>,
        session: Arc<dyn SessionStore>,
    ) -> Self {
        Self::new(
            connector,
            session,
            ConnectionConfig::from_websocket_settings(&config.websocket),
            config.routes.clone(),
        )
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start connecting. Returns `false` if a link is already active.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn connect(&self) -> bool {
        self.connection.connect()
    }

    /// Close the link. Subscriptions are kept for the next connect.
    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// Apply the keep-alive policy for a navigation to `route`.
    ///
    /// Routes under a keep-alive prefix keep (or start) the connection;
    /// any other route tears the feed down. Returns whether the feed was
    /// kept alive.
    pub fn navigate(&self, route: &str) -> bool {
        if self.routes.keeps_alive(route) {
            tracing::debug!(route, "Route keeps market feed alive");
            self.connect();
            true
        } else {
            tracing::debug!(route, "Route releases market feed");
            self.teardown();
            false
        }
    }

    /// Release everything: unsubscribe all keys, disconnect, clear the
    /// cache, reset the connection state and forget the session.
    ///
    /// Handles still held by consumers become inert; releasing them later
    /// sends nothing and leaves interest taken after the teardown intact.
    pub fn teardown(&self) {
        let released = self.mux.unsubscribe_all();
        self.connection.disconnect();
        self.store.reset();
        self.connection.reset_state();

        if let Err(e) = self.session.clear() {
            tracing::warn!(error = %e, "Failed to clear persisted session");
        }

        tracing::info!(released, "Market feed torn down");
    }

    // =========================================================================
    // Historical Seed
    // =========================================================================

    /// Replace the candle history for `(token, interval)`.
    pub fn seed_klines(&self, token: &str, interval: Interval, points: Vec<CandlePoint>) {
        self.store.set_kline(token, interval, points);
    }

    /// Replace the trade history for `token`.
    pub fn seed_trades(&self, token: &str, ticks: Vec<TradeTick>) {
        self.store.set_trade(token, ticks);
    }

    // =========================================================================
    // Consumers
    // =========================================================================

    /// Subscribe to candles for `(token, interval)`.
    #[must_use]
    pub fn kline_consumer(&self, token: &str, interval: Interval) -> KlineConsumer {
        KlineConsumer::new(Arc::clone(&self.mux), Arc::clone(&self.store), token, interval)
    }

    /// Subscribe to trades for `token`.
    #[must_use]
    pub fn trade_consumer(&self, token: &str) -> TradeConsumer {
        TradeConsumer::new(Arc::clone(&self.mux), Arc::clone(&self.store), token)
    }

    /// Read-only view of the connection.
    #[must_use]
    pub fn status_consumer(&self) -> ConnectionStatusConsumer {
        let source: Arc<dyn ConnectionStatusSource> = Arc::clone(&self.connection) as _;
        ConnectionStatusConsumer::new(source)
    }

    /// Stream of bus events of the given kinds.
    #[must_use]
    pub fn events(&self, kinds: &[EventKind]) -> EventStream {
        EventStream::new(Arc::clone(&self.bus), kinds)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Event bus.
    #[must_use]
    pub const fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Subscription multiplexer.
    #[must_use]
    pub const fn multiplexer(&self) -> &Arc<SubscriptionMultiplexer> {
        &self.mux
    }

    /// Market data cache.
    #[must_use]
    pub const fn store(&self) -> &Arc<MarketDataStore> {
        &self.store
    }

    /// Connection manager.
    #[must_use]
    pub const fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Snapshot of the whole feed. Never mutates anything.
    #[must_use]
    pub fn diagnostics(&self) -> FeedDiagnostics {
        let state = self.connection.state();

        FeedDiagnostics {
            status: state.status,
            connection_id: state.connection_id,
            latency_ms: state.latency_ms,
            reconnect_attempt: state.reconnect_attempt,
            last_error: state.last_error,
            link_up: self.mux.is_link_up(),
            subscriptions: self
                .mux
                .subscriptions()
                .iter()
                .map(ToString::to_string)
                .collect(),
            ref_counts: self
                .mux
                .ref_counts()
                .into_iter()
                .map(|(key, count)| (key.to_string(), count))
                .collect(),
            listeners: EventKind::all()
                .iter()
                .map(|&kind| (kind.as_str(), self.bus.listener_count(kind)))
                .collect(),
            store: self.store.stats(),
            store_revision: self.store.revision(),
            protocol_errors: self.connection.protocol_errors(),
            registry_mismatches: self.mux.registry_mismatches(),
            listener_panics: self.bus.listener_panics(),
        }
    }
}

/// Route inbound market data from the bus into the store.
fn register_ingest(bus: &EventBus, store: &Arc<MarketDataStore>) {
    let klines = Arc::clone(store);
    bus.on(
        EventKind::Kline,
        listener(move |event| {
            if let FeedEvent::Kline {
                token,
                interval,
                point,
            } = event
            {
                klines.update_kline(token, *interval, point.clone());
            }
        }),
    );

    let trades = Arc::clone(store);
    bus.on(
        EventKind::Trade,
        listener(move |event| {
            if let FeedEvent::Trade { token, tick } = event
                && !trades.update_trade(token, tick.clone())
            {
                tracing::trace!(token = %token, trade_id = %tick.trade_id, "Duplicate trade ignored");
            }
        }),
    );
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::feed::loopback::LoopbackConnector;
    use crate::infrastructure::session::MemorySessionStore;
    use rust_decimal_macros::dec;

    fn feed() -> MarketFeed {
        let (connector, _server) = LoopbackConnector::new();
        MarketFeed::new(
            Arc::new(connector),
            Arc::new(MemorySessionStore::with_connection_id("c-1")),
            ConnectionConfig::default(),
            RouteSettings::default(),
        )
    }

    fn candle(timestamp: i64) -> CandlePoint {
        CandlePoint {
            timestamp,
            open: dec!(1.0),
            high: dec!(1.5),
            low: dec!(0.5),
            close: dec!(1.2),
            volume: dec!(10),
            quote_volume: dec!(12),
            trades: 1,
            taker_buy_base_volume: dec!(5),
            taker_buy_quote_volume: dec!(6),
        }
    }

    fn tick(id: &str, timestamp: i64) -> TradeTick {
        TradeTick {
            price: dec!(2.5),
            quantity: dec!(1),
            timestamp,
            is_buyer_maker: false,
            trade_id: id.to_string(),
        }
    }

    #[test]
    fn bus_events_are_ingested_into_store() {
        let feed = feed();

        feed.bus().emit(&FeedEvent::Kline {
            token: "SOL".to_string(),
            interval: Interval::OneMinute,
            point: candle(60_000),
        });
        feed.bus().emit(&FeedEvent::Trade {
            token: "SOL".to_string(),
            tick: tick("t-1", 61_000),
        });
        feed.bus().emit(&FeedEvent::Trade {
            token: "SOL".to_string(),
            tick: tick("t-1", 61_000),
        });

        assert_eq!(feed.store().klines("SOL", Interval::OneMinute).len(), 1);
        assert_eq!(feed.store().trades("SOL").len(), 1);
        assert_eq!(feed.store().latest_price("SOL"), Some(dec!(2.5)));
    }

    #[test]
    fn consumers_share_subscriptions() {
        let feed = feed();

        let a = feed.kline_consumer("SOL", Interval::OneMinute);
        let b = feed.kline_consumer("SOL", Interval::OneMinute);
        let trades = feed.trade_consumer("SOL");

        let diagnostics = feed.diagnostics();
        assert_eq!(diagnostics.subscriptions.len(), 2);
        assert_eq!(diagnostics.ref_counts.get("SOL:kline:1m"), Some(&2));

        drop(a);
        drop(b);
        drop(trades);
        assert!(feed.diagnostics().subscriptions.is_empty());
    }

    #[test]
    fn seeded_history_is_visible_to_consumers() {
        let feed = feed();
        feed.seed_klines("SOL", Interval::OneHour, vec![candle(7_200_000), candle(3_600_000)]);
        feed.seed_trades("SOL", vec![tick("a", 1), tick("b", 2)]);

        let candles = feed.kline_consumer("SOL", Interval::OneHour);
        let timestamps: Vec<i64> = candles.snapshot().iter().map(|c| c.timestamp).collect();
        assert_eq!(timestamps, vec![3_600_000, 7_200_000]);
        assert_eq!(feed.trade_consumer("SOL").snapshot().len(), 2);
    }

    #[test]
    fn diagnostics_report_listeners_and_counters() {
        let feed = feed();
        let diagnostics = feed.diagnostics();

        assert_eq!(diagnostics.status, ConnectionStatus::Disconnected);
        assert_eq!(diagnostics.connection_id.as_deref(), Some("c-1"));
        assert_eq!(diagnostics.listeners.get("kline_update"), Some(&1));
        assert_eq!(diagnostics.listeners.get("trade_update"), Some(&1));
        assert_eq!(diagnostics.listeners.get("latency"), Some(&0));
        assert_eq!(diagnostics.protocol_errors, 0);
        assert!(!diagnostics.link_up);

        assert_eq!(feed.diagnostics(), diagnostics);
    }

    #[test]
    fn teardown_resets_everything() {
        let feed = feed();
        let candles = feed.kline_consumer("SOL", Interval::OneMinute);
        feed.seed_klines("SOL", Interval::OneMinute, vec![candle(60_000)]);

        feed.teardown();

        let diagnostics = feed.diagnostics();
        assert!(diagnostics.subscriptions.is_empty());
        assert_eq!(diagnostics.store, StoreStats::default());
        assert_eq!(diagnostics.connection_id, None);
        assert!(candles.snapshot().is_empty());

        drop(candles);
        assert_eq!(feed.diagnostics().registry_mismatches, 1);
    }

    #[test]
    fn status_consumer_reads_connection() {
        let feed = feed();
        let status = feed.status_consumer();

        assert_eq!(status.status(), ConnectionStatus::Disconnected);
        assert!(!status.is_connected());
        assert_eq!(status.latency_ms(), None);
    }
}
