//! Consumer Adapters
//!
//! Scoped wrappers that hold interest in a subscription for as long as they
//! are alive. A handle acquires its keys on activation and releases them on
//! every exit path, including drop.
//!
//! Acquire and release are idempotent per handle, so an activation that runs
//! twice within the same scope never counts twice against the multiplexer.
//! A handle remembers the registry generation it acquired in; once the
//! registry is cleared the handle is inert and releasing it sends nothing.

use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::application::ports::ConnectionStatusSource;
use crate::application::services::multiplexer::SubscriptionMultiplexer;
use crate::application::services::store::{KlineSeries, MarketDataStore, TradeSeries};
use crate::domain::connection::ConnectionStatus;
use crate::domain::market::{Channel, Interval, Token};

// =============================================================================
// Subscription Handle
// =============================================================================

/// Scoped interest in `(token, channels × intervals)`.
#[derive(Debug)]
pub struct SubscriptionHandle {
    mux: Arc<SubscriptionMultiplexer>,
    token: Token,
    channels: Vec<Channel>,
    intervals: Vec<Interval>,
    /// Registry generation of the held interest.
    held: Mutex<Option<u64>>,
}

impl SubscriptionHandle {
    /// Create an inactive handle.
    #[must_use]
    pub fn new(
        mux: Arc<SubscriptionMultiplexer>,
        token: impl Into<Token>,
        channels: &[Channel],
        intervals: &[Interval],
    ) -> Self {
        Self {
            mux,
            token: token.into(),
            channels: channels.to_vec(),
            intervals: intervals.to_vec(),
            held: Mutex::new(None),
        }
    }

    /// Create a handle and acquire it immediately.
    #[must_use]
    pub fn acquired(
        mux: Arc<SubscriptionMultiplexer>,
        token: impl Into<Token>,
        channels: &[Channel],
        intervals: &[Interval],
    ) -> Self {
        let handle = Self::new(mux, token, channels, intervals);
        handle.acquire();
        handle
    }

    /// Register interest. Returns `false` if the handle already held it.
    pub fn acquire(&self) -> bool {
        let mut held = self.held.lock();
        if held.is_some() {
            return false;
        }
        *held = Some(
            self.mux
                .acquire(&self.token, &self.channels, &self.intervals),
        );
        true
    }

    /// Drop interest. Returns `false` if the handle did not hold it or its
    /// interest was already cleared by the multiplexer.
    pub fn release(&self) -> bool {
        let Some(generation) = self.held.lock().take() else {
            return false;
        };
        self.mux
            .release(&self.token, &self.channels, &self.intervals, generation)
    }

    /// Whether the handle currently holds live interest.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held
            .lock()
            .is_some_and(|generation| generation == self.mux.generation())
    }

    /// Token the handle covers.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

// =============================================================================
// Market Data Consumers
// =============================================================================

/// Live candles for one `(token, interval)`.
#[derive(Debug)]
pub struct KlineConsumer {
    handle: SubscriptionHandle,
    interval: Interval,
    store: Arc<MarketDataStore>,
}

impl KlineConsumer {
    /// Subscribe to candles and return the consumer.
    #[must_use]
    pub fn new(
        mux: Arc<SubscriptionMultiplexer>,
        store: Arc<MarketDataStore>,
        token: impl Into<Token>,
        interval: Interval,
    ) -> Self {
        Self {
            handle: SubscriptionHandle::acquired(mux, token, &[Channel::Kline], &[interval]),
            interval,
            store,
        }
    }

    /// Current candle series. Empty until the first update arrives.
    #[must_use]
    pub fn snapshot(&self) -> KlineSeries {
        self.store.klines(self.handle.token(), self.interval)
    }

    /// Latest price for the token.
    #[must_use]
    pub fn latest_price(&self) -> Option<Decimal> {
        self.store.latest_price(self.handle.token())
    }

    /// Candle interval.
    #[must_use]
    pub const fn interval(&self) -> Interval {
        self.interval
    }

    /// Underlying subscription handle.
    #[must_use]
    pub const fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }
}

/// Live trades for one token.
#[derive(Debug)]
pub struct TradeConsumer {
    handle: SubscriptionHandle,
    store: Arc<MarketDataStore>,
}

impl TradeConsumer {
    /// Subscribe to trades and return the consumer.
    #[must_use]
    pub fn new(
        mux: Arc<SubscriptionMultiplexer>,
        store: Arc<MarketDataStore>,
        token: impl Into<Token>,
    ) -> Self {
        Self {
            handle: SubscriptionHandle::acquired(mux, token, &[Channel::Trade], &[]),
            store,
        }
    }

    /// Current trades, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> TradeSeries {
        self.store.trades(self.handle.token())
    }

    /// Latest price for the token.
    #[must_use]
    pub fn latest_price(&self) -> Option<Decimal> {
        self.store.latest_price(self.handle.token())
    }

    /// Underlying subscription handle.
    #[must_use]
    pub const fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }
}

// =============================================================================
// Connection Status
// =============================================================================

/// Read-only view of the connection.
#[derive(Clone)]
pub struct ConnectionStatusConsumer {
    source: Arc<dyn ConnectionStatusSource>,
}

impl std::fmt::Debug for ConnectionStatusConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStatusConsumer")
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionStatusConsumer {
    /// Wrap a status source.
    #[must_use]
    pub fn new(source: Arc<dyn ConnectionStatusSource>) -> Self {
        Self { source }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.source.connection_state().status
    }

    /// Whether the feed is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Last measured round trip in milliseconds.
    #[must_use]
    pub fn latency_ms(&self) -> Option<u64> {
        self.source.connection_state().latency_ms
    }
}
