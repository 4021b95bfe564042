//! Market Data Store
//!
//! Bounded, time-ordered caches of candles and trades plus the latest
//! observed price per token.
//!
//! # Snapshots
//!
//! Series are held behind `Arc` and replaced wholesale on every mutation,
//! so a snapshot handed out by [`MarketDataStore::klines`] or
//! [`MarketDataStore::trades`] is never modified afterwards and cheap to
//! compare by pointer.
//!
//! # Bounds
//!
//! - Candles: sorted ascending by timestamp, unique timestamps, newest
//!   [`MAX_KLINE_POINTS`] kept.
//! - Trades: sorted ascending by timestamp, unique `(trade_id, timestamp)`,
//!   newest [`MAX_TRADE_TICKS`] kept.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::domain::market::{
    CandlePoint, Interval, MAX_KLINE_POINTS, MAX_TRADE_TICKS, Token, TradeTick,
};

/// Shared, immutable candle series.
pub type KlineSeries = Arc<Vec<CandlePoint>>;

/// Shared, immutable trade series.
pub type TradeSeries = Arc<Vec<TradeTick>>;

#[derive(Debug, Default)]
struct StoreInner {
    klines: HashMap<(Token, Interval), KlineSeries>,
    trades: HashMap<Token, TradeSeries>,
    latest_price: HashMap<Token, Decimal>,
}

/// Counts of cached data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Number of (token, interval) candle series.
    pub kline_series: usize,
    /// Total candles across all series.
    pub kline_points: usize,
    /// Number of tokens with trades.
    pub trade_series: usize,
    /// Total trades across all tokens.
    pub trade_ticks: usize,
    /// Number of tokens with a known latest price.
    pub priced_tokens: usize,
}

/// In-memory market data cache.
#[derive(Debug, Default)]
pub struct MarketDataStore {
    inner: RwLock<StoreInner>,
    revision: AtomicU64,
}

impl MarketDataStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Candles
    // =========================================================================

    /// Insert or replace one candle and record its close as latest price.
    ///
    /// A candle with an existing timestamp replaces it in place; otherwise it
    /// is inserted at its sorted position and the oldest candles are evicted
    /// past the bound. A candle older than every point of a full series
    /// would be evicted at once: it is ignored and `false` is returned.
    pub fn update_kline(&self, token: &str, interval: Interval, point: CandlePoint) -> bool {
        let mut inner = self.inner.write();
        let close = point.close;

        let key = (token.to_string(), interval);
        let mut series: Vec<CandlePoint> = inner
            .klines
            .get(&key)
            .map(|s| s.as_ref().clone())
            .unwrap_or_default();

        match series.binary_search_by_key(&point.timestamp, |p| p.timestamp) {
            Ok(index) => series[index] = point,
            Err(0) if series.len() >= MAX_KLINE_POINTS => {
                tracing::trace!(
                    token,
                    timestamp = point.timestamp,
                    "Candle older than full series ignored"
                );
                return false;
            }
            Err(index) => series.insert(index, point),
        }
        trim_front(&mut series, MAX_KLINE_POINTS);

        inner.klines.insert(key, Arc::new(series));
        inner.latest_price.insert(token.to_string(), close);
        drop(inner);

        self.bump();
        true
    }

    /// Replace a candle series with a historical snapshot.
    ///
    /// The input is sorted and deduplicated by timestamp (the later entry in
    /// input order wins) and truncated to the newest candles. The newest
    /// close becomes the latest price.
    pub fn set_kline(&self, token: &str, interval: Interval, points: Vec<CandlePoint>) {
        let mut series = points;
        // Stable sort keeps input order among equal timestamps.
        series.sort_by_key(|p| p.timestamp);
        let mut deduped: Vec<CandlePoint> = Vec::with_capacity(series.len());
        for point in series {
            match deduped.last_mut() {
                Some(last) if last.timestamp == point.timestamp => *last = point,
                _ => deduped.push(point),
            }
        }
        trim_front(&mut deduped, MAX_KLINE_POINTS);

        let mut inner = self.inner.write();
        if let Some(newest) = deduped.last() {
            inner.latest_price.insert(token.to_string(), newest.close);
        }
        inner
            .klines
            .insert((token.to_string(), interval), Arc::new(deduped));
        drop(inner);

        self.bump();
    }

    /// Candle series for `(token, interval)`, empty if unknown.
    #[must_use]
    pub fn klines(&self, token: &str, interval: Interval) -> KlineSeries {
        self.inner
            .read()
            .klines
            .get(&(token.to_string(), interval))
            .cloned()
            .unwrap_or_default()
    }

    // =========================================================================
    // Trades
    // =========================================================================

    /// Append one trade and record its price as latest price.
    ///
    /// A trade whose `(trade_id, timestamp)` is already present is ignored,
    /// as is a trade older than every tick of a full buffer (it would be
    /// evicted at once and must not move the latest price). Returns `false`
    /// in both cases.
    pub fn update_trade(&self, token: &str, tick: TradeTick) -> bool {
        let mut inner = self.inner.write();

        let mut series: Vec<TradeTick> = inner
            .trades
            .get(token)
            .map(|s| s.as_ref().clone())
            .unwrap_or_default();

        if series.iter().any(|t| t.identity() == tick.identity()) {
            tracing::trace!(token, trade_id = %tick.trade_id, "Duplicate trade ignored");
            return false;
        }

        let price = tick.price;
        let index = series.partition_point(|t| t.timestamp <= tick.timestamp);
        if index == 0 && series.len() >= MAX_TRADE_TICKS {
            tracing::trace!(
                token,
                trade_id = %tick.trade_id,
                "Trade older than full buffer ignored"
            );
            return false;
        }
        series.insert(index, tick);
        trim_front(&mut series, MAX_TRADE_TICKS);

        inner.trades.insert(token.to_string(), Arc::new(series));
        inner.latest_price.insert(token.to_string(), price);
        drop(inner);

        self.bump();
        true
    }

    /// Replace a token's trades with a historical snapshot.
    ///
    /// The input is sorted by timestamp, deduplicated by identity (first
    /// occurrence wins) and truncated to the newest trades. The newest
    /// price becomes the latest price.
    pub fn set_trade(&self, token: &str, ticks: Vec<TradeTick>) {
        let mut series = ticks;
        series.sort_by_key(|t| t.timestamp);

        let mut seen: HashSet<(String, i64)> = HashSet::with_capacity(series.len());
        series.retain(|t| seen.insert((t.trade_id.clone(), t.timestamp)));
        trim_front(&mut series, MAX_TRADE_TICKS);

        let mut inner = self.inner.write();
        if let Some(newest) = series.last() {
            inner.latest_price.insert(token.to_string(), newest.price);
        }
        inner.trades.insert(token.to_string(), Arc::new(series));
        drop(inner);

        self.bump();
    }

    /// Trades for `token`, empty if unknown.
    #[must_use]
    pub fn trades(&self, token: &str) -> TradeSeries {
        self.inner
            .read()
            .trades
            .get(token)
            .cloned()
            .unwrap_or_default()
    }

    // =========================================================================
    // Prices and Lifecycle
    // =========================================================================

    /// Most recently observed price for `token`.
    #[must_use]
    pub fn latest_price(&self, token: &str) -> Option<Decimal> {
        self.inner.read().latest_price.get(token).copied()
    }

    /// Drop all cached data.
    pub fn reset(&self) {
        *self.inner.write() = StoreInner::default();
        self.bump();
        tracing::debug!("Market data store reset");
    }

    /// Alias for [`Self::reset`].
    pub fn clear_data(&self) {
        self.reset();
    }

    /// Monotonic counter bumped on every mutation.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Counts of cached data.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        StoreStats {
            kline_series: inner.klines.len(),
            kline_points: inner.klines.values().map(|s| s.len()).sum(),
            trade_series: inner.trades.len(),
            trade_ticks: inner.trades.values().map(|s| s.len()).sum(),
            priced_tokens: inner.latest_price.len(),
        }
    }

    fn bump(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
    }
}

fn trim_front<T>(series: &mut Vec<T>, max: usize) {
    if series.len() > max {
        let excess = series.len() - max;
        series.drain(..excess);
    }
}

// =============================================================================
// Tests
// =============================================================================
