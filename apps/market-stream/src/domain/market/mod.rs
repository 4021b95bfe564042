//! Market Data Types
//!
//! Core domain types for the feed: channels, kline intervals, candles and
//! trade ticks. These types are codec-agnostic apart from their serde
//! representation, which matches the feed's JSON payloads.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Types
// =============================================================================

/// A token identifier (mint address or ticker).
pub type Token = String;

/// Maximum number of candles retained per (token, interval).
pub const MAX_KLINE_POINTS: usize = 1000;

/// Maximum number of trade ticks retained per token.
pub const MAX_TRADE_TICKS: usize = 100;

/// Feed channel a consumer can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Candlestick (OHLCV) updates, keyed by interval.
    Kline,
    /// Individual trade ticks.
    Trade,
}

impl Channel {
    /// Get all channels.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Kline, Self::Trade]
    }

    /// Whether subscriptions on this channel are scoped to an interval.
    #[must_use]
    pub const fn requires_interval(self) -> bool {
        matches!(self, Self::Kline)
    }

    /// Wire name of the channel.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Kline => "kline",
            Self::Trade => "trade",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candle aggregation interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    /// One second.
    #[serde(rename = "1s")]
    OneSecond,
    /// One minute.
    #[serde(rename = "1m")]
    OneMinute,
    /// Five minutes.
    #[serde(rename = "5m")]
    FiveMinutes,
    /// Fifteen minutes.
    #[serde(rename = "15m")]
    FifteenMinutes,
    /// Thirty minutes.
    #[serde(rename = "30m")]
    ThirtyMinutes,
    /// One hour.
    #[serde(rename = "1h")]
    OneHour,
    /// Four hours.
    #[serde(rename = "4h")]
    FourHours,
    /// One day.
    #[serde(rename = "1d")]
    OneDay,
}

impl Interval {
    /// Get all intervals, shortest first.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::OneSecond,
            Self::OneMinute,
            Self::FiveMinutes,
            Self::FifteenMinutes,
            Self::ThirtyMinutes,
            Self::OneHour,
            Self::FourHours,
            Self::OneDay,
        ]
    }

    /// Wire name of the interval.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneSecond => "1s",
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
            Self::FourHours => "4h",
            Self::OneDay => "1d",
        }
    }

    /// Length of one candle in milliseconds.
    #[must_use]
    pub const fn duration_ms(self) -> i64 {
        match self {
            Self::OneSecond => 1_000,
            Self::OneMinute => 60_000,
            Self::FiveMinutes => 300_000,
            Self::FifteenMinutes => 900_000,
            Self::ThirtyMinutes => 1_800_000,
            Self::OneHour => 3_600_000,
            Self::FourHours => 14_400_000,
            Self::OneDay => 86_400_000,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown interval name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown interval: {0}")]
pub struct ParseIntervalError(pub String);

impl FromStr for Interval {
    type Err = ParseIntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::all()
            .iter()
            .copied()
            .find(|interval| interval.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| ParseIntervalError(trimmed.to_string()))
    }
}

// =============================================================================
// Candles
// =============================================================================

/// One OHLCV candle for a fixed interval.
///
/// # Wire Format (JSON)
/// ```json
/// {"timestamp": 1700000000000, "open": "1.0", "high": "1.2", "low": "0.9",
///  "close": "1.1", "volume": "1500", "quoteVolume": "1650", "trades": 42,
///  "takerBuyBaseVolume": "800", "takerBuyQuoteVolume": "880"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandlePoint {
    /// Candle open time (ms since epoch).
    pub timestamp: i64,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close price.
    pub close: Decimal,
    /// Base asset volume.
    pub volume: Decimal,
    /// Quote asset volume.
    #[serde(default)]
    pub quote_volume: Decimal,
    /// Number of trades in the candle.
    #[serde(default)]
    pub trades: u64,
    /// Base volume bought by takers.
    #[serde(default)]
    pub taker_buy_base_volume: Decimal,
    /// Quote volume bought by takers.
    #[serde(default)]
    pub taker_buy_quote_volume: Decimal,
}

impl CandlePoint {
    /// Check the candle is internally consistent.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPayload` if the timestamp is negative, a price is not
    /// positive, the high/low range does not contain open and close, or a
    /// volume is negative.
    pub fn validate(&self) -> Result<(), InvalidPayload> {
        if self.timestamp < 0 {
            return Err(InvalidPayload::NegativeTimestamp(self.timestamp));
        }
        for price in [self.open, self.high, self.low, self.close] {
            if price <= Decimal::ZERO {
                return Err(InvalidPayload::NonPositivePrice(price));
            }
        }
        if self.low > self.high
            || self.open < self.low
            || self.open > self.high
            || self.close < self.low
            || self.close > self.high
        {
            return Err(InvalidPayload::InconsistentRange);
        }
        if self.volume.is_sign_negative() || self.quote_volume.is_sign_negative() {
            return Err(InvalidPayload::NegativeVolume);
        }
        Ok(())
    }
}

// =============================================================================
// Trades
// =============================================================================

/// A single executed trade.
///
/// # Wire Format (JSON)
/// ```json
/// {"price": "1.05", "quantity": "300", "timestamp": 1700000000123,
///  "isBuyerMaker": false, "tradeId": "9f1c..."}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeTick {
    /// Execution price.
    pub price: Decimal,
    /// Executed base quantity.
    pub quantity: Decimal,
    /// Execution time (ms since epoch).
    pub timestamp: i64,
    /// Whether the buyer was the passive side.
    pub is_buyer_maker: bool,
    /// Feed-assigned trade identifier.
    pub trade_id: String,
}

impl TradeTick {
    /// Dedup identity of the tick.
    #[must_use]
    pub fn identity(&self) -> (&str, i64) {
        (self.trade_id.as_str(), self.timestamp)
    }

    /// Check the tick is usable.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPayload` for an empty trade id, a negative timestamp,
    /// a non-positive price or a negative quantity.
    pub fn validate(&self) -> Result<(), InvalidPayload> {
        if self.trade_id.trim().is_empty() {
            return Err(InvalidPayload::MissingTradeId);
        }
        if self.timestamp < 0 {
            return Err(InvalidPayload::NegativeTimestamp(self.timestamp));
        }
        if self.price <= Decimal::ZERO {
            return Err(InvalidPayload::NonPositivePrice(self.price));
        }
        if self.quantity.is_sign_negative() {
            return Err(InvalidPayload::NegativeVolume);
        }
        Ok(())
    }
}

/// Semantic validation failures for decoded market data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidPayload {
    /// Timestamp before the epoch.
    #[error("negative timestamp: {0}")]
    NegativeTimestamp(i64),
    /// Zero or negative price.
    #[error("non-positive price: {0}")]
    NonPositivePrice(Decimal),
    /// High/low do not bound open and close.
    #[error("candle range is inconsistent")]
    InconsistentRange,
    /// Negative volume or quantity.
    #[error("negative volume")]
    NegativeVolume,
    /// Trade without an identifier.
    #[error("missing trade id")]
    MissingTradeId,
}

// =============================================================================
// Tests
// =============================================================================
