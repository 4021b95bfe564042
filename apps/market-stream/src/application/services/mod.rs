//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `EventBus`: Typed dispatch of feed events to listeners
//! - `SubscriptionMultiplexer`: Ref-counted wire subscriptions and replay
//! - `MarketDataStore`: Bounded candle and trade caches
//! - Consumer adapters: Scoped subscription handles and read-only views

pub mod consumer;
pub mod event_bus;
pub mod multiplexer;
pub mod store;

pub use consumer::{ConnectionStatusConsumer, KlineConsumer, SubscriptionHandle, TradeConsumer};
pub use event_bus::{EventBus, EventKind, FeedEvent, Listener, listener};
pub use multiplexer::{OutboundCommand, OutboundReceiver, SubscriptionAck, SubscriptionMultiplexer};
pub use store::{KlineSeries, MarketDataStore, StoreStats, TradeSeries};
