//! Feed Event Bus
//!
//! Typed, synchronous publish/subscribe that decouples inbound wire
//! messages from the layers that consume them.
//!
//! Listeners are registered per [`EventKind`] and invoked in registration
//! order. A panicking listener is isolated: the panic is caught, logged and
//! the remaining listeners still run.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

use crate::domain::market::{CandlePoint, Interval, Token, TradeTick};

// =============================================================================
// Events
// =============================================================================

/// Events published by the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// Handshake complete and all active subscriptions replayed.
    Connected {
        /// Server-assigned session id.
        connection_id: String,
        /// Number of subscriptions resent during replay.
        replayed: usize,
    },
    /// Connection closed by an explicit disconnect.
    Disconnected,
    /// Connection dropped; retrying after `delay`.
    Reconnecting {
        /// Reconnect attempt number (1-based).
        attempt: u32,
        /// Backoff before the attempt.
        delay: Duration,
    },
    /// Retries exhausted; the feed stays down until reconnected explicitly.
    ConnectionError {
        /// Last transport error.
        message: String,
    },
    /// A candle was created or updated.
    Kline {
        /// Token the candle belongs to.
        token: Token,
        /// Candle interval.
        interval: Interval,
        /// The candle.
        point: CandlePoint,
    },
    /// A trade executed.
    Trade {
        /// Token traded.
        token: Token,
        /// The trade.
        tick: TradeTick,
    },
    /// A heartbeat round trip completed.
    Latency {
        /// Round-trip time in milliseconds.
        latency_ms: u64,
    },
}

impl FeedEvent {
    /// The kind listeners register for.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Connected { .. } => EventKind::Connected,
            Self::Disconnected => EventKind::Disconnected,
            Self::Reconnecting { .. } => EventKind::Reconnecting,
            Self::ConnectionError { .. } => EventKind::ConnectionError,
            Self::Kline { .. } => EventKind::Kline,
            Self::Trade { .. } => EventKind::Trade,
            Self::Latency { .. } => EventKind::Latency,
        }
    }
}

/// Closed set of event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// See [`FeedEvent::Connected`].
    Connected,
    /// See [`FeedEvent::Disconnected`].
    Disconnected,
    /// See [`FeedEvent::Reconnecting`].
    Reconnecting,
    /// See [`FeedEvent::ConnectionError`].
    ConnectionError,
    /// See [`FeedEvent::Kline`].
    Kline,
    /// See [`FeedEvent::Trade`].
    Trade,
    /// See [`FeedEvent::Latency`].
    Latency,
}

impl EventKind {
    /// Every event kind.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Connected,
            Self::Disconnected,
            Self::Reconnecting,
            Self::ConnectionError,
            Self::Kline,
            Self::Trade,
            Self::Latency,
        ]
    }

    /// Event name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::ConnectionError => "connection_error",
            Self::Kline => "kline_update",
            Self::Trade => "trade_update",
            Self::Latency => "latency",
        }
    }
}

/// A registered callback. Deregistration matches on the `Arc` pointer.
pub type Listener = Arc<dyn Fn(&FeedEvent) + Send + Sync>;

/// Wrap a closure as a [`Listener`].
pub fn listener<F>(f: F) -> Listener
where
    F: Fn(&FeedEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

// =============================================================================
// Event Bus
// =============================================================================

/// Synchronous typed dispatcher.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use market_stream::application::services::event_bus::{EventBus, EventKind, FeedEvent, listener};
///
/// let bus = EventBus::new();
/// let seen = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&seen);
/// let on_latency = listener(move |_| {
///     counter.fetch_add(1, Ordering::SeqCst);
/// });
///
/// bus.on(EventKind::Latency, Arc::clone(&on_latency));
/// bus.emit(&FeedEvent::Latency { latency_ms: 12 });
/// assert!(bus.off(EventKind::Latency, &on_latency));
/// bus.emit(&FeedEvent::Latency { latency_ms: 15 });
///
/// assert_eq!(seen.load(Ordering::SeqCst), 1);
/// ```
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<BTreeMap<EventKind, Vec<Listener>>>,
    listener_panics: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("event_names", &self.event_names())
            .field("listener_panics", &self.listener_panics())
            .finish()
    }
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for an event kind.
    pub fn on(&self, kind: EventKind, listener: Listener) {
        self.listeners.write().entry(kind).or_default().push(listener);
    }

    /// Deregister one registration of exactly this listener.
    ///
    /// Returns `false` if the listener was not registered for `kind`.
    pub fn off(&self, kind: EventKind, listener: &Listener) -> bool {
        let mut listeners = self.listeners.write();
        let Some(registered) = listeners.get_mut(&kind) else {
            return false;
        };

        let Some(position) = registered.iter().position(|l| Arc::ptr_eq(l, listener)) else {
            return false;
        };

        registered.remove(position);
        if registered.is_empty() {
            listeners.remove(&kind);
        }
        true
    }

    /// Dispatch an event to every listener of its kind, in registration order.
    ///
    /// Listeners run on the caller's thread against a snapshot of the
    /// registrations, so they may register or deregister listeners freely.
    /// Returns the number of listeners that completed without panicking.
    pub fn emit(&self, event: &FeedEvent) -> usize {
        let kind = event.kind();
        let snapshot: Vec<Listener> = self
            .listeners
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        let mut completed = 0;
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_ok() {
                completed += 1;
            } else {
                self.listener_panics.fetch_add(1, Ordering::Relaxed);
                tracing::error!(event = kind.as_str(), "Event listener panicked");
            }
        }

        completed
    }

    /// Number of listeners registered for a kind.
    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.read().get(&kind).map_or(0, Vec::len)
    }

    /// Kinds that currently have at least one listener.
    #[must_use]
    pub fn event_names(&self) -> Vec<EventKind> {
        self.listeners.read().keys().copied().collect()
    }

    /// Total number of listener panics caught since creation.
    #[must_use]
    pub fn listener_panics(&self) -> u64 {
        self.listener_panics.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================
