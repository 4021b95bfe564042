//! Subscription Multiplexer
//!
//! Shares one wire subscription per key among any number of consumers.
//!
//! Registry mutation and the decision to emit a wire frame happen under a
//! single lock, and frames are queued in that same critical section. The
//! queue order is therefore the order in which the registry changed, and
//! reconnect replay (performed in [`SubscriptionMultiplexer::link_up`]) is
//! always ahead of any consumer call that follows it.
//!
//! Each queued frame carries the link epoch it was produced for. The
//! connection task drops frames from older epochs, so a frame queued just
//! before a drop is never sent on top of the replay for the next link.
//!
//! The registry also has a generation, advanced by
//! [`SubscriptionMultiplexer::unsubscribe_all`]. Interest taken through
//! [`SubscriptionMultiplexer::acquire`] is tagged with it, and a
//! [`SubscriptionMultiplexer::release`] from an older generation touches
//! nothing: a handle that outlived a teardown cannot release a key that a
//! newer consumer holds.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::domain::market::{Channel, Interval};
use crate::domain::subscription::{SubscriptionKey, SubscriptionOp, SubscriptionRegistry};
use crate::infrastructure::metrics;

// =============================================================================
// Outbound Frames
// =============================================================================

/// A subscription change waiting to be written to the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCommand {
    /// Link epoch the command was produced for.
    pub epoch: u64,
    /// Subscribe or unsubscribe.
    pub op: SubscriptionOp,
    /// Key the command applies to.
    pub key: SubscriptionKey,
}

/// Receiving half of the outbound command queue.
pub type OutboundReceiver = mpsc::UnboundedReceiver<OutboundCommand>;

/// Server confirmation of a subscription change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionAck {
    /// Which change is being confirmed.
    pub op: SubscriptionOp,
    /// Keys covered by the ack.
    pub keys: Vec<SubscriptionKey>,
}

// =============================================================================
// Multiplexer
// =============================================================================

#[derive(Debug, Default)]
struct MuxState {
    registry: SubscriptionRegistry,
    link_up: bool,
    epoch: u64,
    generation: u64,
}

/// Reference-counted subscription multiplexer.
///
/// # Example
///
/// ```rust
/// use market_stream::application::services::multiplexer::SubscriptionMultiplexer;
/// use market_stream::domain::market::{Channel, Interval};
///
/// let (mux, mut outbound) = SubscriptionMultiplexer::new();
/// mux.link_up();
///
/// mux.subscribe("TOKEN", &[Channel::Kline], &[Interval::OneMinute]);
/// mux.subscribe("TOKEN", &[Channel::Kline], &[Interval::OneMinute]);
///
/// // Only the first interested consumer produces a wire frame.
/// assert!(outbound.try_recv().is_ok());
/// assert!(outbound.try_recv().is_err());
/// ```
#[derive(Debug)]
pub struct SubscriptionMultiplexer {
    state: Mutex<MuxState>,
    outbound: mpsc::UnboundedSender<OutboundCommand>,
    registry_mismatches: AtomicU64,
}

impl SubscriptionMultiplexer {
    /// Create a multiplexer and the receiving end of its outbound queue.
    #[must_use]
    pub fn new() -> (Self, OutboundReceiver) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Mutex::new(MuxState::default()),
                outbound,
                registry_mismatches: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Register interest in `(token, channels × intervals)`.
    ///
    /// Keys going 0→1 are sent immediately while the link is up and
    /// deferred to the next replay otherwise.
    pub fn subscribe(&self, token: &str, channels: &[Channel], intervals: &[Interval]) {
        self.acquire(token, channels, intervals);
    }

    /// [`Self::subscribe`], returning the registry generation the interest
    /// was recorded in. Pass it back to [`Self::release`].
    pub fn acquire(&self, token: &str, channels: &[Channel], intervals: &[Interval]) -> u64 {
        let keys = SubscriptionKey::expand(token, channels, intervals);
        let mut state = self.state.lock();

        for key in keys {
            if state.registry.acquire(&key) {
                tracing::debug!(key = %key, deferred = !state.link_up, "Subscription activated");
                if state.link_up {
                    self.enqueue(state.epoch, SubscriptionOp::Subscribe, key);
                }
            }
        }

        metrics::set_active_subscriptions(state.registry.len());
        state.generation
    }

    /// Drop interest in `(token, channels × intervals)`.
    ///
    /// Keys going 1→0 are removed and, while the link is up, unsubscribed
    /// upstream. Absent keys are ignored.
    pub fn unsubscribe(&self, token: &str, channels: &[Channel], intervals: &[Interval]) {
        let keys = SubscriptionKey::expand(token, channels, intervals);
        let mut state = self.state.lock();
        self.release_keys(&mut state, keys);
    }

    /// Drop interest taken in registry `generation`.
    ///
    /// Interest from before the last [`Self::unsubscribe_all`] was already
    /// released there; each of its keys is counted as a mismatch and the
    /// registry is left alone. Returns whether the registry was touched.
    pub fn release(
        &self,
        token: &str,
        channels: &[Channel],
        intervals: &[Interval],
        generation: u64,
    ) -> bool {
        let keys = SubscriptionKey::expand(token, channels, intervals);
        let mut state = self.state.lock();

        if generation != state.generation {
            for key in keys {
                self.record_mismatch();
                tracing::debug!(
                    key = %key,
                    generation,
                    current = state.generation,
                    "Release from a cleared registry ignored"
                );
            }
            return false;
        }

        self.release_keys(&mut state, keys);
        true
    }

    fn release_keys(&self, state: &mut MuxState, keys: Vec<SubscriptionKey>) {
        for key in keys {
            if !state.registry.contains(&key) {
                self.record_mismatch();
                tracing::debug!(key = %key, "Unsubscribe for inactive key ignored");
                continue;
            }

            if state.registry.release(&key) {
                tracing::debug!(key = %key, "Subscription released");
                if state.link_up {
                    self.enqueue(state.epoch, SubscriptionOp::Unsubscribe, key);
                }
            }
        }

        metrics::set_active_subscriptions(state.registry.len());
    }

    /// Unsubscribe every active key exactly once and clear the registry.
    ///
    /// Returns the number of keys that were active.
    pub fn unsubscribe_all(&self) -> usize {
        let mut state = self.state.lock();
        let keys = state.registry.drain();
        let count = keys.len();
        state.generation += 1;

        if state.link_up {
            for key in keys {
                self.enqueue(state.epoch, SubscriptionOp::Unsubscribe, key);
            }
        }

        metrics::set_active_subscriptions(0);
        tracing::info!(count, "Released all subscriptions");
        count
    }

    /// Mark the link as up and replay every active key once.
    ///
    /// Returns the new epoch and the number of keys replayed.
    pub fn link_up(&self) -> (u64, usize) {
        let mut state = self.state.lock();
        state.epoch += 1;
        state.link_up = true;

        let epoch = state.epoch;
        let keys = state.registry.active_keys();
        let replayed = keys.len();

        for key in keys {
            self.enqueue(epoch, SubscriptionOp::Subscribe, key);
        }

        tracing::info!(epoch, replayed, "Replayed active subscriptions");
        (epoch, replayed)
    }

    /// Mark the link as down. The registry is kept for the next replay.
    pub fn link_down(&self) {
        let mut state = self.state.lock();
        if state.link_up {
            state.link_up = false;
            tracing::debug!(epoch = state.epoch, "Subscription link down");
        }
    }

    /// Whether frames are currently being sent.
    #[must_use]
    pub fn is_link_up(&self) -> bool {
        self.state.lock().link_up
    }

    /// Current link epoch.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Current registry generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Reconcile a server ack against the registry.
    ///
    /// Acks never mutate the registry; an ack that disagrees with current
    /// interest is logged and counted.
    pub fn handle_ack(&self, ack: &SubscriptionAck) {
        let state = self.state.lock();

        for key in &ack.keys {
            let active = state.registry.contains(key);
            let consistent = match ack.op {
                SubscriptionOp::Subscribe => active,
                SubscriptionOp::Unsubscribe => !active,
            };

            if consistent {
                tracing::trace!(key = %key, op = ack.op.as_str(), "Ack confirmed");
            } else {
                self.record_mismatch();
                tracing::warn!(
                    key = %key,
                    op = ack.op.as_str(),
                    active,
                    "Ack does not match current interest"
                );
            }
        }
    }

    /// Active keys in canonical order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<SubscriptionKey> {
        self.state.lock().registry.active_keys()
    }

    /// Reference count per active key.
    #[must_use]
    pub fn ref_counts(&self) -> BTreeMap<SubscriptionKey, usize> {
        self.state.lock().registry.ref_counts()
    }

    /// Number of unsubscribes for inactive keys and mismatched acks seen.
    #[must_use]
    pub fn registry_mismatches(&self) -> u64 {
        self.registry_mismatches.load(Ordering::Relaxed)
    }

    fn enqueue(&self, epoch: u64, op: SubscriptionOp, key: SubscriptionKey) {
        if self
            .outbound
            .send(OutboundCommand { epoch, op, key })
            .is_err()
        {
            tracing::debug!("Outbound queue closed, dropping subscription frame");
        }
    }

    fn record_mismatch(&self) {
        self.registry_mismatches.fetch_add(1, Ordering::Relaxed);
        metrics::record_registry_mismatch();
    }
}

// =============================================================================
// Tests
// =============================================================================
