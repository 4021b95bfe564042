//! Subscription Tracking Types
//!
//! Domain types for tracking consumer interest in feed channels.
//!
//! # Design
//!
//! The registry tracks one reference count per canonical
//! `(token, channel, interval)` key. Only the 0→1 and 1→0 transitions
//! produce upstream changes, which lets many consumers share a single
//! wire subscription.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::domain::market::{Channel, Interval, Token};

// =============================================================================
// Keys
// =============================================================================

/// Canonical identity of one wire subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    /// Token the subscription is for.
    pub token: Token,
    /// Feed channel.
    pub channel: Channel,
    /// Interval, present only for interval-scoped channels.
    pub interval: Option<Interval>,
}

impl SubscriptionKey {
    /// Key for a kline subscription.
    #[must_use]
    pub fn kline(token: impl Into<Token>, interval: Interval) -> Self {
        Self {
            token: token.into(),
            channel: Channel::Kline,
            interval: Some(interval),
        }
    }

    /// Key for a trade subscription.
    #[must_use]
    pub fn trade(token: impl Into<Token>) -> Self {
        Self {
            token: token.into(),
            channel: Channel::Trade,
            interval: None,
        }
    }

    /// Expand a `(token, channels, intervals)` request into canonical keys.
    ///
    /// Interval-scoped channels produce one key per interval; other channels
    /// ignore the intervals. Duplicates are collapsed and the result is sorted.
    #[must_use]
    pub fn expand(token: &str, channels: &[Channel], intervals: &[Interval]) -> Vec<Self> {
        let mut keys = Vec::new();

        for channel in channels {
            if channel.requires_interval() {
                if intervals.is_empty() {
                    tracing::warn!(
                        token,
                        channel = %channel,
                        "Ignoring interval-scoped channel requested without intervals"
                    );
                }
                for interval in intervals {
                    keys.push(Self {
                        token: token.to_string(),
                        channel: *channel,
                        interval: Some(*interval),
                    });
                }
            } else {
                keys.push(Self {
                    token: token.to_string(),
                    channel: *channel,
                    interval: None,
                });
            }
        }

        keys.sort();
        keys.dedup();
        keys
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.interval {
            Some(interval) => write!(f, "{}:{}:{}", self.token, self.channel, interval),
            None => write!(f, "{}:{}", self.token, self.channel),
        }
    }
}

/// Direction of an upstream subscription change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionOp {
    /// Start receiving a key.
    Subscribe,
    /// Stop receiving a key.
    Unsubscribe,
}

impl SubscriptionOp {
    /// Wire name of the operation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Bookkeeping for one active key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEntry {
    /// Number of interested consumers, always at least 1.
    pub ref_count: usize,
    /// When the key first became active.
    pub subscribed_at: DateTime<Utc>,
}

/// Reference-counted set of active subscription keys.
///
/// Entries with a zero count never exist: they are removed on the
/// transition that brings them to zero.
///
/// # Example
///
/// ```rust
/// use market_stream::domain::market::Interval;
/// use market_stream::domain::subscription::{SubscriptionKey, SubscriptionRegistry};
///
/// let mut registry = SubscriptionRegistry::default();
/// let key = SubscriptionKey::kline("TOKEN", Interval::OneMinute);
///
/// assert!(registry.acquire(&key));   // 0 -> 1, needs upstream subscribe
/// assert!(!registry.acquire(&key));  // 1 -> 2
/// assert!(!registry.release(&key));  // 2 -> 1
/// assert!(registry.release(&key));   // 1 -> 0, needs upstream unsubscribe
/// assert!(!registry.release(&key));  // absent, no-op
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: BTreeMap<SubscriptionKey, SubscriptionEntry>,
}

impl SubscriptionRegistry {
    /// Register interest in a key.
    ///
    /// Returns `true` if the key went 0→1 and needs an upstream subscribe.
    pub fn acquire(&mut self, key: &SubscriptionKey) -> bool {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.ref_count += 1;
            return false;
        }

        self.entries.insert(
            key.clone(),
            SubscriptionEntry {
                ref_count: 1,
                subscribed_at: Utc::now(),
            },
        );
        true
    }

    /// Drop interest in a key.
    ///
    /// Returns `true` if the key went 1→0 and needs an upstream unsubscribe.
    /// Releasing an absent key is a no-op that returns `false`.
    pub fn release(&mut self, key: &SubscriptionKey) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };

        entry.ref_count = entry.ref_count.saturating_sub(1);

        if entry.ref_count == 0 {
            self.entries.remove(key);
            return true;
        }

        false
    }

    /// Remove every entry, returning the keys that were active.
    pub fn drain(&mut self) -> Vec<SubscriptionKey> {
        std::mem::take(&mut self.entries).into_keys().collect()
    }

    /// All active keys in canonical order.
    #[must_use]
    pub fn active_keys(&self) -> Vec<SubscriptionKey> {
        self.entries.keys().cloned().collect()
    }

    /// Reference count per active key.
    #[must_use]
    pub fn ref_counts(&self) -> BTreeMap<SubscriptionKey, usize> {
        self.entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.ref_count))
            .collect()
    }

    /// Entry for a key, if active.
    #[must_use]
    pub fn entry(&self, key: &SubscriptionKey) -> Option<&SubscriptionEntry> {
        self.entries.get(key)
    }

    /// Whether a key is active.
    #[must_use]
    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of active keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn key_display_is_stable() {
        assert_eq!(
            SubscriptionKey::kline("ABC", Interval::OneMinute).to_string(),
            "ABC:kline:1m"
        );
        assert_eq!(SubscriptionKey::trade("ABC").to_string(), "ABC:trade");
    }

    #[test]
    fn expand_crosses_kline_with_intervals() {
        let keys = SubscriptionKey::expand(
            "ABC",
            &[Channel::Kline, Channel::Trade],
            &[Interval::OneMinute, Interval::OneHour],
        );

        assert_eq!(
            keys,
            vec![
                SubscriptionKey::kline("ABC", Interval::OneMinute),
                SubscriptionKey::kline("ABC", Interval::OneHour),
                SubscriptionKey::trade("ABC"),
            ]
        );
    }

    #[test]
    fn expand_collapses_duplicates() {
        let keys = SubscriptionKey::expand(
            "ABC",
            &[Channel::Trade, Channel::Trade],
            &[Interval::OneMinute],
        );
        assert_eq!(keys, vec![SubscriptionKey::trade("ABC")]);
    }

    #[test]
    fn expand_kline_without_intervals_is_empty() {
        assert!(SubscriptionKey::expand("ABC", &[Channel::Kline], &[]).is_empty());
    }

    #[test]
    fn acquire_release_transitions() {
        let mut registry = SubscriptionRegistry::default();
        let key = SubscriptionKey::trade("ABC");

        assert!(registry.acquire(&key));
        assert!(!registry.acquire(&key));
        assert_eq!(registry.entry(&key).unwrap().ref_count, 2);

        assert!(!registry.release(&key));
        assert!(registry.contains(&key));

        assert!(registry.release(&key));
        assert!(!registry.contains(&key));
        assert!(registry.is_empty());
    }

    #[test]
    fn release_absent_key_is_noop() {
        let mut registry = SubscriptionRegistry::default();
        assert!(!registry.release(&SubscriptionKey::trade("ABC")));
        assert!(registry.is_empty());
    }

    #[test]
    fn drain_returns_all_and_clears() {
        let mut registry = SubscriptionRegistry::default();
        registry.acquire(&SubscriptionKey::trade("A"));
        registry.acquire(&SubscriptionKey::trade("B"));
        registry.acquire(&SubscriptionKey::trade("B"));

        let drained = registry.drain();

        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }

    proptest! {
        /// Any sequence of acquire/release keeps counts equal to
        /// acquires minus effective releases and never below one.
        #[test]
        fn ref_counts_track_balance(ops in proptest::collection::vec((0u8..3, any::<bool>()), 0..200)) {
            let keys = [
                SubscriptionKey::trade("A"),
                SubscriptionKey::trade("B"),
                SubscriptionKey::kline("A", Interval::OneMinute),
            ];
            let mut registry = SubscriptionRegistry::default();
            let mut expected = [0usize; 3];
            let mut subscribes = [0usize; 3];
            let mut unsubscribes = [0usize; 3];

            for (index, is_acquire) in ops {
                let i = usize::from(index);
                if is_acquire {
                    if registry.acquire(&keys[i]) {
                        subscribes[i] += 1;
                    }
                    expected[i] += 1;
                } else {
                    if registry.release(&keys[i]) {
                        unsubscribes[i] += 1;
                    }
                    expected[i] = expected[i].saturating_sub(1);
                }
            }

            for i in 0..3 {
                let actual = registry.entry(&keys[i]).map_or(0, |e| e.ref_count);
                prop_assert_eq!(actual, expected[i]);
                // Upstream traffic alternates subscribe/unsubscribe per key.
                prop_assert!(subscribes[i] == unsubscribes[i] || subscribes[i] == unsubscribes[i] + 1);
                prop_assert_eq!(subscribes[i] > unsubscribes[i], expected[i] > 0);
            }
        }
    }
}
