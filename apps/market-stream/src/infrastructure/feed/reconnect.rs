//! Reconnection Policy
//!
//! Exponential backoff with jitter for re-establishing the feed link.
//!
//! Every failed attempt to open the link (refused, timed out handshake or
//! dropped stream) consumes one attempt and the feed reports
//! `Reconnecting` with that attempt number. When `next_delay()` returns
//! `None` the connection task stops retrying: the status becomes `Error`,
//! `last_error` carries the [`ReconnectError`] message and a
//! `ConnectionError` event is emitted. Nothing retries after that until
//! `connect()` is called again, which starts a fresh policy. A completed
//! handshake resets the policy, so the bound applies to consecutive
//! failures only. A `max_attempts` of zero never gives up.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::WebSocketSettings;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial delay before first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each attempt).
    pub multiplier: f64,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization).
    pub jitter_factor: f64,
    /// Maximum number of reconnection attempts (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    /// Create configuration from `WebSocketSettings`.
    #[must_use]
    pub const fn from_websocket_settings(settings: &WebSocketSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay_initial,
            max_delay: settings.reconnect_delay_max,
            multiplier: settings.reconnect_delay_multiplier,
            jitter_factor: 0.1,
            max_attempts: settings.max_reconnect_attempts,
        }
    }

    /// Same configuration without jitter.
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }
}

/// Reconnection policy implementing exponential backoff with jitter.
///
/// # Example
///
/// ```rust
/// use market_stream::infrastructure::feed::reconnect::{ReconnectConfig, ReconnectPolicy};
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
///
/// assert!(policy.next_delay().is_some());
/// assert_eq!(policy.attempt_count(), 1);
///
/// // Successful handshake
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            attempt_count: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        self.attempt_count += 1;
        let delay = self.apply_jitter(self.current_delay);

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let capped = next_millis.min(self.config.max_delay.as_millis());
        self.current_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));

        Some(delay)
    }

    /// Reset the policy after a successful handshake.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Configured attempt bound (0 = unlimited).
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}

/// Error type for reconnection failures.
#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts ({attempts}) exceeded: {last_error}")]
    MaxAttemptsExceeded {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last_error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn policy(initial_ms: u64, max_ms: u64, multiplier: f64, max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy::new(
            ReconnectConfig {
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_millis(max_ms),
                multiplier,
                jitter_factor: 0.1,
                max_attempts,
            }
            .without_jitter(),
        )
    }

    #[test]
    fn default_config_values() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!((config.multiplier - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.max_attempts, 10);
    }

    #[test]
    fn from_settings_copies_bounds() {
        let settings = WebSocketSettings {
            max_reconnect_attempts: 4,
            ..WebSocketSettings::default()
        };
        let config = ReconnectConfig::from_websocket_settings(&settings);
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.max_delay, settings.reconnect_delay_max);
    }

    #[test_case(1, 1_000 ; "first attempt uses initial delay")]
    #[test_case(2, 2_000 ; "second attempt doubles")]
    #[test_case(5, 16_000 ; "fifth attempt")]
    #[test_case(6, 30_000 ; "sixth attempt is capped")]
    #[test_case(10, 30_000 ; "last attempt stays capped")]
    fn backoff_schedule(attempt: u32, expected_ms: u64) {
        let mut policy = policy(1_000, 30_000, 2.0, 10);
        let mut delay = Duration::ZERO;
        for _ in 0..attempt {
            delay = policy.next_delay().unwrap();
        }
        assert_eq!(delay, Duration::from_millis(expected_ms));
    }

    #[test]
    fn attempts_are_bounded() {
        let mut policy = policy(100, 1_000, 2.0, 3);

        for expected in 1..=3 {
            assert!(policy.next_delay().is_some());
            assert_eq!(policy.attempt_count(), expected);
        }

        assert!(policy.next_delay().is_none());
        assert!(!policy.should_retry());
    }

    #[test]
    fn reset_restores_initial_delay() {
        let mut policy = policy(100, 10_000, 2.0, 3);
        let _ = policy.next_delay();
        let _ = policy.next_delay();

        policy.reset();

        assert_eq!(policy.attempt_count(), 0);
        assert!(policy.should_retry());
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
            let millis = policy.next_delay().unwrap().as_millis();
            assert!((900..=1100).contains(&millis), "delay {millis}ms out of bounds");
        }
    }

    #[test]
    fn exhaustion_reports_attempts_until_reset() {
        let mut policy = policy(10, 40, 2.0, 2);
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert_eq!(policy.next_delay(), None);
        assert_eq!(policy.next_delay(), None);
        assert_eq!(policy.attempt_count(), 2);

        let failure = ReconnectError::MaxAttemptsExceeded {
            attempts: policy.attempt_count(),
            last_error: "connection refused".to_string(),
        };
        assert_eq!(
            failure.to_string(),
            "maximum reconnection attempts (2) exceeded: connection refused"
        );

        // a handshake between failures starts the count over
        policy.reset();
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(10)));
        assert!(policy.should_retry());
    }

    #[test]
    fn zero_means_unlimited() {
        let mut policy = policy(1, 10, 2.0, 0);
        for _ in 0..1000 {
            assert!(policy.next_delay().is_some());
        }
    }
}
