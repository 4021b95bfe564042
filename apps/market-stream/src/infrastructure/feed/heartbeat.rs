//! Heartbeat Manager
//!
//! Probes link liveness with periodic pings. Each ping opens a pong window;
//! if the window closes without a pong the manager reports a timeout and
//! exits, and the connection task treats that as a liveness failure.
//!
//! Round-trip time is measured from the ping to the matching pong.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::config::WebSocketSettings;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between ping messages.
    pub ping_interval: Duration,
    /// How long after a ping the pong must arrive.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(5),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
        }
    }

    /// Create configuration from `WebSocketSettings`.
    #[must_use]
    pub const fn from_websocket_settings(settings: &WebSocketSettings) -> Self {
        Self {
            ping_interval: settings.heartbeat_interval,
            pong_timeout: settings.pong_timeout,
        }
    }
}

/// Events emitted by the heartbeat manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a ping frame now.
    SendPing,
    /// No pong arrived in time; the link should be dropped.
    Timeout,
}

/// State shared between the heartbeat manager and the connection task.
#[derive(Debug, Default)]
pub struct HeartbeatState {
    ping_sent_at: RwLock<Option<Instant>>,
    last_latency: RwLock<Option<Duration>>,
    waiting_for_pong: AtomicBool,
}

impl HeartbeatState {
    /// Create new heartbeat state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a ping went out and open the pong window.
    pub fn mark_ping_sent(&self) {
        *self.ping_sent_at.write() = Some(Instant::now());
        self.waiting_for_pong.store(true, Ordering::SeqCst);
    }

    /// Record a pong and return the round trip, if a ping was outstanding.
    pub fn record_pong(&self) -> Option<Duration> {
        if !self.waiting_for_pong.swap(false, Ordering::SeqCst) {
            return None;
        }
        let latency = self.ping_sent_at.read().map(|sent| sent.elapsed());
        if let Some(latency) = latency {
            *self.last_latency.write() = Some(latency);
        }
        latency
    }

    /// Check if we're currently waiting for a pong.
    #[must_use]
    pub fn is_waiting_for_pong(&self) -> bool {
        self.waiting_for_pong.load(Ordering::SeqCst)
    }

    /// Last measured round trip.
    #[must_use]
    pub fn last_latency(&self) -> Option<Duration> {
        *self.last_latency.read()
    }

    /// Reset state for new connection.
    pub fn reset(&self) {
        *self.ping_sent_at.write() = None;
        self.waiting_for_pong.store(false, Ordering::SeqCst);
    }
}

/// Heartbeat manager that monitors link liveness.
///
/// # Example
///
/// ```rust,no_run
/// use market_stream::infrastructure::feed::heartbeat::{
///     HeartbeatConfig, HeartbeatManager, HeartbeatState, HeartbeatEvent,
/// };
/// use std::sync::Arc;
/// use tokio::sync::mpsc;
/// use tokio_util::sync::CancellationToken;
///
/// async fn example() {
///     let state = Arc::new(HeartbeatState::new());
///     let (event_tx, mut event_rx) = mpsc::channel(4);
///     let cancel = CancellationToken::new();
///
///     let manager = HeartbeatManager::new(
///         HeartbeatConfig::default(),
///         Arc::clone(&state),
///         event_tx,
///         cancel.clone(),
///     );
///     tokio::spawn(manager.run());
///
///     while let Some(event) = event_rx.recv().await {
///         match event {
///             HeartbeatEvent::SendPing => { /* write {"op":"ping"} */ }
///             HeartbeatEvent::Timeout => break,
///         }
///     }
/// }
/// ```
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run the heartbeat loop until cancelled or a pong window expires.
    pub async fn run(self) {
        let start = tokio::time::Instant::now() + self.config.ping_interval;
        let mut interval = tokio::time::interval_at(start, self.config.ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat manager cancelled");
                    break;
                }
                _ = interval.tick() => {}
            }

            self.state.mark_ping_sent();
            if self.event_tx.send(HeartbeatEvent::SendPing).await.is_err() {
                tracing::debug!("Event channel closed, stopping heartbeat");
                break;
            }

            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat manager cancelled");
                    break;
                }
                () = tokio::time::sleep(self.config.pong_timeout) => {}
            }

            if self.state.is_waiting_for_pong() {
                tracing::warn!(
                    timeout_ms = u64::try_from(self.config.pong_timeout.as_millis()).unwrap_or(u64::MAX),
                    "Heartbeat timeout detected"
                );
                let _ = self.event_tx.send(HeartbeatEvent::Timeout).await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert_eq!(config.pong_timeout, Duration::from_secs(5));
    }

    #[test]
    fn pong_without_ping_is_ignored() {
        let state = HeartbeatState::new();
        assert_eq!(state.record_pong(), None);
        assert_eq!(state.last_latency(), None);
    }

    #[test]
    fn pong_after_ping_measures_latency() {
        let state = HeartbeatState::new();
        state.mark_ping_sent();
        assert!(state.is_waiting_for_pong());

        let latency = state.record_pong();
        assert!(latency.is_some());
        assert!(!state.is_waiting_for_pong());
        assert_eq!(state.last_latency(), latency);
    }

    #[test]
    fn state_reset() {
        let state = HeartbeatState::new();
        state.mark_ping_sent();
        state.reset();
        assert!(!state.is_waiting_for_pong());
        assert_eq!(state.record_pong(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn manager_pings_after_interval() {
        let config = HeartbeatConfig::new(Duration::from_secs(30), Duration::from_secs(5));
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            HeartbeatManager::new(config, Arc::clone(&state), event_tx, cancel.clone()).run(),
        );

        let event = event_rx.recv().await.expect("channel should not close");
        assert_eq!(event, HeartbeatEvent::SendPing);
        assert!(state.is_waiting_for_pong());

        cancel.cancel();
        handle.await.expect("task should complete");
    }

    #[tokio::test(start_paused = true)]
    async fn manager_keeps_pinging_when_pongs_arrive() {
        let config = HeartbeatConfig::new(Duration::from_secs(30), Duration::from_secs(5));
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            HeartbeatManager::new(config, Arc::clone(&state), event_tx, cancel.clone()).run(),
        );

        for _ in 0..3 {
            let event = event_rx.recv().await.expect("channel should not close");
            assert_eq!(event, HeartbeatEvent::SendPing);
            assert!(state.record_pong().is_some());
        }

        cancel.cancel();
        handle.await.expect("task should complete");
    }

    #[tokio::test(start_paused = true)]
    async fn manager_detects_timeout() {
        let config = HeartbeatConfig::new(Duration::from_secs(30), Duration::from_secs(5));
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            HeartbeatManager::new(config, Arc::clone(&state), event_tx, cancel.clone()).run(),
        );

        assert_eq!(event_rx.recv().await, Some(HeartbeatEvent::SendPing));
        assert_eq!(event_rx.recv().await, Some(HeartbeatEvent::Timeout));

        handle.await.expect("manager should exit after timeout");
    }

    #[tokio::test]
    async fn manager_cancellation() {
        let config = HeartbeatConfig::new(Duration::from_secs(10), Duration::from_secs(10));
        let (event_tx, _event_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            HeartbeatManager::new(config, Arc::new(HeartbeatState::new()), event_tx, cancel.clone())
                .run(),
        );
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_millis(100), handle).await;
        assert!(result.is_ok(), "manager should shut down on cancellation");
    }
}
