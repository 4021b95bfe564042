//! Connection Manager
//!
//! Owns the single feed link and its lifecycle:
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──handshake──▶ Connected
//!      ▲                          │                        │
//!      │                          ▼                        ▼
//!  disconnect()  ◀──────── Reconnecting ◀──── link lost / liveness failure
//!                                 │
//!                                 ▼ attempts exhausted
//!                               Error
//! ```
//!
//! A connection task is spawned per `connect()` and owns the link. It is the
//! only writer to the socket: multiplexer commands, heartbeat pings and the
//! handshake all go through it.
//!
//! Every state change made by the task is checked against its cancellation
//! token under the state lock, and `disconnect()` cancels under that same
//! lock, so a task that has been told to stop can never overwrite the state
//! set by the caller. Market updates are dispatched under a delivery lock
//! that `disconnect()` waits on after cancelling, so no update reaches the
//! bus once `disconnect()` has returned.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    ConnectionStatusSource, FeedConnector, FeedLink, FrameSink, FrameStream, SessionStore,
    TransportError,
};
use crate::application::services::event_bus::{EventBus, FeedEvent};
use crate::application::services::multiplexer::{OutboundReceiver, SubscriptionMultiplexer};
use crate::domain::connection::{ConnectionState, ConnectionStatus};
use crate::infrastructure::config::WebSocketSettings;
use crate::infrastructure::feed::codec::JsonCodec;
use crate::infrastructure::feed::heartbeat::{
    HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState,
};
use crate::infrastructure::feed::messages::{ClientFrame, ServerFrame};
use crate::infrastructure::feed::reconnect::{ReconnectConfig, ReconnectError, ReconnectPolicy};
use crate::infrastructure::metrics;

/// Upper bound on draining queued commands when the link is closed on purpose.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// Configuration
// =============================================================================

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Liveness probing.
    pub heartbeat: HeartbeatConfig,
    /// Backoff between link attempts.
    pub reconnect: ReconnectConfig,
    /// How long the server has to answer `hello`.
    pub handshake_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectionConfig {
    /// Create configuration from `WebSocketSettings`.
    #[must_use]
    pub const fn from_websocket_settings(settings: &WebSocketSettings) -> Self {
        Self {
            heartbeat: HeartbeatConfig::from_websocket_settings(settings),
            reconnect: ReconnectConfig::from_websocket_settings(settings),
            handshake_timeout: settings.handshake_timeout,
        }
    }
}

// =============================================================================
// Connection Manager
// =============================================================================

/// Single-link feed connection with handshake, replay and reconnection.
pub struct ConnectionManager {
    connector: Arc<dyn FeedConnector>,
    session: Arc<dyn SessionStore>,
    mux: Arc<SubscriptionMultiplexer>,
    bus: Arc<EventBus>,
    config: ConnectionConfig,
    codec: JsonCodec,
    state: RwLock<ConnectionState>,
    cancel: Mutex<Option<CancellationToken>>,
    outbound: tokio::sync::Mutex<OutboundReceiver>,
    /// Held while a market update is dispatched.
    delivery: ReentrantMutex<()>,
    protocol_errors: AtomicU64,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.connector.endpoint())
            .field("state", &*self.state.read())
            .field("protocol_errors", &self.protocol_errors())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager. The persisted session id, if any, is loaded now and
    /// offered in the first `hello`.
    #[must_use]
    pub fn new(
        connector: Arc<dyn FeedConnector>,
        session: Arc<dyn SessionStore>,
        mux: Arc<SubscriptionMultiplexer>,
        outbound: OutboundReceiver,
        bus: Arc<EventBus>,
        config: ConnectionConfig,
    ) -> Self {
        let state = ConnectionState::with_connection_id(session.load());
        Self {
            connector,
            session,
            mux,
            bus,
            config,
            codec: JsonCodec::new(),
            state: RwLock::new(state),
            cancel: Mutex::new(None),
            outbound: tokio::sync::Mutex::new(outbound),
            delivery: ReentrantMutex::new(()),
            protocol_errors: AtomicU64::new(0),
        }
    }

    /// Start the connection task.
    ///
    /// Returns `false` without doing anything if a task is already
    /// connecting, connected or reconnecting.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn connect(self: &Arc<Self>) -> bool {
        let cancel = {
            let mut state = self.state.write();
            if state.status.is_active() {
                tracing::debug!(status = %state.status, "Connect ignored, link already active");
                return false;
            }

            state.status = ConnectionStatus::Connecting;
            state.reconnect_attempt = 0;
            state.last_error = None;

            let cancel = CancellationToken::new();
            if let Some(previous) = self.cancel.lock().replace(cancel.clone()) {
                previous.cancel();
            }
            cancel
        };

        metrics::set_connection_status(ConnectionStatus::Connecting);
        tracing::info!(endpoint = %self.connector.endpoint(), "Connecting to market feed");

        tokio::spawn(Arc::clone(self).run(cancel));
        true
    }

    /// Close the link and stop reconnecting.
    ///
    /// The subscription registry is kept, so a later `connect()` replays it.
    pub fn disconnect(&self) {
        let previous = {
            let mut state = self.state.write();
            if let Some(cancel) = self.cancel.lock().take() {
                cancel.cancel();
            }

            let previous = state.status;
            state.status = ConnectionStatus::Disconnected;
            state.reconnect_attempt = 0;
            state.latency_ms = None;
            self.mux.link_down();
            previous
        };

        // Wait out a market update the task is already dispatching.
        drop(self.delivery.lock());

        metrics::set_connection_status(ConnectionStatus::Disconnected);

        if previous != ConnectionStatus::Disconnected {
            tracing::info!(previous = %previous, "Market feed disconnected");
            self.bus.emit(&FeedEvent::Disconnected);
        }
    }

    /// Forget the session: the state returns to its initial value with no
    /// connection id. Intended for use after `disconnect()`.
    pub fn reset_state(&self) {
        *self.state.write() = ConnectionState::default();
    }

    /// Current state snapshot.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.read().clone()
    }

    /// Whether the handshake has completed on the current link.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected()
    }

    /// Current or last server-assigned session id.
    #[must_use]
    pub fn connection_id(&self) -> Option<String> {
        self.state.read().connection_id.clone()
    }

    /// Frames dropped at the codec boundary since creation.
    #[must_use]
    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    /// Apply `f` to the state unless `cancel` has fired.
    fn with_state<R>(
        &self,
        cancel: &CancellationToken,
        f: impl FnOnce(&mut ConnectionState) -> R,
    ) -> Option<R> {
        let mut state = self.state.write();
        if cancel.is_cancelled() {
            return None;
        }
        Some(f(&mut state))
    }

    fn record_protocol_error(&self, reason: &'static str) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
        metrics::record_protocol_error(reason);
    }

    // =========================================================================
    // Connection Task
    // =========================================================================

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        // A previous task may still be draining; it releases the queue once
        // it observes its own cancellation.
        let mut outbound = tokio::select! {
            () = cancel.cancelled() => return,
            guard = self.outbound.lock() => guard,
        };

        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            let error = match self.connect_once(&cancel, &mut outbound, &mut policy).await {
                Ok(()) => return,
                Err(e) => e,
            };
            if cancel.is_cancelled() {
                return;
            }

            let message = error.to_string();

            let Some(delay) = policy.next_delay() else {
                let failure = ReconnectError::MaxAttemptsExceeded {
                    attempts: policy.attempt_count(),
                    last_error: message,
                };
                let failure_message = failure.to_string();

                let applied = self.with_state(&cancel, |state| {
                    state.status = ConnectionStatus::Error;
                    state.last_error = Some(failure_message.clone());
                    state.latency_ms = None;
                    self.mux.link_down();
                });
                if applied.is_none() {
                    return;
                }

                metrics::set_connection_status(ConnectionStatus::Error);
                tracing::error!(error = %failure, "Giving up on market feed");
                self.bus.emit(&FeedEvent::ConnectionError {
                    message: failure_message,
                });
                return;
            };

            let attempt = policy.attempt_count();
            let applied = self.with_state(&cancel, |state| {
                state.status = ConnectionStatus::Reconnecting;
                state.reconnect_attempt = attempt;
                state.last_error = Some(message.clone());
                state.latency_ms = None;
                self.mux.link_down();
            });
            if applied.is_none() {
                return;
            }

            metrics::set_connection_status(ConnectionStatus::Reconnecting);
            metrics::record_reconnect();
            tracing::warn!(
                error = %message,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Market feed link lost, reconnecting"
            );
            self.bus.emit(&FeedEvent::Reconnecting { attempt, delay });

            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Open one link and serve it until it fails or the task is cancelled.
    ///
    /// `Ok` means the task was cancelled; every error is retryable.
    async fn connect_once(
        &self,
        cancel: &CancellationToken,
        outbound: &mut OutboundReceiver,
        policy: &mut ReconnectPolicy,
    ) -> Result<(), TransportError> {
        let FeedLink {
            mut sink,
            mut stream,
        } = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            link = self.connector.connect() => link?,
        };

        let connection_id = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            id = self.handshake(&mut sink, &mut stream) => id?,
        };

        if let Err(e) = self.session.save(&connection_id) {
            tracing::warn!(error = %e, "Failed to persist session id");
        }

        let Some((epoch, replayed)) = self.with_state(cancel, |state| {
            state.status = ConnectionStatus::Connected;
            state.connection_id = Some(connection_id.clone());
            state.last_connected_at = Some(Utc::now());
            state.last_error = None;
            state.reconnect_attempt = 0;
            self.mux.link_up()
        }) else {
            return Ok(());
        };

        policy.reset();
        metrics::set_connection_status(ConnectionStatus::Connected);

        self.flush_outbound(&mut sink, outbound, epoch).await?;

        tracing::info!(connection_id = %connection_id, epoch, replayed, "Market feed connected");
        self.bus.emit(&FeedEvent::Connected {
            connection_id,
            replayed,
        });

        self.run_session(cancel, sink, stream, outbound, epoch)
            .await
    }

    /// Send `hello` and wait for the `connection` reply.
    async fn handshake(
        &self,
        sink: &mut FrameSink,
        stream: &mut FrameStream,
    ) -> Result<String, TransportError> {
        let resume = self.state.read().connection_id.clone();
        self.send(sink, &ClientFrame::Hello {
            connection_id: resume,
        })
        .await?;

        let timeout = self.config.handshake_timeout;
        tokio::time::timeout(timeout, self.await_connection(stream))
            .await
            .map_err(|_| TransportError::HandshakeTimeout(timeout))?
    }

    async fn await_connection(&self, stream: &mut FrameStream) -> Result<String, TransportError> {
        while let Some(text) = stream.next().await {
            let text = text?;
            match self.codec.decode(&text) {
                Ok(ServerFrame::Connection { connection_id }) => return Ok(connection_id),
                Ok(ServerFrame::Error { code, message }) => {
                    tracing::warn!(code, message = %message, "Feed error during handshake");
                }
                Ok(frame) => {
                    tracing::debug!(
                        message_type = frame.message_type(),
                        "Ignoring frame before handshake"
                    );
                }
                Err(e) => {
                    self.record_protocol_error(e.reason());
                    tracing::warn!(error = %e, "Dropping malformed frame during handshake");
                }
            }
        }
        Err(TransportError::Closed)
    }

    /// Serve an established link.
    async fn run_session(
        &self,
        cancel: &CancellationToken,
        mut sink: FrameSink,
        mut stream: FrameStream,
        outbound: &mut OutboundReceiver,
        epoch: u64,
    ) -> Result<(), TransportError> {
        let heartbeat = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(4);
        let heartbeat_cancel = cancel.child_token();
        let _heartbeat_guard = heartbeat_cancel.clone().drop_guard();

        tokio::spawn(
            HeartbeatManager::new(
                self.config.heartbeat.clone(),
                Arc::clone(&heartbeat),
                heartbeat_tx,
                heartbeat_cancel,
            )
            .run(),
        );

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    self.close(&mut sink, outbound, epoch).await;
                    return Ok(());
                }

                Some(event) = heartbeat_rx.recv() => match event {
                    HeartbeatEvent::SendPing => self.send(&mut sink, &ClientFrame::Ping).await?,
                    HeartbeatEvent::Timeout => {
                        return Err(TransportError::LivenessFailure(self.config.heartbeat.pong_timeout));
                    }
                },

                Some(command) = outbound.recv() => {
                    if command.epoch == epoch {
                        self.send(&mut sink, &ClientFrame::from_command(&command)).await?;
                    } else {
                        tracing::trace!(key = %command.key, epoch = command.epoch, "Dropping stale command");
                    }
                }

                frame = stream.next() => match frame {
                    Some(Ok(text)) => self.handle_frame(cancel, &heartbeat, &text),
                    Some(Err(e)) => return Err(e),
                    None => return Err(TransportError::Closed),
                },
            }
        }
    }

    /// Send every queued command for `epoch` without waiting for more.
    async fn flush_outbound(
        &self,
        sink: &mut FrameSink,
        outbound: &mut OutboundReceiver,
        epoch: u64,
    ) -> Result<usize, TransportError> {
        let mut sent = 0;
        while let Ok(command) = outbound.try_recv() {
            if command.epoch != epoch {
                tracing::trace!(key = %command.key, epoch = command.epoch, "Dropping stale command");
                continue;
            }
            self.send(sink, &ClientFrame::from_command(&command)).await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Drain pending commands and close the sink on a deliberate disconnect.
    async fn close(&self, sink: &mut FrameSink, outbound: &mut OutboundReceiver, epoch: u64) {
        match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, self.flush_outbound(sink, outbound, epoch))
            .await
        {
            Ok(Ok(sent)) if sent > 0 => tracing::debug!(sent, "Flushed pending commands before close"),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "Failed to flush pending commands"),
            Err(_) => tracing::debug!("Timed out flushing pending commands"),
        }

        if let Ok(Err(e)) = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, sink.close()).await {
            tracing::debug!(error = %e, "Error closing feed link");
        }
    }

    fn handle_frame(&self, cancel: &CancellationToken, heartbeat: &HeartbeatState, text: &str) {
        let frame = match self.codec.decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.record_protocol_error(e.reason());
                tracing::warn!(error = %e, reason = e.reason(), "Dropping malformed frame");
                return;
            }
        };

        metrics::record_message_received(frame.message_type());

        if let Some(ack) = frame.ack() {
            self.mux.handle_ack(&ack);
            return;
        }

        match frame {
            ServerFrame::KlineUpdate {
                token,
                interval,
                data,
            } => {
                self.deliver(
                    cancel,
                    &FeedEvent::Kline {
                        token,
                        interval,
                        point: data,
                    },
                );
            }
            ServerFrame::TradeUpdate { token, data } => {
                self.deliver(cancel, &FeedEvent::Trade { token, tick: data });
            }
            ServerFrame::Pong => {
                let Some(latency) = heartbeat.record_pong() else {
                    tracing::trace!("Ignoring unsolicited pong");
                    return;
                };
                let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);

                if self
                    .with_state(cancel, |state| state.latency_ms = Some(latency_ms))
                    .is_some()
                {
                    metrics::record_latency(latency);
                    tracing::trace!(latency_ms, "Heartbeat round trip");
                    self.bus.emit(&FeedEvent::Latency { latency_ms });
                }
            }
            ServerFrame::Connection { connection_id } => {
                self.record_protocol_error("unexpected_connection");
                tracing::warn!(connection_id = %connection_id, "Unexpected connection frame");
            }
            ServerFrame::Error { code, message } => {
                tracing::warn!(code, message = %message, "Feed reported an error");
            }
            ServerFrame::Subscribed(_) | ServerFrame::Unsubscribed(_) => {}
        }
    }

    fn deliver(&self, cancel: &CancellationToken, event: &FeedEvent) {
        let _delivery = self.delivery.lock();
        if cancel.is_cancelled() {
            tracing::trace!(event = event.kind().as_str(), "Dropping update after disconnect");
            return;
        }
        self.bus.emit(event);
    }

    async fn send(&self, sink: &mut FrameSink, frame: &ClientFrame) -> Result<(), TransportError> {
        let text = self
            .codec
            .encode(frame)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        sink.send(text).await?;

        metrics::record_frame_sent(frame.op());
        tracing::trace!(op = frame.op(), "Frame sent");
        Ok(())
    }
}

impl ConnectionStatusSource for ConnectionManager {
    fn connection_state(&self) -> ConnectionState {
        self.state()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{MockSessionStore, SessionError};
    use crate::application::services::event_bus::{EventKind, listener};
    use crate::domain::market::{Channel, Interval};
    use crate::infrastructure::feed::loopback::{LoopbackConnector, LoopbackServer};
    use crate::infrastructure::session::MemorySessionStore;

    const WAIT: Duration = Duration::from_secs(2);

    const KLINE: &str = r#"{"type":"kline_update","token":"SOL","interval":"1m","data":{
        "timestamp":60000,"open":"1.0","high":"1.2","low":"0.9","close":"1.1","volume":"100"}}"#;

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            heartbeat: HeartbeatConfig::new(Duration::from_secs(3600), Duration::from_secs(5)),
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                multiplier: 2.0,
                jitter_factor: 0.0,
                max_attempts: 3,
            },
            handshake_timeout: Duration::from_millis(200),
        }
    }

    struct Harness {
        manager: Arc<ConnectionManager>,
        mux: Arc<SubscriptionMultiplexer>,
        server: LoopbackServer,
        events: mpsc::UnboundedReceiver<FeedEvent>,
    }

    fn harness(config: ConnectionConfig, session: Arc<dyn SessionStore>) -> Harness {
        let (connector, server) = LoopbackConnector::new();
        let (mux, outbound) = SubscriptionMultiplexer::new();
        let mux = Arc::new(mux);
        let bus = Arc::new(EventBus::new());
        let events = record_events(&bus);

        let manager = Arc::new(ConnectionManager::new(
            Arc::new(connector),
            session,
            Arc::clone(&mux),
            outbound,
            bus,
            config,
        ));

        Harness {
            manager,
            mux,
            server,
            events,
        }
    }

    fn record_events(bus: &EventBus) -> mpsc::UnboundedReceiver<FeedEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        for kind in EventKind::all() {
            let tx = tx.clone();
            bus.on(
                *kind,
                listener(move |event| {
                    let _ = tx.send(event.clone());
                }),
            );
        }
        rx
    }

    async fn next_matching(
        events: &mut mpsc::UnboundedReceiver<FeedEvent>,
        predicate: impl Fn(&FeedEvent) -> bool,
    ) -> FeedEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = events.recv().await.expect("bus dropped");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn is_connected(event: &FeedEvent) -> bool {
        matches!(event, FeedEvent::Connected { .. })
    }

    fn subscribes(frames: &[ClientFrame]) -> usize {
        frames
            .iter()
            .filter(|f| matches!(f, ClientFrame::Subscribe(_)))
            .count()
    }

    #[tokio::test]
    async fn handshake_persists_connection_id() {
        let session = Arc::new(MemorySessionStore::new());
        let mut h = harness(test_config(), session.clone());

        assert!(h.manager.connect());
        let event = next_matching(&mut h.events, is_connected).await;

        assert_eq!(
            event,
            FeedEvent::Connected {
                connection_id: "loopback-1".to_string(),
                replayed: 0,
            }
        );
        assert_eq!(session.load().as_deref(), Some("loopback-1"));
        assert!(h.manager.is_connected());
        assert!(h.manager.state().last_connected_at.is_some());
        assert_eq!(
            h.server.frames()[0],
            ClientFrame::Hello {
                connection_id: None
            }
        );

        h.manager.disconnect();
    }

    #[tokio::test]
    async fn persisted_session_is_offered_in_hello() {
        let session = Arc::new(MemorySessionStore::with_connection_id("c-9"));
        let mut h = harness(test_config(), session);

        assert_eq!(h.manager.connection_id().as_deref(), Some("c-9"));
        h.manager.connect();
        next_matching(&mut h.events, is_connected).await;

        assert_eq!(
            h.server.frames()[0],
            ClientFrame::Hello {
                connection_id: Some("c-9".to_string())
            }
        );
        assert_eq!(h.manager.connection_id().as_deref(), Some("c-9"));

        h.manager.disconnect();
    }

    #[tokio::test]
    async fn connect_is_idempotent_while_active() {
        let mut h = harness(test_config(), Arc::new(MemorySessionStore::new()));

        assert!(h.manager.connect());
        assert!(!h.manager.connect());
        next_matching(&mut h.events, is_connected).await;
        assert!(!h.manager.connect());

        assert_eq!(h.server.connections(), 1);
        h.manager.disconnect();
    }

    #[tokio::test]
    async fn replay_completes_before_connected_is_emitted() {
        let mut h = harness(test_config(), Arc::new(MemorySessionStore::new()));
        h.mux.subscribe(
            "SOL",
            &[Channel::Kline, Channel::Trade],
            &[Interval::OneMinute, Interval::FiveMinutes],
        );

        let seen_at_connected = Arc::new(Mutex::new(Vec::new()));
        {
            let server = h.server.clone();
            let seen = Arc::clone(&seen_at_connected);
            h.manager.bus.on(
                EventKind::Connected,
                listener(move |_| *seen.lock() = server.frames()),
            );
        }

        h.manager.connect();
        let event = next_matching(&mut h.events, is_connected).await;

        assert!(matches!(event, FeedEvent::Connected { replayed: 3, .. }));
        let frames = seen_at_connected.lock().clone();
        assert_eq!(frames.len(), 4);
        assert!(matches!(frames[0], ClientFrame::Hello { .. }));
        assert_eq!(subscribes(&frames), 3);

        h.manager.disconnect();
    }

    #[tokio::test]
    async fn dropped_link_reconnects_and_replays_once() {
        let mut h = harness(test_config(), Arc::new(MemorySessionStore::new()));
        h.mux
            .subscribe("SOL", &[Channel::Kline], &[Interval::OneMinute, Interval::OneHour]);

        h.manager.connect();
        next_matching(&mut h.events, is_connected).await;
        h.server.clear_frames();

        h.server.drop_connection();

        let reconnecting =
            next_matching(&mut h.events, |e| matches!(e, FeedEvent::Reconnecting { .. })).await;
        assert!(matches!(reconnecting, FeedEvent::Reconnecting { attempt: 1, .. }));

        let connected = next_matching(&mut h.events, is_connected).await;
        assert_eq!(
            connected,
            FeedEvent::Connected {
                connection_id: "loopback-1".to_string(),
                replayed: 2,
            }
        );

        let frames = h.server.frames();
        assert_eq!(
            frames[0],
            ClientFrame::Hello {
                connection_id: Some("loopback-1".to_string())
            }
        );
        assert_eq!(subscribes(&frames), 2);
        assert_eq!(h.manager.state().reconnect_attempt, 0);

        h.manager.disconnect();
    }

    #[tokio::test]
    async fn exhausted_attempts_end_in_error() {
        let mut h = harness(test_config(), Arc::new(MemorySessionStore::new()));
        h.server.refuse_all(true);

        h.manager.connect();

        for expected in 1..=3 {
            let event =
                next_matching(&mut h.events, |e| matches!(e, FeedEvent::Reconnecting { .. })).await;
            assert!(matches!(event, FeedEvent::Reconnecting { attempt, .. } if attempt == expected));
        }
        let failure = next_matching(&mut h.events, |e| {
            matches!(e, FeedEvent::ConnectionError { .. })
        })
        .await;

        assert!(matches!(failure, FeedEvent::ConnectionError { message } if message.contains("maximum reconnection attempts (3)")));
        assert_eq!(h.manager.state().status, ConnectionStatus::Error);

        h.server.refuse_all(false);
        assert!(h.manager.connect());
        next_matching(&mut h.events, is_connected).await;
        h.manager.disconnect();
    }

    #[tokio::test]
    async fn unanswered_hello_times_out() {
        let mut h = harness(test_config(), Arc::new(MemorySessionStore::new()));
        h.server.manual_handshake(true);

        h.manager.connect();
        next_matching(&mut h.events, |e| matches!(e, FeedEvent::Reconnecting { .. })).await;

        let state = h.manager.state();
        assert_eq!(state.status, ConnectionStatus::Reconnecting);
        assert!(
            state
                .last_error
                .is_some_and(|e| e.contains("handshake timed out"))
        );

        h.manager.disconnect();
    }

    #[tokio::test]
    async fn disconnect_keeps_registry_and_stops_link() {
        let mut h = harness(test_config(), Arc::new(MemorySessionStore::new()));
        h.mux.subscribe("SOL", &[Channel::Trade], &[]);

        h.manager.connect();
        next_matching(&mut h.events, is_connected).await;

        h.manager.disconnect();
        let event = next_matching(&mut h.events, |e| matches!(e, FeedEvent::Disconnected)).await;
        assert_eq!(event, FeedEvent::Disconnected);

        assert_eq!(h.manager.state().status, ConnectionStatus::Disconnected);
        assert!(!h.mux.is_link_up());
        assert_eq!(h.mux.subscriptions().len(), 1);

        h.manager.disconnect();
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn updates_are_not_delivered_after_cancel() {
        let mut h = harness(test_config(), Arc::new(MemorySessionStore::new()));
        let cancel = CancellationToken::new();
        let heartbeat = HeartbeatState::new();

        h.manager.handle_frame(&cancel, &heartbeat, KLINE);
        assert!(matches!(h.events.try_recv(), Ok(FeedEvent::Kline { .. })));

        cancel.cancel();
        h.manager.handle_frame(&cancel, &heartbeat, KLINE);
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn listener_may_disconnect_during_delivery() {
        let mut h = harness(test_config(), Arc::new(MemorySessionStore::new()));
        let weak = Arc::downgrade(&h.manager);
        h.manager.bus.on(
            EventKind::Kline,
            listener(move |_| {
                if let Some(manager) = weak.upgrade() {
                    manager.disconnect();
                }
            }),
        );

        h.manager.connect();
        next_matching(&mut h.events, is_connected).await;
        assert!(h.server.push(KLINE));

        next_matching(&mut h.events, |e| matches!(e, FeedEvent::Disconnected)).await;
        assert_eq!(h.manager.state().status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn malformed_frame_is_counted_and_stream_continues() {
        let mut h = harness(test_config(), Arc::new(MemorySessionStore::new()));

        h.manager.connect();
        next_matching(&mut h.events, is_connected).await;

        assert!(h.server.push("{not json"));
        assert!(h.server.push(r#"{"type":"mystery"}"#));
        assert!(h.server.push(KLINE));

        let event = next_matching(&mut h.events, |e| matches!(e, FeedEvent::Kline { .. })).await;
        assert!(matches!(event, FeedEvent::Kline { interval: Interval::OneMinute, .. }));
        assert_eq!(h.manager.protocol_errors(), 2);
        assert!(h.manager.is_connected());

        h.manager.disconnect();
    }

    #[tokio::test]
    async fn silent_server_triggers_liveness_failure() {
        let config = ConnectionConfig {
            heartbeat: HeartbeatConfig::new(Duration::from_millis(30), Duration::from_millis(20)),
            ..test_config()
        };
        let mut h = harness(config, Arc::new(MemorySessionStore::new()));
        h.server.silent(true);

        h.manager.connect();
        next_matching(&mut h.events, is_connected).await;
        next_matching(&mut h.events, |e| matches!(e, FeedEvent::Reconnecting { .. })).await;

        assert!(
            h.manager
                .state()
                .last_error
                .is_some_and(|e| e.contains("liveness failure"))
        );

        h.manager.disconnect();
    }

    #[tokio::test]
    async fn pong_records_latency() {
        let config = ConnectionConfig {
            heartbeat: HeartbeatConfig::new(Duration::from_millis(20), Duration::from_secs(1)),
            ..test_config()
        };
        let mut h = harness(config, Arc::new(MemorySessionStore::new()));

        h.manager.connect();
        next_matching(&mut h.events, |e| matches!(e, FeedEvent::Latency { .. })).await;

        assert!(h.manager.state().latency_ms.is_some());
        assert!(h.server.frames().contains(&ClientFrame::Ping));

        h.manager.disconnect();
        assert_eq!(h.manager.state().latency_ms, None);
    }

    #[tokio::test]
    async fn failed_session_save_is_not_fatal() {
        let mut session = MockSessionStore::new();
        session.expect_load().return_const(None);
        session
            .expect_save()
            .times(1)
            .returning(|_| Err(SessionError::Io(std::io::Error::other("disk full"))));

        let mut h = harness(test_config(), Arc::new(session));

        h.manager.connect();
        next_matching(&mut h.events, is_connected).await;

        assert!(h.manager.is_connected());
        assert_eq!(h.manager.connection_id().as_deref(), Some("loopback-1"));

        h.manager.disconnect();
    }

    #[tokio::test]
    async fn reset_state_forgets_session() {
        let mut h = harness(test_config(), Arc::new(MemorySessionStore::new()));

        h.manager.connect();
        next_matching(&mut h.events, is_connected).await;
        h.manager.disconnect();
        h.manager.reset_state();

        assert_eq!(h.manager.state(), ConnectionState::default());
    }
}
