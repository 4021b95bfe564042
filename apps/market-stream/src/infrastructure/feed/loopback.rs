//! Loopback Transport
//!
//! In-memory [`FeedConnector`] for tests and dry runs. Each `connect()`
//! opens a fresh pair of channels; the paired [`LoopbackServer`] plays the
//! feed's side: it answers `hello` and `ping`, records every client frame
//! and can inject server frames or drop the link on demand.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::future;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::application::ports::{FeedConnector, FeedLink, TransportError};
use crate::infrastructure::feed::messages::ClientFrame;

type ServerSender = mpsc::UnboundedSender<Result<String, TransportError>>;

#[derive(Debug, Default)]
struct Shared {
    frames: Mutex<Vec<String>>,
    current: Mutex<Option<ServerSender>>,
    connections: AtomicUsize,
    refuse_next: AtomicUsize,
    refuse_all: AtomicBool,
    manual_handshake: AtomicBool,
    silent: AtomicBool,
    changed: Notify,
}

/// Client half: hand this to the connection manager.
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    shared: Arc<Shared>,
}

/// Server half: drive the feed's side of the link.
#[derive(Debug, Clone)]
pub struct LoopbackServer {
    shared: Arc<Shared>,
}

impl LoopbackConnector {
    /// Create a connected connector/server pair.
    #[must_use]
    pub fn new() -> (Self, LoopbackServer) {
        let shared = Arc::new(Shared::default());
        (
            Self {
                shared: Arc::clone(&shared),
            },
            LoopbackServer { shared },
        )
    }
}

#[async_trait]
impl FeedConnector for LoopbackConnector {
    async fn connect(&self) -> Result<FeedLink, TransportError> {
        let shared = &self.shared;

        if shared.refuse_all.load(Ordering::SeqCst)
            || shared
                .refuse_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            shared.changed.notify_waiters();
            return Err(TransportError::ConnectFailed("loopback refused".to_string()));
        }

        let number = shared.connections.fetch_add(1, Ordering::SeqCst) + 1;
        let (client_tx, mut client_rx) = mpsc::unbounded::<String>();
        let (server_tx, server_rx) = mpsc::unbounded();

        if let Some(previous) = shared.current.lock().replace(server_tx.clone()) {
            previous.close_channel();
        }

        // Frames are recorded as they enter the sink, before the caller's
        // send completes.
        let recorder = Arc::clone(shared);
        let sink = client_tx
            .sink_map_err(|e| TransportError::SendFailed(e.to_string()))
            .with(move |text: String| {
                recorder.frames.lock().push(text.clone());
                recorder.changed.notify_waiters();
                future::ready(Ok::<_, TransportError>(text))
            });

        let responder = Arc::clone(shared);
        tokio::spawn(async move {
            while let Some(text) = client_rx.next().await {
                let reply = match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(ClientFrame::Hello { connection_id })
                        if !responder.manual_handshake.load(Ordering::SeqCst) =>
                    {
                        let id = connection_id.unwrap_or_else(|| format!("loopback-{number}"));
                        Some(format!(r#"{{"type":"connection","connectionId":"{id}"}}"#))
                    }
                    Ok(ClientFrame::Ping) if !responder.silent.load(Ordering::SeqCst) => {
                        Some(r#"{"type":"pong"}"#.to_string())
                    }
                    _ => None,
                };
                if let Some(reply) = reply {
                    let _ = server_tx.unbounded_send(Ok(reply));
                }
            }
        });

        shared.changed.notify_waiters();

        Ok(FeedLink {
            sink: Box::pin(sink),
            stream: Box::pin(server_rx),
        })
    }

    fn endpoint(&self) -> String {
        "loopback://feed".to_string()
    }
}

impl LoopbackServer {
    /// Send a raw text frame on the current link.
    ///
    /// Returns `false` if no link is open.
    pub fn push(&self, text: impl Into<String>) -> bool {
        self.shared
            .current
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.unbounded_send(Ok(text.into())).is_ok())
    }

    /// Close the current link from the server side.
    pub fn drop_connection(&self) {
        if let Some(tx) = self.shared.current.lock().take() {
            tx.close_channel();
        }
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next(&self, count: usize) {
        self.shared.refuse_next.store(count, Ordering::SeqCst);
    }

    /// Refuse every connection attempt until turned off.
    pub fn refuse_all(&self, refuse: bool) {
        self.shared.refuse_all.store(refuse, Ordering::SeqCst);
    }

    /// Stop answering `hello` automatically.
    pub fn manual_handshake(&self, manual: bool) {
        self.shared.manual_handshake.store(manual, Ordering::SeqCst);
    }

    /// Stop answering `ping`.
    pub fn silent(&self, silent: bool) {
        self.shared.silent.store(silent, Ordering::SeqCst);
    }

    /// Number of links opened so far.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Every frame the client has sent, oldest first.
    #[must_use]
    pub fn raw_frames(&self) -> Vec<String> {
        self.shared.frames.lock().clone()
    }

    /// Every decodable frame the client has sent, oldest first.
    #[must_use]
    pub fn frames(&self) -> Vec<ClientFrame> {
        self.shared
            .frames
            .lock()
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }

    /// Forget recorded frames.
    pub fn clear_frames(&self) {
        self.shared.frames.lock().clear();
    }

    /// Wait until `predicate` holds for the recorded frames.
    ///
    /// Returns `false` if `timeout` elapses first.
    pub async fn wait_for<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&[ClientFrame]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.changed.notified();
            if predicate(&self.frames()) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return predicate(&self.frames());
            }
        }
    }

    /// Wait until at least `count` links have been opened.
    pub async fn wait_for_connections(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.changed.notified();
            if self.connections() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.connections() >= count;
            }
        }
    }
}
