//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `FeedConnector`: Opens a text-frame link to the market data feed
//! - `SessionStore`: Persists the server-assigned connection id
//!
//! ## Driver Ports (Inbound)
//!
//! - `ConnectionStatusSource`: Read-only connection state for consumers

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream};

use crate::domain::connection::ConnectionState;

// =============================================================================
// Transport
// =============================================================================

/// Failures of the underlying transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Opening the connection failed.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// Writing a frame failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Reading from the link failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// The peer closed the link.
    #[error("connection closed")]
    Closed,

    /// Handshake did not complete in time.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(std::time::Duration),

    /// No pong arrived within the liveness window.
    #[error("liveness failure: no pong within {0:?}")]
    LivenessFailure(std::time::Duration),
}

/// Outbound half of a feed link: accepts encoded text frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half of a feed link: yields encoded text frames until closed.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// An open, bidirectional text-frame link to the feed.
pub struct FeedLink {
    /// Frames to the server.
    pub sink: FrameSink,
    /// Frames from the server.
    pub stream: FrameStream,
}

impl std::fmt::Debug for FeedLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedLink").finish_non_exhaustive()
    }
}

/// Opens links to the market data feed.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    /// Open a new link.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectFailed` if the link cannot be opened.
    async fn connect(&self) -> Result<FeedLink, TransportError>;

    /// Human-readable endpoint for logs.
    fn endpoint(&self) -> String;
}

// =============================================================================
// Session
// =============================================================================

/// Session persistence failures.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Filesystem error.
    #[error("session I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored session could not be encoded or decoded.
    #[error("session encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Persists the server-assigned connection id between runs.
#[cfg_attr(test, mockall::automock)]
pub trait SessionStore: Send + Sync {
    /// Load the last persisted connection id.
    fn load(&self) -> Option<String>;

    /// Persist a connection id.
    ///
    /// # Errors
    ///
    /// Returns `SessionError` if the id cannot be written.
    fn save(&self, connection_id: &str) -> Result<(), SessionError>;

    /// Forget the persisted connection id.
    ///
    /// # Errors
    ///
    /// Returns `SessionError` if the stored id cannot be removed.
    fn clear(&self) -> Result<(), SessionError>;
}

// =============================================================================
// Status
// =============================================================================

/// Read-only access to the connection state.
pub trait ConnectionStatusSource: Send + Sync {
    /// Current connection state snapshot.
    fn connection_state(&self) -> ConnectionState;
}
