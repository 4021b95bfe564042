//! Connection State
//!
//! Process-wide view of the feed connection. Only the connection manager
//! mutates it; everything else reads clones.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle status of the feed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// No connection and none being attempted.
    #[default]
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Handshake complete, data flowing.
    Connected,
    /// Connection dropped, retrying with backoff.
    Reconnecting,
    /// Retries exhausted; needs an explicit connect.
    Error,
}

impl ConnectionStatus {
    /// Status name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }

    /// Whether a connection task is alive for this status.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }

    /// Numeric code used for the status gauge.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Reconnecting => 3,
            Self::Error => 4,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    /// Current lifecycle status.
    pub status: ConnectionStatus,
    /// Server-assigned session id, reloaded across restarts.
    pub connection_id: Option<String>,
    /// When the last handshake completed.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Last transport error, if any.
    pub last_error: Option<String>,
    /// Current reconnect attempt (0 when connected).
    pub reconnect_attempt: u32,
    /// Last measured ping round trip.
    pub latency_ms: Option<u64>,
}

impl ConnectionState {
    /// Initial state with a previously persisted session id.
    #[must_use]
    pub fn with_connection_id(connection_id: Option<String>) -> Self {
        Self {
            connection_id,
            ..Self::default()
        }
    }

    /// Whether the feed is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}
