//! Feed Configuration Settings
//!
//! Configuration types for the market feed, loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::domain::market::{Interval, Token};

/// Connection timing and reconnect settings.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// How long to wait for a pong before declaring the link dead.
    pub pong_timeout: Duration,
    /// How long to wait for the server's `connection` frame.
    pub handshake_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            reconnect_delay_initial: Duration::from_millis(1000),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 10,
        }
    }
}

/// Routes that keep the connection alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSettings {
    /// Route prefixes on which the feed stays connected.
    pub keep_alive_prefixes: Vec<String>,
}

impl Default for RouteSettings {
    fn default() -> Self {
        Self {
            keep_alive_prefixes: vec!["/trade".to_string(), "/token".to_string()],
        }
    }
}

impl RouteSettings {
    /// Whether `route` should keep the feed connected.
    #[must_use]
    pub fn keeps_alive(&self, route: &str) -> bool {
        self.keep_alive_prefixes
            .iter()
            .any(|prefix| route.starts_with(prefix.as_str()))
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete feed configuration.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Feed WebSocket endpoint.
    pub url: Url,
    /// Connection settings.
    pub websocket: WebSocketSettings,
    /// Keep-alive routes.
    pub routes: RouteSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Where to persist the connection id (`None` keeps it in memory).
    pub session_file: Option<PathBuf>,
    /// Tokens the binary watches.
    pub tokens: Vec<Token>,
    /// Candle intervals the binary watches.
    pub intervals: Vec<Interval>,
}

impl FeedConfig {
    /// Configuration with defaults for everything but the endpoint.
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            url,
            websocket: WebSocketSettings::default(),
            routes: RouteSettings::default(),
            server: ServerSettings::default(),
            session_file: None,
            tokens: Vec::new(),
            intervals: vec![Interval::OneMinute],
        }
    }

    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `MARKET_FEED_URL` is missing, empty or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if `MARKET_FEED_URL` is missing, empty or invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_url = lookup("MARKET_FEED_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("MARKET_FEED_URL".to_string()))?;

        if raw_url.trim().is_empty() {
            return Err(ConfigError::EmptyValue("MARKET_FEED_URL".to_string()));
        }

        let url = Url::parse(raw_url.trim()).map_err(|e| ConfigError::InvalidUrl {
            key: "MARKET_FEED_URL".to_string(),
            reason: e.to_string(),
        })?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidUrl {
                key: "MARKET_FEED_URL".to_string(),
                reason: format!("unsupported scheme {}", url.scheme()),
            });
        }

        let defaults = WebSocketSettings::default();
        let websocket = WebSocketSettings {
            heartbeat_interval: parse_duration_secs(
                &lookup,
                "MARKET_FEED_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            ),
            pong_timeout: parse_duration_secs(
                &lookup,
                "MARKET_FEED_PONG_TIMEOUT_SECS",
                defaults.pong_timeout,
            ),
            handshake_timeout: parse_duration_secs(
                &lookup,
                "MARKET_FEED_HANDSHAKE_TIMEOUT_SECS",
                defaults.handshake_timeout,
            ),
            reconnect_delay_initial: parse_duration_millis(
                &lookup,
                "MARKET_FEED_RECONNECT_DELAY_INITIAL_MS",
                defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_duration_secs(
                &lookup,
                "MARKET_FEED_RECONNECT_DELAY_MAX_SECS",
                defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_value(
                &lookup,
                "MARKET_FEED_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: parse_value(
                &lookup,
                "MARKET_FEED_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
        };

        let routes = lookup("MARKET_FEED_KEEP_ALIVE_ROUTES").map_or_else(
            RouteSettings::default,
            |raw| RouteSettings {
                keep_alive_prefixes: split_list(&raw),
            },
        );

        let server = ServerSettings {
            health_port: parse_value(
                &lookup,
                "MARKET_FEED_HEALTH_PORT",
                ServerSettings::default().health_port,
            ),
        };

        let session_file = lookup("MARKET_FEED_SESSION_FILE")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let tokens = lookup("MARKET_FEED_TOKENS")
            .map(|raw| split_list(&raw))
            .unwrap_or_default();

        let intervals = lookup("MARKET_FEED_INTERVALS")
            .map(|raw| parse_intervals(&raw))
            .filter(|parsed| !parsed.is_empty())
            .unwrap_or_else(|| vec![Interval::OneMinute]);

        Ok(Self {
            url,
            websocket,
            routes,
            server,
            session_file,
            tokens,
            intervals,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Endpoint could not be parsed or has the wrong scheme.
    #[error("invalid URL in {key}: {reason}")]
    InvalidUrl {
        /// Variable name.
        key: String,
        /// Parse failure.
        reason: String,
    },
}

fn parse_value<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_duration_secs<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_duration_millis<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_intervals(raw: &str) -> Vec<Interval> {
    split_list(raw)
        .into_iter()
        .filter_map(|name| match name.parse() {
            Ok(interval) => Some(interval),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unknown interval");
                None
            }
        })
        .collect()
}
