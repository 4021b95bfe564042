//! Configuration Module
//!
//! Configuration loading for the market feed service.

mod settings;

pub use settings::{ConfigError, FeedConfig, RouteSettings, ServerSettings, WebSocketSettings};
