//! Domain Layer - Core market data types and subscription bookkeeping.
//!
//! This layer contains the core domain types for the feed with no I/O.
//! All types here are pure Rust with serialization support.

/// Connection lifecycle state.
pub mod connection;

/// Market data types (channels, intervals, candles, trades).
pub mod market;

/// Subscription keys and the ref-counted registry.
pub mod subscription;
