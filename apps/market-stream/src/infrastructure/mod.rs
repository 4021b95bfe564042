//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the composition root.

/// Environment configuration.
pub mod config;

/// Feed transport, codec and connection management.
pub mod feed;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Composition root wiring the subscription core together.
pub mod runtime;

/// Session id persistence.
pub mod session;

/// OpenTelemetry tracing integration.
pub mod telemetry;
