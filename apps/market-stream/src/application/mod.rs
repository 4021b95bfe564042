//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (transport, session, status).
pub mod ports;

/// Application services: event bus, multiplexer, store and consumers.
pub mod services;
