//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the multiplexer services and the port interfaces
//! that define how they talk to the feed transport.

/// Port interfaces for the feed transport and session callbacks.
pub mod ports;

/// Multiplexer services: batching, dispatch, callbacks and the facade.
pub mod services;
