//! Domain Layer - Core streaming types and business logic.
//!
//! This layer contains the core domain types for the price stream with no
//! I/O. All types here are pure Rust with serialization support.

/// Price ticks and connection status types.
pub mod streaming;

/// Reference-counted interest tracking and wire diffs.
pub mod subscription;

/// Symbol canonicalization across vendor spellings.
pub mod symbols;
