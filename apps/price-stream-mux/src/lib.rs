#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Price Stream Multiplexer
//!
//! One shared client that owns a single streaming connection to a market
//! data feed and fans price updates out to any number of independent
//! consumers, each interested in its own changing set of symbols.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types with no I/O
//!   - `symbols`: Alias canonicalization (`EUR/USD`, `FX:EURUSD` → `EURUSD`)
//!   - `subscription`: Reference-counted interest and pending wire diffs
//!   - `streaming`: Connection states, raw and enriched ticks
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Feed transport seam and session hooks
//!   - `services`: Multiplexer facade, batch scheduler, tick dispatcher
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `feed`: JSON codec, connection lifecycle, WebSocket transport
//!   - `cache`: Keyed TTL response cache
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!   - `metrics` / `telemetry`: Prometheus and OpenTelemetry
//!
//! # Data Flow
//!
//! ```text
//! Widget A ─┐ subscribe/unsubscribe            ┌──────────────┐
//! Widget B ─┼──────────► Registry ─► Batch ───►│  Connection  │◄──► Feed WS
//! Widget C ─┘                        Scheduler │   Manager    │
//!     ▲                                        └──────┬───────┘
//!     │              price callbacks                  │ frames
//!     └──────────────────── Dispatcher ◄──────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::streaming::{ConnectionState, PriceTick, RawTick, StatusEvent};
pub use domain::subscription::{InterestRegistry, InterestStats, PendingDiff, WireInstruction};
pub use domain::symbols::{AliasResolver, CanonicalSymbol};

// Ports
pub use application::ports::{FeedConnection, FeedConnector, SessionHooks, TransportError};

// Services
pub use application::services::{
    Callback, CallbackHandle, DispatchStats, Multiplexer, MultiplexerError, MultiplexerStats,
};

// Feed adapters
pub use infrastructure::feed::{
    HeartbeatConfig, JsonFrameCodec, ReconnectConfig, WebSocketConnector,
};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, FeedSettings, MultiplexerConfig, MultiplexerSettings, ServerSettings,
    ServiceConfig,
};

// Response cache
pub use infrastructure::cache::ResponseCache;

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
