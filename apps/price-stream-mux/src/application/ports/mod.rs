//! Port Interfaces
//!
//! Defines the interfaces (ports) between the multiplexer and the outside
//! world following the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - `FeedConnector`: Opens one streaming connection to the market-data feed
//! - `FeedConnection`: An open connection: send instructions, receive frames
//!
//! ## Driver Ports (Inbound)
//!
//! - `SessionHooks`: What the connection manager calls back into while a
//!   session is running (replay, frames, status)

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::streaming::ConnectionState;
use crate::domain::subscription::WireInstruction;

// =============================================================================
// Transport Errors
// =============================================================================

/// Errors raised by a feed transport.
///
/// These never reach consumers; they drive the connection state machine.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Handshake did not complete in time.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(std::time::Duration),

    /// No pong or data within the heartbeat timeout.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    /// Instruction could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,
}

impl TransportError {
    /// Short label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionFailed(_) => "connection_failed",
            Self::WebSocket(_) => "websocket",
            Self::HandshakeTimeout(_) => "handshake_timeout",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Encode(_) => "encode",
            Self::ConnectionClosed => "connection_closed",
        }
    }
}

// =============================================================================
// Feed Transport
// =============================================================================

/// Opens connections to the upstream feed.
#[async_trait]
pub trait FeedConnector: Send + Sync + 'static {
    /// Open one connection and complete the handshake.
    async fn connect(&self) -> Result<Box<dyn FeedConnection>, TransportError>;
}

/// One open streaming connection.
#[async_trait]
pub trait FeedConnection: Send {
    /// Send one instruction.
    async fn send(&mut self, instruction: &WireInstruction) -> Result<(), TransportError>;

    /// Wait for the next inbound text frame.
    ///
    /// Returns `None` once the stream has ended. Must be cancel safe: the
    /// connection manager polls it inside `tokio::select!`.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    /// Close the connection.
    async fn close(&mut self);
}

// =============================================================================
// Session Hooks
// =============================================================================

/// Callbacks from the connection manager into the multiplexer.
pub trait SessionHooks: Send + Sync + 'static {
    /// A connection has completed its handshake.
    ///
    /// The hook installs `link` as the outbound path for batch flushes and
    /// enqueues the replay of the full interest set on it before any flush
    /// can.
    fn on_connected(&self, link: mpsc::UnboundedSender<WireInstruction>);

    /// The connection is gone; stop routing flushes to it.
    fn on_link_lost(&self);

    /// An inbound text frame arrived.
    fn on_frame(&self, text: &str);

    /// The connection state changed.
    fn on_state_change(
        &self,
        previous: ConnectionState,
        state: ConnectionState,
        attempt: u32,
        reason: Option<String>,
    );
}
