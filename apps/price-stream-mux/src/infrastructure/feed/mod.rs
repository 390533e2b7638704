//! Feed Adapters
//!
//! Everything that touches the upstream price feed:
//!
//! - **Codec**: Lenient JSON frame decoding, subscribe/unsubscribe encoding
//! - **Connection**: Session state machine with replay and backoff
//! - **WebSocket**: `tokio-tungstenite` transport with heartbeat

pub mod codec;
pub mod connection;
pub mod heartbeat;
pub mod reconnect;
pub mod websocket;

pub use codec::{CodecError, DecodedFrame, JsonFrameCodec};
pub use connection::{ConnectionConfig, ConnectionManager};
pub use heartbeat::{HeartbeatAction, HeartbeatConfig, HeartbeatMonitor};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use websocket::{WebSocketConnection, WebSocketConnector};
