//! WebSocket Feed Transport
//!
//! [`FeedConnector`] over `tokio-tungstenite` with rustls.
//!
//! # Protocol
//!
//! Outbound instructions are encoded with [`JsonFrameCodec`]. Inbound text
//! frames are passed through untouched; binary frames are accepted when they
//! hold UTF-8 JSON. Server pings are answered, and a client-side heartbeat
//! fails the connection when the feed goes silent.

use std::time::Instant;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::codec::{CodecError, JsonFrameCodec};
use super::heartbeat::{HeartbeatAction, HeartbeatConfig, HeartbeatMonitor};
use crate::application::ports::{FeedConnection, FeedConnector, TransportError};
use crate::domain::subscription::WireInstruction;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Connector
// =============================================================================

/// Opens WebSocket connections to the feed URL.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    heartbeat: HeartbeatConfig,
}

impl WebSocketConnector {
    /// Create a connector for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>, heartbeat: HeartbeatConfig) -> Self {
        Self {
            url: url.into(),
            heartbeat,
        }
    }

    /// Feed URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl FeedConnector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn FeedConnection>, TransportError> {
        tracing::info!(url = %self.url, "Connecting to price feed");

        let (stream, response) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        tracing::debug!(status = %response.status(), "WebSocket handshake complete");

        let (write, read) = stream.split();
        let monitor = HeartbeatMonitor::new(self.heartbeat.clone());
        let ping_timer = monitor.interval();

        Ok(Box::new(WebSocketConnection {
            write,
            read,
            codec: JsonFrameCodec::new(),
            monitor,
            ping_timer,
            closed: false,
        }))
    }
}

// =============================================================================
// Connection
// =============================================================================

/// One open WebSocket connection.
pub struct WebSocketConnection {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    codec: JsonFrameCodec,
    monitor: HeartbeatMonitor,
    ping_timer: Option<tokio::time::Interval>,
    closed: bool,
}

impl std::fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("monitor", &self.monitor)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

enum ReadEvent {
    Message(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
    HeartbeatTick,
}

impl WebSocketConnection {
    async fn next_event(&mut self) -> ReadEvent {
        match self.ping_timer.as_mut() {
            Some(timer) => tokio::select! {
                message = self.read.next() => ReadEvent::Message(message),
                _ = timer.tick() => ReadEvent::HeartbeatTick,
            },
            None => ReadEvent::Message(self.read.next().await),
        }
    }
}

#[async_trait]
impl FeedConnection for WebSocketConnection {
    async fn send(&mut self, instruction: &WireInstruction) -> Result<(), TransportError> {
        let messages = self.codec.encode(instruction).map_err(|error| match error {
            CodecError::Json(inner) => TransportError::Encode(inner),
            CodecError::InvalidFormat(reason) => TransportError::ConnectionFailed(reason),
        })?;

        for text in messages {
            tracing::trace!(message = %text, "Sending feed message");
            self.write.send(Message::Text(text.into())).await?;
        }

        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        if self.closed {
            return None;
        }

        loop {
            match self.next_event().await {
                ReadEvent::HeartbeatTick => match self.monitor.on_tick(Instant::now()) {
                    HeartbeatAction::SendPing => {
                        if let Err(error) = self.write.send(Message::Ping(vec![].into())).await {
                            return Some(Err(error.into()));
                        }
                    }
                    HeartbeatAction::Timeout => return Some(Err(TransportError::HeartbeatTimeout)),
                },
                ReadEvent::Message(None) => {
                    tracing::info!("WebSocket stream ended");
                    self.closed = true;
                    return None;
                }
                ReadEvent::Message(Some(Err(error))) => return Some(Err(error.into())),
                ReadEvent::Message(Some(Ok(message))) => {
                    self.monitor.record_activity(Instant::now());

                    match message {
                        Message::Text(text) => return Some(Ok(text.to_string())),
                        Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                            Ok(text) => return Some(Ok(text)),
                            Err(_) => tracing::debug!(
                                bytes = data.len(),
                                "Ignoring non-UTF-8 binary frame"
                            ),
                        },
                        Message::Ping(data) => {
                            if let Err(error) = self.write.send(Message::Pong(data)).await {
                                return Some(Err(error.into()));
                            }
                        }
                        Message::Close(frame) => {
                            tracing::info!(frame = ?frame, "Server sent close frame");
                            self.closed = true;
                            return None;
                        }
                        Message::Pong(_) | Message::Frame(_) => {}
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(error) = self.write.send(Message::Close(None)).await {
            tracing::debug!(error = %error, "Error sending close frame");
        }
        let _ = self.write.close().await;
    }
}

// =============================================================================
// Tests
// =============================================================================
