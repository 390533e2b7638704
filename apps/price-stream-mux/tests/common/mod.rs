//! In-memory feed used by the integration tests.
//!
//! Every accepted connection hands the test a [`FeedSession`]: the
//! instructions the multiplexer sent, and a way to push frames or drop the
//! socket.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use price_stream_mux::{
    FeedConnection, FeedConnector, Multiplexer, MultiplexerConfig, PriceTick, ReconnectConfig,
    StatusEvent, TransportError, WireInstruction,
};

/// How long a test waits for something that should happen.
pub const WAIT: Duration = Duration::from_secs(2);

/// Server side of one fake connection.
pub struct FeedSession {
    sent: mpsc::UnboundedReceiver<WireInstruction>,
    frames: mpsc::UnboundedSender<Option<String>>,
}

impl FeedSession {
    /// Next instruction the multiplexer wrote to this connection.
    pub async fn next_instruction(&mut self) -> WireInstruction {
        timeout(WAIT, self.sent.recv())
            .await
            .expect("timed out waiting for an instruction")
            .expect("connection closed")
    }

    /// Instruction already written, if any.
    pub fn try_instruction(&mut self) -> Option<WireInstruction> {
        self.sent.try_recv().ok()
    }

    /// Push one inbound frame.
    pub fn push(&self, frame: &str) {
        let _ = self.frames.send(Some(frame.to_string()));
    }

    /// Drop the socket from the server side.
    pub fn drop_connection(&self) {
        let _ = self.frames.send(None);
    }
}

struct FakeConnection {
    sent: mpsc::UnboundedSender<WireInstruction>,
    frames: mpsc::UnboundedReceiver<Option<String>>,
}

#[async_trait]
impl FeedConnection for FakeConnection {
    async fn send(&mut self, instruction: &WireInstruction) -> Result<(), TransportError> {
        self.sent
            .send(instruction.clone())
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        match self.frames.recv().await {
            Some(Some(frame)) => Some(Ok(frame)),
            Some(None) | None => None,
        }
    }

    async fn close(&mut self) {
        self.frames.close();
    }
}

/// Connector that hands out in-memory connections.
pub struct FakeFeed {
    sessions: mpsc::UnboundedSender<FeedSession>,
    refuse: AtomicUsize,
    connects: AtomicUsize,
}

impl FakeFeed {
    /// Connector plus the stream of accepted sessions.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FeedSession>) {
        let (sessions, rx) = mpsc::unbounded_channel();
        let feed = Arc::new(Self {
            sessions,
            refuse: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
        });
        (feed, rx)
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next(&self, count: usize) {
        self.refuse.store(count, Ordering::SeqCst);
    }

    /// Connection attempts seen so far, refused ones included.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedConnector for FakeFeed {
    async fn connect(&self) -> Result<Box<dyn FeedConnection>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::ConnectionFailed("refused".to_string()));
        }

        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let _ = self.sessions.send(FeedSession {
            sent: sent_rx,
            frames: frames_tx,
        });

        Ok(Box::new(FakeConnection {
            sent: sent_tx,
            frames: frames_rx,
        }))
    }
}

/// Manual-flush configuration with fast, deterministic reconnects.
pub fn manual_config() -> MultiplexerConfig {
    MultiplexerConfig {
        batch_window: Duration::ZERO,
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            ..ReconnectConfig::default()
        }
        .without_jitter(),
        ..MultiplexerConfig::default()
    }
}

/// Next accepted session.
pub async fn next_session(sessions: &mut mpsc::UnboundedReceiver<FeedSession>) -> FeedSession {
    timeout(WAIT, sessions.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}

/// Collect every price tick into a channel.
pub fn tick_sink(mux: &Multiplexer) -> mpsc::UnboundedReceiver<PriceTick> {
    let (tx, rx) = mpsc::unbounded_channel();
    mux.on_price_update(Arc::new(move |tick: &PriceTick| {
        let _ = tx.send(tick.clone());
    }));
    rx
}

/// Collect every status event into a channel.
pub fn status_sink(mux: &Multiplexer) -> mpsc::UnboundedReceiver<StatusEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    mux.on_connection_status(Arc::new(move |event: &StatusEvent| {
        let _ = tx.send(event.clone());
    }));
    rx
}

/// Next item from a sink.
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("sink closed")
}

/// Instruction builder for assertions.
pub fn instruction(subscribe: &[&str], unsubscribe: &[&str]) -> WireInstruction {
    WireInstruction {
        subscribe: subscribe.iter().map(ToString::to_string).collect(),
        unsubscribe: unsubscribe.iter().map(ToString::to_string).collect(),
    }
}
