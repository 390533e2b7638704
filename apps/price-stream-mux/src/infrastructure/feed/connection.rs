//! Connection Manager
//!
//! Owns the lifecycle of the single upstream connection.
//!
//! # State Machine
//!
//! ```text
//!                connect()
//! Disconnected ────────────► Connecting ──handshake ok──► Connected
//!      ▲                      ▲     │                        │
//!      │ disconnect()         │     │ failed / timed out     │ socket lost
//!      │ (from any state)     │     ▼                        ▼
//!      └──────────────────    └── Error ◄────────────────────┘
//!                           backoff elapsed
//! ```
//!
//! One session task runs per `connect()`. It retries with exponential
//! backoff until it connects, is cancelled, or runs out of attempts. Every
//! state it publishes carries its generation; once `disconnect()` has
//! retired a session, nothing that session does can change the state again.
//!
//! On each successful handshake the manager hands a fresh outbound link to
//! [`SessionHooks::on_connected`], which queues the replay of the interest
//! set before publishing `Connected`.
//!
//! # Status Delivery
//!
//! Every state update is queued under the session lock, so the queue order
//! is the order the state actually changed in. Whoever finds the queue idle
//! drains it and calls [`SessionHooks::on_state_change`] with no lock held;
//! concurrent publishers only enqueue. Status callbacks therefore see one
//! consistent sequence even when `disconnect()` races the session task.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{FeedConnection, FeedConnector, SessionHooks, TransportError};
use crate::domain::streaming::ConnectionState;
use crate::domain::subscription::WireInstruction;
use crate::infrastructure::config::MultiplexerConfig;
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Upper bound on one handshake.
    pub handshake_timeout: Duration,
    /// Connected time after which the backoff schedule resets.
    pub stable_after: Duration,
    /// Reconnection backoff.
    pub reconnect: ReconnectConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from_multiplexer_config(&MultiplexerConfig::default())
    }
}

impl ConnectionConfig {
    /// Extract the connection settings from a multiplexer configuration.
    #[must_use]
    pub fn from_multiplexer_config(config: &MultiplexerConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout,
            stable_after: config.stable_after,
            reconnect: config.reconnect.clone(),
        }
    }
}

// =============================================================================
// Connection Manager
// =============================================================================

struct SessionSlot {
    generation: u64,
    cancel: CancellationToken,
    /// `None` while the session is being started.
    task: Option<JoinHandle<()>>,
}

impl SessionSlot {
    fn is_alive(&self) -> bool {
        self.task.as_ref().is_none_or(|task| !task.is_finished())
    }
}

struct StatusChange {
    previous: ConnectionState,
    state: ConnectionState,
    attempt: u32,
    reason: Option<String>,
}

#[derive(Default)]
struct StatusQueue {
    pending: VecDeque<StatusChange>,
    draining: bool,
}

struct Shared {
    connector: Arc<dyn FeedConnector>,
    hooks: Arc<dyn SessionHooks>,
    config: ConnectionConfig,
    state_tx: watch::Sender<ConnectionState>,
    session: Mutex<Option<SessionSlot>>,
    generation: AtomicU64,
    /// Locked after `session`, never before.
    status: Mutex<StatusQueue>,
}

/// Single-connection lifecycle manager.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager reporting to `hooks`; sessions are cancelled along
    /// with `cancel`.
    #[must_use]
    pub fn new(
        connector: Arc<dyn FeedConnector>,
        hooks: Arc<dyn SessionHooks>,
        config: ConnectionConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                connector,
                hooks,
                config,
                state_tx,
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                status: Mutex::new(StatusQueue::default()),
            }),
            cancel,
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Watch state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Whether a session task is running (connecting, connected or retrying).
    #[must_use]
    pub fn is_session_alive(&self) -> bool {
        self.shared
            .session
            .lock()
            .as_ref()
            .is_some_and(SessionSlot::is_alive)
    }

    /// Start a session unless one is already running, then wait for the
    /// first outcome.
    ///
    /// Resolves with `Connected` once a handshake completes, or with `Error`
    /// when the attempt fails (retries continue in the background).
    pub async fn connect(&self) -> ConnectionState {
        let mut state_rx = self.shared.state_tx.subscribe();

        let started = {
            let mut session = self.shared.session.lock();

            if session.as_ref().is_some_and(SessionSlot::is_alive) {
                None
            } else {
                let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let cancel = self.cancel.child_token();
                let previous = self.shared.transition(ConnectionState::Connecting, 0, None);

                *session = Some(SessionSlot {
                    generation,
                    cancel: cancel.clone(),
                    task: None,
                });
                Some((generation, cancel, previous))
            }
        };

        if let Some((generation, cancel, previous)) = started {
            tracing::info!(generation, previous = %previous, "Starting feed session");
            self.shared.deliver_status();

            let task = tokio::spawn(run_session(Arc::clone(&self.shared), generation, cancel));
            if let Some(slot) = self
                .shared
                .session
                .lock()
                .as_mut()
                .filter(|slot| slot.generation == generation)
            {
                slot.task = Some(task);
            }
        }

        state_rx
            .wait_for(|state| *state != ConnectionState::Connecting)
            .await
            .map_or(ConnectionState::Disconnected, |state| *state)
    }

    /// Tear the session down and enter `Disconnected` immediately.
    pub fn disconnect(&self) {
        let retired = {
            let mut session = self.shared.session.lock();
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
            self.shared.transition(
                ConnectionState::Disconnected,
                0,
                Some("disconnect requested".to_string()),
            );
            session.take()
        };

        if let Some(slot) = retired {
            tracing::info!(generation = slot.generation, "Disconnecting feed session");
            slot.cancel.cancel();
        }

        self.shared.hooks.on_link_lost();
        self.shared.deliver_status();
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(slot) = self.shared.session.lock().take() {
            slot.cancel.cancel();
        }
    }
}

// =============================================================================
// Session Task
// =============================================================================

impl Shared {
    /// Run `f` only if `generation` is still the live session.
    fn if_current<R>(&self, generation: u64, f: impl FnOnce() -> R) -> Option<R> {
        let session = self.session.lock();
        if session.as_ref().map(|slot| slot.generation) == Some(generation) {
            Some(f())
        } else {
            None
        }
    }

    /// Set the state and queue the status event. Caller holds `session`.
    fn transition(
        &self,
        state: ConnectionState,
        attempt: u32,
        reason: Option<String>,
    ) -> ConnectionState {
        let previous = self.state_tx.send_replace(state);
        metrics::set_connection_state(state);
        if previous != state {
            self.status.lock().pending.push_back(StatusChange {
                previous,
                state,
                attempt,
                reason,
            });
        }
        previous
    }

    /// Deliver queued status events in order, unless another caller
    /// already is.
    fn deliver_status(&self) {
        {
            let mut queue = self.status.lock();
            if queue.draining {
                return;
            }
            queue.draining = true;
        }

        loop {
            let next = {
                let mut queue = self.status.lock();
                let next = queue.pending.pop_front();
                queue.draining = next.is_some();
                next
            };
            let Some(change) = next else {
                return;
            };

            tracing::info!(
                from = %change.previous,
                to = %change.state,
                attempt = change.attempt,
                reason = change.reason.as_deref().unwrap_or(""),
                "Connection state changed"
            );
            self.hooks
                .on_state_change(change.previous, change.state, change.attempt, change.reason);
        }
    }

    fn publish(
        &self,
        generation: u64,
        state: ConnectionState,
        attempt: u32,
        reason: Option<String>,
    ) -> bool {
        if self
            .if_current(generation, || self.transition(state, attempt, reason))
            .is_none()
        {
            tracing::debug!(generation, state = %state, "Dropping state from retired session");
            return false;
        }

        self.deliver_status();
        true
    }
}

enum PumpEvent {
    Cancelled,
    Outbound(Option<WireInstruction>),
    Inbound(Option<Result<String, TransportError>>),
}

async fn run_session(shared: Arc<Shared>, generation: u64, cancel: CancellationToken) {
    let hooks = Arc::clone(&shared.hooks);
    let mut policy = ReconnectPolicy::new(shared.config.reconnect.clone());
    let mut attempt = 0_u32;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        // The first attempt was announced by `connect()`
        if attempt > 0
            && !shared.publish(generation, ConnectionState::Connecting, attempt, None)
        {
            return;
        }

        let handshake = tokio::select! {
            () = cancel.cancelled() => return,
            result = tokio::time::timeout(
                shared.config.handshake_timeout,
                shared.connector.connect(),
            ) => result,
        };

        let error = match handshake {
            Ok(Ok(mut connection)) => {
                let (link_tx, link_rx) = mpsc::unbounded_channel();

                if shared
                    .if_current(generation, || hooks.on_connected(link_tx))
                    .is_none()
                {
                    connection.close().await;
                    return;
                }
                if !shared.publish(generation, ConnectionState::Connected, attempt, None) {
                    connection.close().await;
                    return;
                }

                let connected_at = Instant::now();
                let outcome = pump(connection.as_mut(), link_rx, &*hooks, &cancel).await;
                shared.if_current(generation, || hooks.on_link_lost());

                let Some(error) = outcome else {
                    return;
                };

                if policy.session_ended(connected_at.elapsed(), shared.config.stable_after) {
                    tracing::debug!("Connection was stable; backoff reset");
                }
                error
            }
            Ok(Err(error)) => error,
            Err(_) => TransportError::HandshakeTimeout(shared.config.handshake_timeout),
        };

        tracing::warn!(error = %error, attempt, "Feed connection error");
        metrics::record_transport_error(error.kind());

        if !shared.publish(
            generation,
            ConnectionState::Error,
            attempt,
            Some(error.to_string()),
        ) {
            return;
        }

        let Some(delay) = policy.next_delay() else {
            tracing::error!(
                attempts = policy.attempt_count(),
                "Reconnect attempts exhausted; staying in error state"
            );
            return;
        };
        attempt = policy.attempt_count();
        metrics::record_reconnect();

        tracing::info!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Reconnecting to feed"
        );

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// Shuttle instructions out and frames in until the connection ends.
///
/// Returns `None` when cancelled, otherwise the error that ended it.
async fn pump(
    connection: &mut dyn FeedConnection,
    mut link_rx: mpsc::UnboundedReceiver<WireInstruction>,
    hooks: &dyn SessionHooks,
    cancel: &CancellationToken,
) -> Option<TransportError> {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => PumpEvent::Cancelled,
            instruction = link_rx.recv() => PumpEvent::Outbound(instruction),
            frame = connection.recv() => PumpEvent::Inbound(frame),
        };

        match event {
            PumpEvent::Cancelled => {
                connection.close().await;
                return None;
            }
            PumpEvent::Outbound(Some(instruction)) => {
                tracing::debug!(
                    subscribe = ?instruction.subscribe,
                    unsubscribe = ?instruction.unsubscribe,
                    "Sending wire instruction"
                );
                if let Err(error) = connection.send(&instruction).await {
                    return Some(error);
                }
            }
            PumpEvent::Outbound(None) => {
                // Link dropped by the owner; only happens on teardown
                connection.close().await;
                return None;
            }
            PumpEvent::Inbound(Some(Ok(text))) => hooks.on_frame(&text),
            PumpEvent::Inbound(Some(Err(error))) => return Some(error),
            PumpEvent::Inbound(None) => return Some(TransportError::ConnectionClosed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
