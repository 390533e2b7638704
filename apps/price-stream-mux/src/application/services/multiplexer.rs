//! Price Stream Multiplexer
//!
//! The public facade consumers hold. One instance owns one upstream
//! connection and serves any number of independent widgets.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use price_stream_mux::{Multiplexer, MultiplexerConfig, PriceTick, WebSocketConnector};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MultiplexerConfig::default();
//! let connector = WebSocketConnector::new("wss://feed.example/ws", config.heartbeat.clone());
//! let mux = Multiplexer::new(Arc::new(connector), config);
//!
//! let handle = mux.on_price_update(Arc::new(|tick: &PriceTick| {
//!     println!("{} {}", tick.label, tick.price);
//! }));
//!
//! mux.connect().await;
//! mux.subscribe(&["EUR/USD", "gold"])?;
//!
//! // Widget unmounts
//! mux.unsubscribe(&["EUR/USD", "gold"]);
//! mux.remove_price_update_callback(handle);
//! # Ok(())
//! # }
//! ```
//!
//! # Guarantees
//!
//! - A symbol is subscribed on the wire exactly while at least one consumer
//!   holds interest in it, however many consumers share it.
//! - Changes within one batch window leave as one instruction.
//! - After every (re)connect the full interest set is replayed before any
//!   other instruction, and nothing pending from before the drop is sent.
//! - Unsubscribing everything never closes the connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::callbacks::{Callback, CallbackHandle, CallbackRegistry};
use super::dispatcher::{DispatchStats, Dispatcher};
use super::scheduler::BatchScheduler;
use crate::application::ports::{FeedConnector, SessionHooks};
use crate::domain::streaming::{ConnectionState, PriceTick, StatusEvent};
use crate::domain::subscription::{InterestRegistry, InterestStats, WireInstruction};
use crate::domain::symbols::{AliasResolver, CanonicalSymbol};
use crate::infrastructure::config::MultiplexerConfig;
use crate::infrastructure::feed::connection::{ConnectionConfig, ConnectionManager};
use crate::infrastructure::metrics::{self, CallbackKind};

// =============================================================================
// Errors and Stats
// =============================================================================

/// Errors returned to consumers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MultiplexerError {
    /// The subscribe would push the distinct symbol count over the cap.
    #[error("symbol limit exceeded: {requested} symbols requested, limit is {limit}")]
    SymbolLimitExceeded {
        /// Distinct symbols that would be held after the call.
        requested: usize,
        /// Configured cap.
        limit: usize,
    },
}

/// Multiplexer statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MultiplexerStats {
    /// Current connection state.
    pub state: ConnectionState,
    /// Interest registry statistics.
    pub interest: InterestStats,
    /// Dispatcher statistics.
    pub dispatch: DispatchStats,
    /// Registered price callbacks.
    pub price_callbacks: usize,
    /// Registered status callbacks.
    pub status_callbacks: usize,
    /// Status callback invocations that panicked.
    pub status_callback_panics: u64,
    /// Symbols waiting for the next flush.
    pub pending_changes: usize,
}

// =============================================================================
// Shared State
// =============================================================================

struct Inner {
    resolver: Arc<AliasResolver>,
    config: MultiplexerConfig,
    registry: Mutex<InterestRegistry>,
    scheduler: BatchScheduler,
    dispatcher: Dispatcher,
    status_callbacks: CallbackRegistry<StatusEvent>,
    status_panics: AtomicU64,
}

impl Inner {
    fn spell(&self, symbol: &CanonicalSymbol) -> Vec<String> {
        if self.config.expand_vendor_forms {
            self.resolver.vendor_forms(symbol)
        } else {
            vec![symbol.to_string()]
        }
    }

    fn flush(&self) -> Option<WireInstruction> {
        self.scheduler.flush(|symbol| self.spell(symbol))
    }

    fn canonicalize_all<S: AsRef<str>>(&self, symbols: &[S]) -> Vec<CanonicalSymbol> {
        symbols
            .iter()
            .map(|raw| raw.as_ref().trim())
            .filter(|raw| !raw.is_empty())
            .map(|raw| self.resolver.canonicalize(raw))
            .collect()
    }
}

impl SessionHooks for Inner {
    fn on_connected(&self, link: mpsc::UnboundedSender<WireInstruction>) {
        // Registry first, then the outbox: no subscribe can slip between
        // the snapshot and the new link
        let registry = self.registry.lock();
        let interest = registry.current_interest_set();
        let replay =
            WireInstruction::subscribe_only(interest.iter().flat_map(|symbol| self.spell(symbol)));

        tracing::info!(symbols = interest.len(), "Replaying interest set");
        self.scheduler.attach(link, replay);
    }

    fn on_link_lost(&self) {
        self.scheduler.detach();
        // The next connection may carry a different set of spellings
        self.dispatcher.reset_active_forms();
    }

    fn on_frame(&self, text: &str) {
        self.dispatcher.on_frame(text);
    }

    fn on_state_change(
        &self,
        previous: ConnectionState,
        state: ConnectionState,
        attempt: u32,
        reason: Option<String>,
    ) {
        let event = StatusEvent {
            state,
            previous,
            attempt,
            reason,
            at: Utc::now(),
        };

        let outcome = self.status_callbacks.dispatch(&event);
        if outcome.panicked > 0 {
            self.status_panics
                .fetch_add(outcome.panicked as u64, Ordering::Relaxed);
            metrics::record_callback_panics(CallbackKind::Status, outcome.panicked as u64);
        }
    }
}

// =============================================================================
// Multiplexer
// =============================================================================

/// Shared price stream client.
///
/// Construct one per session and hand it (behind an `Arc` if needed) to
/// every consumer. Dropping it tears the connection down.
pub struct Multiplexer {
    inner: Arc<Inner>,
    connection: ConnectionManager,
    cancel: CancellationToken,
    timer_started: AtomicBool,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Multiplexer {
    /// Create a multiplexer with the built-in alias table.
    #[must_use]
    pub fn new(connector: Arc<dyn FeedConnector>, config: MultiplexerConfig) -> Self {
        Self::with_resolver(connector, config, AliasResolver::default())
    }

    /// Create a multiplexer with a custom alias table.
    #[must_use]
    pub fn with_resolver(
        connector: Arc<dyn FeedConnector>,
        config: MultiplexerConfig,
        resolver: AliasResolver,
    ) -> Self {
        let resolver = Arc::new(resolver);
        let cancel = CancellationToken::new();
        let connection_config = ConnectionConfig::from_multiplexer_config(&config);

        let inner = Arc::new(Inner {
            dispatcher: Dispatcher::new(Arc::clone(&resolver)),
            scheduler: BatchScheduler::new(config.batch_window),
            registry: Mutex::new(InterestRegistry::new()),
            status_callbacks: CallbackRegistry::new("status"),
            status_panics: AtomicU64::new(0),
            resolver,
            config,
        });
        let connection = ConnectionManager::new(
            connector,
            Arc::clone(&inner) as Arc<dyn SessionHooks>,
            connection_config,
            cancel.child_token(),
        );

        Self {
            inner,
            connection,
            cancel,
            timer_started: AtomicBool::new(false),
        }
    }

    /// Open the upstream connection if it is not already open or opening.
    ///
    /// Resolves with `Connected` once the handshake completes, or `Error` if
    /// the first attempt fails; retries then continue in the background.
    /// Calling it while a session is alive never opens a second connection.
    pub async fn connect(&self) -> ConnectionState {
        self.start_batch_timer();
        self.connection.connect().await
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Interest is kept; a later [`connect`](Self::connect) replays it.
    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// Register interest in `symbols` (any vendor spelling).
    ///
    /// Symbols that become newly needed are subscribed on the next flush.
    /// Accepted before `connect()`; held until the connection comes up.
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexerError::SymbolLimitExceeded`] when the call would
    /// push the number of distinct symbols over `max_symbols`; nothing is
    /// registered in that case.
    pub fn subscribe<S: AsRef<str>>(&self, symbols: &[S]) -> Result<(), MultiplexerError> {
        let symbols = self.inner.canonicalize_all(symbols);
        if symbols.is_empty() {
            return Ok(());
        }

        let mut registry = self.inner.registry.lock();

        let requested = registry.len() + registry.new_symbol_count(&symbols);
        if requested > self.inner.config.max_symbols {
            tracing::warn!(
                requested,
                limit = self.inner.config.max_symbols,
                "Rejecting subscribe over symbol limit"
            );
            return Err(MultiplexerError::SymbolLimitExceeded {
                requested,
                limit: self.inner.config.max_symbols,
            });
        }

        let newly_needed = registry.add_interest(&symbols);
        let held = registry.len();
        if !newly_needed.is_empty() {
            tracing::debug!(symbols = ?newly_needed, "Symbols newly needed");
        }
        self.inner.scheduler.record(newly_needed, Vec::new());
        drop(registry);

        metrics::set_active_symbols(held);
        Ok(())
    }

    /// Release interest in `symbols`.
    ///
    /// Symbols nobody holds any more are unsubscribed on the next flush.
    /// Releasing a symbol that is not held is a no-op.
    pub fn unsubscribe<S: AsRef<str>>(&self, symbols: &[S]) {
        let symbols = self.inner.canonicalize_all(symbols);
        if symbols.is_empty() {
            return;
        }

        let mut registry = self.inner.registry.lock();
        let released = registry.remove_interest(&symbols);
        let held = registry.len();
        if !released.is_empty() {
            tracing::debug!(symbols = ?released, "Symbols no longer needed");
        }
        self.inner.scheduler.record(Vec::new(), released.clone());
        drop(registry);

        self.inner.dispatcher.release(&released);
        metrics::set_active_symbols(held);
    }

    /// Send pending changes now instead of waiting for the batch window.
    ///
    /// Returns the instruction handed to the connection, if any.
    pub fn flush(&self) -> Option<WireInstruction> {
        self.inner.flush()
    }

    /// Register a price callback.
    pub fn on_price_update(&self, callback: Callback<PriceTick>) -> CallbackHandle {
        self.inner.dispatcher.register(callback)
    }

    /// Remove a price callback; `false` if the handle is unknown.
    pub fn remove_price_update_callback(&self, handle: CallbackHandle) -> bool {
        self.inner.dispatcher.remove(handle)
    }

    /// Register a connection status callback.
    pub fn on_connection_status(&self, callback: Callback<StatusEvent>) -> CallbackHandle {
        let handle = self.inner.status_callbacks.register(callback);
        metrics::set_callbacks(CallbackKind::Status, self.inner.status_callbacks.len());
        handle
    }

    /// Remove a status callback; `false` if the handle is unknown.
    pub fn remove_connection_status_callback(&self, handle: CallbackHandle) -> bool {
        let removed = self.inner.status_callbacks.remove(handle);
        metrics::set_callbacks(CallbackKind::Status, self.inner.status_callbacks.len());
        removed
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_status(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    /// Symbols with active interest, sorted.
    #[must_use]
    pub fn interest_set(&self) -> Vec<CanonicalSymbol> {
        self.inner.registry.lock().current_interest_set()
    }

    /// Number of consumers holding `symbol` (any spelling).
    #[must_use]
    pub fn interest_count(&self, symbol: &str) -> usize {
        let symbol = self.inner.resolver.canonicalize(symbol.trim());
        self.inner.registry.lock().count(&symbol)
    }

    /// The alias table in use.
    #[must_use]
    pub fn resolver(&self) -> &AliasResolver {
        &self.inner.resolver
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &MultiplexerConfig {
        &self.inner.config
    }

    /// Multiplexer statistics.
    #[must_use]
    pub fn stats(&self) -> MultiplexerStats {
        let scheduler = self.inner.scheduler.stats();
        MultiplexerStats {
            state: self.connection.state(),
            interest: self.inner.registry.lock().stats(),
            dispatch: self.inner.dispatcher.stats(),
            price_callbacks: self.inner.dispatcher.callback_count(),
            status_callbacks: self.inner.status_callbacks.len(),
            status_callback_panics: self.inner.status_panics.load(Ordering::Relaxed),
            pending_changes: scheduler.pending_subscribes + scheduler.pending_unsubscribes,
        }
    }

    fn start_batch_timer(&self) {
        if self.inner.config.batch_window.is_zero()
            || self.timer_started.swap(true, Ordering::SeqCst)
        {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let flusher = Arc::clone(&inner);
            inner
                .scheduler
                .run_timer(cancel, move || {
                    flusher.flush();
                })
                .await;
        });
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================
