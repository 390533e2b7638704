//! Tick Dispatcher
//!
//! Turns inbound frames into [`PriceTick`]s and delivers them to every price
//! callback.
//!
//! # Pipeline
//!
//! 1. Decode the frame with [`JsonFrameCodec`]; undecodable frames and
//!    malformed entries are counted and dropped.
//! 2. Canonicalize the wire symbol.
//! 3. One spelling per symbol: when a symbol is subscribed under several
//!    vendor spellings, the first spelling that produces a tick becomes the
//!    active one and ticks for the others are skipped, so consumers never see
//!    duplicate updates. A spelling earlier in the resolver's vendor-form
//!    order takes over from a later one. The choice is forgotten when the
//!    symbol is released and whenever a new connection starts.
//! 4. Compute change versus the last price seen for the wire symbol.
//! 5. Invoke every price callback in registration order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;

use super::callbacks::{Callback, CallbackHandle, CallbackRegistry};
use crate::domain::streaming::{PriceTick, RawTick, price_change};
use crate::domain::symbols::{AliasResolver, CanonicalSymbol};
use crate::infrastructure::feed::codec::JsonFrameCodec;
use crate::infrastructure::metrics::{self, CallbackKind, DropReason};

#[derive(Debug, Default)]
struct Routing {
    /// Canonical symbol -> wire spelling currently delivering ticks.
    active_forms: HashMap<CanonicalSymbol, String>,
    /// Canonical symbol -> wire spelling -> last price.
    last_prices: HashMap<CanonicalSymbol, HashMap<String, Decimal>>,
}

#[derive(Debug, Default)]
struct Counters {
    frames: AtomicU64,
    ticks: AtomicU64,
    malformed: AtomicU64,
    control: AtomicU64,
    shadowed: AtomicU64,
    callback_panics: AtomicU64,
}

/// Dispatcher statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Frames received.
    pub frames: u64,
    /// Ticks delivered to callbacks.
    pub ticks: u64,
    /// Frames or entries dropped as malformed.
    pub malformed: u64,
    /// Control entries ignored.
    pub control: u64,
    /// Ticks skipped because another vendor spelling is active.
    pub shadowed: u64,
    /// Price callback invocations that panicked.
    pub callback_panics: u64,
}

/// Frame decoder and price fan-out.
pub struct Dispatcher {
    resolver: Arc<AliasResolver>,
    codec: JsonFrameCodec,
    callbacks: CallbackRegistry<PriceTick>,
    routing: Mutex<Routing>,
    counters: Counters,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("callbacks", &self.callbacks)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher that canonicalizes with `resolver`.
    #[must_use]
    pub fn new(resolver: Arc<AliasResolver>) -> Self {
        Self {
            resolver,
            codec: JsonFrameCodec::new(),
            callbacks: CallbackRegistry::new("price"),
            routing: Mutex::new(Routing::default()),
            counters: Counters::default(),
        }
    }

    /// Register a price callback.
    pub fn register(&self, callback: Callback<PriceTick>) -> CallbackHandle {
        let handle = self.callbacks.register(callback);
        metrics::set_callbacks(CallbackKind::Price, self.callbacks.len());
        handle
    }

    /// Remove a price callback; `false` if the handle is unknown.
    pub fn remove(&self, handle: CallbackHandle) -> bool {
        let removed = self.callbacks.remove(handle);
        metrics::set_callbacks(CallbackKind::Price, self.callbacks.len());
        removed
    }

    /// Number of registered price callbacks.
    #[must_use]
    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    /// Handle one inbound text frame.
    ///
    /// Returns the number of ticks delivered.
    pub fn on_frame(&self, text: &str) -> usize {
        let started = Instant::now();
        self.counters.frames.fetch_add(1, Ordering::Relaxed);
        metrics::record_frame_received();

        let frame = match self.codec.decode(text) {
            Ok(frame) => frame,
            Err(error) => {
                tracing::debug!(error = %error, "Dropping undecodable frame");
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                metrics::record_frames_dropped(DropReason::Undecodable, 1);
                return 0;
            }
        };

        if frame.malformed > 0 {
            tracing::trace!(count = frame.malformed, "Dropping malformed entries");
            self.counters
                .malformed
                .fetch_add(frame.malformed as u64, Ordering::Relaxed);
            metrics::record_frames_dropped(DropReason::Malformed, frame.malformed as u64);
        }
        if frame.control > 0 {
            self.counters
                .control
                .fetch_add(frame.control as u64, Ordering::Relaxed);
            metrics::record_control_frames(frame.control as u64);
        }

        let ticks = self.route(frame.ticks);
        let delivered = ticks.len();

        for tick in &ticks {
            let outcome = self.callbacks.dispatch(tick);
            if outcome.panicked > 0 {
                self.counters
                    .callback_panics
                    .fetch_add(outcome.panicked as u64, Ordering::Relaxed);
                metrics::record_callback_panics(CallbackKind::Price, outcome.panicked as u64);
            }
        }

        if delivered > 0 {
            self.counters
                .ticks
                .fetch_add(delivered as u64, Ordering::Relaxed);
            metrics::record_ticks_dispatched(delivered as u64);
        }
        metrics::record_processing_duration(started.elapsed());

        delivered
    }

    /// Forget routing state for symbols whose interest dropped to zero.
    pub fn release(&self, symbols: &[CanonicalSymbol]) {
        if symbols.is_empty() {
            return;
        }

        let mut routing = self.routing.lock();
        for symbol in symbols {
            routing.active_forms.remove(symbol);
            routing.last_prices.remove(symbol);
        }
    }

    /// Forget every active spelling; the next connection picks afresh.
    pub fn reset_active_forms(&self) {
        let mut routing = self.routing.lock();
        if !routing.active_forms.is_empty() {
            tracing::debug!(
                count = routing.active_forms.len(),
                "Clearing active vendor spellings"
            );
            routing.active_forms.clear();
        }
    }

    /// Wire spelling currently delivering ticks for `symbol`.
    #[must_use]
    pub fn active_form(&self, symbol: &CanonicalSymbol) -> Option<String> {
        self.routing.lock().active_forms.get(symbol).cloned()
    }

    /// Wire spellings with a remembered last price.
    #[must_use]
    pub fn tracked_prices(&self) -> usize {
        self.routing.lock().last_prices.values().map(HashMap::len).sum()
    }

    /// Dispatcher statistics.
    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            frames: self.counters.frames.load(Ordering::Relaxed),
            ticks: self.counters.ticks.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            control: self.counters.control.load(Ordering::Relaxed),
            shadowed: self.counters.shadowed.load(Ordering::Relaxed),
            callback_panics: self.counters.callback_panics.load(Ordering::Relaxed),
        }
    }

    /// Build consumer ticks under the routing lock; callbacks run after.
    fn route(&self, raw_ticks: Vec<RawTick>) -> Vec<PriceTick> {
        let mut routing = self.routing.lock();
        let mut ticks = Vec::with_capacity(raw_ticks.len());
        let mut shadowed = 0_u64;

        for raw in raw_ticks {
            let symbol = self.resolver.canonicalize(&raw.symbol);

            let active = routing.active_forms.get(&symbol);
            if active.is_some_and(|active| {
                *active != raw.symbol && !self.outranks(&symbol, &raw.symbol, active)
            }) {
                shadowed += 1;
                continue;
            }
            if active != Some(&raw.symbol) {
                if let Some(replaced) = routing
                    .active_forms
                    .insert(symbol.clone(), raw.symbol.clone())
                {
                    tracing::debug!(
                        symbol = %symbol,
                        from = %replaced,
                        to = %raw.symbol,
                        "Preferred vendor spelling took over"
                    );
                }
            }

            let previous = routing
                .last_prices
                .entry(symbol.clone())
                .or_default()
                .insert(raw.symbol.clone(), raw.price);
            let (change, change_percent) = price_change(previous, raw.price);

            ticks.push(PriceTick {
                label: self.resolver.display_label(&symbol),
                symbol,
                raw_symbol: raw.symbol,
                price: raw.price,
                change,
                change_percent,
                open: raw.open,
                high: raw.high,
                low: raw.low,
                close: raw.close,
                volume: raw.volume,
                timestamp: raw.timestamp.unwrap_or_else(Utc::now),
            });
        }
        drop(routing);

        if shadowed > 0 {
            self.counters.shadowed.fetch_add(shadowed, Ordering::Relaxed);
            metrics::record_ticks_shadowed(shadowed);
        }

        ticks
    }

    /// Whether `candidate` comes before `active` in the vendor-form order.
    ///
    /// Spellings outside the list rank last, so between two of them the
    /// active one stays.
    fn outranks(&self, symbol: &CanonicalSymbol, candidate: &str, active: &str) -> bool {
        let forms = self.resolver.vendor_forms(symbol);
        let rank = |spelling: &str| {
            forms
                .iter()
                .position(|form| form.eq_ignore_ascii_case(spelling))
                .unwrap_or(usize::MAX)
        };
        rank(candidate) < rank(active)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use parking_lot::Mutex;

    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn collecting(dispatcher: &Dispatcher) -> Arc<Mutex<Vec<PriceTick>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher.register(Arc::new(move |tick: &PriceTick| sink.lock().push(tick.clone())));
        seen
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(AliasResolver::default()))
    }

    #[test]
    fn delivers_canonical_tick() {
        let dispatcher = dispatcher();
        let seen = collecting(&dispatcher);

        let delivered = dispatcher.on_frame(r#"{"symbol":"EUR/USD","price":"1.0851"}"#);

        assert_eq!(delivered, 1);
        let seen = seen.lock();
        assert_eq!(seen[0].symbol, "EURUSD");
        assert_eq!(seen[0].raw_symbol, "EUR/USD");
        assert_eq!(seen[0].label, "EUR/USD");
        assert_eq!(seen[0].price, dec("1.0851"));
        assert_eq!(seen[0].change, Decimal::ZERO);
    }

    #[test]
    fn change_tracks_previous_price() {
        let dispatcher = dispatcher();
        let seen = collecting(&dispatcher);

        dispatcher.on_frame(r#"{"s":"AAPL","p":200}"#);
        dispatcher.on_frame(r#"{"s":"AAPL","p":210}"#);

        let seen = seen.lock();
        assert_eq!(seen[1].change, dec("10"));
        assert_eq!(seen[1].change_percent, dec("5"));
    }

    #[test]
    fn feed_timestamp_is_kept() {
        let dispatcher = dispatcher();
        let seen = collecting(&dispatcher);

        dispatcher.on_frame(r#"{"s":"AAPL","p":200,"ts":1700000000}"#);

        assert_eq!(seen.lock()[0].timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn malformed_frames_are_counted_and_dropped() {
        let dispatcher = dispatcher();
        let seen = collecting(&dispatcher);

        dispatcher.on_frame("garbage");
        dispatcher.on_frame(r#"{"symbol":"EURUSD"}"#);
        dispatcher.on_frame(r#"{"price":1.0}"#);

        assert!(seen.lock().is_empty());
        let stats = dispatcher.stats();
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.malformed, 3);
        assert_eq!(stats.ticks, 0);
    }

    #[test]
    fn control_frames_are_ignored() {
        let dispatcher = dispatcher();
        let seen = collecting(&dispatcher);

        dispatcher.on_frame(r#"{"type":"subscribed","symbols":["EURUSD"]}"#);

        assert!(seen.lock().is_empty());
        assert_eq!(dispatcher.stats().control, 1);
        assert_eq!(dispatcher.stats().malformed, 0);
    }

    #[test]
    fn first_vendor_form_wins() {
        let dispatcher = dispatcher();
        let seen = collecting(&dispatcher);

        dispatcher.on_frame(r#"[{"s":"XAU","p":2300},{"s":"GOLD","p":2301},{"s":"XAU","p":2302}]"#);

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|tick| tick.raw_symbol == "XAU"));
        assert_eq!(dispatcher.stats().shadowed, 1);
        assert_eq!(
            dispatcher.active_form(&AliasResolver::default().canonicalize("gold")),
            Some("XAU".to_string())
        );
    }

    #[test]
    fn release_frees_active_form() {
        let dispatcher = dispatcher();
        let seen = collecting(&dispatcher);
        let gold = AliasResolver::default().canonicalize("gold");

        dispatcher.on_frame(r#"{"s":"XAU","p":2300}"#);
        dispatcher.release(std::slice::from_ref(&gold));
        dispatcher.on_frame(r#"{"s":"GOLD","p":2301}"#);

        assert_eq!(seen.lock().len(), 2);
        assert_eq!(dispatcher.active_form(&gold), Some("GOLD".to_string()));
    }

    #[test]
    fn preferred_vendor_form_takes_over() {
        let dispatcher = dispatcher();
        let seen = collecting(&dispatcher);
        let gold = AliasResolver::default().canonicalize("gold");

        dispatcher.on_frame(
            r#"[{"s":"GC=F","p":2400.5},{"s":"XAUUSD","p":2401},{"s":"GC=F","p":2402.5}]"#,
        );

        let seen = seen.lock();
        let raw: Vec<&str> = seen.iter().map(|tick| tick.raw_symbol.as_str()).collect();
        assert_eq!(raw, vec!["GC=F", "XAUUSD"]);
        assert_eq!(dispatcher.stats().shadowed, 1);
        assert_eq!(dispatcher.active_form(&gold), Some("XAUUSD".to_string()));
    }

    #[test]
    fn reset_lets_a_lower_form_deliver_again() {
        let dispatcher = dispatcher();
        let seen = collecting(&dispatcher);
        let gold = AliasResolver::default().canonicalize("gold");

        dispatcher.on_frame(r#"{"s":"XAUUSD","p":2400}"#);
        dispatcher.on_frame(r#"{"s":"GC=F","p":2401}"#);
        assert_eq!(seen.lock().len(), 1);

        dispatcher.reset_active_forms();
        dispatcher.on_frame(r#"{"s":"GC=F","p":2402}"#);

        assert_eq!(seen.lock().len(), 2);
        assert_eq!(dispatcher.active_form(&gold), Some("GC=F".to_string()));
    }

    #[test]
    fn release_forgets_last_prices() {
        let dispatcher = dispatcher();
        let seen = collecting(&dispatcher);
        let aapl = AliasResolver::default().canonicalize("AAPL");

        dispatcher.on_frame(r#"{"s":"AAPL","p":200}"#);
        dispatcher.release(std::slice::from_ref(&aapl));
        dispatcher.on_frame(r#"{"s":"AAPL","p":210}"#);

        let seen = seen.lock();
        assert_eq!(seen[1].change, Decimal::ZERO);
        assert_eq!(seen[1].change_percent, Decimal::ZERO);
        assert_eq!(dispatcher.tracked_prices(), 1);
    }

    #[test]
    fn out_of_range_prices_do_not_break_routing() {
        let dispatcher = dispatcher();
        let seen = collecting(&dispatcher);

        dispatcher.on_frame(r#"{"s":"X","p":"79228162514264337593543950335"}"#);
        dispatcher.on_frame(r#"{"s":"X","p":"-1"}"#);
        dispatcher.on_frame(r#"{"s":"EURUSD","p":"1.1"}"#);

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1].change, Decimal::ZERO);
        assert_eq!(seen[2].symbol, "EURUSD");
    }

    #[test]
    fn panicking_callback_is_isolated() {
        let dispatcher = dispatcher();
        dispatcher.register(Arc::new(|_: &PriceTick| panic!("bad widget")));
        let seen = collecting(&dispatcher);

        dispatcher.on_frame(r#"{"s":"SPX","p":5000}"#);
        dispatcher.on_frame(r#"{"s":"SPX","p":5001}"#);

        assert_eq!(seen.lock().len(), 2);
        assert_eq!(dispatcher.stats().callback_panics, 2);
    }

    #[test]
    fn remove_callback() {
        let dispatcher = dispatcher();
        let handle = dispatcher.register(Arc::new(|_: &PriceTick| {}));

        assert_eq!(dispatcher.callback_count(), 1);
        assert!(dispatcher.remove(handle));
        assert!(!dispatcher.remove(handle));
        assert_eq!(dispatcher.callback_count(), 0);
    }
}
