//! Market Data Streaming Types
//!
//! Core domain types for the price stream: raw ticks as decoded off the wire,
//! canonicalized ticks as delivered to consumers, and connection status.
//! These types are codec-agnostic.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::domain::symbols::CanonicalSymbol;

// =============================================================================
// Connection State
// =============================================================================

/// State of the single upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No connection and no retries scheduled.
    #[default]
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Handshake complete; frames are flowing.
    Connected,
    /// Last attempt failed or the socket dropped; a retry may be scheduled.
    Error,
}

impl ConnectionState {
    /// Get the state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }

    /// Check if the connection is usable.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Numeric form used for the state gauge.
    #[must_use]
    pub const fn as_gauge(&self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Connected => 2.0,
            Self::Error => 3.0,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A connection state transition, as delivered to status callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEvent {
    /// State entered.
    pub state: ConnectionState,
    /// State left.
    pub previous: ConnectionState,
    /// Reconnect attempt number (0 outside of a retry cycle).
    pub attempt: u32,
    /// Why the transition happened, for `Error`.
    pub reason: Option<String>,
    /// When the transition happened.
    pub at: DateTime<Utc>,
}

// =============================================================================
// Ticks
// =============================================================================

/// A price update as decoded from one inbound frame, before canonicalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTick {
    /// Symbol exactly as spelled by the feed.
    pub symbol: String,
    /// Last price.
    pub price: Decimal,
    /// Session open, if the feed sent one.
    pub open: Option<Decimal>,
    /// Session high.
    pub high: Option<Decimal>,
    /// Session low.
    pub low: Option<Decimal>,
    /// Session close / previous close.
    pub close: Option<Decimal>,
    /// Volume.
    pub volume: Option<Decimal>,
    /// Feed timestamp, if present.
    pub timestamp: Option<DateTime<Utc>>,
}

impl RawTick {
    /// Create a tick with only symbol and price.
    #[must_use]
    pub fn new(symbol: impl Into<String>, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            open: None,
            high: None,
            low: None,
            close: None,
            volume: None,
            timestamp: None,
        }
    }
}

/// A canonicalized price update delivered to price callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceTick {
    /// Canonical symbol.
    pub symbol: CanonicalSymbol,
    /// Symbol as spelled on the wire.
    pub raw_symbol: String,
    /// Display label for the symbol.
    pub label: String,
    /// Last price.
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    /// Signed change versus the previous price for this wire symbol.
    #[serde(with = "rust_decimal::serde::str")]
    pub change: Decimal,
    /// Percent change versus the previous price for this wire symbol.
    #[serde(with = "rust_decimal::serde::str")]
    pub change_percent: Decimal,
    /// Session open.
    pub open: Option<Decimal>,
    /// Session high.
    pub high: Option<Decimal>,
    /// Session low.
    pub low: Option<Decimal>,
    /// Session close / previous close.
    pub close: Option<Decimal>,
    /// Volume.
    pub volume: Option<Decimal>,
    /// Feed timestamp, or receive time when the feed omitted it.
    pub timestamp: DateTime<Utc>,
}

/// Signed change and percent change from `previous` to `price`.
///
/// Percent is zero when there is no usable previous price. Both are zero
/// when the difference falls outside the representable range.
#[must_use]
pub fn price_change(previous: Option<Decimal>, price: Decimal) -> (Decimal, Decimal) {
    let Some((previous, change)) =
        previous.and_then(|previous| Some((previous, price.checked_sub(previous)?)))
    else {
        return (Decimal::ZERO, Decimal::ZERO);
    };

    let percent = change
        .checked_div(previous)
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
        .unwrap_or(Decimal::ZERO);

    (change, percent.round_dp(4))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn connection_state_names() {
        assert_eq!(ConnectionState::Disconnected.as_str(), "disconnected");
        assert_eq!(ConnectionState::Connecting.as_str(), "connecting");
        assert_eq!(ConnectionState::Connected.as_str(), "connected");
        assert_eq!(ConnectionState::Error.as_str(), "error");
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn connection_state_serialization() {
        assert_eq!(
            serde_json::to_string(&ConnectionState::Connected).unwrap(),
            "\"connected\""
        );
    }

    #[test]
    fn only_connected_is_connected() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(!ConnectionState::Error.is_connected());
        assert!(!ConnectionState::Disconnected.is_connected());
    }

    #[test]
    fn first_price_has_no_change() {
        let (change, percent) = price_change(None, dec("1.0850"));
        assert_eq!(change, Decimal::ZERO);
        assert_eq!(percent, Decimal::ZERO);
    }

    #[test]
    fn price_change_up() {
        let (change, percent) = price_change(Some(dec("100")), dec("102.5"));
        assert_eq!(change, dec("2.5"));
        assert_eq!(percent, dec("2.5"));
    }

    #[test]
    fn price_change_down() {
        let (change, percent) = price_change(Some(dec("200")), dec("150"));
        assert_eq!(change, dec("-50"));
        assert_eq!(percent, dec("-25"));
    }

    #[test]
    fn price_change_from_zero_has_no_percent() {
        let (change, percent) = price_change(Some(Decimal::ZERO), dec("5"));
        assert_eq!(change, dec("5"));
        assert_eq!(percent, Decimal::ZERO);
    }

    #[test]
    fn price_change_percent_rounded() {
        let (_, percent) = price_change(Some(dec("3")), dec("4"));
        assert_eq!(percent, dec("33.3333"));
    }

    #[test]
    fn price_change_out_of_range_is_zero() {
        let (change, percent) = price_change(Some(Decimal::MIN), Decimal::MAX);
        assert_eq!(change, Decimal::ZERO);
        assert_eq!(percent, Decimal::ZERO);

        let (change, percent) = price_change(Some(Decimal::MAX), dec("-1"));
        assert_eq!(change, Decimal::ZERO);
        assert_eq!(percent, Decimal::ZERO);
    }
}
