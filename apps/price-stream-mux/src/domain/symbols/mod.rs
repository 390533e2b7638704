//! Symbol Canonicalization
//!
//! Upstream feeds are inconsistent about how they spell the same instrument:
//! `EUR/USD`, `FX:EURUSD` and `eurusd` all mean one thing, indices come with
//! or without a caret, commodities go by nickname, and some stocks need an
//! exchange prefix. Everything inside the multiplexer speaks
//! [`CanonicalSymbol`]; [`AliasResolver`] is the only place that knows the
//! vendor spellings.
//!
//! # Rules
//!
//! - Lookup is case-insensitive (the raw input is uppercased first).
//! - Unknown inputs canonicalize to their uppercased form.
//! - A canonical symbol never appears as the alias of another symbol, so
//!   canonicalization is idempotent.

use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Serialize;

// =============================================================================
// Canonical Symbol
// =============================================================================

/// The single normalized spelling of a tradable instrument.
///
/// Produced by [`AliasResolver::canonicalize`]; the multiplexer never handles
/// vendor spellings past its public entry points.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CanonicalSymbol(String);

impl CanonicalSymbol {
    pub(crate) fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the symbol as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the symbol, returning the inner string.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CanonicalSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for CanonicalSymbol {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for CanonicalSymbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for CanonicalSymbol {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for CanonicalSymbol {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

// =============================================================================
// Built-in Table
// =============================================================================

/// One instrument in the built-in alias table.
struct Instrument {
    canonical: &'static str,
    label: &'static str,
    /// Wire spellings to try, in order.
    vendor_forms: &'static [&'static str],
    /// Spellings accepted on input but never sent.
    aliases: &'static [&'static str],
}

/// FX majors share a regular spelling scheme, so they are generated.
const FX_MAJORS: &[(&str, &str)] = &[
    ("EUR", "USD"),
    ("GBP", "USD"),
    ("USD", "JPY"),
    ("USD", "CHF"),
    ("USD", "CAD"),
    ("AUD", "USD"),
    ("NZD", "USD"),
    ("EUR", "GBP"),
    ("EUR", "JPY"),
    ("GBP", "JPY"),
];

const INSTRUMENTS: &[Instrument] = &[
    Instrument {
        canonical: "XAUUSD",
        label: "Gold",
        vendor_forms: &["XAUUSD", "XAU/USD", "OANDA:XAUUSD", "GC=F"],
        aliases: &["GOLD", "XAU", "XAU-USD", "XAU_USD"],
    },
    Instrument {
        canonical: "XAGUSD",
        label: "Silver",
        vendor_forms: &["XAGUSD", "XAG/USD", "OANDA:XAGUSD", "SI=F"],
        aliases: &["SILVER", "XAG", "XAG-USD", "XAG_USD"],
    },
    Instrument {
        canonical: "USOIL",
        label: "WTI Crude Oil",
        vendor_forms: &["USOIL", "WTI", "TVC:USOIL", "CL=F"],
        aliases: &["CRUDE", "OIL", "WTICOUSD", "CL"],
    },
    Instrument {
        canonical: "UKOIL",
        label: "Brent Crude Oil",
        vendor_forms: &["UKOIL", "BRENT", "TVC:UKOIL", "BZ=F"],
        aliases: &["BRENTOIL", "BCOUSD"],
    },
    Instrument {
        canonical: "SPX",
        label: "S&P 500",
        vendor_forms: &["SPX", "^GSPC", "SP:SPX", "US500"],
        aliases: &["S&P500", "SP500", "GSPC", "SPX500"],
    },
    Instrument {
        canonical: "NDX",
        label: "Nasdaq 100",
        vendor_forms: &["NDX", "^NDX", "NASDAQ:NDX", "US100"],
        aliases: &["NAS100", "NASDAQ100"],
    },
    Instrument {
        canonical: "DJI",
        label: "Dow Jones",
        vendor_forms: &["DJI", "^DJI", "DJ:DJI", "US30"],
        aliases: &["DOW", "DJIA"],
    },
    Instrument {
        canonical: "BTCUSD",
        label: "Bitcoin",
        vendor_forms: &["BTCUSD", "BTC/USD", "BTC-USD", "BINANCE:BTCUSDT"],
        aliases: &["BTC", "XBTUSD", "BTCUSDT", "BITCOIN"],
    },
    Instrument {
        canonical: "ETHUSD",
        label: "Ethereum",
        vendor_forms: &["ETHUSD", "ETH/USD", "ETH-USD", "BINANCE:ETHUSDT"],
        aliases: &["ETH", "ETHUSDT", "ETHEREUM"],
    },
    Instrument {
        canonical: "AAPL",
        label: "Apple",
        vendor_forms: &["AAPL", "NASDAQ:AAPL"],
        aliases: &[],
    },
    Instrument {
        canonical: "MSFT",
        label: "Microsoft",
        vendor_forms: &["MSFT", "NASDAQ:MSFT"],
        aliases: &[],
    },
    Instrument {
        canonical: "TSLA",
        label: "Tesla",
        vendor_forms: &["TSLA", "NASDAQ:TSLA"],
        aliases: &[],
    },
];

// =============================================================================
// Alias Resolver
// =============================================================================

/// Maps vendor spellings to canonical symbols and back.
///
/// Pure lookup with no failure mode.
///
/// # Example
///
/// ```rust
/// use price_stream_mux::domain::symbols::AliasResolver;
///
/// let resolver = AliasResolver::default();
///
/// assert_eq!(resolver.canonicalize("eur/usd"), "EURUSD");
/// assert_eq!(resolver.canonicalize("gold"), "XAUUSD");
/// assert_eq!(resolver.canonicalize("nvda"), "NVDA");
///
/// let gold = resolver.canonicalize("XAU");
/// assert_eq!(resolver.display_label(&gold), "Gold");
/// assert_eq!(resolver.vendor_forms(&gold)[0], "XAUUSD");
/// ```
#[derive(Debug, Clone)]
pub struct AliasResolver {
    /// Uppercased spelling -> canonical symbol.
    aliases: HashMap<String, String>,
    /// Every symbol that is a canonical target.
    canonical: HashSet<String>,
    labels: HashMap<String, String>,
    vendor_forms: HashMap<String, Vec<String>>,
}

impl Default for AliasResolver {
    fn default() -> Self {
        let mut resolver = Self::empty();

        for (base, quote) in FX_MAJORS {
            let canonical = format!("{base}{quote}");
            let forms = vec![
                canonical.clone(),
                format!("{base}/{quote}"),
                format!("FX:{canonical}"),
                format!("OANDA:{base}_{quote}"),
            ];
            let aliases = [
                format!("{base}-{quote}"),
                format!("{base}_{quote}"),
                format!("{canonical}=X"),
            ];
            resolver.insert(&canonical, &format!("{base}/{quote}"), forms, &aliases);
        }

        for instrument in INSTRUMENTS {
            let forms = instrument
                .vendor_forms
                .iter()
                .map(ToString::to_string)
                .collect();
            resolver.insert(
                instrument.canonical,
                instrument.label,
                forms,
                instrument.aliases,
            );
        }

        resolver
    }
}

impl AliasResolver {
    /// Create a resolver with no table at all; every input canonicalizes to
    /// its uppercased form.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            aliases: HashMap::new(),
            canonical: HashSet::new(),
            labels: HashMap::new(),
            vendor_forms: HashMap::new(),
        }
    }

    /// Add a deployment-specific alias.
    ///
    /// The target is itself canonicalized first, so aliasing onto an alias
    /// lands on the real canonical symbol. An alias that is already the
    /// canonical spelling of a different instrument is ignored.
    #[must_use]
    pub fn with_alias(mut self, canonical: &str, alias: &str) -> Self {
        let target = self.canonicalize(canonical).into_string();
        let alias = alias.to_uppercase();

        if alias != target && self.canonical.contains(&alias) {
            tracing::warn!(
                alias = %alias,
                target = %target,
                "Ignoring alias that shadows a canonical symbol"
            );
            return self;
        }

        self.canonical.insert(target.clone());
        self.aliases.insert(target.clone(), target.clone());
        self.aliases.insert(alias, target);
        self
    }

    /// Map any vendor spelling to its canonical symbol.
    #[must_use]
    pub fn canonicalize(&self, raw: &str) -> CanonicalSymbol {
        let upper = raw.to_uppercase();
        match self.aliases.get(&upper) {
            Some(canonical) => CanonicalSymbol::new(canonical.clone()),
            None => CanonicalSymbol::new(upper),
        }
    }

    /// Candidate wire spellings for a canonical symbol, first match wins.
    ///
    /// Unknown symbols yield just the canonical spelling.
    #[must_use]
    pub fn vendor_forms(&self, symbol: &CanonicalSymbol) -> Vec<String> {
        self.vendor_forms
            .get(symbol.as_str())
            .cloned()
            .unwrap_or_else(|| vec![symbol.to_string()])
    }

    /// Human readable label for a canonical symbol.
    #[must_use]
    pub fn display_label(&self, symbol: &CanonicalSymbol) -> String {
        self.labels
            .get(symbol.as_str())
            .cloned()
            .unwrap_or_else(|| symbol.to_string())
    }

    /// Whether the symbol has an entry in the table.
    #[must_use]
    pub fn is_known(&self, symbol: &CanonicalSymbol) -> bool {
        self.canonical.contains(symbol.as_str())
    }

    fn insert<S: AsRef<str>>(
        &mut self,
        canonical: &str,
        label: &str,
        forms: Vec<String>,
        aliases: &[S],
    ) {
        let canonical = canonical.to_uppercase();
        self.canonical.insert(canonical.clone());
        self.aliases.insert(canonical.clone(), canonical.clone());

        for spelling in forms
            .iter()
            .map(String::as_str)
            .chain(aliases.iter().map(AsRef::as_ref))
        {
            self.aliases
                .insert(spelling.to_uppercase(), canonical.clone());
        }

        self.labels.insert(canonical.clone(), label.to_string());
        self.vendor_forms.insert(canonical, forms);
    }
}

// =============================================================================
// Tests
// =============================================================================
