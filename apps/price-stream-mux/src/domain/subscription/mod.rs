//! Interest Tracking
//!
//! Domain types for reference-counted symbol interest and the pending wire
//! diff that accumulates between batch flushes.
//!
//! # Design
//!
//! Consumers do not know about each other, so interest is tracked by count,
//! not by the identity of the requester:
//! - The first add of a symbol (count 0→1) needs a wire subscribe
//! - The last remove of a symbol (count 1→0) needs a wire unsubscribe
//! - Everything in between is invisible upstream
//!
//! This allows any number of widgets to watch the same symbol while the feed
//! only ever sees one subscription for it.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::domain::symbols::CanonicalSymbol;

// =============================================================================
// Interest Registry
// =============================================================================

/// Mapping from canonical symbol to active-interest count.
///
/// Counts are never negative: removing a symbol that is not held is a no-op.
///
/// # Example
///
/// ```rust
/// use price_stream_mux::domain::subscription::InterestRegistry;
/// use price_stream_mux::domain::symbols::AliasResolver;
///
/// let resolver = AliasResolver::default();
/// let eurusd = resolver.canonicalize("EURUSD");
/// let mut registry = InterestRegistry::new();
///
/// // First widget needs the symbol on the wire
/// assert_eq!(registry.add_interest(&[eurusd.clone()]), vec![eurusd.clone()]);
///
/// // Second widget piggybacks
/// assert!(registry.add_interest(&[eurusd.clone()]).is_empty());
///
/// // One widget leaves, the symbol is still needed
/// assert!(registry.remove_interest(&[eurusd.clone()]).is_empty());
///
/// // Last widget leaves
/// assert_eq!(registry.remove_interest(&[eurusd.clone()]), vec![eurusd]);
/// assert!(registry.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct InterestRegistry {
    counts: HashMap<CanonicalSymbol, usize>,
}

impl InterestRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the count of each symbol.
    ///
    /// Returns the symbols that transitioned 0→1 (newly needed on the wire),
    /// each listed once even if repeated in the input.
    pub fn add_interest(&mut self, symbols: &[CanonicalSymbol]) -> Vec<CanonicalSymbol> {
        let mut newly_needed = Vec::new();

        for symbol in symbols {
            let count = self.counts.entry(symbol.clone()).or_insert(0);
            *count += 1;

            if *count == 1 {
                newly_needed.push(symbol.clone());
            }
        }

        newly_needed
    }

    /// Decrement the count of each symbol, flooring at zero.
    ///
    /// Returns the symbols that transitioned to 0 (no longer needed on the
    /// wire). Entries are removed as soon as they reach zero.
    pub fn remove_interest(&mut self, symbols: &[CanonicalSymbol]) -> Vec<CanonicalSymbol> {
        let mut released = Vec::new();

        for symbol in symbols {
            // Not held: never go negative
            let Some(count) = self.counts.get_mut(symbol) else {
                continue;
            };

            *count = count.saturating_sub(1);

            if *count == 0 {
                self.counts.remove(symbol);
                released.push(symbol.clone());
            }
        }

        released
    }

    /// All symbols with count > 0, sorted.
    #[must_use]
    pub fn current_interest_set(&self) -> Vec<CanonicalSymbol> {
        let mut symbols: Vec<_> = self.counts.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Current count for a symbol (0 when not held).
    #[must_use]
    pub fn count(&self, symbol: &CanonicalSymbol) -> usize {
        self.counts.get(symbol).copied().unwrap_or(0)
    }

    /// Whether the symbol is currently held by anyone.
    #[must_use]
    pub fn contains(&self, symbol: &CanonicalSymbol) -> bool {
        self.counts.contains_key(symbol)
    }

    /// Number of distinct symbols held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Whether no symbol is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Number of distinct symbols that adding `symbols` would introduce.
    #[must_use]
    pub fn new_symbol_count(&self, symbols: &[CanonicalSymbol]) -> usize {
        symbols
            .iter()
            .filter(|s| !self.counts.contains_key(*s))
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> InterestStats {
        InterestStats {
            symbol_count: self.counts.len(),
            total_interest: self.counts.values().sum(),
        }
    }
}

/// Statistics for the interest registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InterestStats {
    /// Number of distinct symbols held.
    pub symbol_count: usize,
    /// Sum of all reference counts.
    pub total_interest: usize,
}

// =============================================================================
// Pending Diff
// =============================================================================

/// Not-yet-sent wire changes accumulated between flushes.
///
/// Opposite changes to the same symbol cancel out, so a widget that
/// unmounts and remounts inside one batch window produces no wire traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingDiff {
    /// Symbols to subscribe on the next flush.
    pub subscribe: BTreeSet<CanonicalSymbol>,
    /// Symbols to unsubscribe on the next flush.
    pub unsubscribe: BTreeSet<CanonicalSymbol>,
}

impl PendingDiff {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }

    /// Merge symbols that became needed.
    pub fn add(&mut self, symbols: impl IntoIterator<Item = CanonicalSymbol>) {
        for symbol in symbols {
            if !self.unsubscribe.remove(&symbol) {
                self.subscribe.insert(symbol);
            }
        }
    }

    /// Merge symbols that are no longer needed.
    pub fn remove(&mut self, symbols: impl IntoIterator<Item = CanonicalSymbol>) {
        for symbol in symbols {
            if !self.subscribe.remove(&symbol) {
                self.unsubscribe.insert(symbol);
            }
        }
    }

    /// Take the accumulated diff, leaving this one empty.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Discard everything pending.
    pub fn clear(&mut self) {
        self.subscribe.clear();
        self.unsubscribe.clear();
    }
}

// =============================================================================
// Wire Instruction
// =============================================================================

/// One outbound subscribe/unsubscribe instruction in wire spellings.
///
/// Produced once per flush (or per reconnect replay).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WireInstruction {
    /// Wire symbols to subscribe, sorted.
    pub subscribe: Vec<String>,
    /// Wire symbols to unsubscribe, sorted.
    pub unsubscribe: Vec<String>,
}

impl WireInstruction {
    /// Build an instruction, expanding each canonical symbol with `spell`.
    pub fn from_diff<F>(diff: &PendingDiff, mut spell: F) -> Self
    where
        F: FnMut(&CanonicalSymbol) -> Vec<String>,
    {
        let subscribe = diff.subscribe.iter().flat_map(&mut spell).collect();
        let unsubscribe = diff.unsubscribe.iter().flat_map(&mut spell).collect();
        Self::new(subscribe, unsubscribe)
    }

    /// Create an instruction with only subscribes.
    #[must_use]
    pub fn subscribe_only(symbols: impl IntoIterator<Item = String>) -> Self {
        Self::new(symbols.into_iter().collect(), BTreeSet::new())
    }

    /// Check if the instruction carries nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }

    fn new(subscribe: BTreeSet<String>, unsubscribe: BTreeSet<String>) -> Self {
        Self {
            subscribe: subscribe.into_iter().collect(),
            unsubscribe: unsubscribe.into_iter().collect(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn sym(s: &str) -> CanonicalSymbol {
        CanonicalSymbol::new(s)
    }

    #[test]
    fn add_interest_new_symbol() {
        let mut registry = InterestRegistry::new();

        let added = registry.add_interest(&[sym("EURUSD")]);

        assert_eq!(added, vec![sym("EURUSD")]);
        assert_eq!(registry.count(&sym("EURUSD")), 1);
    }

    #[test]
    fn add_interest_existing_symbol() {
        let mut registry = InterestRegistry::new();

        registry.add_interest(&[sym("EURUSD")]);
        let added = registry.add_interest(&[sym("EURUSD")]);

        assert!(added.is_empty());
        assert_eq!(registry.count(&sym("EURUSD")), 2);
    }

    #[test]
    fn add_interest_repeated_in_one_call() {
        let mut registry = InterestRegistry::new();

        let added = registry.add_interest(&[sym("EURUSD"), sym("EURUSD")]);

        assert_eq!(added, vec![sym("EURUSD")]);
        assert_eq!(registry.count(&sym("EURUSD")), 2);
    }

    #[test]
    fn add_partially_existing_symbols() {
        let mut registry = InterestRegistry::new();

        registry.add_interest(&[sym("EURUSD")]);
        let added = registry.add_interest(&[sym("EURUSD"), sym("USDJPY")]);

        // Only USDJPY needs the wire
        assert_eq!(added, vec![sym("USDJPY")]);
    }

    #[test]
    fn remove_interest_with_remaining_holders() {
        let mut registry = InterestRegistry::new();

        registry.add_interest(&[sym("EURUSD")]);
        registry.add_interest(&[sym("EURUSD")]);

        let released = registry.remove_interest(&[sym("EURUSD")]);

        assert!(released.is_empty());
        assert!(registry.contains(&sym("EURUSD")));
    }

    #[test]
    fn remove_interest_last_holder() {
        let mut registry = InterestRegistry::new();

        registry.add_interest(&[sym("EURUSD")]);
        let released = registry.remove_interest(&[sym("EURUSD")]);

        assert_eq!(released, vec![sym("EURUSD")]);
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_interest_not_held_is_noop() {
        let mut registry = InterestRegistry::new();

        registry.add_interest(&[sym("GBPUSD")]);
        let released = registry.remove_interest(&[sym("EURUSD")]);

        assert!(released.is_empty());
        assert_eq!(registry.count(&sym("EURUSD")), 0);
        assert_eq!(registry.current_interest_set(), vec![sym("GBPUSD")]);
    }

    #[test]
    fn n_holders_need_n_removals() {
        let mut registry = InterestRegistry::new();

        for _ in 0..5 {
            registry.add_interest(&[sym("XAUUSD")]);
        }
        for _ in 0..4 {
            assert!(registry.remove_interest(&[sym("XAUUSD")]).is_empty());
            assert!(registry.current_interest_set().contains(&sym("XAUUSD")));
        }

        assert_eq!(registry.remove_interest(&[sym("XAUUSD")]), vec![sym("XAUUSD")]);
        assert!(registry.current_interest_set().is_empty());
    }

    #[test]
    fn current_interest_set_is_sorted() {
        let mut registry = InterestRegistry::new();

        registry.add_interest(&[sym("USDJPY"), sym("EURUSD"), sym("GBPUSD")]);

        assert_eq!(
            registry.current_interest_set(),
            vec![sym("EURUSD"), sym("GBPUSD"), sym("USDJPY")]
        );
    }

    #[test]
    fn new_symbol_count_ignores_held_and_duplicates() {
        let mut registry = InterestRegistry::new();
        registry.add_interest(&[sym("EURUSD")]);

        let count =
            registry.new_symbol_count(&[sym("EURUSD"), sym("USDJPY"), sym("USDJPY")]);

        assert_eq!(count, 1);
    }

    #[test]
    fn stats_are_accurate() {
        let mut registry = InterestRegistry::new();

        registry.add_interest(&[sym("EURUSD"), sym("USDJPY")]);
        registry.add_interest(&[sym("EURUSD")]);

        let stats = registry.stats();
        assert_eq!(stats.symbol_count, 2);
        assert_eq!(stats.total_interest, 3);
    }

    #[test]
    fn pending_diff_add_then_remove_cancels() {
        let mut diff = PendingDiff::default();

        diff.add([sym("EURUSD")]);
        diff.remove([sym("EURUSD")]);

        assert!(diff.is_empty());
    }

    #[test]
    fn pending_diff_remove_then_add_cancels() {
        let mut diff = PendingDiff::default();

        diff.remove([sym("EURUSD")]);
        diff.add([sym("EURUSD")]);

        assert!(diff.is_empty());
    }

    #[test]
    fn pending_diff_take_leaves_empty() {
        let mut diff = PendingDiff::default();
        diff.add([sym("EURUSD"), sym("GBPUSD")]);
        diff.remove([sym("USDJPY")]);

        let taken = diff.take();

        assert!(diff.is_empty());
        assert_eq!(taken.subscribe.len(), 2);
        assert_eq!(taken.unsubscribe.len(), 1);
    }

    #[test]
    fn wire_instruction_from_diff_expands_and_sorts() {
        let mut diff = PendingDiff::default();
        diff.add([sym("XAUUSD"), sym("EURUSD")]);
        diff.remove([sym("USDJPY")]);

        let instruction = WireInstruction::from_diff(&diff, |s| {
            if s == "XAUUSD" {
                vec!["XAUUSD".to_string(), "GOLD".to_string()]
            } else {
                vec![s.to_string()]
            }
        });

        assert_eq!(instruction.subscribe, vec!["EURUSD", "GOLD", "XAUUSD"]);
        assert_eq!(instruction.unsubscribe, vec!["USDJPY"]);
    }

    #[test]
    fn wire_instruction_is_empty() {
        assert!(WireInstruction::default().is_empty());
        assert!(!WireInstruction::subscribe_only(["EURUSD".to_string()]).is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(Vec<u8>),
        Remove(Vec<u8>),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        let symbols = prop::collection::vec(0u8..6, 0..4);
        prop_oneof![
            symbols.clone().prop_map(Op::Add),
            symbols.prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn counts_match_a_saturating_model(ops in prop::collection::vec(op_strategy(), 0..60)) {
            let mut registry = InterestRegistry::new();
            let mut model: HashMap<u8, usize> = HashMap::new();
            // Wire-visible state built only from the returned transitions
            let mut wire: BTreeSet<CanonicalSymbol> = BTreeSet::new();

            for op in ops {
                match op {
                    Op::Add(ids) => {
                        let symbols: Vec<_> = ids.iter().map(|i| sym(&format!("S{i}"))).collect();
                        for added in registry.add_interest(&symbols) {
                            prop_assert!(wire.insert(added));
                        }
                        for id in ids {
                            *model.entry(id).or_insert(0) += 1;
                        }
                    }
                    Op::Remove(ids) => {
                        let symbols: Vec<_> = ids.iter().map(|i| sym(&format!("S{i}"))).collect();
                        for released in registry.remove_interest(&symbols) {
                            prop_assert!(wire.remove(&released));
                        }
                        for id in ids {
                            if let Some(count) = model.get_mut(&id) {
                                *count = count.saturating_sub(1);
                                if *count == 0 {
                                    model.remove(&id);
                                }
                            }
                        }
                    }
                }

                for (id, expected) in &model {
                    prop_assert_eq!(registry.count(&sym(&format!("S{id}"))), *expected);
                }
                let held: BTreeSet<_> = registry.current_interest_set().into_iter().collect();
                prop_assert_eq!(&held, &wire);
                prop_assert_eq!(registry.len(), model.len());
            }
        }
    }
}
