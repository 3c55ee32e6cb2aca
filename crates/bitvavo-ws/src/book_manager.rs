//! Per-market local order books and resync policy.
//!
//! A tracked market is either *awaiting* a snapshot or *live*. Diffs are
//! only applied to live books; a nonce gap flips the book back to awaiting
//! and asks the caller for exactly one resync. Further diffs are ignored
//! until the next snapshot lands.

use bitvavo_core::{BookDiff, BookSnapshot, CoreError, OrderBook};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Outcome of feeding a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookUpdate {
    /// Diff applied; the updated book.
    Applied(OrderBook),
    /// Gap detected; request a new snapshot and resubscribe.
    Resync,
    /// Not tracked, or awaiting a snapshot.
    Ignored,
}

#[derive(Debug, Default)]
struct LocalBook {
    book: Option<OrderBook>,
    awaiting_snapshot: bool,
}

/// Local books keyed by market.
#[derive(Debug, Default)]
pub struct BookManager {
    books: HashMap<String, LocalBook>,
    resyncs: u64,
}

impl BookManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `market`. The book waits for its first snapshot.
    pub fn track(&mut self, market: &str) {
        let entry = self.books.entry(market.to_string()).or_default();
        entry.awaiting_snapshot = true;
    }

    /// Stop tracking `market` and discard its book.
    pub fn untrack(&mut self, market: &str) -> bool {
        self.books.remove(market).is_some()
    }

    pub fn is_tracked(&self, market: &str) -> bool {
        self.books.contains_key(market)
    }

    pub fn is_awaiting_snapshot(&self, market: &str) -> bool {
        self.books
            .get(market)
            .is_some_and(|local| local.awaiting_snapshot)
    }

    /// Put every tracked book back into the awaiting state (new session).
    pub fn reset_all(&mut self) {
        for local in self.books.values_mut() {
            local.awaiting_snapshot = true;
        }
    }

    /// Install a snapshot. Returns the book, or `None` for untracked markets.
    pub fn apply_snapshot(&mut self, snapshot: BookSnapshot) -> Option<OrderBook> {
        let Some(local) = self.books.get_mut(&snapshot.market) else {
            debug!(market = %snapshot.market, "Snapshot for untracked market ignored");
            return None;
        };
        match local.book.as_mut() {
            Some(book) => book.replace(snapshot),
            None => local.book = Some(OrderBook::from_snapshot(snapshot)),
        }
        local.awaiting_snapshot = false;
        local.book.clone()
    }

    /// Feed one diff.
    pub fn apply_diff(&mut self, diff: &BookDiff) -> BookUpdate {
        let Some(local) = self.books.get_mut(&diff.market) else {
            return BookUpdate::Ignored;
        };
        if local.awaiting_snapshot {
            return BookUpdate::Ignored;
        }
        let Some(book) = local.book.as_mut() else {
            return BookUpdate::Ignored;
        };

        match book.apply_diff(diff) {
            Ok(()) => BookUpdate::Applied(book.clone()),
            Err(CoreError::NonceGap {
                market,
                expected,
                received,
            }) => {
                warn!(%market, expected, received, "Book nonce gap, resyncing");
                local.awaiting_snapshot = true;
                self.resyncs += 1;
                BookUpdate::Resync
            }
            Err(e) => {
                warn!(market = %diff.market, error = %e, "Book diff rejected");
                BookUpdate::Ignored
            }
        }
    }

    pub fn book(&self, market: &str) -> Option<&OrderBook> {
        self.books.get(market).and_then(|local| local.book.as_ref())
    }

    /// Total resyncs triggered since creation.
    pub fn resync_count(&self) -> u64 {
        self.resyncs
    }

    pub fn markets(&self) -> impl Iterator<Item = &str> {
        self.books.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvavo_core::{Level, Price, Size};
    use rust_decimal_macros::dec;

    const MARKET: &str = "BTC-EUR";

    fn snapshot(nonce: u64) -> BookSnapshot {
        BookSnapshot {
            market: MARKET.to_string(),
            nonce,
            bids: vec![Level::new(Price::new(dec!(100)), Size::new(dec!(1)))],
            asks: vec![Level::new(Price::new(dec!(101)), Size::new(dec!(1)))],
        }
    }

    fn diff(nonce: u64) -> BookDiff {
        BookDiff {
            market: MARKET.to_string(),
            nonce,
            bids: vec![Level::new(Price::new(dec!(99.5)), Size::new(dec!(3)))],
            asks: vec![],
        }
    }

    #[test]
    fn test_untracked_market_ignored() {
        let mut books = BookManager::new();
        assert!(books.apply_snapshot(snapshot(10)).is_none());
        assert_eq!(books.apply_diff(&diff(11)), BookUpdate::Ignored);
    }

    #[test]
    fn test_diffs_ignored_until_snapshot() {
        let mut books = BookManager::new();
        books.track(MARKET);
        assert!(books.is_awaiting_snapshot(MARKET));
        assert_eq!(books.apply_diff(&diff(11)), BookUpdate::Ignored);

        let book = books.apply_snapshot(snapshot(10)).unwrap();
        assert_eq!(book.nonce, 10);
        assert!(!books.is_awaiting_snapshot(MARKET));

        match books.apply_diff(&diff(11)) {
            BookUpdate::Applied(book) => {
                assert_eq!(book.nonce, 11);
                assert_eq!(book.bids.len(), 2);
            }
            other => panic!("expected applied, got {other:?}"),
        }
    }

    #[test]
    fn test_gap_triggers_exactly_one_resync() {
        let mut books = BookManager::new();
        books.track(MARKET);
        books.apply_snapshot(snapshot(10));

        assert_eq!(books.apply_diff(&diff(12)), BookUpdate::Resync);
        // burst of further gapped diffs while awaiting
        assert_eq!(books.apply_diff(&diff(13)), BookUpdate::Ignored);
        assert_eq!(books.apply_diff(&diff(14)), BookUpdate::Ignored);
        assert_eq!(books.resync_count(), 1);

        // book kept its pre-gap state
        assert_eq!(books.book(MARKET).unwrap().nonce, 10);

        books.apply_snapshot(snapshot(20));
        assert!(matches!(books.apply_diff(&diff(21)), BookUpdate::Applied(_)));
    }

    #[test]
    fn test_reset_all_and_untrack() {
        let mut books = BookManager::new();
        books.track(MARKET);
        books.apply_snapshot(snapshot(10));

        books.reset_all();
        assert!(books.is_awaiting_snapshot(MARKET));
        assert_eq!(books.apply_diff(&diff(11)), BookUpdate::Ignored);

        assert!(books.untrack(MARKET));
        assert!(!books.is_tracked(MARKET));
        assert!(books.book(MARKET).is_none());
        assert_eq!(books.markets().count(), 0);
    }
}
