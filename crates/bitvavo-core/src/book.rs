//! Local order book reconstruction.
//!
//! A book starts from an authoritative snapshot (`getBook`) and is then
//! advanced by incremental diffs from the `book` channel. Every diff carries
//! a nonce; a diff is only applied when its nonce is exactly one above the
//! book's current nonce; anything else means a message was missed and the
//! book must be rebuilt from a fresh snapshot.
//!
//! Invariants at every stable point:
//! - bids strictly descending by price, asks strictly ascending
//! - no duplicate prices, no zero-size levels
//! - `nonce` equals the nonce of the last applied snapshot or diff

use crate::error::{CoreError, Result};
use crate::{Price, Size};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One `(price, size)` level. On the wire: `["price", "size"]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(Price, Size)", into = "(Price, Size)")]
pub struct Level {
    pub price: Price,
    pub size: Size,
}

impl Level {
    pub fn new(price: Price, size: Size) -> Self {
        Self { price, size }
    }
}

impl From<(Price, Size)> for Level {
    fn from((price, size): (Price, Size)) -> Self {
        Self { price, size }
    }
}

impl From<Level> for (Price, Size) {
    fn from(level: Level) -> Self {
        (level.price, level.size)
    }
}

/// Side of the book, carrying its ordering rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Bid,
    Ask,
}

impl BookSide {
    /// True when price `a` sorts strictly before price `b` on this side.
    #[inline]
    pub fn precedes(self, a: Price, b: Price) -> bool {
        match self {
            Self::Bid => a > b,
            Self::Ask => a < b,
        }
    }
}

/// Full book as returned by the `getBook` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub market: String,
    pub nonce: u64,
    #[serde(default)]
    pub bids: Vec<Level>,
    #[serde(default)]
    pub asks: Vec<Level>,
}

/// Incremental update pushed on the `book` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookDiff {
    pub market: String,
    pub nonce: u64,
    #[serde(default)]
    pub bids: Vec<Level>,
    #[serde(default)]
    pub asks: Vec<Level>,
}

/// Merge a batch of level updates into one side of the book.
///
/// For each update the side is scanned for the first level the update does
/// not sort after. Equal price: replace (size > 0) or remove (size == 0).
/// Otherwise the update is inserted before that level, or appended when the
/// scan runs off the end. Zero-size updates for prices that are not in the
/// book are ignored.
///
/// O(updates * depth); books are tens of levels deep.
pub fn merge_levels(levels: &mut Vec<Level>, updates: &[Level], side: BookSide) {
    for update in updates {
        let slot = levels
            .iter()
            .position(|level| !side.precedes(level.price, update.price));

        match slot {
            Some(idx) if levels[idx].price == update.price => {
                if update.size.is_positive() {
                    levels[idx] = *update;
                } else {
                    levels.remove(idx);
                }
            }
            Some(idx) => {
                if update.size.is_positive() {
                    levels.insert(idx, *update);
                }
            }
            None => {
                if update.size.is_positive() {
                    levels.push(*update);
                }
            }
        }
    }
}

/// Reconstructed order book for one market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderBook {
    pub market: String,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub nonce: u64,
    pub updated_at: DateTime<Utc>,
}

impl OrderBook {
    /// Build a book from a snapshot.
    pub fn from_snapshot(snapshot: BookSnapshot) -> Self {
        Self {
            market: snapshot.market,
            bids: snapshot.bids,
            asks: snapshot.asks,
            nonce: snapshot.nonce,
            updated_at: Utc::now(),
        }
    }

    /// Replace bids, asks and nonce wholesale. No merge.
    pub fn replace(&mut self, snapshot: BookSnapshot) {
        self.bids = snapshot.bids;
        self.asks = snapshot.asks;
        self.nonce = snapshot.nonce;
        self.updated_at = Utc::now();
    }

    /// Nonce the next diff must carry.
    #[inline]
    pub fn expected_nonce(&self) -> u64 {
        self.nonce.wrapping_add(1)
    }

    /// Apply a diff.
    ///
    /// Returns `CoreError::NonceGap` without touching the book when the diff
    /// nonce is not exactly `nonce + 1`.
    pub fn apply_diff(&mut self, diff: &BookDiff) -> Result<()> {
        let expected = self.expected_nonce();
        if diff.nonce != expected {
            return Err(CoreError::NonceGap {
                market: self.market.clone(),
                expected,
                received: diff.nonce,
            });
        }

        merge_levels(&mut self.bids, &diff.bids, BookSide::Bid);
        merge_levels(&mut self.asks, &diff.asks, BookSide::Ask);
        self.nonce = diff.nonce;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn best_bid(&self) -> Option<Level> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<Level> {
        self.asks.first().copied()
    }

    /// Best ask minus best bid.
    pub fn spread(&self) -> Option<Price> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }

    pub fn mid_price(&self) -> Option<Price> {
        Some(self.best_bid()?.price.midpoint(self.best_ask()?.price))
    }

    /// The best `levels` entries of each side, as `(bids, asks)`.
    pub fn depth(&self, levels: usize) -> (&[Level], &[Level]) {
        (
            &self.bids[..levels.min(self.bids.len())],
            &self.asks[..levels.min(self.asks.len())],
        )
    }

    /// Check the ordering invariant on both sides.
    pub fn is_consistent(&self) -> bool {
        side_is_consistent(&self.bids, BookSide::Bid) && side_is_consistent(&self.asks, BookSide::Ask)
    }
}

fn side_is_consistent(levels: &[Level], side: BookSide) -> bool {
    levels.iter().all(|level| level.size.is_positive())
        && levels
            .windows(2)
            .all(|pair| side.precedes(pair[0].price, pair[1].price))
}
