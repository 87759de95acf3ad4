/*
[INPUT]:  Decoded snapshot/update payloads for one (pair, asset)
[OUTPUT]: Sorted, checksum-verified book state and read-only views
[POS]:    Order book layer - per-instrument state machine
[UPDATE]: When changing apply semantics or integrity checks
*/

use std::cmp::Reverse;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use super::checksum::compute_checksum;
use crate::error::{Result, StreamError};
use crate::types::{BookKey, ChecksumConvention, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Bid,
    Ask,
}

/// Levels carried by one snapshot or update message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookDelta {
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    /// Venue-declared checksum; `None` skips verification
    pub checksum: Option<i64>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl BookDelta {
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

/// Point-in-time copy of a book, safe to hand to readers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderBookView {
    pub key: BookKey,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub checksum: u32,
    pub last_updated: Option<DateTime<Utc>>,
    pub synced: bool,
}

impl OrderBookView {
    pub fn best_bid(&self) -> Option<Level> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<Level> {
        self.asks.first().copied()
    }

    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }
}

/// Book for one (pair, asset).
///
/// Bids are keyed by `Reverse(price)` so both maps iterate best-first.
/// A book is `synced` only between a verified snapshot and the first
/// failed verification; unsynced books refuse updates.
#[derive(Debug, Clone)]
pub struct OrderBookState {
    key: BookKey,
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    last_checksum: u32,
    last_updated: Option<DateTime<Utc>>,
    synced: bool,
}

impl OrderBookState {
    pub fn new(key: BookKey) -> Self {
        Self {
            key,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_checksum: 0,
            last_updated: None,
            synced: false,
        }
    }

    pub fn key(&self) -> &BookKey {
        &self.key
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn last_checksum(&self) -> u32 {
        self.last_checksum
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    pub fn bids(&self) -> impl Iterator<Item = Level> + '_ {
        self.bids
            .iter()
            .map(|(Reverse(price), amount)| Level::new(*price, *amount))
    }

    pub fn asks(&self) -> impl Iterator<Item = Level> + '_ {
        self.asks
            .iter()
            .map(|(price, amount)| Level::new(*price, *amount))
    }

    pub fn best_bid(&self) -> Option<Level> {
        self.bids().next()
    }

    pub fn best_ask(&self) -> Option<Level> {
        self.asks().next()
    }

    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid.price >= ask.price,
            _ => false,
        }
    }

    /// Checksum over the current top levels
    pub fn checksum(&self) -> u32 {
        compute_checksum(self.bids(), self.asks())
    }

    /// Replace the whole book.
    ///
    /// The candidate is built and verified on the side; on failure the
    /// visible state is left exactly as it was.
    pub fn load_snapshot(&mut self, delta: &BookDelta, convention: ChecksumConvention) -> Result<u32> {
        let mut candidate = OrderBookState::new(self.key.clone());
        for level in &delta.bids {
            candidate.set_level(Side::Bid, *level);
        }
        for level in &delta.asks {
            candidate.set_level(Side::Ask, *level);
        }

        let checksum = candidate.verify(delta.checksum, convention)?;
        candidate.last_checksum = checksum;
        candidate.last_updated = Some(delta.timestamp.unwrap_or_else(Utc::now));
        candidate.synced = true;
        *self = candidate;
        Ok(checksum)
    }

    /// Apply an incremental update in place.
    ///
    /// A failed verification leaves the book unsynced; only a new
    /// snapshot brings it back.
    pub fn apply_update(&mut self, delta: &BookDelta, convention: ChecksumConvention) -> Result<u32> {
        if !self.synced {
            return Err(StreamError::BookNotSynced {
                key: self.key.clone(),
            });
        }
        if delta.is_empty() {
            return Ok(self.last_checksum);
        }

        for level in &delta.bids {
            self.set_level(Side::Bid, *level);
        }
        for level in &delta.asks {
            self.set_level(Side::Ask, *level);
        }

        match self.verify(delta.checksum, convention) {
            Ok(checksum) => {
                self.last_checksum = checksum;
                self.last_updated = Some(delta.timestamp.unwrap_or_else(Utc::now));
                Ok(checksum)
            }
            Err(err) => {
                self.synced = false;
                Err(err)
            }
        }
    }

    /// Drop all levels and require a fresh snapshot
    pub fn invalidate(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.synced = false;
    }

    pub fn view(&self) -> OrderBookView {
        OrderBookView {
            key: self.key.clone(),
            bids: self.bids().collect(),
            asks: self.asks().collect(),
            checksum: self.last_checksum,
            last_updated: self.last_updated,
            synced: self.synced,
        }
    }

    // amount 0 removes; removing an absent price is a no-op
    fn set_level(&mut self, side: Side, level: Level) {
        match (side, level.amount.is_zero()) {
            (Side::Bid, true) => {
                self.bids.remove(&Reverse(level.price));
            }
            (Side::Bid, false) => {
                self.bids.insert(Reverse(level.price), level.amount);
            }
            (Side::Ask, true) => {
                self.asks.remove(&level.price);
            }
            (Side::Ask, false) => {
                self.asks.insert(level.price, level.amount);
            }
        }
    }

    fn verify(&self, declared: Option<i64>, convention: ChecksumConvention) -> Result<u32> {
        let computed = self.checksum();
        if let Some(expected) = declared {
            if !convention.matches(computed, expected) {
                return Err(StreamError::ChecksumMismatch {
                    key: self.key.clone(),
                    expected,
                    computed,
                });
            }
        }
        if self.is_crossed() {
            return Err(StreamError::CrossedBook {
                key: self.key.clone(),
            });
        }
        Ok(computed)
    }
}
