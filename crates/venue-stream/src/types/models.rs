/*
[INPUT]:  Instrument identifiers and order-book price levels
[OUTPUT]: Keyed model types shared by subscriptions and order books
[POS]:    Data layer - core model definitions
[UPDATE]: When instrument identity or level representation changes
*/

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::enums::AssetClass;
use crate::error::{Result, StreamError};

/// A tradable pair/contract on the venue
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    /// Venue instrument id (e.g. "BTC-USDT")
    pub symbol: String,
    pub asset: AssetClass,
}

impl Instrument {
    pub fn new(symbol: impl Into<String>, asset: AssetClass) -> Self {
        Self {
            symbol: symbol.into(),
            asset,
        }
    }

    pub fn book_key(&self) -> BookKey {
        BookKey::new(self.symbol.clone(), self.asset)
    }
}

/// Order books are partitioned by (pair, asset)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BookKey {
    pub symbol: String,
    pub asset: AssetClass,
}

impl BookKey {
    pub fn new(symbol: impl Into<String>, asset: AssetClass) -> Self {
        Self {
            symbol: symbol.into(),
            asset,
        }
    }
}

impl fmt::Display for BookKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.symbol, self.asset)
    }
}

/// One (price, amount) row of an order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
}

impl Level {
    pub fn new(price: Decimal, amount: Decimal) -> Self {
        Self { price, amount }
    }

    /// Parse a venue row such as `["8476.98", "415", "0", "13"]`.
    ///
    /// Only the first two columns are used.
    pub fn from_row(row: &[String]) -> Result<Self> {
        let (Some(price), Some(amount)) = (row.first(), row.get(1)) else {
            return Err(StreamError::Decode(format!(
                "order book row needs price and amount, got {} columns",
                row.len()
            )));
        };
        Ok(Self {
            price: parse_decimal(price)?,
            amount: parse_decimal(amount)?,
        })
    }
}

fn parse_decimal(value: &str) -> Result<Decimal> {
    Decimal::from_str(value.trim())
        .map_err(|e| StreamError::Decode(format!("invalid decimal {value:?}: {e}")))
}

/// Auxiliary subscription parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionParams {
    /// Candle interval, e.g. "5m"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// Order-book depth
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
}
