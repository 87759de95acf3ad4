/*
[INPUT]:  Venue protocol tags and serde requirements
[OUTPUT]: Typed Rust enums with serialization support
[POS]:    Data layer - enum definitions shared across layers
[UPDATE]: When venue tags change or new asset classes are added
*/

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Spot,
    Margin,
    PerpetualSwap,
    Futures,
    Options,
}

impl AssetClass {
    /// Venue instrument-type tag for this asset class
    pub fn inst_type(self) -> &'static str {
        match self {
            AssetClass::Spot => "SPOT",
            AssetClass::Margin => "MARGIN",
            AssetClass::PerpetualSwap => "SWAP",
            AssetClass::Futures => "FUTURES",
            AssetClass::Options => "OPTION",
        }
    }

    /// Parse a venue instrument-type tag (case-insensitive)
    pub fn from_inst_type(tag: &str) -> Option<Self> {
        match tag.to_ascii_uppercase().as_str() {
            "SPOT" => Some(AssetClass::Spot),
            "MARGIN" => Some(AssetClass::Margin),
            "SWAP" => Some(AssetClass::PerpetualSwap),
            "FUTURES" => Some(AssetClass::Futures),
            "OPTION" => Some(AssetClass::Options),
            _ => None,
        }
    }

    /// Guess the asset class from the shape of an instrument id.
    ///
    /// `BTC-USDT-SWAP` is a perpetual, `BTC-USD-240628` a dated future,
    /// `BTC-USD-240628-60000-C` an option; anything else is treated as spot.
    pub fn guess_from_inst_id(inst_id: &str) -> Self {
        let parts: Vec<&str> = inst_id.split('-').collect();
        match parts.as_slice() {
            [.., last] if last.eq_ignore_ascii_case("SWAP") => AssetClass::PerpetualSwap,
            [_, _, _, _, side] if side.eq_ignore_ascii_case("C") || side.eq_ignore_ascii_case("P") => {
                AssetClass::Options
            }
            [_, _, expiry] if !expiry.is_empty() && expiry.chars().all(|c| c.is_ascii_digit()) => {
                AssetClass::Futures
            }
            _ => AssetClass::Spot,
        }
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.inst_type())
    }
}

/// Which logical socket a frame or request belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Public,
    Authenticated,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::Public => f.write_str("public"),
            ConnectionKind::Authenticated => f.write_str("authenticated"),
        }
    }
}

/// How the venue declares its order-book checksum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumConvention {
    /// CRC-32 reinterpreted as a signed 32-bit integer
    #[default]
    Signed,
    Unsigned,
}

impl ChecksumConvention {
    pub fn matches(self, computed: u32, declared: i64) -> bool {
        match self {
            ChecksumConvention::Signed => i64::from(computed as i32) == declared,
            ChecksumConvention::Unsigned => i64::from(computed) == declared,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureEncoding {
    #[default]
    Base64,
    Hex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Active,
    Removing,
}
