/*
[INPUT]:  Decoded push data, order-book results, failures
[OUTPUT]: Events published to the downstream data sink
[POS]:    Data layer - sink event definitions
[UPDATE]: When adding new event kinds for downstream consumers
*/

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::enums::ConnectionKind;
use super::models::{BookKey, Level};
use crate::error::StreamError;

/// Category of a decoded data push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushKind {
    Ticker,
    Trade,
    Candle,
    Order,
    Position,
    Account,
}

/// A data push routed through a registered channel handler
#[derive(Debug, Clone, Serialize)]
pub struct PushData {
    pub kind: PushKind,
    pub channel: String,
    pub inst_id: Option<String>,
    pub data: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BookAction {
    Snapshot,
    Update,
}

/// Summary published after each successful order-book apply
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookUpdate {
    pub key: BookKey,
    pub action: BookAction,
    pub best_bid: Option<Level>,
    pub best_ask: Option<Level>,
    pub checksum: u32,
    pub updated_at: DateTime<Utc>,
}

/// Everything the streaming core hands to downstream consumers
#[derive(Debug)]
pub enum DataEvent {
    Push(PushData),
    OrderBook(BookUpdate),
    /// Non-fatal failure (decode error, desync, failed resubscribe, ...)
    Error(StreamError),
    /// Frame whose channel tag has no registered handler
    Unhandled { raw: String },
    Connection {
        kind: ConnectionKind,
        connected: bool,
        reason: Option<String>,
    },
    Authentication { authenticated: bool },
}
