/*
[INPUT]:  Data-push envelopes routed by channel tag
[OUTPUT]: Order book applies, typed push events, resync requests
[POS]:    WebSocket layer - channel handler table
[UPDATE]: When adding channels or changing per-channel decoding
*/

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::Deserializer;
use tokio::sync::mpsc;
use tracing::debug;

use super::message::Envelope;
use crate::error::{Result, StreamError};
use crate::orderbook::{BookDelta, OrderBookTable};
use crate::sink::DataSink;
use crate::types::{
    AssetClass, BookAction, BookKey, ConnectionKind, DataEvent, Instrument, Level, PushData,
    PushKind,
};

/// Ask to re-subscribe a single instrument after its book desynchronized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncRequest {
    pub channel: String,
    pub instrument: Instrument,
}

/// Shared state handed to every handler invocation
#[derive(Clone)]
pub struct HandlerContext {
    pub sink: DataSink,
    pub books: Arc<OrderBookTable>,
    pub resync_tx: mpsc::UnboundedSender<ResyncRequest>,
}

impl HandlerContext {
    pub fn request_resync(&self, channel: &str, instrument: Instrument) {
        let _ = self.resync_tx.send(ResyncRequest {
            channel: channel.to_string(),
            instrument,
        });
    }
}

/// Decode-and-publish capability for one channel tag
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn handle(&self, ctx: &HandlerContext, kind: ConnectionKind, envelope: Envelope) -> Result<()>;

    /// Whether pushes on this channel feed the order book table
    fn maintains_books(&self) -> bool {
        false
    }
}

/// Channel tag -> handler table, built once at startup.
///
/// Tags are case-sensitive: `candle1M` (month) and `candle1m` (minute)
/// are different channels.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ChannelHandler>>,
    authenticated: HashSet<String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a public channel
    pub fn register(mut self, channel: &str, handler: Arc<dyn ChannelHandler>) -> Self {
        self.handlers.insert(channel.to_string(), handler);
        self
    }

    /// Register a channel that lives on the authenticated socket
    pub fn register_authenticated(mut self, channel: &str, handler: Arc<dyn ChannelHandler>) -> Self {
        self.authenticated.insert(channel.to_string());
        self.handlers.insert(channel.to_string(), handler);
        self
    }

    pub fn get(&self, channel: &str) -> Option<&Arc<dyn ChannelHandler>> {
        self.handlers.get(channel)
    }

    pub fn is_authenticated(&self, channel: &str) -> bool {
        self.authenticated.contains(channel)
    }

    pub fn authenticated_channels(&self) -> HashSet<String> {
        self.authenticated.clone()
    }

    /// Standard v5 channel set: books, tickers, trades, candles, orders, account
    pub fn with_default_channels() -> Self {
        let incremental: Arc<dyn ChannelHandler> = Arc::new(OrderBookHandler::incremental());
        let snapshots: Arc<dyn ChannelHandler> = Arc::new(OrderBookHandler::snapshots_only());

        let mut registry = Self::new()
            .register("books", Arc::clone(&incremental))
            .register("books-l2-tbt", Arc::clone(&incremental))
            .register("books50-l2-tbt", incremental)
            .register("books5", Arc::clone(&snapshots))
            .register("bbo-tbt", snapshots)
            .register("tickers", Arc::new(PushHandler::new(PushKind::Ticker)))
            .register("trades", Arc::new(PushHandler::new(PushKind::Trade)));

        let candles: Arc<dyn ChannelHandler> = Arc::new(PushHandler::new(PushKind::Candle));
        for interval in [
            "1m", "3m", "5m", "15m", "30m", "1H", "2H", "4H", "6H", "12H", "1D", "1W", "1M", "3M",
        ] {
            registry = registry.register(&format!("candle{interval}"), Arc::clone(&candles));
        }

        registry
            .register_authenticated("orders", Arc::new(PushHandler::new(PushKind::Order)))
            .register_authenticated("positions", Arc::new(PushHandler::new(PushKind::Position)))
            .register_authenticated("account", Arc::new(PushHandler::new(PushKind::Account)))
    }
}

/// Order book channel handler
#[derive(Debug, Clone, Copy)]
pub struct OrderBookHandler {
    snapshots_only: bool,
}

impl OrderBookHandler {
    /// Channel sends a snapshot followed by incremental updates
    pub fn incremental() -> Self {
        Self {
            snapshots_only: false,
        }
    }

    /// Channel sends a full book on every push (e.g. top-5 depth)
    pub fn snapshots_only() -> Self {
        Self {
            snapshots_only: true,
        }
    }

    fn action(&self, envelope: &Envelope) -> Result<BookAction> {
        if self.snapshots_only {
            return Ok(BookAction::Snapshot);
        }
        match envelope.action.as_deref() {
            Some(action) if action.eq_ignore_ascii_case("snapshot") => Ok(BookAction::Snapshot),
            Some(action) if action.eq_ignore_ascii_case("update") => Ok(BookAction::Update),
            None => Ok(BookAction::Snapshot),
            Some(other) => Err(StreamError::Decode(format!("unknown book action {other:?}"))),
        }
    }
}

#[async_trait]
impl ChannelHandler for OrderBookHandler {
    async fn handle(&self, ctx: &HandlerContext, _kind: ConnectionKind, envelope: Envelope) -> Result<()> {
        let channel = envelope.channel().unwrap_or_default().to_string();
        let inst_id = envelope
            .inst_id()
            .ok_or_else(|| StreamError::Decode(format!("{channel} push without instrument id")))?
            .to_string();
        // `books` pushes carry no instType; spot and margin share an instId
        let inst_type = envelope.inst_type().and_then(AssetClass::from_inst_type);
        let keys: Vec<BookKey> = ctx
            .books
            .assets_for(&channel, &inst_id, inst_type)
            .into_iter()
            .map(|asset| BookKey::new(inst_id.clone(), asset))
            .collect();
        let action = self.action(&envelope)?;

        for payload in envelope.data_as::<BookPayload>()? {
            let delta = payload.into_delta()?;
            for key in &keys {
                let applied = match action {
                    BookAction::Snapshot => ctx.books.load_snapshot(key, &delta).map(Some),
                    BookAction::Update => ctx.books.apply_update(key, &delta),
                };

                match applied {
                    Ok(Some(update)) => {
                        ctx.sink.publish(DataEvent::OrderBook(update)).await;
                    }
                    Ok(None) => {}
                    Err(StreamError::BookNotSynced { .. }) => {
                        // Stale book: a resubscribe is already in flight
                        debug!(book = %key, "dropping update for unsynced book");
                    }
                    Err(err) if err.is_desync() => {
                        // Every book fed by this stream missed the same delta
                        for sibling in &keys {
                            ctx.books.invalidate(sibling);
                        }
                        ctx.request_resync(&channel, Instrument::new(inst_id.clone(), key.asset));
                        return Err(err);
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    fn maintains_books(&self) -> bool {
        true
    }
}

#[derive(Debug, Deserialize)]
struct BookPayload {
    #[serde(default)]
    asks: Vec<Vec<String>>,
    #[serde(default)]
    bids: Vec<Vec<String>>,
    #[serde(default, deserialize_with = "declared_checksum")]
    checksum: Option<i64>,
    #[serde(default)]
    ts: Option<String>,
}

impl BookPayload {
    fn into_delta(self) -> Result<BookDelta> {
        let parse = |rows: Vec<Vec<String>>| -> Result<Vec<Level>> {
            rows.iter().map(|row| Level::from_row(row)).collect()
        };
        Ok(BookDelta {
            bids: parse(self.bids)?,
            asks: parse(self.asks)?,
            checksum: self.checksum,
            timestamp: self.ts.as_deref().and_then(parse_millis),
        })
    }
}

// A declared checksum of 0 means "not provided"
fn declared_checksum<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<i64>::deserialize(deserializer)?.filter(|value| *value != 0))
}

fn parse_millis(value: &str) -> Option<DateTime<Utc>> {
    value.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis)
}

/// Forwards the raw `data` rows of a channel to the sink
#[derive(Debug, Clone, Copy)]
pub struct PushHandler {
    kind: PushKind,
}

impl PushHandler {
    pub fn new(kind: PushKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl ChannelHandler for PushHandler {
    async fn handle(&self, ctx: &HandlerContext, _kind: ConnectionKind, envelope: Envelope) -> Result<()> {
        let data = match envelope.data_as::<serde_json::Value>() {
            Ok(rows) => rows,
            // Flat formats push a single object instead of an array
            Err(_) => match &envelope.data {
                Some(value @ serde_json::Value::Object(_)) => vec![value.clone()],
                _ => {
                    return Err(StreamError::Decode(format!(
                        "{} push without data",
                        envelope.channel().unwrap_or("unknown")
                    )));
                }
            },
        };
        ctx.sink
            .publish(DataEvent::Push(PushData {
                kind: self.kind,
                channel: envelope.channel().unwrap_or_default().to_string(),
                inst_id: envelope.inst_id().map(str::to_string),
                data,
            }))
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChecksumConvention;
    use rust_decimal_macros::dec;

    fn context() -> (
        HandlerContext,
        mpsc::Receiver<DataEvent>,
        mpsc::UnboundedReceiver<ResyncRequest>,
    ) {
        let (sink, events) = DataSink::channel(16);
        let (resync_tx, resync_rx) = mpsc::unbounded_channel();
        let ctx = HandlerContext {
            sink,
            books: Arc::new(OrderBookTable::new(ChecksumConvention::Signed)),
            resync_tx,
        };
        (ctx, events, resync_rx)
    }

    #[tokio::test]
    async fn test_snapshot_then_update() {
        let (ctx, mut events, _resync) = context();
        let handler = OrderBookHandler::incremental();

        let snapshot = Envelope::decode(
            r#"{"arg":{"channel":"books","instId":"BTC-USDT"},"action":"snapshot",
                "data":[{"bids":[["100","1","0","1"],["99","2","0","1"]],"asks":[["101","1","0","1"],["102","3","0","1"]],
                "ts":"1700000000000","checksum":-214146010}]}"#,
        )
        .unwrap();
        handler.handle(&ctx, ConnectionKind::Public, snapshot).await.unwrap();

        let update = Envelope::decode(
            r#"{"arg":{"channel":"books","instId":"BTC-USDT"},"action":"update",
                "data":[{"bids":[["99","0","0","0"],["98","5","0","2"]],"asks":[],"ts":"1700000000100","checksum":0}]}"#,
        )
        .unwrap();
        handler.handle(&ctx, ConnectionKind::Public, update).await.unwrap();

        let key = BookKey::new("BTC-USDT", AssetClass::Spot);
        let view = ctx.books.view(&key).unwrap();
        assert_eq!(
            view.bids,
            vec![Level::new(dec!(100), dec!(1)), Level::new(dec!(98), dec!(5))]
        );

        let Some(DataEvent::OrderBook(first)) = events.recv().await else {
            panic!("expected order book event");
        };
        assert_eq!(first.action, BookAction::Snapshot);
        assert_eq!(first.updated_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[tokio::test]
    async fn test_checksum_failure_requests_resync() {
        let (ctx, _events, mut resync) = context();
        let handler = OrderBookHandler::incremental();
        let snapshot = Envelope::decode(
            r#"{"arg":{"channel":"books","instId":"ETH-USDT-SWAP"},"action":"snapshot",
                "data":[{"bids":[["10","1"]],"asks":[["11","1"]],"checksum":99}]}"#,
        )
        .unwrap();

        let err = handler
            .handle(&ctx, ConnectionKind::Public, snapshot)
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::ChecksumMismatch { .. }));

        let request = resync.recv().await.unwrap();
        assert_eq!(request.channel, "books");
        assert_eq!(
            request.instrument,
            Instrument::new("ETH-USDT-SWAP", AssetClass::PerpetualSwap)
        );
    }

    #[tokio::test]
    async fn test_margin_route_keys_book_and_resync() {
        let (ctx, _events, mut resync) = context();
        ctx.books.set_routes([("books".to_string(), "BTC-USDT".to_string(), AssetClass::Margin)]);
        let handler = OrderBookHandler::incremental();

        let snapshot = Envelope::decode(
            r#"{"arg":{"channel":"books","instId":"BTC-USDT"},"action":"snapshot",
                "data":[{"bids":[["100","1","0","1"],["99","2","0","1"]],"asks":[["101","1","0","1"],["102","3","0","1"]],
                "checksum":-214146010}]}"#,
        )
        .unwrap();
        handler.handle(&ctx, ConnectionKind::Public, snapshot).await.unwrap();

        let margin = BookKey::new("BTC-USDT", AssetClass::Margin);
        assert!(ctx.books.is_synced(&margin));
        assert!(ctx.books.view(&BookKey::new("BTC-USDT", AssetClass::Spot)).is_none());

        let bad = Envelope::decode(
            r#"{"arg":{"channel":"books","instId":"BTC-USDT"},"action":"update",
                "data":[{"bids":[["98","5","0","1"]],"asks":[],"checksum":123}]}"#,
        )
        .unwrap();
        let err = handler.handle(&ctx, ConnectionKind::Public, bad).await.unwrap_err();
        assert!(matches!(err, StreamError::ChecksumMismatch { .. }));
        assert!(!ctx.books.is_synced(&margin));

        let request = resync.recv().await.unwrap();
        assert_eq!(request.channel, "books");
        assert_eq!(request.instrument, Instrument::new("BTC-USDT", AssetClass::Margin));
    }

    #[tokio::test]
    async fn test_shared_stream_invalidates_every_routed_book() {
        let (ctx, _events, mut resync) = context();
        ctx.books.set_routes([
            ("books".to_string(), "ETH-USDT".to_string(), AssetClass::Spot),
            ("books".to_string(), "ETH-USDT".to_string(), AssetClass::Margin),
        ]);
        let handler = OrderBookHandler::incremental();
        let snapshot = Envelope::decode(
            r#"{"arg":{"channel":"books","instId":"ETH-USDT"},"action":"snapshot",
                "data":[{"bids":[["10","1"]],"asks":[["11","1"]]}]}"#,
        )
        .unwrap();
        handler.handle(&ctx, ConnectionKind::Public, snapshot).await.unwrap();
        let spot = BookKey::new("ETH-USDT", AssetClass::Spot);
        let margin = BookKey::new("ETH-USDT", AssetClass::Margin);
        assert!(ctx.books.is_synced(&spot) && ctx.books.is_synced(&margin));

        let bad = Envelope::decode(
            r#"{"arg":{"channel":"books","instId":"ETH-USDT"},"action":"update",
                "data":[{"bids":[["9","1"]],"asks":[],"checksum":7}]}"#,
        )
        .unwrap();
        assert!(handler.handle(&ctx, ConnectionKind::Public, bad).await.is_err());
        assert!(!ctx.books.is_synced(&spot));
        assert!(!ctx.books.is_synced(&margin));
        assert!(resync.recv().await.is_some());
        assert!(resync.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_push_handler_publishes_rows() {
        let (ctx, mut events, _resync) = context();
        let envelope = Envelope::decode(
            r#"{"arg":{"channel":"tickers","instId":"BTC-USDT"},"data":[{"last":"9999.99"}]}"#,
        )
        .unwrap();
        PushHandler::new(PushKind::Ticker)
            .handle(&ctx, ConnectionKind::Public, envelope)
            .await
            .unwrap();

        let Some(DataEvent::Push(push)) = events.recv().await else {
            panic!("expected push event");
        };
        assert_eq!(push.kind, PushKind::Ticker);
        assert_eq!(push.inst_id.as_deref(), Some("BTC-USDT"));
        assert_eq!(push.data[0]["last"], "9999.99");
    }

    #[test]
    fn test_default_registry() {
        let registry = HandlerRegistry::with_default_channels();
        assert!(registry.get("books").is_some());
        assert!(registry.get("candle1H").is_some());
        assert!(registry.get("unknown").is_none());
        assert!(registry.is_authenticated("orders"));
        assert!(!registry.is_authenticated("tickers"));
        assert!(!registry.is_authenticated("ORDERS"));
        assert!(registry.get("candle1M").is_some());
        assert!(registry.get("candle1m").is_some());
        assert!(registry.get("BOOKS").is_none());
    }

    #[test]
    fn test_month_and_minute_candles_register_separately() {
        let month: Arc<dyn ChannelHandler> = Arc::new(PushHandler::new(PushKind::Candle));
        let minute: Arc<dyn ChannelHandler> = Arc::new(PushHandler::new(PushKind::Candle));
        let registry = HandlerRegistry::new()
            .register("candle1M", Arc::clone(&month))
            .register("candle1m", Arc::clone(&minute));

        assert!(Arc::ptr_eq(registry.get("candle1M").unwrap(), &month));
        assert!(Arc::ptr_eq(registry.get("candle1m").unwrap(), &minute));
    }
}
