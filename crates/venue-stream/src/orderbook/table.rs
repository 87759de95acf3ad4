/*
[INPUT]:  Snapshot/update deltas keyed by (pair, asset)
[OUTPUT]: Shared, non-blocking readable order book table
[POS]:    Order book layer - per-key exclusive write regions
[UPDATE]: When changing locking or lifecycle of books
*/

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::book::{BookDelta, OrderBookState, OrderBookView};
use crate::error::{Result, StreamError};
use crate::types::{AssetClass, BookAction, BookKey, BookUpdate, ChecksumConvention, Level};

/// All books of one connector.
///
/// The outer lock only guards the key set; each book has its own mutex,
/// so writers for different keys never contend. Locks are never held
/// across an await point.
///
/// Routes map a (channel, instId) stream to the asset classes subscribed
/// on it; they outlive [`clear`](Self::clear).
#[derive(Debug)]
pub struct OrderBookTable {
    books: RwLock<HashMap<BookKey, Arc<Mutex<OrderBookState>>>>,
    routes: RwLock<HashMap<(String, String), Vec<AssetClass>>>,
    convention: ChecksumConvention,
}

impl OrderBookTable {
    pub fn new(convention: ChecksumConvention) -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            convention,
        }
    }

    pub fn convention(&self) -> ChecksumConvention {
        self.convention
    }

    /// Replace the stream routes with `(channel, symbol, asset)` entries
    pub fn set_routes(&self, routes: impl IntoIterator<Item = (String, String, AssetClass)>) {
        let mut table: HashMap<(String, String), Vec<AssetClass>> = HashMap::new();
        for (channel, symbol, asset) in routes {
            let assets = table.entry((channel, symbol)).or_default();
            if !assets.contains(&asset) {
                assets.push(asset);
            }
        }
        *self.routes.write() = table;
    }

    /// Asset classes whose books a push on (`channel`, `inst_id`) feeds.
    ///
    /// An explicit instType wins, then subscribed routes, then the
    /// instrument-id heuristic.
    pub fn assets_for(&self, channel: &str, inst_id: &str, inst_type: Option<AssetClass>) -> Vec<AssetClass> {
        if let Some(asset) = inst_type {
            return vec![asset];
        }
        let routes = self.routes.read();
        match routes.get(&(channel.to_string(), inst_id.to_string())) {
            Some(assets) if !assets.is_empty() => assets.clone(),
            _ => vec![AssetClass::guess_from_inst_id(inst_id)],
        }
    }

    fn entry(&self, key: &BookKey) -> Arc<Mutex<OrderBookState>> {
        if let Some(book) = self.books.read().get(key) {
            return Arc::clone(book);
        }
        let mut books = self.books.write();
        Arc::clone(
            books
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(OrderBookState::new(key.clone())))),
        )
    }

    fn get(&self, key: &BookKey) -> Option<Arc<Mutex<OrderBookState>>> {
        self.books.read().get(key).map(Arc::clone)
    }

    /// Replace the book for `key`; a rejected snapshot mutates nothing
    pub fn load_snapshot(&self, key: &BookKey, delta: &BookDelta) -> Result<BookUpdate> {
        let book = self.entry(key);
        let mut book = book.lock();
        let checksum = book.load_snapshot(delta, self.convention)?;
        debug!(book = %key, bids = delta.bids.len(), asks = delta.asks.len(), checksum, "order book snapshot loaded");
        Ok(summary(&book, BookAction::Snapshot, checksum))
    }

    /// Apply an update; `Ok(None)` when the update carried no levels
    pub fn apply_update(&self, key: &BookKey, delta: &BookDelta) -> Result<Option<BookUpdate>> {
        let book = self.entry(key);
        let mut book = book.lock();
        if delta.is_empty() && book.is_synced() {
            return Ok(None);
        }
        match book.apply_update(delta, self.convention) {
            Ok(checksum) => Ok(Some(summary(&book, BookAction::Update, checksum))),
            Err(err) => {
                if err.is_desync() && !matches!(err, StreamError::BookNotSynced { .. }) {
                    warn!(book = %key, error = %err, "order book desynchronized");
                }
                Err(err)
            }
        }
    }

    pub fn view(&self, key: &BookKey) -> Option<OrderBookView> {
        self.get(key).map(|book| book.lock().view())
    }

    /// Best bid and ask of a synced book
    pub fn top_of_book(&self, key: &BookKey) -> Option<(Option<Level>, Option<Level>)> {
        let book = self.get(key)?;
        let book = book.lock();
        book.is_synced().then(|| (book.best_bid(), book.best_ask()))
    }

    pub fn is_synced(&self, key: &BookKey) -> bool {
        self.get(key).is_some_and(|book| book.lock().is_synced())
    }

    pub fn keys(&self) -> Vec<BookKey> {
        self.books.read().keys().cloned().collect()
    }

    /// Force a fresh snapshot for one key
    pub fn invalidate(&self, key: &BookKey) {
        if let Some(book) = self.get(key) {
            book.lock().invalidate();
        }
    }

    /// Forget every book (reconnect path)
    pub fn clear(&self) {
        let mut books = self.books.write();
        let count = books.len();
        books.clear();
        if count > 0 {
            debug!(count, "discarded order books");
        }
    }
}

fn summary(book: &OrderBookState, action: BookAction, checksum: u32) -> BookUpdate {
    BookUpdate {
        key: book.key().clone(),
        action,
        best_bid: book.best_bid(),
        best_ask: book.best_ask(),
        checksum,
        updated_at: book.last_updated().unwrap_or_else(Utc::now),
    }
}
