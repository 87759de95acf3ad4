/*
[INPUT]:  Order book snapshot/update payloads
[OUTPUT]: Checksum-verified books readable without network I/O
[POS]:    Order book layer - module root
[UPDATE]: When adding book storage or verification features
*/

pub mod book;
pub mod checksum;
pub mod table;

pub use book::{BookDelta, OrderBookState, OrderBookView, Side};
pub use checksum::{CHECKSUM_DEPTH, checksum_payload, compute_checksum};
pub use table::OrderBookTable;
