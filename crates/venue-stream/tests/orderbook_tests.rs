/*
[INPUT]:  Order book snapshot/update sequences
[OUTPUT]: Test results for checksum-verified book synchronization
[POS]:    Integration tests - order book
[UPDATE]: When book application or checksum layout changes
*/

mod common;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::Value;
use std::str::FromStr;

use venue_stream::{AssetClass, BookDelta, BookKey, ChecksumConvention, Level, OrderBookTable, StreamError};

fn levels(rows: &[(Decimal, Decimal)]) -> Vec<Level> {
    rows.iter().map(|(price, amount)| Level::new(*price, *amount)).collect()
}

fn rows_from_json(value: &Value) -> Vec<Level> {
    value
        .as_array()
        .unwrap()
        .iter()
        .map(|row| {
            let row: Vec<String> = serde_json::from_value(row.clone()).unwrap();
            Level::from_row(&row).unwrap()
        })
        .collect()
}

fn delta_from_json(value: &Value) -> BookDelta {
    BookDelta {
        bids: rows_from_json(&value["bids"]),
        asks: rows_from_json(&value["asks"]),
        checksum: value["checksum"].as_i64(),
        timestamp: None,
    }
}

fn key() -> BookKey {
    BookKey::new("BTC-USDT", AssetClass::Spot)
}

fn scenario_snapshot() -> BookDelta {
    BookDelta {
        bids: levels(&[(dec!(100), dec!(1)), (dec!(99), dec!(2))]),
        asks: levels(&[(dec!(101), dec!(1)), (dec!(102), dec!(3))]),
        checksum: Some(-214_146_010),
        timestamp: None,
    }
}

#[test]
fn test_snapshot_checksum_matches_declared_value() {
    let table = OrderBookTable::new(ChecksumConvention::Signed);
    let update = table.load_snapshot(&key(), &scenario_snapshot()).unwrap();

    assert_eq!(update.checksum as i32, -214_146_010);
    assert_eq!(update.best_bid, Some(Level::new(dec!(100), dec!(1))));
    assert_eq!(update.best_ask, Some(Level::new(dec!(101), dec!(1))));
    assert!(table.is_synced(&key()));
}

#[test]
fn test_update_removes_and_inserts_levels() {
    let table = OrderBookTable::new(ChecksumConvention::Signed);
    table.load_snapshot(&key(), &scenario_snapshot()).unwrap();

    let update = BookDelta {
        bids: levels(&[(dec!(99), dec!(0)), (dec!(98), dec!(5))]),
        asks: vec![],
        checksum: None,
        timestamp: None,
    };
    table.apply_update(&key(), &update).unwrap();

    let view = table.view(&key()).unwrap();
    assert_eq!(view.bids, levels(&[(dec!(100), dec!(1)), (dec!(98), dec!(5))]));
    assert_eq!(view.asks, levels(&[(dec!(101), dec!(1)), (dec!(102), dec!(3))]));
}

#[test]
fn test_unsigned_convention_accepts_unsigned_declaration() {
    let table = OrderBookTable::new(ChecksumConvention::Unsigned);
    let snapshot = BookDelta {
        checksum: Some(4_080_821_286),
        ..scenario_snapshot()
    };
    assert!(table.load_snapshot(&key(), &snapshot).is_ok());

    let signed = OrderBookTable::new(ChecksumConvention::Unsigned);
    let err = signed.load_snapshot(&key(), &scenario_snapshot()).unwrap_err();
    assert!(matches!(err, StreamError::ChecksumMismatch { .. }));
}

#[test]
fn test_repeated_snapshot_is_idempotent() {
    let table = OrderBookTable::new(ChecksumConvention::Signed);
    let first = table.load_snapshot(&key(), &scenario_snapshot()).unwrap();
    let second = table.load_snapshot(&key(), &scenario_snapshot()).unwrap();

    assert_eq!(first.checksum, second.checksum);
    assert_eq!(table.view(&key()).unwrap().bids.len(), 2);
}

#[test]
fn test_update_order_changes_outcome() {
    let table = OrderBookTable::new(ChecksumConvention::Signed);
    table.load_snapshot(&key(), &scenario_snapshot()).unwrap();

    let set = |amount: Decimal| BookDelta {
        bids: levels(&[(dec!(99), amount)]),
        asks: vec![],
        checksum: None,
        timestamp: None,
    };
    table.apply_update(&key(), &set(dec!(7))).unwrap();
    table.apply_update(&key(), &set(dec!(0))).unwrap();
    let removed_last = table.view(&key()).unwrap();

    table.load_snapshot(&key(), &scenario_snapshot()).unwrap();
    table.apply_update(&key(), &set(dec!(0))).unwrap();
    table.apply_update(&key(), &set(dec!(7))).unwrap();
    let set_last = table.view(&key()).unwrap();

    assert_eq!(removed_last.bids.len(), 1);
    assert_eq!(set_last.bids[1], Level::new(dec!(99), dec!(7)));
}

#[test]
fn test_mismatch_marks_book_stale_until_next_snapshot() {
    let table = OrderBookTable::new(ChecksumConvention::Signed);
    table.load_snapshot(&key(), &scenario_snapshot()).unwrap();

    let bad = BookDelta {
        bids: levels(&[(dec!(100), dec!(2))]),
        asks: vec![],
        checksum: Some(12345),
        timestamp: None,
    };
    let err = table.apply_update(&key(), &bad).unwrap_err();
    assert!(err.is_desync());
    assert!(!table.is_synced(&key()));
    assert!(table.top_of_book(&key()).is_none());

    let follow_up = BookDelta {
        bids: levels(&[(dec!(97), dec!(1))]),
        asks: vec![],
        checksum: None,
        timestamp: None,
    };
    assert!(matches!(
        table.apply_update(&key(), &follow_up),
        Err(StreamError::BookNotSynced { .. })
    ));

    table.load_snapshot(&key(), &scenario_snapshot()).unwrap();
    assert!(table.is_synced(&key()));
}

#[test]
fn test_crossed_snapshot_is_rejected() {
    let table = OrderBookTable::new(ChecksumConvention::Signed);
    let crossed = BookDelta {
        bids: levels(&[(dec!(102), dec!(1))]),
        asks: levels(&[(dec!(101), dec!(1))]),
        checksum: None,
        timestamp: None,
    };
    let err = table.load_snapshot(&key(), &crossed).unwrap_err();
    assert!(matches!(err, StreamError::CrossedBook { .. }));
    assert!(!table.is_synced(&key()));
}

#[test]
fn test_recorded_sequences_stay_in_sync() {
    let cases = common::fixture("book_sequences.json");
    for case in cases.as_array().unwrap() {
        let name = case["name"].as_str().unwrap();
        let book = BookKey::new(format!("{name}-USDT"), AssetClass::Spot);
        let table = OrderBookTable::new(ChecksumConvention::Signed);

        table
            .load_snapshot(&book, &delta_from_json(&case["snapshot"]))
            .unwrap_or_else(|e| panic!("{name} snapshot: {e}"));
        for (idx, update) in case["updates"].as_array().unwrap().iter().enumerate() {
            table
                .apply_update(&book, &delta_from_json(update))
                .unwrap_or_else(|e| panic!("{name} update {idx}: {e}"));
        }

        let view = table.view(&book).unwrap();
        assert!(view.synced, "{name}");
        assert_eq!(view.bids.len() as u64, case["bid_levels"].as_u64().unwrap(), "{name}");
        assert_eq!(view.asks.len() as u64, case["ask_levels"].as_u64().unwrap(), "{name}");

        let expect_level = |row: &Value| {
            Level::new(
                Decimal::from_str(row[0].as_str().unwrap()).unwrap(),
                Decimal::from_str(row[1].as_str().unwrap()).unwrap(),
            )
        };
        assert_eq!(view.best_bid(), Some(expect_level(&case["best_bid"])), "{name}");
        assert_eq!(view.best_ask(), Some(expect_level(&case["best_ask"])), "{name}");
    }
}
