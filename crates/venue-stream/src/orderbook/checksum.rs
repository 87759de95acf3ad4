/*
[INPUT]:  Sorted bid/ask levels
[OUTPUT]: CRC-32 (IEEE) over the top 25 levels
[POS]:    Order book layer - integrity check
[UPDATE]: When the venue changes its checksum layout
*/

use std::fmt::Write;

use rust_decimal::Decimal;

use crate::types::Level;

/// Levels per side that participate in the checksum
pub const CHECKSUM_DEPTH: usize = 25;

const SEPARATOR: char = ':';

/// Build the string the venue checksums.
///
/// Bids and asks must already be in book order (bids descending, asks
/// ascending). Levels alternate bid then ask for each depth index; a
/// missing side at an index is skipped.
pub fn checksum_payload<B, A>(bids: B, asks: A) -> String
where
    B: IntoIterator<Item = Level>,
    A: IntoIterator<Item = Level>,
{
    let mut bids = bids.into_iter().take(CHECKSUM_DEPTH);
    let mut asks = asks.into_iter().take(CHECKSUM_DEPTH);
    let mut out = String::new();

    loop {
        let bid = bids.next();
        let ask = asks.next();
        if bid.is_none() && ask.is_none() {
            break;
        }
        for level in [bid, ask].into_iter().flatten() {
            push_level(&mut out, &level);
        }
    }

    if out.ends_with(SEPARATOR) {
        out.pop();
    }
    out
}

fn push_level(out: &mut String, level: &Level) {
    // Writing into a String cannot fail
    let _ = write!(
        out,
        "{}{SEPARATOR}{}{SEPARATOR}",
        shortest(level.price),
        shortest(level.amount)
    );
}

/// Shortest exact decimal rendering ("1.50" -> "1.5", "2.000" -> "2")
fn shortest(value: Decimal) -> Decimal {
    value.normalize()
}

pub fn compute_checksum<B, A>(bids: B, asks: A) -> u32
where
    B: IntoIterator<Item = Level>,
    A: IntoIterator<Item = Level>,
{
    crc32fast::hash(checksum_payload(bids, asks).as_bytes())
}
