/*
[INPUT]:  Operation name, ordered subscription args, byte cap
[OUTPUT]: Wire messages, each under the cap where possible
[POS]:    Subscription layer - size-capped request batching
[UPDATE]: When the venue changes its frame size limit or envelope
*/

use serde::Serialize;
use tracing::warn;

use crate::error::Result;

const ARGS_SUFFIX: &str = "]}";

/// One outbound `{"op":..,"args":[..]}` frame and the input indexes it carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub payload: String,
    pub entries: Vec<usize>,
}

/// Greedy packing in input order.
///
/// Entries accumulate until the next one would push the serialized frame
/// past `cap`; the accumulated batch is flushed and the overflowing entry
/// opens the next one. An entry that alone exceeds `cap` is sent by itself.
pub fn batch_requests<T: Serialize>(op: &str, args: &[T], cap: usize) -> Result<Vec<Batch>> {
    let prefix = format!("{{\"op\":{},\"args\":[", serde_json::to_string(op)?);
    let encoded = args
        .iter()
        .map(serde_json::to_string)
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let empty_len = prefix.len() + ARGS_SUFFIX.len();
    let mut batches = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut size = empty_len;

    for (index, arg) in encoded.iter().enumerate() {
        let mut added = arg.len() + usize::from(!current.is_empty());
        if !current.is_empty() && size + added > cap {
            batches.push(finish(&prefix, &encoded, std::mem::take(&mut current)));
            size = empty_len;
            added = arg.len();
        }
        current.push(index);
        size += added;
    }
    if !current.is_empty() {
        batches.push(finish(&prefix, &encoded, current));
    }

    for batch in &batches {
        if batch.payload.len() > cap {
            warn!(op, bytes = batch.payload.len(), cap, "single subscription exceeds frame cap");
        }
    }
    Ok(batches)
}

fn finish(prefix: &str, encoded: &[String], entries: Vec<usize>) -> Batch {
    let mut payload = String::from(prefix);
    for (n, index) in entries.iter().enumerate() {
        if n > 0 {
            payload.push(',');
        }
        payload.push_str(&encoded[*index]);
    }
    payload.push_str(ARGS_SUFFIX);
    Batch { payload, entries }
}
