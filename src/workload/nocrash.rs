//! A fault-tolerance exercise application that never actually fails.
//!
//! Each map emits a small digest of its input file under four fixed keys;
//! the reduce sorts each key's values so the final output is deterministic
//! no matter how tasks were interleaved or re-executed.

use crate::*;
use anyhow::Result;
use bytes::Bytes;

pub fn map(kv: KeyValue, _aux: Bytes) -> MapOutput {
    let filename = String::from_utf8(kv.key.as_ref().into())?;
    let pairs = vec![
        KeyValue::new(Bytes::from("a"), Bytes::from(filename.clone())),
        KeyValue::new(Bytes::from("b"), Bytes::from(filename.len().to_string())),
        KeyValue::new(Bytes::from("c"), Bytes::from(kv.value.len().to_string())),
        KeyValue::new(Bytes::from("d"), Bytes::from("xyzzy")),
    ];
    Ok(Box::new(pairs.into_iter().map(Ok)))
}

pub fn reduce(
    _key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    _aux: Bytes,
) -> Result<Bytes> {
    // Sort values to ensure deterministic output.
    let mut values = values
        .map(|value| Ok(String::from_utf8(value.to_vec())?))
        .collect::<Result<Vec<String>>>()?;
    values.sort();
    Ok(Bytes::from(values.join(" ")))
}
