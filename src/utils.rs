//! Utility functions that may be helpful for implementing
//! and testing MapReduce.
//!

use std::fmt::Display;

use anyhow::Result;
use bytes::Bytes;

/// Canonical name of the shard map task `map_id` publishes for reduce
/// partition `reduce_id`.
pub fn shard_name(map_id: impl Display, reduce_id: impl Display) -> String {
    format!("mr-{}-{}", map_id, reduce_id)
}

/// Glob pattern matching every shard destined for partition `reduce_id`.
pub fn shard_pattern(reduce_id: impl Display) -> String {
    format!("mr-*-{}", reduce_id)
}

/// Canonical name of the final output file for partition `reduce_id`.
pub fn output_name(reduce_id: impl Display) -> String {
    format!("mr-out-{}", reduce_id)
}

/// Read an entire [`Bytes`] slice into a [`String`].
///
/// Note that the entire slice will be read into the string.
/// It is the caller's responsibility to ensure the slice is
/// of the correct length. Failure to do so may result in
/// an error being returned, or the string data being incorrect.
///
/// Returns an error if the slice contains invalid UTF-8.
pub fn string_from_bytes(buf: Bytes) -> Result<String> {
    Ok(String::from_utf8(buf.as_ref().into())?)
}

/// Convert a [`String`] to [`Bytes`].
#[inline]
pub fn string_to_bytes(s: String) -> Bytes {
    Bytes::from(s)
}
