//! A pseudo-application that counts how many times map tasks ran, to
//! check whether tasks get executed multiple times even when no worker
//! fails.
//!
//! Each map invocation drops a marker file and sleeps long enough to give
//! the coordinator a chance to misbehave; the reduce reports how many
//! markers exist.

use std::fs;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crate::*;
use anyhow::Result;
use bytes::Bytes;
use rand::Rng;

const MARKER_PREFIX: &str = "mr-worker-jobcount";

static COUNT: AtomicUsize = AtomicUsize::new(0);

pub fn map(_kv: KeyValue, _aux: Bytes) -> MapOutput {
    let marker = format!(
        "{}-{}-{}",
        MARKER_PREFIX,
        process::id(),
        COUNT.fetch_add(1, Ordering::SeqCst)
    );
    fs::write(marker, "x")?;
    thread::sleep(Duration::from_millis(
        2000 + rand::thread_rng().gen_range(0..3000),
    ));

    let pairs = vec![KeyValue::new(Bytes::from("a"), Bytes::from("x"))];
    Ok(Box::new(pairs.into_iter().map(Ok)))
}

pub fn reduce(
    _key: Bytes,
    _values: Box<dyn Iterator<Item = Bytes> + '_>,
    _aux: Bytes,
) -> Result<Bytes> {
    let invocations = fs::read_dir(".")?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with(MARKER_PREFIX)
        })
        .count();
    Ok(Bytes::from(invocations.to_string()))
}
