//! A sequential, in-process MapReduce engine.
//!
//! Runs the same map, partition and reduce steps as the distributed path
//! and writes `mr-out-*` files in the same `key value` line format, so a
//! standalone run over the same inputs is directly comparable with a
//! cluster run.

use anyhow::Result;
use bytes::Bytes;
use dashmap::DashMap;
use glob::glob;
use itertools::Itertools;
use std::fs::File;
use std::io::{BufWriter, Read, Write};

use crate::standalone::Job;
use crate::{ihash, utils, KeyValue, Workload};

// types related to this engine
type BucketIndex = u32;
type Buckets = DashMap<BucketIndex, Vec<KeyValue>>;

pub fn perform_map(
    job: &Job,
    engine: &Workload,
    serialized_args: &Bytes,
    n_reduce: u32,
) -> Result<Buckets> {
    // Iterator going through all files matching the input glob.
    let input_files = glob(&job.input)?;
    let buckets: Buckets = Buckets::new();
    for pathspec in input_files.flatten() {
        let mut buf = Vec::new();
        {
            // a scope so that the file is closed right after reading
            let mut file = File::open(&pathspec)?;
            file.read_to_end(&mut buf)?;
        }
        let buf = Bytes::from(buf);
        let filename = pathspec.to_str().unwrap_or("unknown").to_string();
        // The map input is <filename, file contents>, same as a map task.
        let input_kv = KeyValue {
            key: Bytes::from(filename),
            value: buf,
        };
        let map_func = engine.map_fn;
        // Each emitted pair lands in the bucket its hashed key selects.
        for item in map_func(input_kv, serialized_args.clone())? {
            let KeyValue { key, value } = item?;
            let bucket_no = ihash(&key) % n_reduce;
            buckets
                .entry(bucket_no)
                .or_default()
                .push(KeyValue { key, value });
        }
    }

    Ok(buckets)
}

pub fn perform_reduce(
    job: &Job,
    engine: &Workload,
    serialized_args: &Bytes,
    n_reduce: u32,
    buckets: Buckets,
) -> Result<()> {
    let reduce_func = engine.reduce_fn;
    let output_dir = &job.output;
    // One output file per partition, empty partitions included, matching
    // what a cluster of workers would leave behind.
    for reduce_id in 0..n_reduce {
        let out_pathspec = format!("{}/{}", &output_dir, utils::output_name(reduce_id));
        let mut out_file = BufWriter::new(File::create(&out_pathspec)?);
        let mut bkt = buckets.remove(&reduce_id).map(|(_, kvs)| kvs).unwrap_or_default();
        bkt.sort_unstable_by_key(KeyValue::key);
        // Group the values for each distinct key and apply the reduce function.
        for (key, value_group) in &bkt.into_iter().chunk_by(KeyValue::key) {
            let iter = value_group.map(KeyValue::into_value);
            let out = reduce_func(key.clone(), Box::new(iter), serialized_args.clone())?;
            writeln!(
                out_file,
                "{} {}",
                utils::string_from_bytes(key)?,
                utils::string_from_bytes(out)?
            )?;
        }
        out_file.flush()?;
    }
    Ok(())
}
