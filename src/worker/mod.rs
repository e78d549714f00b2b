//! The MapReduce worker.
//!
//! A worker registers once, then loops: request a task, execute it, report
//! the completion under the assignment identity the coordinator stamped on
//! it. Every file a worker produces is written to a fresh temporary file
//! and renamed into place, so a worker that dies or straggles mid-write can
//! never leave a half-written file under a canonical name.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use fnv::FnvHashMap;
use glob::glob;
use tempfile::NamedTempFile;
use tokio::time::{sleep, Duration};
use tonic::transport::Channel;
use tonic::Request;
use tracing::{info, warn};

use crate::rpc::{CompletionRequest, CoordinatorClient, RegisterRequest, Task, TaskKind, TaskRequest};
use crate::{codec, ihash, utils, KeyValue, Workload};

/// How long to wait before asking again when no task is available.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Consecutive failed polls after which the coordinator is presumed gone.
const MAX_RPC_FAILURES: u32 = 3;

type BucketIndex = u32;
type Buckets = DashMap<BucketIndex, Vec<KeyValue>>;

pub struct Worker {
    client: CoordinatorClient<Channel>,
    worker_id: i32,
    n_reduce: u32,
    workload: Workload,
    aux: Bytes,
    scratch_dir: PathBuf,
    out_dir: PathBuf,
}

impl Worker {
    /// Ensures the scratch directory exists and registers with the
    /// coordinator, obtaining a worker id and the reduce fanout.
    pub async fn register(
        mut client: CoordinatorClient<Channel>,
        workload: Workload,
        aux: Bytes,
        scratch_dir: impl Into<PathBuf>,
        out_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let scratch_dir = scratch_dir.into();
        let out_dir = out_dir.into();
        fs::create_dir_all(&scratch_dir)
            .with_context(|| format!("cannot create scratch directory {}", scratch_dir.display()))?;
        fs::create_dir_all(&out_dir)
            .with_context(|| format!("cannot create output directory {}", out_dir.display()))?;

        let reply = client
            .register_worker(Request::new(RegisterRequest {}))
            .await?
            .into_inner();
        info!(worker_id = reply.worker_id, n_reduce = reply.n_reduce, "worker registered");

        Ok(Self {
            client,
            worker_id: reply.worker_id,
            n_reduce: reply.n_reduce as u32,
            workload,
            aux,
            scratch_dir,
            out_dir,
        })
    }

    /// The request loop. Returns once the coordinator hands out an `EXIT`
    /// task or becomes unreachable (it exits right after the job is done).
    pub async fn run(mut self) -> Result<()> {
        let mut rpc_failures = 0;
        loop {
            let request = Request::new(TaskRequest {
                worker_id: self.worker_id,
            });
            let reply = match self.client.request_task(request).await {
                Ok(reply) => {
                    rpc_failures = 0;
                    reply.into_inner()
                }
                Err(status) => {
                    rpc_failures += 1;
                    if rpc_failures >= MAX_RPC_FAILURES {
                        // The coordinator exits shortly after the job is
                        // done; a dead endpoint means there is no more work.
                        info!(%status, "coordinator unreachable, shutting down");
                        return Ok(());
                    }
                    warn!(%status, "task request failed, retrying");
                    sleep(POLL_INTERVAL).await;
                    continue;
                }
            };
            let Some(task) = reply.task else {
                sleep(POLL_INTERVAL).await;
                continue;
            };

            match task.kind() {
                TaskKind::Exit => {
                    info!(worker_id = self.worker_id, "job complete, exiting");
                    return Ok(());
                }
                TaskKind::None => {
                    sleep(POLL_INTERVAL).await;
                }
                TaskKind::Map => {
                    match self.perform_map(&task) {
                        Ok(()) => self.report(reply.start_time_ms).await,
                        // Unreported: the lease expires and the task is
                        // reassigned.
                        Err(err) => warn!(id = task.id, %err, "map task failed"),
                    }
                }
                TaskKind::Reduce => {
                    match self.perform_reduce(&task) {
                        Ok(()) => self.report(reply.start_time_ms).await,
                        Err(err) => warn!(id = task.id, %err, "reduce task failed"),
                    }
                }
            }
        }
    }

    async fn report(&mut self, start_time_ms: i64) {
        let request = Request::new(CompletionRequest {
            worker_id: self.worker_id,
            start_time_ms,
        });
        match self.client.report_completion(request).await {
            Ok(reply) => {
                if !reply.into_inner().success {
                    // The lease was reaped while we worked; whatever we
                    // published is superseded by the replacement's files.
                    warn!(worker_id = self.worker_id, "completion arrived after lease expiry");
                }
            }
            Err(status) => warn!(%status, "failed to report completion"),
        }
    }

    /// Runs one map task: read the input file, partition the emitted pairs
    /// by `ihash(key) % R`, and publish one shard per partition.
    fn perform_map(&self, task: &Task) -> Result<()> {
        info!(id = task.id, file = %task.filename, "running map task");
        let contents = fs::read(&task.filename)
            .with_context(|| format!("cannot read input file {}", task.filename))?;
        let input_kv = KeyValue::new(
            Bytes::from(task.filename.clone().into_bytes()),
            Bytes::from(contents),
        );

        let buckets: Buckets = Buckets::new();
        let map_fn = self.workload.map_fn;
        for item in map_fn(input_kv, self.aux.clone())? {
            let kv = item?;
            let bucket_no = ihash(&kv.key) % self.n_reduce;
            buckets.entry(bucket_no).or_default().push(kv);
        }

        // Every partition gets a shard, empty ones included, so the reduce
        // side never has to distinguish a missing shard from an empty one.
        for bucket_no in 0..self.n_reduce {
            let records = buckets
                .remove(&bucket_no)
                .map(|(_, kvs)| kvs)
                .unwrap_or_default();
            let name = utils::shard_name(task.id, bucket_no);
            publish(&self.scratch_dir, &name, |file| {
                codec::write_records(file, &records)
            })?;
        }
        Ok(())
    }

    /// Runs one reduce task: decode every shard for this partition, group
    /// values by key, and publish the final output file.
    fn perform_reduce(&self, task: &Task) -> Result<()> {
        info!(id = task.id, "running reduce task");
        let pattern = self.scratch_dir.join(utils::shard_pattern(task.id));
        let pattern = pattern.to_str().context("scratch path is not valid UTF-8")?;

        let mut table: FnvHashMap<Bytes, Vec<Bytes>> = FnvHashMap::default();
        for path in glob(pattern)?.flatten() {
            let file = File::open(&path)
                .with_context(|| format!("cannot open shard {}", path.display()))?;
            for record in codec::read_records(BufReader::new(file)) {
                table.entry(record.key).or_default().push(record.value);
            }
        }

        let mut groups: Vec<(Bytes, Vec<Bytes>)> = table.into_iter().collect();
        groups.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        let reduce_fn = self.workload.reduce_fn;
        let aux = self.aux.clone();
        let name = utils::output_name(task.id);
        publish(&self.out_dir, &name, |file| {
            let mut writer = BufWriter::new(file);
            for (key, values) in groups {
                let out = reduce_fn(key.clone(), Box::new(values.into_iter()), aux.clone())?;
                writeln!(
                    writer,
                    "{} {}",
                    utils::string_from_bytes(key)?,
                    utils::string_from_bytes(out)?
                )?;
            }
            writer.flush()?;
            Ok(())
        })
    }
}

/// Writes a file through `fill`, then atomically renames it to
/// `dir/name`. Two racing publishers of the same name both succeed and the
/// later rename wins; a publisher that fails partway leaves nothing visible.
fn publish(
    dir: &Path,
    name: &str,
    fill: impl FnOnce(&mut File) -> Result<()>,
) -> Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("cannot create scratch file in {}", dir.display()))?;
    fill(tmp.as_file_mut())?;
    tmp.persist(dir.join(name))
        .map_err(|e| e.error)
        .with_context(|| format!("cannot publish {}", name))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload;
    use tempfile::tempdir;

    #[test]
    fn publish_renames_into_place() {
        let dir = tempdir().unwrap();
        publish(dir.path(), "mr-0-0", |file| {
            file.write_all(b"hello")?;
            Ok(())
        })
        .unwrap();
        assert_eq!(fs::read(dir.path().join("mr-0-0")).unwrap(), b"hello");
        // No stray temporary remains after publication.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn publish_last_writer_wins() {
        let dir = tempdir().unwrap();
        publish(dir.path(), "mr-1-0", |f| Ok(f.write_all(b"first")?)).unwrap();
        publish(dir.path(), "mr-1-0", |f| Ok(f.write_all(b"second")?)).unwrap();
        assert_eq!(fs::read(dir.path().join("mr-1-0")).unwrap(), b"second");
    }

    #[test]
    fn failed_publication_leaves_nothing_visible() {
        let dir = tempdir().unwrap();
        let result = publish(dir.path(), "mr-2-0", |_| anyhow::bail!("map function failed"));
        assert!(result.is_err());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    /// Map then reduce by hand over a scratch directory, the way one worker
    /// would execute the two phases of a single-file word count with R=2.
    #[tokio::test]
    async fn map_and_reduce_produce_word_counts() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("a.txt");
        fs::write(&input, "foo bar").unwrap();

        let wc = workload::named("wc").unwrap();
        let worker = Worker {
            client: CoordinatorClient::new(
                tonic::transport::Endpoint::from_static("http://[::]:1").connect_lazy(),
            ),
            worker_id: 1,
            n_reduce: 2,
            workload: wc,
            aux: Bytes::from("[]"),
            scratch_dir: dir.path().to_path_buf(),
            out_dir: dir.path().to_path_buf(),
        };

        let map_task = Task {
            kind: TaskKind::Map as i32,
            id: 0,
            filename: input.to_str().unwrap().to_string(),
        };
        worker.perform_map(&map_task).unwrap();
        assert!(dir.path().join("mr-0-0").exists());
        assert!(dir.path().join("mr-0-1").exists());

        for id in 0..2 {
            let reduce_task = Task {
                kind: TaskKind::Reduce as i32,
                id,
                filename: String::new(),
            };
            worker.perform_reduce(&reduce_task).unwrap();
        }

        let mut lines: Vec<String> = (0..2)
            .flat_map(|r| {
                let out = fs::read_to_string(dir.path().join(format!("mr-out-{}", r))).unwrap();
                out.lines().map(String::from).collect::<Vec<_>>()
            })
            .collect();
        lines.sort();
        assert_eq!(lines, ["bar 1", "foo 1"]);
    }

    #[tokio::test]
    async fn reduce_aggregates_values_across_shards() {
        let dir = tempdir().unwrap();
        // Two maps emitted values for the same key into partition 0.
        codec_shard(dir.path(), "mr-0-0", &[("foo", 2u64), ("baz", 1)]);
        codec_shard(dir.path(), "mr-1-0", &[("foo", 3u64)]);

        let worker = Worker {
            client: CoordinatorClient::new(
                tonic::transport::Endpoint::from_static("http://[::]:1").connect_lazy(),
            ),
            worker_id: 1,
            n_reduce: 1,
            workload: workload::named("wc").unwrap(),
            aux: Bytes::from("[]"),
            scratch_dir: dir.path().to_path_buf(),
            out_dir: dir.path().to_path_buf(),
        };
        let reduce_task = Task {
            kind: TaskKind::Reduce as i32,
            id: 0,
            filename: String::new(),
        };
        worker.perform_reduce(&reduce_task).unwrap();

        let out = fs::read_to_string(dir.path().join("mr-out-0")).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines, ["baz 1", "foo 5"]);
    }

    fn codec_shard(dir: &Path, name: &str, counts: &[(&str, u64)]) {
        use bytes::BufMut;
        let records: Vec<KeyValue> = counts
            .iter()
            .map(|(key, count)| {
                let mut value = bytes::BytesMut::with_capacity(8);
                value.put_u64(*count);
                KeyValue::new(Bytes::copy_from_slice(key.as_bytes()), value.freeze())
            })
            .collect();
        let mut buf = Vec::new();
        codec::write_records(&mut buf, &records).unwrap();
        fs::write(dir.join(name), buf).unwrap();
    }
}
