//! The MapReduce coordinator.
//!
//! The coordinator owns the global task set and its phase. Map tasks are
//! created at startup, one per input file; the `R` reduce tasks are created
//! in the same critical section that retires the last map task, so no
//! handler can ever observe an empty queue between the two phases. Workers
//! hold tasks under leases named by `(worker_id, start_time_ms)`; a
//! background reaper returns timed-out leases to the pending queue, and a
//! completion report is only honored while its lease is still present.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fnv::FnvHashMap;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::rpc::coordinator_server::Coordinator;
use crate::rpc::{
    CompletionReply, CompletionRequest, RegisterReply, RegisterRequest, Task, TaskKind, TaskReply,
    TaskRequest,
};

/// How long a worker may hold a task before the coordinator writes it off.
pub const TASK_TIMEOUT_MS: i64 = 10_000;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as i64
}

/// The assignment identity: which worker was granted a task, and when.
/// Re-leasing the same task later yields a distinct key, which is what lets
/// the coordinator tell a live completion from a stale one.
type LeaseKey = (i32, i64);

struct State {
    pending: VecDeque<Task>,
    leases: FnvHashMap<LeaseKey, Task>,
    remaining_map: u32,
    remaining_reduce: u32,
    next_worker_id: i32,
}

/// The coordinator service, shared between RPC handlers and the reaper.
#[derive(Clone)]
pub struct CoordinatorService {
    state: Arc<Mutex<State>>,
    n_reduce: u32,
    timeout_ms: i64,
}

impl CoordinatorService {
    /// Creates a coordinator for one job over `files`, with `n_reduce`
    /// output partitions.
    pub fn new(files: Vec<String>, n_reduce: u32, timeout_ms: i64) -> Self {
        let n_map = files.len() as u32;
        let mut pending = VecDeque::with_capacity(files.len().max(n_reduce as usize));
        for (id, filename) in files.into_iter().enumerate() {
            pending.push_back(Task {
                kind: TaskKind::Map as i32,
                id: id as i32,
                filename,
            });
        }
        // With no input files there is nothing for the reduce phase to
        // aggregate either; the job starts out finished.
        let remaining_reduce = if n_map == 0 { 0 } else { n_reduce };
        info!(n_map, n_reduce, "coordinator created, map tasks scheduled");
        Self {
            state: Arc::new(Mutex::new(State {
                pending,
                leases: FnvHashMap::default(),
                remaining_map: n_map,
                remaining_reduce,
                next_worker_id: 0,
            })),
            n_reduce,
            timeout_ms,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True iff every map and reduce task has been completed.
    pub fn done(&self) -> bool {
        let state = self.state();
        state.remaining_map == 0 && state.remaining_reduce == 0
    }

    /// Returns every lease older than the timeout to the pending queue.
    ///
    /// Removal and re-enqueue happen under one lock, so a completion racing
    /// with the reaper sees either the lease or the requeued task, never
    /// both. Phase counters are not touched.
    pub fn reap_expired(&self, now: i64) {
        let mut state = self.state();
        let expired: Vec<LeaseKey> = state
            .leases
            .iter()
            .filter(|((_, start), _)| now - start > self.timeout_ms)
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            if let Some(task) = state.leases.remove(&key) {
                info!(
                    kind = ?task.kind(),
                    id = task.id,
                    worker_id = key.0,
                    "rescheduling task after lease timeout"
                );
                state.pending.push_back(task);
            }
        }
    }

    /// Spawns the background lease reaper. The scan period stays under a
    /// third of the timeout so an expired lease is never held much past it.
    pub fn start_reaper(&self) {
        let service = self.clone();
        let period = Duration::from_millis((self.timeout_ms / 3).max(1) as u64);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                service.reap_expired(now_ms());
            }
        });
    }
}

#[tonic::async_trait]
impl Coordinator for CoordinatorService {
    async fn register_worker(
        &self,
        _request: Request<RegisterRequest>,
    ) -> Result<Response<RegisterReply>, Status> {
        let mut state = self.state();
        state.next_worker_id += 1;
        let worker_id = state.next_worker_id;
        info!(worker_id, "worker registered");
        Ok(Response::new(RegisterReply {
            n_reduce: self.n_reduce as i32,
            worker_id,
        }))
    }

    async fn request_task(
        &self,
        request: Request<TaskRequest>,
    ) -> Result<Response<TaskReply>, Status> {
        let worker_id = request.get_ref().worker_id;
        let mut state = self.state();

        if state.remaining_map == 0 && state.remaining_reduce == 0 {
            return Ok(Response::new(TaskReply {
                task: Some(Task {
                    kind: TaskKind::Exit as i32,
                    id: -1,
                    filename: String::new(),
                }),
                start_time_ms: 0,
            }));
        }

        match state.pending.pop_front() {
            Some(task) => {
                let start_time_ms = now_ms();
                state.leases.insert((worker_id, start_time_ms), task.clone());
                debug!(worker_id, kind = ?task.kind(), id = task.id, "task assigned");
                Ok(Response::new(TaskReply {
                    task: Some(task),
                    start_time_ms,
                }))
            }
            // Nothing to hand out right now; the worker polls again later.
            None => Ok(Response::new(TaskReply {
                task: Some(Task {
                    kind: TaskKind::None as i32,
                    id: -1,
                    filename: String::new(),
                }),
                start_time_ms: 0,
            })),
        }
    }

    async fn report_completion(
        &self,
        request: Request<CompletionRequest>,
    ) -> Result<Response<CompletionReply>, Status> {
        let req = request.get_ref();
        let mut state = self.state();

        let task = match state.leases.remove(&(req.worker_id, req.start_time_ms)) {
            Some(task) => task,
            // The reaper already gave this task away; the stale worker's
            // output is discarded and the replacement's commit wins.
            None => return Ok(Response::new(CompletionReply { success: false })),
        };

        match task.kind() {
            TaskKind::Map => {
                state.remaining_map -= 1;
                debug!(id = task.id, remaining = state.remaining_map, "map task completed");
                if state.remaining_map == 0 {
                    // Still inside the critical section that retired the
                    // last map, so remaining_map == 0 is never observable
                    // with an empty queue and no pending reduces.
                    for id in 0..self.n_reduce {
                        state.pending.push_back(Task {
                            kind: TaskKind::Reduce as i32,
                            id: id as i32,
                            filename: String::new(),
                        });
                    }
                    info!(n_reduce = self.n_reduce, "map phase complete, reduce tasks scheduled");
                }
            }
            TaskKind::Reduce => {
                state.remaining_reduce -= 1;
                debug!(id = task.id, remaining = state.remaining_reduce, "reduce task completed");
                if state.remaining_reduce == 0 {
                    info!("all tasks complete");
                }
            }
            // NONE and EXIT are reply-only sentinels and are never leased.
            _ => return Err(Status::internal("sentinel task found in lease table")),
        }

        Ok(Response::new(CompletionReply { success: true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(files: &[&str], n_reduce: u32) -> CoordinatorService {
        CoordinatorService::new(
            files.iter().map(|f| f.to_string()).collect(),
            n_reduce,
            TASK_TIMEOUT_MS,
        )
    }

    async fn register(svc: &CoordinatorService) -> i32 {
        svc.register_worker(Request::new(RegisterRequest {}))
            .await
            .unwrap()
            .into_inner()
            .worker_id
    }

    async fn request(svc: &CoordinatorService, worker_id: i32) -> TaskReply {
        svc.request_task(Request::new(TaskRequest { worker_id }))
            .await
            .unwrap()
            .into_inner()
    }

    async fn report(svc: &CoordinatorService, worker_id: i32, start_time_ms: i64) -> bool {
        svc.report_completion(Request::new(CompletionRequest {
            worker_id,
            start_time_ms,
        }))
        .await
        .unwrap()
        .into_inner()
        .success
    }

    #[tokio::test]
    async fn registration_allocates_distinct_ids() {
        let svc = service(&["a.txt"], 1);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            assert!(seen.insert(register(&svc).await));
        }
    }

    #[tokio::test]
    async fn empty_input_is_immediately_done() {
        let svc = service(&[], 3);
        assert!(svc.done());
        let reply = request(&svc, 1).await;
        assert_eq!(reply.task.unwrap().kind(), TaskKind::Exit);
    }

    #[tokio::test]
    async fn tasks_are_assigned_in_arrival_order() {
        let svc = service(&["a.txt", "b.txt", "c.txt"], 1);
        let worker = register(&svc).await;
        for expected in ["a.txt", "b.txt", "c.txt"] {
            let task = request(&svc, worker).await.task.unwrap();
            assert_eq!(task.kind(), TaskKind::Map);
            assert_eq!(task.filename, expected);
        }
        // Queue drained but job unfinished: the worker is told to poll again.
        let task = request(&svc, worker).await.task.unwrap();
        assert_eq!(task.kind(), TaskKind::None);
    }

    #[tokio::test]
    async fn reduces_appear_only_after_last_map_completes() {
        let svc = service(&["a.txt", "b.txt"], 2);
        // One map per worker: a worker runs a single task at a time, so a
        // lease key is never shared between outstanding assignments.
        let worker_a = register(&svc).await;
        let worker_b = register(&svc).await;

        let first = request(&svc, worker_a).await;
        let second = request(&svc, worker_b).await;
        assert!(report(&svc, worker_a, first.start_time_ms).await);

        // One map is still out; no reduce may be dispatched yet.
        let reply = request(&svc, worker_a).await;
        assert_eq!(reply.task.unwrap().kind(), TaskKind::None);

        assert!(report(&svc, worker_b, second.start_time_ms).await);

        for _ in 0..2 {
            let reply = request(&svc, worker_a).await;
            let task = reply.task.unwrap();
            assert_eq!(task.kind(), TaskKind::Reduce);
            assert!(report(&svc, worker_a, reply.start_time_ms).await);
        }
        assert!(svc.done());
        let reply = request(&svc, worker_a).await;
        assert_eq!(reply.task.unwrap().kind(), TaskKind::Exit);
    }

    #[tokio::test]
    async fn unknown_assignment_identity_is_refused() {
        let svc = service(&["a.txt"], 1);
        let worker = register(&svc).await;
        let reply = request(&svc, worker).await;

        assert!(!report(&svc, worker, reply.start_time_ms + 1).await);
        assert!(!report(&svc, worker + 7, reply.start_time_ms).await);
        assert!(!svc.done());

        // The genuine identity still commits exactly once.
        assert!(report(&svc, worker, reply.start_time_ms).await);
        assert!(!report(&svc, worker, reply.start_time_ms).await);
    }

    #[tokio::test]
    async fn reaper_requeues_expired_leases_without_touching_counters() {
        let svc = service(&["a.txt"], 1);
        let worker = register(&svc).await;
        let reply = request(&svc, worker).await;

        // Just inside the timeout: the lease survives.
        svc.reap_expired(reply.start_time_ms + TASK_TIMEOUT_MS);
        let held = request(&svc, worker).await;
        assert_eq!(held.task.unwrap().kind(), TaskKind::None);

        // Past the timeout: the task goes back to pending, counters as-is.
        svc.reap_expired(reply.start_time_ms + TASK_TIMEOUT_MS + 1);
        assert!(!svc.done());
        // Step past the original stamp so the new lease key is distinct.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let requeued = request(&svc, worker).await;
        let task = requeued.task.unwrap();
        assert_eq!(task.kind(), TaskKind::Map);
        assert_eq!(task.filename, "a.txt");

        // The original assignment was written off; only the new one counts.
        assert!(!report(&svc, worker, reply.start_time_ms).await);
        assert!(report(&svc, worker, requeued.start_time_ms).await);
    }

    #[tokio::test]
    async fn done_is_monotone() {
        let svc = service(&["a.txt"], 1);
        let worker = register(&svc).await;
        let map = request(&svc, worker).await;
        assert!(report(&svc, worker, map.start_time_ms).await);
        let reduce = request(&svc, worker).await;
        assert!(report(&svc, worker, reduce.start_time_ms).await);

        assert!(svc.done());
        // Late traffic cannot un-finish the job.
        assert!(!report(&svc, worker, reduce.start_time_ms).await);
        svc.reap_expired(now_ms() + 10 * TASK_TIMEOUT_MS);
        assert!(svc.done());
    }
}
