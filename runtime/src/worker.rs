//! Bounded off-reactor request execution with edge-triggered backpressure (§4.5).
//!
//! The teacher's `server/src/worker.rs` is a single thread blocking on an mpsc
//! `Receiver<Arc<Session>>`, left as a `todo!()` stub with no pooling or backpressure.
//! This is its generalization to a bounded pool, following
//! `original_source/thriftworker/worker.py`'s concurrency accounting: a running count
//! of in-flight requests is compared against the pool size to decide when acceptors
//! should stop or resume accepting, and every crossing of the threshold is reported
//! exactly once (an edge), not on every request.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mio::Token;

use crate::config::WorkerKind;
use crate::services::Service;

/// One unit of work handed to the pool: a decoded frame ready for its service's
/// processor, plus enough addressing to route the result back to the right
/// connection (§4.4, §4.5).
pub struct Job {
    /// Name of the acceptor the originating connection belongs to.
    pub acceptor: String,
    /// The connection's slab token within that acceptor.
    pub token: Token,
    /// The request id assigned when the frame was read (§3).
    pub request_id: u64,
    /// The service to dispatch this frame to.
    pub service: Service,
    /// The decoded frame payload.
    pub frame: Vec<u8>,
    /// When this job was handed to the pool, for dispatch-latency accounting (§4.5, §7).
    pub enqueued_at: Instant,
}

/// The result of running a [`Job`], delivered back through
/// [`crate::hub::Hub::callback`] so it lands on the reactor thread (§4.5).
#[derive(Debug)]
pub struct JobResult {
    /// Echoes [`Job::acceptor`].
    pub acceptor: String,
    /// Name of the service that processed this request, for telemetry keys keyed
    /// `"<service>::<method>"` (§6) — distinct from [`JobResult::acceptor`], which may
    /// be named differently from the service it routes to.
    pub service_name: String,
    /// Echoes [`Job::token`].
    pub token: Token,
    /// Echoes [`Job::request_id`].
    pub request_id: u64,
    /// Whether the processor completed without a framework-level error (§4.2).
    pub success: bool,
    /// The serialized response payload.
    pub response: Vec<u8>,
    /// Best-effort method name for telemetry keys (§6).
    pub method: &'static str,
    /// Time the job spent queued before a worker picked it up (§4.5, §7).
    pub dispatch_latency: Duration,
    /// Time the processor itself took to run.
    pub execution_time: Duration,
    /// True exactly when this completion brings concurrency back under the pool size
    /// after having reached it (§4.5's "start_accepting" edge).
    pub pool_desaturated: bool,
}

/// Result of submitting a [`Job`] to the pool (§4.5).
#[derive(Debug, Clone, Copy)]
pub struct SubmitOutcome {
    /// True exactly when this submission brings concurrency up to the pool size
    /// (§4.5's "stop_accepting" edge).
    pub pool_saturated: bool,
    /// True when concurrency was already at or above the pool size before this
    /// submission landed — counted against `pool_overflow` (§6).
    pub overflow: bool,
}

type ResultCallback = dyn Fn(JobResult) + Send + Sync;

/// A bounded pool of request executors (§4.5).
pub struct WorkerPool {
    kind: WorkerKind,
    pool_size: usize,
    concurrency: Arc<AtomicUsize>,
    sender: Option<crossbeam_channel::Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    on_result: Arc<ResultCallback>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("kind", &self.kind)
            .field("pool_size", &self.pool_size)
            .field("concurrency", &self.concurrency.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

fn run_job(job: Job) -> JobResult {
    let dispatch_latency = job.enqueued_at.elapsed();
    let started = Instant::now();
    let service_name = job.service.name().to_owned();
    let method = job.service.method_name(&job.frame);
    let result = job.service.process(&job.frame);
    let execution_time = started.elapsed();
    JobResult {
        acceptor: job.acceptor,
        service_name,
        token: job.token,
        request_id: job.request_id,
        success: result.success,
        response: result.response,
        method,
        dispatch_latency,
        execution_time,
        pool_desaturated: false,
    }
}

impl WorkerPool {
    /// Builds a pool per `kind`/`pool_size`, delivering every completed [`JobResult`]
    /// to `on_result`. For [`WorkerKind::ThreadPool`] this spawns `pool_size` worker
    /// threads immediately; for [`WorkerKind::Inline`] jobs run synchronously inside
    /// [`WorkerPool::submit`] and `pool_size` only affects backpressure accounting.
    pub fn new(
        kind: WorkerKind,
        pool_size: usize,
        on_result: impl Fn(JobResult) + Send + Sync + 'static,
    ) -> Self {
        let concurrency = Arc::new(AtomicUsize::new(0));
        let on_result: Arc<ResultCallback> = Arc::new(on_result);

        let (sender, handles) = match kind {
            WorkerKind::Inline => (None, Vec::new()),
            WorkerKind::ThreadPool => {
                let (tx, rx) = crossbeam_channel::unbounded::<Job>();
                let mut handles = Vec::with_capacity(pool_size);
                for idx in 0..pool_size {
                    let rx = rx.clone();
                    let concurrency = Arc::clone(&concurrency);
                    let on_result = Arc::clone(&on_result);
                    let handle = std::thread::Builder::new()
                        .name(format!("thrift-worker-{idx}"))
                        .spawn(move || {
                            while let Ok(job) = rx.recv() {
                                let mut result = run_job(job);
                                let prev = concurrency.fetch_sub(1, Ordering::SeqCst);
                                result.pool_desaturated = prev == pool_size;
                                on_result(result);
                            }
                        })
                        .expect("failed to spawn worker thread");
                    handles.push(handle);
                }
                (Some(tx), handles)
            }
        };

        Self { kind, pool_size, concurrency, sender, handles, on_result }
    }

    /// Current number of requests dispatched but not yet completed.
    pub fn concurrency(&self) -> usize {
        self.concurrency.load(Ordering::SeqCst)
    }

    /// Configured pool size (§4.5's saturation threshold).
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Hands `job` to the pool. Always accepted — there is no bounded queue to reject
    /// from — but the returned [`SubmitOutcome`] tells the caller whether this crossed
    /// into or past saturation, so acceptors can be paused (§4.5).
    pub fn submit(&self, job: Job) -> SubmitOutcome {
        let prev = self.concurrency.fetch_add(1, Ordering::SeqCst);
        let outcome =
            SubmitOutcome { pool_saturated: prev + 1 == self.pool_size, overflow: prev >= self.pool_size };

        match self.kind {
            WorkerKind::Inline => {
                let mut result = run_job(job);
                let prev = self.concurrency.fetch_sub(1, Ordering::SeqCst);
                result.pool_desaturated = prev == self.pool_size;
                (self.on_result)(result);
            }
            WorkerKind::ThreadPool => {
                let _ = self.sender.as_ref().expect("thread pool sender").send(job);
            }
        }

        outcome
    }

    /// Stops accepting new jobs and joins every worker thread, running to completion
    /// any job already queued (§4.3's drain-before-close).
    pub fn stop(&mut self) {
        self.sender.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn job(id: u64, service: Service) -> Job {
        Job {
            acceptor: "echo".into(),
            token: Token(0),
            request_id: id,
            service,
            frame: vec![1, 2, 3],
            enqueued_at: Instant::now(),
        }
    }

    struct Echo;
    impl crate::services::Processor for Echo {
        fn process(&self, request: &[u8]) -> crate::services::ProcessResult {
            crate::services::ProcessResult::ok(request.to_vec())
        }
    }

    #[test]
    fn inline_pool_runs_synchronously_and_reports_saturation_edge() {
        let (tx, rx) = mpsc::channel();
        let pool = WorkerPool::new(WorkerKind::Inline, 1, move |r| tx.send(r).unwrap());
        let service = Service::new("Echo", Arc::new(Echo));

        let outcome = pool.submit(job(0, service));
        assert!(outcome.pool_saturated);
        assert!(!outcome.overflow);

        let result = rx.recv().unwrap();
        assert!(result.success);
        assert_eq!(result.response, vec![1, 2, 3]);
        assert!(result.pool_desaturated);
    }

    #[test]
    fn thread_pool_processes_jobs_and_reports_results() {
        let (tx, rx) = mpsc::channel();
        let pool = WorkerPool::new(WorkerKind::ThreadPool, 2, move |r| tx.send(r).unwrap());
        let service = Service::new("Echo", Arc::new(Echo));

        pool.submit(job(0, service.clone()));
        pool.submit(job(1, service));

        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let mut ids = [first.request_id, second.request_id];
        ids.sort_unstable();
        assert_eq!(ids, [0, 1]);
    }

    #[test]
    fn overflow_is_reported_once_pool_size_is_exceeded() {
        let (tx, rx) = mpsc::channel();
        let pool = WorkerPool::new(WorkerKind::ThreadPool, 1, move |r| tx.send(r).unwrap());
        let service = Service::new("Echo", Arc::new(Echo));

        let first = pool.submit(job(0, service.clone()));
        let second = pool.submit(job(1, service));
        assert!(first.pool_saturated);
        assert!(second.overflow);

        let _ = rx.recv_timeout(Duration::from_secs(1));
        let _ = rx.recv_timeout(Duration::from_secs(1));
    }
}
