// Bounded pool of job workers fed by a bounded queue. The message loop only
// ever calls `PoolHandle::submit`, which never waits: a full queue rejects
// the job on the spot.

use async_trait::async_trait;
use builder_sdk::TraceWriter;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::job::{JobError, JobRequest, RejectReason};

/// A parsed request waiting for a worker.
#[derive(Debug, Clone)]
pub struct JobTicket {
    pub request: JobRequest,
    pub received_at: DateTime<Utc>,
}

impl JobTicket {
    pub fn new(request: JobRequest) -> Self {
        Self {
            request,
            received_at: Utc::now(),
        }
    }
}

/// Runs one job to completion on a pool worker.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ticket: JobTicket);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub capacity: usize,
    pub queued: usize,
    pub running: usize,
    pub accepted: u64,
    pub rejected: u64,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "queued {}/{}, running {}/{}, accepted {}, rejected {}",
            self.queued, self.capacity, self.running, self.workers, self.accepted, self.rejected
        )
    }
}

#[derive(Default)]
struct PoolCounters {
    queued: AtomicUsize,
    running: AtomicUsize,
    accepted: AtomicU64,
    rejected: AtomicU64,
    closed: AtomicBool,
}

/// Submission side of the pool, cloned into the dispatcher.
#[derive(Clone)]
pub struct PoolHandle {
    tx: mpsc::Sender<JobTicket>,
    counters: Arc<PoolCounters>,
    workers: usize,
    capacity: usize,
    trace: Arc<dyn TraceWriter>,
}

impl PoolHandle {
    /// Queue a job without waiting.
    pub fn submit(&self, ticket: JobTicket) -> Result<PoolStats, JobError> {
        let job_id = ticket.request.job_id.clone();
        if self.counters.closed.load(Ordering::SeqCst) {
            return Err(self.reject(job_id, RejectReason::ShuttingDown));
        }

        // Counted before the send so a fast worker never sees a zero count.
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        match self.tx.try_send(ticket) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::SeqCst);
                let stats = self.stats();
                self.trace.verbose(&format!("Queued job {job_id}: {stats}"));
                Ok(stats)
            }
            Err(TrySendError::Full(_)) => {
                self.counters.queued.fetch_sub(1, Ordering::SeqCst);
                Err(self.reject(
                    job_id,
                    RejectReason::QueueFull {
                        capacity: self.capacity,
                    },
                ))
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.queued.fetch_sub(1, Ordering::SeqCst);
                Err(self.reject(job_id, RejectReason::ShuttingDown))
            }
        }
    }

    fn reject(&self, job_id: String, reason: RejectReason) -> JobError {
        self.counters.rejected.fetch_add(1, Ordering::SeqCst);
        JobError::Rejected { job_id, reason }
    }

    pub fn stats(&self) -> PoolStats {
        snapshot(&self.counters, self.workers, self.capacity)
    }
}

fn snapshot(counters: &PoolCounters, workers: usize, capacity: usize) -> PoolStats {
    PoolStats {
        workers,
        capacity,
        queued: counters.queued.load(Ordering::SeqCst),
        running: counters.running.load(Ordering::SeqCst),
        accepted: counters.accepted.load(Ordering::SeqCst),
        rejected: counters.rejected.load(Ordering::SeqCst),
    }
}

pub struct WorkerPool {
    handle: PoolHandle,
    rx: Arc<Mutex<mpsc::Receiver<JobTicket>>>,
    workers: Vec<JoinHandle<()>>,
    stop: CancellationToken,
}

impl WorkerPool {
    /// Start `workers` worker tasks sharing a queue of `capacity` tickets.
    pub fn start(
        workers: usize,
        capacity: usize,
        handler: Arc<dyn JobHandler>,
        trace: Arc<dyn TraceWriter>,
    ) -> Self {
        let workers = workers.max(1);
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(PoolCounters::default());
        let stop = CancellationToken::new();

        let tasks = (0..workers)
            .map(|index| {
                tokio::spawn(worker_loop(
                    index,
                    rx.clone(),
                    handler.clone(),
                    counters.clone(),
                    stop.clone(),
                    trace.clone(),
                ))
            })
            .collect();

        trace.info(&format!(
            "Started {workers} job worker(s) with a queue of {capacity}"
        ));

        Self {
            handle: PoolHandle {
                tx,
                counters,
                workers,
                capacity,
                trace,
            },
            rx,
            workers: tasks,
            stop,
        }
    }

    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> PoolStats {
        self.handle.stats()
    }

    /// Stop accepting work, drop jobs that never started, and wait up to
    /// `grace` for running jobs. Returns how many jobs were still running.
    pub async fn shutdown(self, grace: Duration) -> usize {
        let counters = &self.handle.counters;
        let trace = &self.handle.trace;
        counters.closed.store(true, Ordering::SeqCst);
        self.stop.cancel();

        {
            let mut rx = self.rx.lock().await;
            rx.close();
            while let Ok(ticket) = rx.try_recv() {
                counters.queued.fetch_sub(1, Ordering::SeqCst);
                trace.warning(&format!(
                    "Dropping queued job {} at shutdown",
                    ticket.request.job_id
                ));
            }
        }

        let running = counters.running.load(Ordering::SeqCst);
        if running > 0 {
            trace.info(&format!(
                "Waiting up to {grace:?} for {running} running job(s)"
            ));
        }

        let deadline = tokio::time::Instant::now() + grace;
        for worker in self.workers {
            if tokio::time::timeout_at(deadline, worker).await.is_err() {
                break;
            }
        }

        let still_running = counters.running.load(Ordering::SeqCst);
        if still_running > 0 {
            trace.warning(&format!(
                "{still_running} job(s) still running at shutdown; their build programs are left running"
            ));
        }
        still_running
    }
}

async fn worker_loop(
    index: usize,
    rx: Arc<Mutex<mpsc::Receiver<JobTicket>>>,
    handler: Arc<dyn JobHandler>,
    counters: Arc<PoolCounters>,
    stop: CancellationToken,
    trace: Arc<dyn TraceWriter>,
) {
    loop {
        let ticket = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                ticket = rx.recv() => ticket,
            }
        };
        let Some(ticket) = ticket else { break };

        counters.queued.fetch_sub(1, Ordering::SeqCst);
        counters.running.fetch_add(1, Ordering::SeqCst);
        trace.verbose(&format!(
            "Worker {index} picked up job {}",
            ticket.request.job_id
        ));

        handler.handle(ticket).await;

        counters.running.fetch_sub(1, Ordering::SeqCst);
    }
    trace.verbose(&format!("Worker {index} stopped"));
}
