use builder_sdk::TraceWriter;
use std::sync::Arc;

use crate::job::{JobError, JobRequest, JobState};
use crate::worker_pool::{JobTicket, PoolHandle, PoolStats};

/// Turns job messages into queued tickets. Returns as soon as the ticket is
/// queued; the build runs on a pool worker.
pub struct JobDispatcher {
    pool: PoolHandle,
    trace: Arc<dyn TraceWriter>,
}

impl JobDispatcher {
    pub fn new(pool: PoolHandle, trace: Arc<dyn TraceWriter>) -> Self {
        Self { pool, trace }
    }

    pub fn dispatch(&self, body: &str) -> Result<PoolStats, JobError> {
        let request = JobRequest::parse(body)?;
        self.trace.info(&format!(
            "Job {}: {} (bioc_version {}, client_id '{}')",
            request.job_id,
            JobState::Received,
            request.bioc_version,
            request.client_id
        ));
        self.pool.submit(JobTicket::new(request))
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}
