// Runs one job on a pool worker: workspace, build program, accepted event,
// exit status. Each stage fails with its own `JobError` variant.

use async_trait::async_trait;
use builder_sdk::{ProcessExit, ProcessInvoker, RunningProcess, TraceWriter};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::event_publisher::{BuilderEvent, EventPublisher};
use crate::job::{FailureKind, JobError, JobRequest, JobState};
use crate::worker_pool::{JobHandler, JobTicket};
use crate::workspace::JobWorkspace;

/// Pause between attempts to start the build program.
pub const SPAWN_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct BuildRunnerConfig {
    pub builder_id: String,
    pub jobs_root: PathBuf,
    pub build_program: PathBuf,
    /// Working directory of the build program (the packagebuilder home).
    pub working_directory: PathBuf,
    pub spawn_attempts: u32,
    pub spawn_retry_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub job_id: String,
    pub workspace: JobWorkspace,
    pub pid: u32,
    pub exit: ProcessExit,
    pub accepted_event_sent: bool,
}

pub struct BuildRunner {
    config: BuildRunnerConfig,
    publisher: EventPublisher,
    invoker: ProcessInvoker,
    trace: Arc<dyn TraceWriter>,
}

impl BuildRunner {
    pub fn new(config: BuildRunnerConfig, publisher: EventPublisher, trace: Arc<dyn TraceWriter>) -> Self {
        Self {
            invoker: ProcessInvoker::new(trace.clone()),
            config,
            publisher,
            trace,
        }
    }

    fn transition(&self, job_id: &str, state: JobState) {
        self.trace.verbose(&format!("Job {job_id}: {state}"));
    }

    /// Run `ticket` to completion. There is no timeout on the build program.
    pub async fn run(&self, ticket: &JobTicket) -> Result<BuildOutcome, JobError> {
        let request = &ticket.request;
        let job_id = request.job_id.as_str();

        let workspace = JobWorkspace::prepare(&self.config.jobs_root, request)
            .await
            .map_err(|source| JobError::Workspace {
                job_id: job_id.to_string(),
                source,
            })?;
        self.transition(job_id, JobState::WorkspacePrepared);

        self.transition(job_id, JobState::Dispatched);
        let process = self.spawn_with_retry(request, &workspace).await?;
        let pid = process.pid();
        self.transition(job_id, JobState::Running);

        let event = BuilderEvent::accepted(&self.config.builder_id, request);
        let accepted_event_sent = match self.publisher.publish(&event).await {
            Ok(()) => {
                self.trace
                    .info(&format!("Job {job_id}: sent accepted event to {}", self.publisher.topic()));
                true
            }
            Err(e) => {
                self.trace
                    .warning(&format!("Job {job_id}: failed to send accepted event: {e}"));
                false
            }
        };

        let exit = process.wait().await.map_err(|source| JobError::Wait {
            job_id: job_id.to_string(),
            source,
        })?;
        self.transition(job_id, JobState::Terminated);

        let message = format!(
            "Job {job_id}: build program finished with {} (log: {})",
            exit.describe(),
            workspace.log_path.display()
        );
        if exit.success() {
            self.trace.info(&message);
        } else {
            self.trace.warning(&message);
        }

        Ok(BuildOutcome {
            job_id: job_id.to_string(),
            workspace,
            pid,
            exit,
            accepted_event_sent,
        })
    }

    async fn spawn_with_retry(
        &self,
        request: &JobRequest,
        workspace: &JobWorkspace,
    ) -> Result<RunningProcess, JobError> {
        let args = [
            workspace.manifest_path.as_os_str(),
            OsStr::new(&request.bioc_version),
        ];
        let attempts = self.config.spawn_attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .invoker
                .spawn_logged(
                    &self.config.working_directory,
                    &self.config.build_program,
                    &args,
                    &workspace.log_path,
                )
                .await;
            let err = match result {
                Ok(process) => return Ok(process),
                Err(source) => JobError::Spawn {
                    job_id: request.job_id.clone(),
                    attempts: attempt,
                    source,
                },
            };
            if !err.is_retryable() || attempt >= attempts {
                return Err(err);
            }

            self.trace.warning(&format!(
                "{err}; retrying in {:?} ({attempt}/{attempts})",
                self.config.spawn_retry_delay
            ));
            tokio::time::sleep(self.config.spawn_retry_delay).await;
        }
    }
}

#[async_trait]
impl JobHandler for BuildRunner {
    async fn handle(&self, ticket: JobTicket) {
        let job_id = ticket.request.job_id.clone();
        match self.run(&ticket).await {
            Ok(outcome) => self.trace.verbose(&format!(
                "Job {job_id} (pid {}) done in {:.2?} after queueing at {}",
                outcome.pid,
                outcome.exit.elapsed,
                ticket.received_at.to_rfc3339()
            )),
            Err(e) => {
                self.transition(&job_id, JobState::Dropped);
                match e.kind() {
                    FailureKind::Environment | FailureKind::Execution => {
                        self.trace.error(&builder_common::tracing::error_chain(&e))
                    }
                    FailureKind::MalformedInput | FailureKind::Capacity => {
                        self.trace.warning(&e.to_string())
                    }
                }
            }
        }
    }
}
