// Build request model: parsing inbound job messages, the job lifecycle, and
// the typed errors each stage can produce.

use builder_sdk::ProcessError;
use serde::Deserialize;
use std::fmt;

use crate::workspace::WorkspaceError;

/// A job id becomes a directory name under the jobs root, so it must stay
/// one path component.
fn is_single_path_component(job_id: &str) -> bool {
    !matches!(job_id, "." | "..") && !job_id.contains(&['/', '\\', '\0'][..])
}

/// A validated build request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub job_id: String,
    pub bioc_version: String,
    /// Echoed back in events; empty when the requester sent none.
    pub client_id: String,
    /// The message body exactly as received. Written verbatim as the manifest.
    pub raw_body: String,
}

#[derive(Deserialize)]
struct RequiredFields {
    job_id: Option<String>,
    bioc_version: Option<String>,
    client_id: Option<String>,
}

impl JobRequest {
    /// Parse a job message body. Fields other than the ones below are opaque
    /// and only survive through `raw_body`.
    pub fn parse(body: &str) -> Result<Self, JobError> {
        let value: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| JobError::malformed(None, format!("body is not JSON: {e}")))?;
        if !value.is_object() {
            return Err(JobError::malformed(None, "body is not a JSON object"));
        }

        let fields: RequiredFields = serde_json::from_value(value)
            .map_err(|e| JobError::malformed(None, format!("unexpected field type: {e}")))?;

        let job_id = fields
            .job_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| JobError::malformed(None, "missing job_id"))?;
        if !is_single_path_component(&job_id) {
            return Err(JobError::malformed(
                Some(job_id.clone()),
                "job_id is not a valid directory name",
            ));
        }

        let bioc_version = fields
            .bioc_version
            .filter(|v| !v.is_empty())
            .ok_or_else(|| JobError::malformed(Some(job_id.clone()), "missing bioc_version"))?;

        Ok(Self {
            job_id,
            bioc_version,
            client_id: fields.client_id.unwrap_or_default(),
            raw_body: body.to_string(),
        })
    }
}

/// Lifecycle of one build request, as recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Received,
    WorkspacePrepared,
    Dispatched,
    Running,
    Terminated,
    Dropped,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Received => "received",
            JobState::WorkspacePrepared => "workspace prepared",
            JobState::Dispatched => "dispatched",
            JobState::Running => "running",
            JobState::Terminated => "terminated",
            JobState::Dropped => "dropped",
        };
        f.write_str(s)
    }
}

/// Coarse classification used when logging a dropped job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The message itself was unusable.
    MalformedInput,
    /// The host could not provide what the job needed (directories, files).
    Environment,
    /// The build program could not be started or awaited.
    Execution,
    /// The worker had no room for the job.
    Capacity,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::MalformedInput => "malformed input",
            FailureKind::Environment => "environment",
            FailureKind::Execution => "execution",
            FailureKind::Capacity => "capacity",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    QueueFull { capacity: usize },
    ShuttingDown,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::QueueFull { capacity } => {
                write!(f, "job queue is full ({capacity} waiting)")
            }
            RejectReason::ShuttingDown => write!(f, "worker is shutting down"),
        }
    }
}

/// Why a job never reached, or did not survive, the running state.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Malformed job request{}: {reason}", job_label(.job_id))]
    Malformed {
        job_id: Option<String>,
        reason: String,
    },

    #[error("Failed to prepare workspace for job {job_id}: {source}")]
    Workspace {
        job_id: String,
        #[source]
        source: WorkspaceError,
    },

    #[error("Failed to start build for job {job_id} after {attempts} attempt(s): {source}")]
    Spawn {
        job_id: String,
        attempts: u32,
        #[source]
        source: ProcessError,
    },

    #[error("Lost track of build for job {job_id}: {source}")]
    Wait {
        job_id: String,
        #[source]
        source: ProcessError,
    },

    #[error("Rejected job {job_id}: {reason}")]
    Rejected { job_id: String, reason: RejectReason },
}

fn job_label(job_id: &Option<String>) -> String {
    match job_id {
        Some(id) => format!(" {id}"),
        None => String::new(),
    }
}

impl JobError {
    pub fn malformed(job_id: Option<String>, reason: impl Into<String>) -> Self {
        JobError::Malformed {
            job_id,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            JobError::Malformed { .. } => FailureKind::MalformedInput,
            JobError::Workspace { .. } => FailureKind::Environment,
            JobError::Spawn { source, .. } | JobError::Wait { source, .. } => match source {
                ProcessError::LogFile { .. } => FailureKind::Environment,
                _ => FailureKind::Execution,
            },
            JobError::Rejected { .. } => FailureKind::Capacity,
        }
    }

    /// Only a build program that failed to start is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::Spawn {
                source: ProcessError::Spawn { .. },
                ..
            }
        )
    }
}
