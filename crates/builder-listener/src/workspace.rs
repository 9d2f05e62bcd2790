// Per-job workspace on disk:
//
//   <jobs_root>/<job_id>/
//       R-libs/
//       manifest.json   the request body, verbatim
//       builder.log     combined output of the build program
//
// Preparing the same job twice reuses the directories and rewrites the manifest.

use builder_common::constants::path;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::job::JobRequest;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Failed to create directory {}: {source}", path.display())]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} exists but is not a directory", path.display())]
    NotADirectory { path: PathBuf },

    #[error("Failed to write manifest {}: {source}", path.display())]
    WriteManifest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Resolved paths of one job's workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobWorkspace {
    pub job_dir: PathBuf,
    pub r_libs_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub log_path: PathBuf,
}

impl JobWorkspace {
    /// Paths for `job_id` under `jobs_root`, without touching the disk.
    pub fn layout(jobs_root: &Path, job_id: &str) -> Self {
        let job_dir = jobs_root.join(job_id);
        Self {
            r_libs_dir: job_dir.join(path::R_LIBS_DIRECTORY),
            manifest_path: job_dir.join(path::MANIFEST_FILE),
            log_path: job_dir.join(path::BUILDER_LOG_FILE),
            job_dir,
        }
    }

    /// Create the workspace for `request` and write its manifest.
    ///
    /// Returned paths are absolute so the build program can be handed them
    /// regardless of its own working directory.
    pub async fn prepare(jobs_root: &Path, request: &JobRequest) -> Result<Self, WorkspaceError> {
        tokio::fs::create_dir_all(jobs_root)
            .await
            .map_err(|source| WorkspaceError::CreateDirectory {
                path: jobs_root.to_path_buf(),
                source,
            })?;
        let jobs_root = tokio::fs::canonicalize(jobs_root)
            .await
            .map_err(|source| WorkspaceError::CreateDirectory {
                path: jobs_root.to_path_buf(),
                source,
            })?;

        let workspace = Self::layout(&jobs_root, &request.job_id);
        ensure_directory(&workspace.job_dir).await?;
        ensure_directory(&workspace.r_libs_dir).await?;

        tokio::fs::write(&workspace.manifest_path, request.raw_body.as_bytes())
            .await
            .map_err(|source| WorkspaceError::WriteManifest {
                path: workspace.manifest_path.clone(),
                source,
            })?;

        Ok(workspace)
    }
}

async fn ensure_directory(dir: &Path) -> Result<(), WorkspaceError> {
    match tokio::fs::create_dir(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            if tokio::fs::metadata(dir).await.map(|m| m.is_dir()).unwrap_or(false) {
                Ok(())
            } else {
                Err(WorkspaceError::NotADirectory {
                    path: dir.to_path_buf(),
                })
            }
        }
        Err(source) => Err(WorkspaceError::CreateDirectory {
            path: dir.to_path_buf(),
            source,
        }),
    }
}
