use crate::trace::TraceWriter;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};

/// Failure while starting or awaiting a child process.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to open output log '{}': {source}", path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start process '{file_name}': {source}")]
    Spawn {
        file_name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for process {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// How a child process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal number when the process was killed (unix only).
    pub signal: Option<i32>,
    pub elapsed: Duration,
}

impl ProcessExit {
    /// Shell-style exit code: the exit code, or `128 + signal`, or 1 when neither is known.
    pub fn exit_code(&self) -> i32 {
        self.code
            .or_else(|| self.signal.map(|s| 128 + s))
            .unwrap_or(1)
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Human readable termination reason, e.g. `exit code 0` or `signal SIGKILL`.
    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(signal)) => format!("signal {}", signal_name(signal)),
            (None, None) => "unknown termination".to_string(),
        }
    }
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    nix::sys::signal::Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| signal.to_string())
}

#[cfg(not(unix))]
fn signal_name(signal: i32) -> String {
    signal.to_string()
}

/// Spawns external programs whose combined stdout/stderr go to a log file.
///
/// Unlike a piped invoker this never reads the child's output itself, so a
/// chatty build cannot stall on a full pipe while nobody is reading.
pub struct ProcessInvoker {
    trace: Arc<dyn TraceWriter>,
}

impl ProcessInvoker {
    pub fn new(trace: Arc<dyn TraceWriter>) -> Self {
        Self { trace }
    }

    /// Start `file_name` with `arguments`, writing stdout and stderr to `log_path`.
    ///
    /// The log file is created or truncated. The parent's handles on it are
    /// released as soon as the child is started; the child keeps its own.
    pub async fn spawn_logged<S: AsRef<OsStr>>(
        &self,
        working_directory: &Path,
        file_name: &Path,
        arguments: &[S],
        log_path: &Path,
    ) -> Result<RunningProcess, ProcessError> {
        let display_args: Vec<String> = arguments
            .iter()
            .map(|a| a.as_ref().to_string_lossy().into_owned())
            .collect();

        self.trace.info("Starting process:");
        self.trace
            .info(&format!("  File name: '{}'", file_name.display()));
        self.trace
            .info(&format!("  Arguments: '{}'", display_args.join(" ")));
        self.trace
            .info(&format!("  Working directory: '{}'", working_directory.display()));
        self.trace.info(&format!("  Output log: '{}'", log_path.display()));

        let log_error = |source| ProcessError::LogFile {
            path: log_path.to_path_buf(),
            source,
        };
        let stdout = tokio::fs::File::create(log_path)
            .await
            .map_err(log_error)?
            .into_std()
            .await;
        let stderr = stdout.try_clone().map_err(log_error)?;

        let mut cmd = Command::new(file_name);
        cmd.args(arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        let in_directory = tokio::fs::metadata(working_directory)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if in_directory {
            cmd.current_dir(working_directory);
        }

        let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            file_name: file_name.display().to_string(),
            source,
        })?;
        // Dropping the command closes the parent's copies of the log handle.
        drop(cmd);

        let pid = child.id().unwrap_or(0);
        self.trace
            .info(&format!("Process started with process id {pid}."));

        Ok(RunningProcess {
            child,
            pid,
            started: Instant::now(),
            trace: self.trace.clone(),
        })
    }
}

/// A started child process that has not been awaited yet.
pub struct RunningProcess {
    child: Child,
    pid: u32,
    started: Instant,
    trace: Arc<dyn TraceWriter>,
}

impl RunningProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Block until the process terminates. There is no timeout.
    pub async fn wait(mut self) -> Result<ProcessExit, ProcessError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|source| ProcessError::Wait {
                pid: self.pid,
                source,
            })?;

        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        let exit = ProcessExit {
            code: status.code(),
            signal,
            elapsed: self.started.elapsed(),
        };

        self.trace.info(&format!(
            "Finished process {} with {}, and elapsed time {:.2?}.",
            self.pid,
            exit.describe(),
            exit.elapsed
        ));

        Ok(exit)
    }
}
