// HostContext: the explicit application context handed to every component.
// Holds the resolved settings and identity, trace sources, the shutdown token
// and the externally observable broker connection state.

use crate::config_store::BuilderSettings;
use crate::constants::{path, variables, WellKnownConfigFile};
use crate::secret_masker::SecretMasker;
use crate::tracing::{TraceManager, TraceSetting, Tracing};

use builder_sdk::{StringUtil, TraceWriter};
use parking_lot::Mutex;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Why the worker is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    UserCancelled,
    OperatingSystemShutdown,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::UserCancelled => write!(f, "UserCancelled"),
            ShutdownReason::OperatingSystemShutdown => write!(f, "OperatingSystemShutdown"),
        }
    }
}

/// Broker session state as seen by the message loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// The listener is running but the session dropped; a reconnect is pending.
    Disconnected,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Worker-wide context. Everything in it is read-only after startup except
/// the shutdown token and the connection state.
pub struct HostContext {
    settings: BuilderSettings,
    builder_id: String,
    host_name: String,
    trace_manager: TraceManager,
    shutdown_token: CancellationToken,
    shutdown_reason: Mutex<Option<ShutdownReason>>,
    connection_state: watch::Sender<ConnectionState>,
}

impl HostContext {
    /// Create the context. The broker password is registered as a secret.
    pub fn new(settings: BuilderSettings, builder_id: impl Into<String>, host_name: impl Into<String>) -> Arc<Self> {
        let secret_masker = SecretMasker::new();
        if let Some(ref password) = settings.password {
            secret_masker.add_value(password);
        }

        let print_to_stdout = env::var(variables::PRINT_LOG_TO_STDOUT)
            .ok()
            .and_then(|v| StringUtil::convert_to_bool(&v))
            .unwrap_or(false);
        let trace_setting = TraceSetting {
            print_to_stdout,
            ..TraceSetting::default()
        };

        let (connection_state, _) = watch::channel(ConnectionState::Connecting);

        Arc::new(Self {
            settings,
            builder_id: builder_id.into(),
            host_name: host_name.into(),
            trace_manager: TraceManager::with_setting(secret_masker, trace_setting),
            shutdown_token: CancellationToken::new(),
            shutdown_reason: Mutex::new(None),
            connection_state,
        })
    }

    // -----------------------------------------------------------------------
    // Read-only worker facts
    // -----------------------------------------------------------------------

    pub fn settings(&self) -> &BuilderSettings {
        &self.settings
    }

    /// Identity reported as `builder_id` in every event.
    pub fn builder_id(&self) -> &str {
        &self.builder_id
    }

    /// Raw host name reported in keepalive responses.
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    // -----------------------------------------------------------------------
    // Tracing
    // -----------------------------------------------------------------------

    /// Get a trace source for the given component name.
    pub fn get_trace(&self, name: &str) -> Tracing {
        self.trace_manager.get(name)
    }

    pub fn secret_masker(&self) -> &SecretMasker {
        self.trace_manager.secret_masker()
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Token cancelled when the worker starts shutting down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        *self.shutdown_reason.lock()
    }

    /// Initiate worker shutdown with the given reason.
    pub fn shutdown(&self, reason: ShutdownReason) {
        self.get_trace("HostContext")
            .info(&format!("Worker will be shut down for {}", reason));
        *self.shutdown_reason.lock() = Some(reason);
        self.shutdown_token.cancel();
    }

    // -----------------------------------------------------------------------
    // Connection state
    // -----------------------------------------------------------------------

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection_state.borrow()
    }

    /// Receiver that observes every connection state change.
    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection_state.subscribe()
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        let previous = self.connection_state.send_replace(state);
        if previous != state {
            self.get_trace("HostContext")
                .info(&format!("Broker connection {} -> {}", previous, state));
        }
    }
}

// ---------------------------------------------------------------------------
// Directory resolution
// ---------------------------------------------------------------------------

/// Installation root: the parent of the directory holding the binary.
pub fn default_root_directory() -> PathBuf {
    let bin = env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    bin.parent().map(Path::to_path_buf).unwrap_or(bin)
}

/// Resolve a well-known configuration file under `root`.
pub fn config_file_in(root: &Path, config_file: WellKnownConfigFile) -> PathBuf {
    match config_file {
        WellKnownConfigFile::Builder => root.join(path::SETTINGS_FILE),
    }
}
