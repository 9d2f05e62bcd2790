// Constants shared by the builder crates: platform detection, topic names,
// job workspace layout, environment variable names and exit codes.

use std::fmt;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Operating system platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsPlatform {
    Linux,
    MacOS,
    Windows,
}

impl fmt::Display for OsPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsPlatform::Linux => write!(f, "Linux"),
            OsPlatform::MacOS => write!(f, "Darwin"),
            OsPlatform::Windows => write!(f, "Windows"),
        }
    }
}

impl OsPlatform {
    /// Extension of the per-builder build script on this platform.
    pub fn build_script_extension(&self) -> &'static str {
        match self {
            OsPlatform::Linux | OsPlatform::MacOS => ".sh",
            OsPlatform::Windows => ".bat",
        }
    }
}

/// Well-known configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WellKnownConfigFile {
    Builder,
}

impl fmt::Display for WellKnownConfigFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ---------------------------------------------------------------------------
// Platform detection (compile-time)
// ---------------------------------------------------------------------------

/// The current OS platform, detected at compile time.
#[cfg(target_os = "linux")]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::Linux;
#[cfg(target_os = "macos")]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::MacOS;
#[cfg(target_os = "windows")]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::Windows;
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::Linux; // default fallback

/// Name the worker reports as `script` in keepalive responses.
pub const WORKER_NAME: &str = "builder-listener";

/// Body of the event sent once a build has been started.
pub const ACCEPTED_EVENT_BODY: &str = "Got build request...";

/// Deployment mode in which the broker is contacted without credentials.
pub const PRODUCTION_ENVIRONMENT: &str = "production";

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Default broker destinations.
pub mod topics {
    pub const JOBS: &str = "/topic/buildjobs";
    pub const EVENTS: &str = "/topic/builderevents";
    pub const KEEPALIVE: &str = "/topic/keepalive";
    pub const KEEPALIVE_RESPONSE: &str = "/topic/keepalive_response";
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// File and directory names inside the packagebuilder home.
pub mod path {
    pub const JOBS_DIRECTORY: &str = "jobs";
    pub const R_LIBS_DIRECTORY: &str = "R-libs";
    pub const MANIFEST_FILE: &str = "manifest.json";
    pub const BUILDER_LOG_FILE: &str = "builder.log";
    pub const SETTINGS_FILE: &str = ".builder";
}

// ---------------------------------------------------------------------------
// Broker defaults
// ---------------------------------------------------------------------------

pub mod broker {
    pub const DEFAULT_HOST: &str = "localhost";
    pub const DEFAULT_PORT: u16 = 61613;
    pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
    /// Header asking the broker to persist a message until consumed.
    pub const PERSISTENT_HEADER: &str = "persistent";
}

// ---------------------------------------------------------------------------
// Worker pool defaults
// ---------------------------------------------------------------------------

pub mod pool {
    pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;
    pub const DEFAULT_QUEUE_CAPACITY: usize = 32;
    pub const DEFAULT_SPAWN_ATTEMPTS: u32 = 2;
}

// ---------------------------------------------------------------------------
// Environment variables
// ---------------------------------------------------------------------------

/// Environment variables that override values from the settings file.
pub mod variables {
    pub const ENVIRONMENT: &str = "SPB_ENVIRONMENT";
    pub const BROKER_USER: &str = "ACTIVEMQ_USER";
    pub const BROKER_PASSWORD: &str = "ACTIVEMQ_PASS";
    pub const BROKER_HOST: &str = "BROKER_HOST";
    pub const BROKER_PORT: &str = "BROKER_PORT";
    pub const PACKAGEBUILDER_HOME: &str = "PACKAGEBUILDER_HOME";
    /// Explicit builder identity used when the host name is ambiguous.
    pub const PACKAGEBUILDER_HOST: &str = "PACKAGEBUILDER_HOST";
    /// Windows DNS domain appended to the builder identity.
    pub const USER_DNS_DOMAIN: &str = "USERDNSDOMAIN";
    pub const PRINT_LOG_TO_STDOUT: &str = "SPB_PRINT_LOG_TO_STDOUT";
    /// Emit log lines as JSON objects.
    pub const LOG_JSON: &str = "SPB_LOG_JSON";
}

// ---------------------------------------------------------------------------
// CommandLine
// ---------------------------------------------------------------------------

/// Command-line argument names.
pub mod command_line {
    /// Named arguments (key value style).
    pub mod args {
        pub const CONFIG: &str = "config";
        pub const HOME: &str = "home";
    }

    /// Top-level commands.
    pub mod commands {
        pub const RUN: &str = "run";
    }

    /// Boolean flags.
    pub mod flags {
        pub const CHECK: &str = "check";
        pub const HELP: &str = "help";
        pub const VERSION: &str = "version";
    }
}

// ---------------------------------------------------------------------------
// ReturnCode
// ---------------------------------------------------------------------------

/// Process return / exit codes.
pub mod return_code {
    pub const SUCCESS: i32 = 0;
    pub const TERMINATED_ERROR: i32 = 1;
    pub const CONFIGURATION_ERROR: i32 = 2;
}
