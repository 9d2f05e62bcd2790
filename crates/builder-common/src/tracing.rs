// Per-component trace sources. Each component logs through a named `Tracing`
// that masks secrets before handing the line to the `tracing` crate.

use crate::secret_masker::SecretMasker;
use builder_sdk::TraceWriter;
use chrono::Utc;

/// Trace event severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceEventType {
    Verbose,
    Information,
    Warning,
    Error,
}

impl std::fmt::Display for TraceEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceEventType::Verbose => write!(f, "VERB"),
            TraceEventType::Information => write!(f, "INFO"),
            TraceEventType::Warning => write!(f, "WARN"),
            TraceEventType::Error => write!(f, "ERR "),
        }
    }
}

/// Configuration for trace output.
#[derive(Debug, Clone)]
pub struct TraceSetting {
    /// Minimum severity level to emit.
    pub level: TraceEventType,
    /// Whether to also print to stdout.
    pub print_to_stdout: bool,
}

impl Default for TraceSetting {
    fn default() -> Self {
        Self {
            level: TraceEventType::Verbose,
            print_to_stdout: false,
        }
    }
}

/// A named trace source.
#[derive(Clone)]
pub struct Tracing {
    name: String,
    secret_masker: SecretMasker,
    setting: TraceSetting,
}

impl Tracing {
    pub fn new(name: impl Into<String>, secret_masker: SecretMasker, setting: TraceSetting) -> Self {
        Self {
            name: name.into(),
            secret_masker,
            setting,
        }
    }

    fn trace(&self, event_type: TraceEventType, message: &str) {
        if event_type < self.setting.level {
            return;
        }

        let masked = self.secret_masker.mask_secrets(message);

        match event_type {
            TraceEventType::Error => tracing::error!(component = %self.name, "{}", masked),
            TraceEventType::Warning => tracing::warn!(component = %self.name, "{}", masked),
            TraceEventType::Information => tracing::info!(component = %self.name, "{}", masked),
            TraceEventType::Verbose => tracing::debug!(component = %self.name, "{}", masked),
        }

        if self.setting.print_to_stdout {
            let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
            println!("[{}][{}] {}: {}", timestamp, self.name, event_type, masked);
        }
    }

    /// Name of this trace source.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// `outer: cause: root cause` for an error and its sources.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

impl TraceWriter for Tracing {
    fn info(&self, message: &str) {
        self.trace(TraceEventType::Information, message);
    }

    fn verbose(&self, message: &str) {
        self.trace(TraceEventType::Verbose, message);
    }

    fn warning(&self, message: &str) {
        self.trace(TraceEventType::Warning, message);
    }

    fn error(&self, message: &str) {
        self.trace(TraceEventType::Error, message);
    }
}

/// Hands out named trace sources that share one `SecretMasker`.
pub struct TraceManager {
    secret_masker: SecretMasker,
    default_setting: TraceSetting,
}

impl TraceManager {
    pub fn with_setting(secret_masker: SecretMasker, setting: TraceSetting) -> Self {
        Self {
            secret_masker,
            default_setting: setting,
        }
    }

    /// Create a named trace source.
    pub fn get(&self, name: &str) -> Tracing {
        Tracing::new(name, self.secret_masker.clone(), self.default_setting.clone())
    }

    pub fn secret_masker(&self) -> &SecretMasker {
        &self.secret_masker
    }
}
