/// Trace / logging abstraction shared by every builder component.
///
/// Components write through this trait instead of calling `tracing` macros
/// directly so that tests can swap in a writer that records what was logged.
pub trait TraceWriter: Send + Sync {
    /// Log an informational message.
    fn info(&self, message: &str);

    /// Log a verbose / debug message.
    fn verbose(&self, message: &str);

    /// Log a warning message.
    fn warning(&self, message: &str) {
        self.info(&format!("[warning] {message}"));
    }

    /// Log an error message.
    fn error(&self, message: &str) {
        self.info(&format!("[error] {message}"));
    }
}

/// Discards everything.
#[derive(Debug, Clone)]
pub struct NullTraceWriter;

impl TraceWriter for NullTraceWriter {
    fn info(&self, _message: &str) {}
    fn verbose(&self, _message: &str) {}
    fn warning(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
}

/// Severity of a recorded trace entry, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

/// A trace writer that keeps every entry in memory.
#[derive(Debug, Default)]
pub struct CollectingTraceWriter {
    entries: parking_lot::Mutex<Vec<(TraceLevel, String)>>,
}

impl CollectingTraceWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded entries, oldest first.
    pub fn entries(&self) -> Vec<(TraceLevel, String)> {
        self.entries.lock().clone()
    }

    /// Number of entries recorded at exactly `level`.
    pub fn count(&self, level: TraceLevel) -> usize {
        self.entries.lock().iter().filter(|(l, _)| *l == level).count()
    }

    /// Whether any entry at `level` or above contains `needle`.
    pub fn contains(&self, level: TraceLevel, needle: &str) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|(l, m)| *l >= level && m.contains(needle))
    }

    fn push(&self, level: TraceLevel, message: &str) {
        self.entries.lock().push((level, message.to_string()));
    }
}

impl TraceWriter for CollectingTraceWriter {
    fn info(&self, message: &str) {
        self.push(TraceLevel::Info, message);
    }

    fn verbose(&self, message: &str) {
        self.push(TraceLevel::Verbose, message);
    }

    fn warning(&self, message: &str) {
        self.push(TraceLevel::Warning, message);
    }

    fn error(&self, message: &str) {
        self.push(TraceLevel::Error, message);
    }
}
