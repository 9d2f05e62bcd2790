// builder-sdk: Foundation layer for the Single Package Builder worker.
// This crate has no dependencies on other builder crates; it provides the
// trace abstraction and the child-process plumbing used by the listener.

pub mod process_invoker;
pub mod string_util;
pub mod trace;

// Re-export commonly used items at crate root
pub use process_invoker::{ProcessError, ProcessExit, ProcessInvoker, RunningProcess};
pub use string_util::StringUtil;
pub use trace::{CollectingTraceWriter, NullTraceWriter, TraceLevel, TraceWriter};
