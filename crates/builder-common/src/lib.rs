// builder-common: Shared services for the Single Package Builder worker.
// Settings, builder identity, the host context and per-component tracing.
// Depends on `builder-sdk`.

pub mod config_store;
pub mod constants;
pub mod host_context;
pub mod identity;
pub mod secret_masker;
pub mod tracing;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use config_store::{AckMode, BuilderSettings, ConfigError, ConfigurationStore, Credentials, Topics};
pub use constants::{OsPlatform, WellKnownConfigFile, CURRENT_PLATFORM};
pub use host_context::{ConnectionState, HostContext, ShutdownReason};
pub use identity::{resolve_builder_id, IdentityError, IdentityInputs};
pub use secret_masker::SecretMasker;
pub use crate::tracing::{TraceEventType, TraceManager, TraceSetting, Tracing};
