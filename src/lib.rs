// Library interface for the werk build engine
// Front ends (CLI, configure probes, language-specific build steps) consume
// this surface; the engine itself contains no command-line handling.

pub mod cache;
pub mod checksum;
pub mod config;
pub mod context;
pub mod error;
pub mod graph;
pub mod logging;
pub mod runtime;
pub mod step;
pub mod target;
pub mod vars;

// Re-export commonly used types
pub use cache::{FingerprintCache, StalenessOptions, CACHE_FORMAT_VERSION};
pub use config::EngineConfig;
pub use context::{BuildContext, SOURCES_VAR, TARGET_VAR};
pub use error::BuildError;
pub use runtime::{CommandStatus, ThreadedCommand, WaitHandle, WorkerPool};
pub use step::{BuildStep, FinalOutcome, StepContext, StepOutcome, StepRegistry};
pub use target::Target;
pub use vars::{Scope, Value, VarMap};
