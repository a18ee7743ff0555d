pub mod archive;
pub mod cache;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod recovery;
pub mod runtime;
pub mod sandbox;
pub mod session;
pub mod storage;

pub use cache::{CacheCategory, CacheLayer, CacheStatistics};
pub use cleanup::{CleanupReport, ResourceCleanupService, spawn_cleanup_task};
pub use config::{ConfigError, PipelineConfig};
pub use error::{ErrorKind, ExecError, FailureSignal, PipelineError, Result};
pub use pipeline::{Pipeline, PipelineHealth};
pub use recovery::{ErrorRecord, ErrorRecoveryEngine, HealthStatus};
pub use runtime::{
    BuildKind, BuildPolicy, BuildRuntime, Compression, ExportOptions, ExportResult,
    PreviewResult,
};
pub use sandbox::{CommandArg, SandboxedExecutor};
pub use session::{GameSession, OwnerRef, SessionId, SessionManager, SessionStatus};
