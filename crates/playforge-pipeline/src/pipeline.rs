use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::cache::{CacheLayer, CacheStatistics};
use crate::cleanup::ResourceCleanupService;
use crate::config::PipelineConfig;
use crate::error::{ErrorKind, ExecError, PipelineError, Result};
use crate::recovery::{ErrorRecoveryEngine, HealthStatus, RecoveryHealth};
use crate::runtime::{
    BuildKind, BuildRuntime, ExportDownload, ExportOptions, ExportResult, ExportStatus,
    PreviewResult,
};
use crate::sandbox::SandboxedExecutor;
use crate::session::{GameSession, OwnerRef, SessionManager, SessionStatistics, SessionStatus};

/// Every pipeline component, constructed once and shared.
#[derive(Clone)]
pub struct Pipeline {
    pub config: Arc<PipelineConfig>,
    pub sandbox: Arc<SandboxedExecutor>,
    pub cache: Arc<CacheLayer>,
    pub recovery: Arc<ErrorRecoveryEngine>,
    pub sessions: Arc<SessionManager>,
    pub runtime: Arc<BuildRuntime>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineHealth {
    pub status: HealthStatus,
    pub version: &'static str,
    pub toolchain_available: bool,
    pub active_builds: usize,
    pub free_build_slots: usize,
    pub sessions: SessionStatistics,
    pub cache: CacheStatistics,
    pub recovery: RecoveryHealth,
}

impl Pipeline {
    /// Wire up every component over `config.sandbox.root`, rehydrating
    /// persisted sessions.
    pub async fn new(config: PipelineConfig) -> Result<Self> {
        let sandbox = SandboxedExecutor::new(&config.toolchain, &config.sandbox.root).map_err(
            |e| match e {
                ExecError::Io(e) => PipelineError::Storage(e),
                e => e.into(),
            },
        )?;
        let sandbox = Arc::new(sandbox);
        let cache = Arc::new(CacheLayer::new(&config.cache));
        let recovery = Arc::new(ErrorRecoveryEngine::new(config.recovery.clone()));
        let sessions = Arc::new(SessionManager::open(sandbox.root(), Arc::clone(&cache)).await?);
        let runtime = Arc::new(BuildRuntime::new(
            &config,
            Arc::clone(&sandbox),
            Arc::clone(&recovery),
            Arc::clone(&cache),
        ));
        tracing::info!(root = %sandbox.root().display(), "Pipeline ready");
        Ok(Self {
            config: Arc::new(config),
            sandbox,
            cache,
            recovery,
            sessions,
            runtime,
        })
    }

    /// Cancel every build in flight. Returns how many were cancelled.
    pub fn shutdown(&self) -> usize {
        let building = self.runtime.building_sessions();
        let cancelled = building
            .iter()
            .filter(|id| self.runtime.cancel_build(id))
            .count();
        tracing::info!(cancelled, "Pipeline shut down");
        cancelled
    }

    pub fn cleanup_service(&self) -> ResourceCleanupService {
        ResourceCleanupService::new(
            self.sandbox.root(),
            self.config.cleanup.clone(),
            Arc::clone(&self.sessions),
            Arc::clone(&self.runtime),
            Arc::clone(&self.cache),
            Arc::clone(&self.recovery),
        )
    }

    pub async fn create_session(&self, owner: Option<OwnerRef>, document: Value) -> Result<GameSession> {
        self.sessions.create_session(owner, document).await
    }

    /// Store a new document version. Rejections are counted against the
    /// session so repeated failures can trigger a fallback suggestion.
    pub async fn update_document(&self, session_id: &str, document: Value) -> Result<GameSession> {
        let result = self.sessions.update_document(session_id, document).await;
        if let Err(e @ PipelineError::Validation(_)) = &result {
            self.recovery.record(session_id, e);
        }
        result
    }

    pub async fn preview(&self, session_id: &str) -> Result<PreviewResult> {
        let session = self.buildable(session_id, BuildKind::Preview).await?;
        let result = self
            .runtime
            .build_preview(session_id, &session.document_path())
            .await;
        self.after_build(session_id, result).await
    }

    /// Export with `options`, or the configured defaults.
    pub async fn export(&self, session_id: &str, options: Option<ExportOptions>) -> Result<ExportResult> {
        let session = self.buildable(session_id, BuildKind::Export).await?;
        let options = options.unwrap_or_else(|| ExportOptions::from(&self.config.export));
        let result = self
            .runtime
            .build_export(session_id, &session.document_path(), &options)
            .await;
        self.after_build(session_id, result).await
    }

    pub async fn export_status(&self, session_id: &str) -> Result<ExportStatus> {
        self.runtime.get_export_status(session_id).await
    }

    pub async fn download_export(&self, session_id: &str) -> Result<ExportDownload> {
        let title = self
            .sessions
            .get_session(session_id)
            .await
            .and_then(|s| s.document.map(|d| d.properties.name));
        self.runtime
            .download_export(session_id, title.as_deref())
            .await
    }

    /// Archive the session, abandoning any build in flight.
    pub async fn archive(&self, session_id: &str) -> Result<GameSession> {
        self.runtime.cancel_build(session_id);
        self.sessions.archive(session_id).await
    }

    pub async fn restore(&self, session_id: &str) -> Result<GameSession> {
        self.sessions.restore(session_id).await
    }

    /// Leave the error state and forget the session's failure history.
    pub async fn reset_error(&self, session_id: &str) -> Result<GameSession> {
        let session = self.sessions.reset_error(session_id).await?;
        self.recovery.reset_session(session_id);
        Ok(session)
    }

    pub async fn health(&self) -> PipelineHealth {
        let toolchain_available = self.sandbox.toolchain_available();
        let recovery = self.recovery.health();
        let status = if toolchain_available {
            recovery.status
        } else {
            HealthStatus::Unhealthy
        };
        PipelineHealth {
            status,
            version: env!("CARGO_PKG_VERSION"),
            toolchain_available,
            active_builds: self.runtime.building_sessions().len(),
            free_build_slots: self.runtime.available_slots(),
            sessions: self.sessions.statistics().await,
            cache: self.cache.statistics(),
            recovery,
        }
    }

    /// The session, if it exists, is active, and has a document to build.
    async fn buildable(&self, session_id: &str, kind: BuildKind) -> Result<GameSession> {
        let session = self
            .sessions
            .get_session(session_id)
            .await
            .ok_or_else(|| PipelineError::SessionNotFound(session_id.to_string()))?;
        if session.status != SessionStatus::Active {
            return Err(PipelineError::InvalidTransition {
                id: session_id.to_string(),
                from: session.status,
                to: SessionStatus::Active,
            });
        }
        if session.document.is_none() {
            return Err(kind.failure("session has no document yet", None));
        }
        Ok(session)
    }

    /// Record build failures. Only a failure the user cannot get past by
    /// editing the document or retrying moves the session to `error`.
    async fn after_build<T>(&self, session_id: &str, result: Result<T>) -> Result<T> {
        let err = match result {
            Ok(value) => {
                if let Err(e) = self.sessions.touch(session_id).await {
                    tracing::debug!(session_id, error = %e, "Touch after build failed");
                }
                return Ok(value);
            },
            Err(e) => e,
        };

        let record = self.recovery.record(session_id, &err);
        let terminal = !err.is_recoverable()
            && matches!(
                err.kind(),
                ErrorKind::Preview | ErrorKind::Export | ErrorKind::Cli | ErrorKind::Sandbox
            );
        if terminal && let Err(e) = self.sessions.mark_error(session_id, record).await {
            tracing::warn!(session_id, error = %e, "Could not move session to error");
        }
        Err(err)
    }
}
