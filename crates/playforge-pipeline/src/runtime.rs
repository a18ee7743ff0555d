//! Preview and export builds.
//!
//! Every build runs the toolchain through the [`SandboxedExecutor`] inside the
//! session's isolated workspace, wrapped in the [`ErrorRecoveryEngine`] retry
//! loop. A per-session lock is taken before a worker slot, so one session
//! never has two builds running while other sessions proceed in parallel up
//! to `max_concurrent_builds`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::archive;
use crate::cache::{CacheLayer, CachedArtifact};
use crate::config::{ExportDefaults, PipelineConfig};
use crate::error::{ErrorKind, ExecError, PipelineError, Result};
use crate::recovery::ErrorRecoveryEngine;
use crate::sandbox::{CommandArg, SandboxedExecutor};
use crate::session::SessionId;
use crate::storage::{self, Reclaimed};

const ENTRY_POINT: &str = "index.html";
const DOCUMENT_FILE: &str = "game.json";
const SESSIONS_DIR: &str = "sessions";
const EXPORTS_DIR: &str = "exports";
const ZIP_MIME_TYPE: &str = "application/zip";
const MAX_DOWNLOAD_NAME_LEN: usize = 64;

/// What a build request does when its session already has one running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildPolicy {
    /// Wait for the running build to finish.
    #[default]
    Queue,
    /// Fail with [`PipelineError::BuildInProgress`].
    Reject,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Stored, no compression.
    None,
    #[default]
    Standard,
    Maximum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildKind {
    Preview,
    Export,
}

impl BuildKind {
    /// Toolchain subcommand.
    pub fn command(self) -> &'static str {
        match self {
            Self::Preview => "preview",
            Self::Export => "export",
        }
    }

    fn output_dir_name(self) -> &'static str {
        match self {
            Self::Preview => "preview",
            Self::Export => "export",
        }
    }

    pub fn error_kind(self) -> ErrorKind {
        match self {
            Self::Preview => ErrorKind::Preview,
            Self::Export => ErrorKind::Export,
        }
    }

    pub(crate) fn failure(self, detail: impl Into<String>, cause: Option<ExecError>) -> PipelineError {
        let detail = detail.into();
        match self {
            Self::Preview => PipelineError::PreviewBuild { detail, cause },
            Self::Export => PipelineError::ExportBuild { detail, cause },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    pub minify: bool,
    pub mobile_optimized: bool,
    pub compression: Compression,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self::from(&ExportDefaults::default())
    }
}

impl From<&ExportDefaults> for ExportOptions {
    fn from(defaults: &ExportDefaults) -> Self {
        Self {
            minify: defaults.minify,
            mobile_optimized: defaults.mobile_optimized,
            compression: defaults.compression,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewResult {
    pub session_id: String,
    pub preview_path: PathBuf,
    pub preview_url: String,
    pub entry_point: PathBuf,
    pub build_time: Duration,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportResult {
    pub session_id: String,
    pub export_path: PathBuf,
    pub zip_path: PathBuf,
    pub download_url: String,
    pub build_time: Duration,
    pub file_size: u64,
    /// The archive is larger than `max_export_size_bytes`. The archive is
    /// still kept; the caller decides what to do.
    pub size_limit_exceeded: bool,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportStatus {
    pub exists: bool,
    pub download_url: Option<String>,
    pub file_size: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportDownload {
    pub path: PathBuf,
    pub file_name: String,
    pub mime_type: &'static str,
    pub file_size: u64,
}

pub fn preview_url(session_id: &str) -> String {
    format!("/{session_id}/serve")
}

pub fn download_url(session_id: &str) -> String {
    format!("/{session_id}/download")
}

/// Lower-case, dash-separated file stem safe for a `Content-Disposition`
/// header. Falls back to `game`.
pub fn download_file_name(title: Option<&str>) -> String {
    let mut stem = String::new();
    for c in title.unwrap_or_default().chars() {
        if stem.len() >= MAX_DOWNLOAD_NAME_LEN {
            break;
        }
        if c.is_ascii_alphanumeric() || c == '_' {
            stem.push(c.to_ascii_lowercase());
        } else if (c.is_whitespace() || c == '-') && !stem.is_empty() && !stem.ends_with('-') {
            stem.push('-');
        }
    }
    let stem = stem.trim_end_matches('-');
    if stem.is_empty() {
        "game.zip".to_string()
    } else {
        format!("{stem}.zip")
    }
}

/// Holds a session's build slot. Dropping it removes an isolated workspace
/// the build left behind, then releases the worker slot and the session lock
/// and clears the in-flight entry. A build future dropped mid-await goes
/// through the same path.
struct BuildGuard<'a> {
    runtime: &'a BuildRuntime,
    session_id: String,
    token: CancellationToken,
    permit: Option<OwnedSemaphorePermit>,
    session_lock: Option<OwnedMutexGuard<()>>,
    /// The isolated workspace exists on disk.
    workspace: bool,
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        if self.workspace
            && let Err(e) = self.runtime.sandbox.discard_isolated_workspace(&self.session_id)
        {
            tracing::warn!(session_id = %self.session_id, error = %e, "Failed to remove abandoned workspace");
        }
        self.runtime.in_flight.lock().remove(&self.session_id);
        self.permit.take();
        self.session_lock.take();
        self.runtime.prune_lock(&self.session_id);
    }
}

/// Keeps builds of one session from starting while held. Taken by the
/// cleanup sweep around anything it deletes on a session's behalf.
pub struct SessionHold<'a> {
    runtime: &'a BuildRuntime,
    session_id: String,
    lock: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionHold<'_> {
    fn drop(&mut self) {
        self.lock.take();
        self.runtime.prune_lock(&self.session_id);
    }
}

pub struct BuildRuntime {
    sandbox: Arc<SandboxedExecutor>,
    recovery: Arc<ErrorRecoveryEngine>,
    cache: Arc<CacheLayer>,
    slots: Arc<Semaphore>,
    session_locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    in_flight: parking_lot::Mutex<HashMap<String, CancellationToken>>,
    policy: BuildPolicy,
    target: String,
    max_export_size: u64,
    export_ttl: Duration,
}

impl BuildRuntime {
    pub fn new(
        config: &PipelineConfig,
        sandbox: Arc<SandboxedExecutor>,
        recovery: Arc<ErrorRecoveryEngine>,
        cache: Arc<CacheLayer>,
    ) -> Self {
        Self {
            sandbox,
            recovery,
            cache,
            slots: Arc::new(Semaphore::new(config.limits.max_concurrent_builds.max(1))),
            session_locks: parking_lot::Mutex::new(HashMap::new()),
            in_flight: parking_lot::Mutex::new(HashMap::new()),
            policy: config.limits.concurrent_build_policy,
            target: config.toolchain.target.clone(),
            max_export_size: config.limits.max_export_size_bytes,
            export_ttl: Duration::from_secs(config.cleanup.export_max_age_hours.saturating_mul(3600)),
        }
    }

    pub fn output_dir(&self, session_id: &str, kind: BuildKind) -> PathBuf {
        self.sandbox
            .root()
            .join(SESSIONS_DIR)
            .join(session_id)
            .join(kind.output_dir_name())
    }

    pub fn exports_root(&self) -> PathBuf {
        self.sandbox.root().join(EXPORTS_DIR)
    }

    pub fn export_archive_path(&self, session_id: &str) -> PathBuf {
        self.exports_root().join(format!("{session_id}.zip"))
    }

    pub fn is_building(&self, session_id: &str) -> bool {
        self.in_flight.lock().contains_key(session_id)
    }

    pub fn building_sessions(&self) -> Vec<String> {
        self.in_flight.lock().keys().cloned().collect()
    }

    /// Cancel the in-flight build of `session_id`, killing the toolchain.
    /// Returns whether a build was running.
    pub fn cancel_build(&self, session_id: &str) -> bool {
        match self.in_flight.lock().get(session_id) {
            Some(token) => {
                tracing::info!(session_id, "Cancelling build");
                token.cancel();
                true
            },
            None => false,
        }
    }

    /// Free worker slots right now.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Take the build lock of `session_id` without waiting. `None` while a
    /// build of that session holds it.
    pub fn try_hold(&self, session_id: &str) -> Option<SessionHold<'_>> {
        let lock = self.session_lock(session_id).try_lock_owned().ok()?;
        Some(SessionHold {
            runtime: self,
            session_id: session_id.to_string(),
            lock: Some(lock),
        })
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.session_locks
                .lock()
                .entry(session_id.to_string())
                .or_default(),
        )
    }

    /// Forget the lock of `session_id` once nothing but the map refers to it.
    fn prune_lock(&self, session_id: &str) {
        let mut locks = self.session_locks.lock();
        if locks
            .get(session_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(session_id);
        }
    }

    async fn acquire(&self, session_id: &str) -> Result<BuildGuard<'_>> {
        let lock = self.session_lock(session_id);
        let session_lock = match self.policy {
            BuildPolicy::Reject => lock
                .try_lock_owned()
                .map_err(|_| PipelineError::BuildInProgress(session_id.to_string()))?,
            BuildPolicy::Queue => lock.lock_owned().await,
        };

        let token = CancellationToken::new();
        self.in_flight
            .lock()
            .insert(session_id.to_string(), token.clone());
        let mut guard = BuildGuard {
            runtime: self,
            session_id: session_id.to_string(),
            token,
            permit: None,
            session_lock: Some(session_lock),
            workspace: false,
        };

        let permit = tokio::select! {
            permit = Arc::clone(&self.slots).acquire_owned() => permit.ok(),
            _ = guard.token.cancelled() => None,
        };
        match permit {
            Some(permit) => {
                guard.permit = Some(permit);
                Ok(guard)
            },
            None => Err(PipelineError::Cancelled(session_id.to_string())),
        }
    }

    /// Build a browser preview of the document at `document_path`.
    pub async fn build_preview(&self, session_id: &str, document_path: &Path) -> Result<PreviewResult> {
        let outcome = self
            .build(session_id, document_path, BuildKind::Preview, None)
            .await?;
        Ok(PreviewResult {
            session_id: session_id.to_string(),
            preview_path: outcome.artifact.output_dir,
            preview_url: preview_url(session_id),
            entry_point: outcome.artifact.entry_point,
            build_time: outcome.artifact.build_time,
            from_cache: outcome.from_cache,
        })
    }

    /// Build and package a distributable export.
    pub async fn build_export(
        &self,
        session_id: &str,
        document_path: &Path,
        options: &ExportOptions,
    ) -> Result<ExportResult> {
        let outcome = self
            .build(session_id, document_path, BuildKind::Export, Some(options))
            .await?;
        let zip_path = outcome
            .artifact
            .zip_path
            .unwrap_or_else(|| self.export_archive_path(session_id));
        Ok(ExportResult {
            session_id: session_id.to_string(),
            export_path: outcome.artifact.output_dir,
            zip_path,
            download_url: download_url(session_id),
            build_time: outcome.artifact.build_time,
            file_size: outcome.artifact.file_size,
            size_limit_exceeded: outcome.artifact.file_size > self.max_export_size,
            from_cache: outcome.from_cache,
        })
    }

    async fn build(
        &self,
        session_id: &str,
        document_path: &Path,
        kind: BuildKind,
        options: Option<&ExportOptions>,
    ) -> Result<BuildOutcome> {
        let id = SessionId::parse(session_id)?;
        let mut guard = self.acquire(id.as_str()).await?;

        // Read under the lock: the session may have been removed while queued.
        let document = match tokio::fs::read(document_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(kind.failure("session has no stored document", None));
            },
            Err(e) => return Err(e.into()),
        };
        let key = artifact_key(&document, options);

        if let Some(artifact) = self.cache.get_cached_artifact(id.as_str(), kind, &key)
            && artifact.entry_point.is_file()
            && artifact.zip_path.as_deref().is_none_or(Path::is_file)
        {
            tracing::debug!(session_id, kind = ?kind, "Build served from cache");
            return Ok(BuildOutcome {
                artifact,
                from_cache: true,
            });
        }

        tracing::info!(session_id, kind = ?kind, "Build started");
        let started = Instant::now();
        guard.workspace = true;
        let workspace = self.sandbox.create_isolated_workspace(id.as_str()).await?;
        let result = self
            .run_toolchain(&id, kind, &document, &workspace, options, &guard.token)
            .await;
        match self.sandbox.cleanup_isolated_workspace(id.as_str()).await {
            Ok(()) => guard.workspace = false,
            Err(e) => tracing::warn!(session_id, error = %e, "Failed to remove isolated workspace"),
        }
        let mut artifact = match result {
            Ok(artifact) => artifact,
            Err(e) => {
                if matches!(e, PipelineError::Cancelled(_))
                    && let Err(remove_err) = storage::remove_path(&self.output_dir(id.as_str(), kind)).await
                {
                    tracing::warn!(session_id, error = %remove_err, "Failed to remove partial build output");
                }
                tracing::warn!(session_id, kind = ?kind, error = %e, "Build failed");
                return Err(e);
            },
        };

        if let Some(options) = options {
            let zip_path = self.export_archive_path(id.as_str());
            let size = archive::package_directory(&artifact.output_dir, &zip_path, options.compression).await?;
            if size > self.max_export_size {
                tracing::warn!(session_id, size, limit = self.max_export_size, "Export exceeds size limit");
            }
            artifact.zip_path = Some(zip_path);
            artifact.file_size = size;
        }
        artifact.build_time = started.elapsed();

        self.cache
            .cache_artifact(id.as_str(), kind, &key, artifact.clone());
        tracing::info!(
            session_id,
            kind = ?kind,
            build_ms = artifact.build_time.as_millis() as u64,
            "Build finished"
        );
        drop(guard);
        Ok(BuildOutcome {
            artifact,
            from_cache: false,
        })
    }

    async fn run_toolchain(
        &self,
        id: &SessionId,
        kind: BuildKind,
        document: &[u8],
        workspace: &Path,
        options: Option<&ExportOptions>,
        token: &CancellationToken,
    ) -> Result<CachedArtifact> {
        tokio::fs::write(workspace.join(DOCUMENT_FILE), document).await?;

        let output_dir = self.output_dir(id.as_str(), kind);
        storage::remove_path(&output_dir).await?;
        tokio::fs::create_dir_all(&output_dir).await?;

        let mut args = vec![
            CommandArg::value(DOCUMENT_FILE),
            CommandArg::flag("output", output_dir.to_string_lossy()),
            CommandArg::flag("target", self.target.as_str()),
        ];
        if let Some(options) = options {
            args.push(CommandArg::flag("minify", options.minify.to_string()));
            if options.mobile_optimized {
                args.push(CommandArg::switch("mobile-optimized"));
            }
        }

        let sandbox = self.sandbox.as_ref();
        let args = args.as_slice();
        let session_id = id.as_str();
        self.recovery
            .execute_with_retry(kind.error_kind(), token, move |attempt| async move {
                tracing::debug!(session_id, attempt, command = kind.command(), "Invoking toolchain");
                sandbox
                    .execute_cancellable(kind.command(), args, workspace, token)
                    .await
                    .map_err(|e| classify(kind, session_id, e))
            })
            .await?;

        let entry_point = output_dir.join(ENTRY_POINT);
        if !tokio::fs::try_exists(&entry_point).await.unwrap_or(false) {
            return Err(kind.failure(
                format!("toolchain exited successfully but produced no {ENTRY_POINT}"),
                None,
            ));
        }
        Ok(CachedArtifact {
            output_dir,
            entry_point,
            zip_path: None,
            file_size: 0,
            build_time: Duration::ZERO,
        })
    }

    pub async fn get_export_status(&self, session_id: &str) -> Result<ExportStatus> {
        let id = SessionId::parse(session_id)?;
        let path = self.export_archive_path(id.as_str());
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ExportStatus {
                    exists: false,
                    download_url: None,
                    file_size: 0,
                    created_at: None,
                    expires_at: None,
                });
            },
            Err(e) => return Err(e.into()),
        };
        let created_at = meta.modified().ok().map(DateTime::<Utc>::from);
        let expires_at = created_at.and_then(|created| {
            chrono::Duration::from_std(self.export_ttl)
                .ok()
                .map(|ttl| created + ttl)
        });
        Ok(ExportStatus {
            exists: true,
            download_url: Some(download_url(id.as_str())),
            file_size: meta.len(),
            created_at,
            expires_at,
        })
    }

    /// Locate a previously built archive for download. Never rebuilds.
    pub async fn download_export(&self, session_id: &str, title: Option<&str>) -> Result<ExportDownload> {
        let id = SessionId::parse(session_id)?;
        let path = self.export_archive_path(id.as_str());
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Err(PipelineError::ExportNotFound(session_id.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::ExportNotFound(session_id.to_string()));
            },
            Err(e) => return Err(e.into()),
        };
        Ok(ExportDownload {
            path,
            file_name: download_file_name(title),
            mime_type: ZIP_MIME_TYPE,
            file_size: meta.len(),
        })
    }

    /// Delete export archives older than `max_age`, skipping sessions with a
    /// build in flight.
    pub async fn cleanup_old_exports(&self, max_age: Duration) -> Result<Reclaimed> {
        let root = self.exports_root();
        let mut reclaimed = Reclaimed::default();
        for name in storage::list_names(&root).await? {
            let Some(id) = name.strip_suffix(".zip") else {
                continue;
            };
            let Some(_hold) = self.try_hold(id) else {
                continue;
            };
            let path = root.join(&name);
            if storage::age_of(&path).await.is_some_and(|age| age > max_age) {
                reclaimed.add(storage::remove_path(&path).await?);
            }
        }
        if reclaimed.count > 0 {
            tracing::info!(removed = reclaimed.count, bytes = reclaimed.bytes, "Old exports removed");
        }
        Ok(reclaimed)
    }
}

struct BuildOutcome {
    artifact: CachedArtifact,
    from_cache: bool,
}

fn classify(kind: BuildKind, session_id: &str, e: ExecError) -> PipelineError {
    match e {
        ExecError::Cancelled => PipelineError::Cancelled(session_id.to_string()),
        e if e.is_violation() => PipelineError::SandboxViolation(e),
        e => kind.failure(format!("`{}` failed", kind.command()), Some(e)),
    }
}

/// Content hash of the document bytes plus the options that shape the output.
fn artifact_key(document: &[u8], options: Option<&ExportOptions>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document);
    if let Some(options) = options {
        hasher.update([
            u8::from(options.minify),
            u8::from(options.mobile_optimized),
            options.compression as u8,
        ]);
    }
    hex::encode(hasher.finalize())
}
