//! Periodic reclamation of disk space and stale in-memory state.
//!
//! Only targets paths whose owning session is provably inactive or unknown.
//! Anything deleted on a session's behalf is deleted while holding that
//! session's build lock, so a build can neither be running nor start
//! underneath the sweep. Each category is swept independently and its
//! failures are recorded in the report rather than aborting the sweep.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheLayer;
use crate::config::CleanupConfig;
use crate::recovery::ErrorRecoveryEngine;
use crate::runtime::BuildRuntime;
use crate::session::SessionManager;
use crate::storage::{self, Reclaimed};

const TEMP_DIR: &str = "temp";
const ISOLATED_DIR: &str = "isolated";
const SESSIONS_DIR: &str = "sessions";
const EXPORTS_DIR: &str = "exports";

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub temp_files_cleaned: usize,
    pub sessions_cleaned: usize,
    pub orphans_cleaned: usize,
    pub exports_cleaned: usize,
    pub cache_entries_purged: usize,
    pub bytes_freed: u64,
    pub errors: Vec<String>,
    pub duration: Duration,
}

impl CleanupReport {
    fn record(&mut self, category: &str, result: std::io::Result<()>) {
        if let Err(e) = result {
            tracing::warn!(category, error = %e, "Cleanup step failed");
            self.errors.push(format!("{category}: {e}"));
        }
    }
}

pub struct ResourceCleanupService {
    root: PathBuf,
    config: CleanupConfig,
    sessions: Arc<SessionManager>,
    runtime: Arc<BuildRuntime>,
    cache: Arc<CacheLayer>,
    recovery: Arc<ErrorRecoveryEngine>,
}

impl ResourceCleanupService {
    pub fn new(
        root: &Path,
        config: CleanupConfig,
        sessions: Arc<SessionManager>,
        runtime: Arc<BuildRuntime>,
        cache: Arc<CacheLayer>,
        recovery: Arc<ErrorRecoveryEngine>,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            config,
            sessions,
            runtime,
            cache,
            recovery,
        }
    }

    fn hours(hours: u64) -> Duration {
        Duration::from_secs(hours.saturating_mul(3600))
    }

    /// Run every cleanup category once.
    pub async fn run_sweep(&self) -> CleanupReport {
        let started = Instant::now();
        let mut report = CleanupReport::default();
        let temp_age = Self::hours(self.config.temp_file_max_age_hours);

        for dir in [TEMP_DIR, ISOLATED_DIR] {
            let mut reclaimed = Reclaimed::default();
            let result = self
                .sweep_temp(&self.root.join(dir), temp_age, &mut reclaimed)
                .await;
            report.temp_files_cleaned += reclaimed.count;
            report.bytes_freed += reclaimed.bytes;
            report.record("temp_files", result);
        }

        let inactive = self
            .sessions
            .inactive_sessions(Self::hours(self.config.inactive_session_hours))
            .await;
        for id in inactive {
            let Some(_hold) = self.runtime.try_hold(&id) else {
                continue;
            };
            match self.sessions.remove_session(&id).await {
                Ok(bytes) => {
                    report.sessions_cleaned += 1;
                    report.bytes_freed += bytes;
                    self.recovery.reset_session(&id);
                    let archive = self.runtime.export_archive_path(&id);
                    if let Ok(bytes) = storage::remove_path(&archive).await {
                        report.bytes_freed += bytes;
                    }
                },
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "Failed to remove inactive session");
                    report.errors.push(format!("session {id}: {e}"));
                },
            }
        }

        let known = self.sessions.known_ids().await;
        let grace = Duration::from_secs(self.config.orphan_grace_secs);
        let mut orphans = Reclaimed::default();
        for dir in [SESSIONS_DIR, ISOLATED_DIR] {
            let result = self
                .sweep_orphans(&self.root.join(dir), None, &known, grace, &mut orphans)
                .await;
            report.record("orphans", result);
        }
        let result = self
            .sweep_orphans(&self.root.join(EXPORTS_DIR), Some(".zip"), &known, grace, &mut orphans)
            .await;
        report.record("orphans", result);
        report.orphans_cleaned = orphans.count;
        report.bytes_freed += orphans.bytes;

        report.cache_entries_purged = self.cache.purge_expired() + self.recovery.prune_expired();

        match self
            .runtime
            .cleanup_old_exports(Self::hours(self.config.export_max_age_hours))
            .await
        {
            Ok(exports) => {
                report.exports_cleaned = exports.count;
                report.bytes_freed += exports.bytes;
            },
            Err(e) => {
                tracing::warn!(error = %e, "Failed to remove old exports");
                report.errors.push(format!("exports: {e}"));
            },
        }

        report.duration = started.elapsed();
        tracing::info!(
            temp_files = report.temp_files_cleaned,
            sessions = report.sessions_cleaned,
            orphans = report.orphans_cleaned,
            exports = report.exports_cleaned,
            cache_entries = report.cache_entries_purged,
            bytes_freed = report.bytes_freed,
            errors = report.errors.len(),
            "Cleanup sweep finished"
        );
        report
    }

    /// Age out files below each top-level entry of `dir`. The entries
    /// themselves stay; removing a whole workspace is left to
    /// [`Self::sweep_orphans`].
    async fn sweep_temp(&self, dir: &Path, max_age: Duration, reclaimed: &mut Reclaimed) -> std::io::Result<()> {
        for name in storage::list_names(dir).await? {
            let Some(_hold) = self.runtime.try_hold(&name) else {
                continue;
            };
            sweep_old_files(&dir.join(&name), max_age, reclaimed).await?;
        }
        Ok(())
    }

    /// Remove children of `dir` named after no known session. `suffix` is
    /// stripped from file names first (`{id}.zip`).
    async fn sweep_orphans(
        &self,
        dir: &Path,
        suffix: Option<&str>,
        known: &HashSet<String>,
        grace: Duration,
        reclaimed: &mut Reclaimed,
    ) -> std::io::Result<()> {
        for name in storage::list_names(dir).await? {
            let id = match suffix {
                Some(suffix) => match name.strip_suffix(suffix) {
                    Some(id) => id,
                    None => continue,
                },
                None => name.as_str(),
            };
            if known.contains(id) {
                continue;
            }
            let Some(_hold) = self.runtime.try_hold(id) else {
                continue;
            };
            let path = dir.join(&name);
            // Unknown but young: a build or session creation may own it.
            if !storage::age_of(&path).await.is_some_and(|age| age > grace) {
                continue;
            }
            let bytes = storage::remove_path(&path).await?;
            tracing::info!(path = %path.display(), bytes, "Orphan removed");
            reclaimed.add(bytes);
        }
        Ok(())
    }
}

/// Delete files at or below `top` older than `max_age`, then directories
/// below `top` left empty. `top` itself is never removed when it is a
/// directory.
async fn sweep_old_files(top: &Path, max_age: Duration, reclaimed: &mut Reclaimed) -> std::io::Result<()> {
    let mut dirs = Vec::new();
    let mut pending = vec![top.to_path_buf()];

    while let Some(path) = pending.pop() {
        let meta = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        if meta.is_dir() {
            let mut entries = tokio::fs::read_dir(&path).await?;
            while let Some(entry) = entries.next_entry().await? {
                pending.push(entry.path());
            }
            dirs.push(path);
        } else if storage::age_of(&path).await.is_some_and(|age| age > max_age) {
            reclaimed.add(storage::remove_path(&path).await?);
        }
    }

    // Children were pushed after their parents, so reverse order visits
    // the deepest first. Non-empty directories fail and stay. `dirs[0]` is
    // `top`.
    for dir in dirs.into_iter().skip(1).rev() {
        let _ = tokio::fs::remove_dir(&dir).await;
    }
    Ok(())
}

/// Run [`ResourceCleanupService::run_sweep`] every `interval` until `cancel`
/// fires. The first sweep runs one interval after start.
pub fn spawn_cleanup_task(
    service: Arc<ResourceCleanupService>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    service.run_sweep().await;
                },
                _ = cancel.cancelled() => {
                    tracing::info!("Cleanup task stopped");
                    break;
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;

    fn age(path: &Path, by: Duration) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[tokio::test]
    async fn old_temp_files_and_empty_dirs_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let top = dir.path().join("a");
        std::fs::create_dir_all(top.join("b/c")).unwrap();
        std::fs::write(top.join("b/c/old.tmp"), vec![0u8; 7]).unwrap();
        std::fs::write(top.join("new.tmp"), b"n").unwrap();
        age(&top.join("b/c/old.tmp"), Duration::from_secs(25 * 3600));

        let mut reclaimed = Reclaimed::default();
        sweep_old_files(&top, Duration::from_secs(24 * 3600), &mut reclaimed)
            .await
            .unwrap();

        assert_eq!(reclaimed, Reclaimed { count: 1, bytes: 7 });
        assert!(!top.join("b").exists());
        assert!(top.join("new.tmp").exists());
    }

    #[tokio::test]
    async fn emptied_top_directory_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let top = dir.path().join("workspace");
        std::fs::create_dir_all(&top).unwrap();
        std::fs::write(top.join("game.json"), b"{}").unwrap();
        age(&top.join("game.json"), Duration::from_secs(3600));

        let mut reclaimed = Reclaimed::default();
        sweep_old_files(&top, Duration::ZERO, &mut reclaimed)
            .await
            .unwrap();
        assert_eq!(reclaimed.count, 1);
        assert!(top.is_dir());
    }

    #[tokio::test]
    async fn old_top_level_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("upload.bin");
        std::fs::write(&file, b"x").unwrap();
        age(&file, Duration::from_secs(3600));

        let mut reclaimed = Reclaimed::default();
        sweep_old_files(&file, Duration::from_secs(60), &mut reclaimed)
            .await
            .unwrap();
        assert_eq!(reclaimed, Reclaimed { count: 1, bytes: 1 });
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn missing_temp_root_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut reclaimed = Reclaimed::default();
        sweep_old_files(&dir.path().join("nothing"), Duration::ZERO, &mut reclaimed)
            .await
            .unwrap();
        assert_eq!(reclaimed.count, 0);
    }
}
