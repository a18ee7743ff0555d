use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use playforge_core::validator::{sanitize_reported, validate};
use playforge_core::{AssetManifest, DocumentError, GameDocument, content_hash};

use crate::cache::CacheLayer;
use crate::error::{PipelineError, Result};
use crate::recovery::ErrorRecord;
use crate::storage;

const SESSIONS_DIR: &str = "sessions";
const METADATA_FILE: &str = "session.json";
const DOCUMENT_FILE: &str = "game.json";
const MANIFEST_FILE: &str = "assets.json";
const MAX_SESSION_ID_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Archived,
    /// Terminal until [`SessionManager::reset_error`].
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::Error => "error",
        })
    }
}

/// Opaque session token: `[A-Za-z0-9_-]{1,64}`. Safe to use as a path
/// component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn parse(id: &str) -> Result<Self> {
        if is_valid_session_id(id) {
            Ok(Self(id.to_string()))
        } else {
            Err(PipelineError::InvalidSessionId(id.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
}

impl TryFrom<String> for SessionId {
    type Error = String;

    fn try_from(id: String) -> std::result::Result<Self, Self::Error> {
        if is_valid_session_id(&id) {
            Ok(Self(id))
        } else {
            Err(format!("invalid session id `{id}`"))
        }
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to the external workspace/user that owns a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerRef {
    pub workspace_id: String,
    pub user_id: String,
}

/// A versioned container for one game document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSession {
    pub id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerRef>,
    pub version: u64,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorRecord>,
    #[serde(skip)]
    pub storage_dir: PathBuf,
    #[serde(skip)]
    pub document: Option<GameDocument>,
    #[serde(skip)]
    pub manifest: AssetManifest,
}

impl GameSession {
    fn new(id: SessionId, owner: Option<OwnerRef>, storage_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner,
            version: 1,
            status: SessionStatus::Active,
            created_at: now,
            last_modified: now,
            last_error: None,
            storage_dir,
            document: None,
            manifest: AssetManifest::default(),
        }
    }

    pub fn document_path(&self) -> PathBuf {
        self.storage_dir.join(DOCUMENT_FILE)
    }

    /// Time since the last mutation or touch.
    pub fn idle_for(&self) -> Duration {
        (Utc::now() - self.last_modified)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStatistics {
    pub total: usize,
    pub active: usize,
    pub archived: usize,
    pub error: usize,
}

/// Generates a game document from a free-form request.
pub trait Synthesizer: Send + Sync {
    fn synthesize(
        &self,
        request: &str,
        template: Option<&Value>,
    ) -> impl Future<Output = std::result::Result<Value, String>> + Send;
}

/// Source of named starter documents.
pub trait TemplateProvider: Send + Sync {
    fn load_template(&self, name: &str) -> Option<Value>;
}

/// A document that passed validation and sanitisation, ready to persist.
struct Accepted {
    tree: Value,
    document: GameDocument,
}

/// Owns every session record and its storage directory.
pub struct SessionManager {
    root: PathBuf,
    sessions: RwLock<HashMap<String, GameSession>>,
    cache: Arc<CacheLayer>,
}

impl SessionManager {
    /// Open the store under `{sandbox_root}/sessions`, rehydrating any
    /// sessions already on disk.
    ///
    /// Directories without readable metadata are skipped; the cleanup sweep
    /// treats them as orphans.
    pub async fn open(sandbox_root: &Path, cache: Arc<CacheLayer>) -> Result<Self> {
        let root = sandbox_root.join(SESSIONS_DIR);
        tokio::fs::create_dir_all(&root).await?;

        let mut sessions = HashMap::new();
        for name in storage::list_names(&root).await? {
            if !is_valid_session_id(&name) {
                continue;
            }
            let dir = root.join(&name);
            let mut session: GameSession = match storage::read_json(&dir.join(METADATA_FILE)).await {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(session_id = %name, error = %e, "Skipping unreadable session");
                    continue;
                },
            };
            if session.id.as_str() != name {
                tracing::warn!(session_id = %name, "Session metadata id mismatch, skipping");
                continue;
            }
            session.storage_dir = dir.clone();
            match storage::read_json::<GameDocument>(&dir.join(DOCUMENT_FILE)).await {
                Ok(document) => session.document = Some(document),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => {
                    tracing::warn!(session_id = %name, error = %e, "Stored document unreadable");
                },
            }
            if let Ok(manifest) = storage::read_json(&dir.join(MANIFEST_FILE)).await {
                session.manifest = manifest;
            }
            sessions.insert(name, session);
        }
        tracing::info!(sessions = sessions.len(), root = %root.display(), "Session store opened");

        Ok(Self {
            root,
            sessions: RwLock::new(sessions),
            cache,
        })
    }

    pub fn session_dir(&self, id: &SessionId) -> PathBuf {
        self.root.join(id.as_str())
    }

    pub fn document_path(&self, id: &SessionId) -> PathBuf {
        self.session_dir(id).join(DOCUMENT_FILE)
    }

    /// Directory holding one directory per session.
    pub fn sessions_root(&self) -> &Path {
        &self.root
    }

    /// Validate and sanitise through the content-hash keyed caches. The
    /// structure cache maps a submitted document's hash to its sanitised
    /// tree, so a resubmitted document skips both passes and keeps the
    /// values generated for it the first time.
    fn accept(&self, document: Value) -> Result<Accepted> {
        let hash = content_hash(&document);
        let tree = match self.cache.get_cached_game_structure(&hash) {
            Some(tree) => tree.as_ref().clone(),
            None => {
                let report = match self.cache.get_cached_validation_result(&hash) {
                    Some(report) => report,
                    None => {
                        let report = Arc::new(validate(&document));
                        self.cache.cache_validation_result(&hash, report.as_ref().clone());
                        report
                    },
                };
                let tree = sanitize_reported(document, &report)?;
                self.cache.cache_game_structure(&hash, tree.clone());
                tree
            },
        };
        let document: GameDocument =
            serde_json::from_value(tree.clone()).map_err(DocumentError::Malformed)?;
        Ok(Accepted { tree, document })
    }

    async fn persist_document(&self, dir: &Path, accepted: &Accepted) -> Result<AssetManifest> {
        let manifest = accepted.document.asset_manifest();
        storage::write_json_atomic(&dir.join(DOCUMENT_FILE), &accepted.tree).await?;
        storage::write_json_atomic(&dir.join(MANIFEST_FILE), &manifest).await?;
        Ok(manifest)
    }

    /// Rewrite the document files of `session` after a failed update, so
    /// disk matches the metadata still in place.
    async fn restore_document(&self, session: &GameSession) {
        let dir = &session.storage_dir;
        let restored = match &session.document {
            Some(document) => storage::write_json_atomic(&dir.join(DOCUMENT_FILE), document).await,
            None => storage::remove_path(&dir.join(DOCUMENT_FILE)).await.map(drop),
        };
        let restored = match restored {
            Ok(()) => storage::write_json_atomic(&dir.join(MANIFEST_FILE), &session.manifest).await,
            Err(e) => Err(e),
        };
        match restored {
            Ok(()) => tracing::warn!(session_id = %session.id, "Update rolled back"),
            Err(e) => tracing::error!(session_id = %session.id, error = %e, "Failed to roll back document"),
        }
    }

    async fn persist_metadata(&self, session: &GameSession) -> Result<()> {
        storage::write_json_atomic(&session.storage_dir.join(METADATA_FILE), session).await?;
        Ok(())
    }

    /// Create a session at version 1 holding `document`.
    pub async fn create_session(
        &self,
        owner: Option<OwnerRef>,
        document: Value,
    ) -> Result<GameSession> {
        let accepted = self.accept(document)?;
        let id = SessionId::generate();
        let dir = self.session_dir(&id);
        tokio::fs::create_dir_all(&dir).await?;

        let mut session = GameSession::new(id, owner, dir.clone());
        let stored = match self.persist_document(&dir, &accepted).await {
            Ok(manifest) => {
                session.manifest = manifest;
                self.persist_metadata(&session).await
            },
            Err(e) => Err(e),
        };
        if let Err(e) = stored {
            let _ = storage::remove_path(&dir).await;
            return Err(e);
        }
        session.document = Some(accepted.document);
        self.cache
            .cache_asset_manifest(session.id.as_str(), session.manifest.clone());

        tracing::info!(session_id = %session.id, "Session created");
        self.sessions
            .write()
            .await
            .insert(session.id.to_string(), session.clone());
        Ok(session)
    }

    /// Return the session with `id`, creating an empty active one if absent.
    pub async fn get_or_create_session(
        &self,
        id: &str,
        owner: Option<OwnerRef>,
    ) -> Result<GameSession> {
        let id = SessionId::parse(id)?;
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(id.as_str()) {
            return Ok(existing.clone());
        }
        let dir = self.session_dir(&id);
        tokio::fs::create_dir_all(&dir).await?;
        let session = GameSession::new(id, owner, dir);
        self.persist_metadata(&session).await?;
        tracing::info!(session_id = %session.id, "Session created");
        sessions.insert(session.id.to_string(), session.clone());
        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> Option<GameSession> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Most recently modified active session of `owner`.
    pub async fn find_active_for_owner(&self, owner: &OwnerRef) -> Option<GameSession> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.status == SessionStatus::Active && s.owner.as_ref() == Some(owner))
            .max_by_key(|s| s.last_modified)
            .cloned()
    }

    /// Sessions, newest first, optionally filtered by status.
    pub async fn list_sessions(&self, status: Option<SessionStatus>) -> Vec<GameSession> {
        let mut list: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| status.is_none_or(|wanted| s.status == wanted))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        list
    }

    /// Validate and store a new document version.
    ///
    /// A rejected document leaves the session untouched; the violations are
    /// returned in [`PipelineError::Validation`].
    pub async fn update_document(&self, id: &str, document: Value) -> Result<GameSession> {
        let accepted = self.accept(document)?;

        let mut sessions = self.sessions.write().await;
        let current = sessions
            .get(id)
            .ok_or_else(|| PipelineError::SessionNotFound(id.to_string()))?;
        if current.status != SessionStatus::Active {
            tracing::warn!(session_id = id, status = %current.status, "Update refused");
            return Err(PipelineError::InvalidTransition {
                id: id.to_string(),
                from: current.status,
                to: SessionStatus::Active,
            });
        }

        let mut next = current.clone();
        next.version += 1;
        next.last_modified = Utc::now();
        let persisted = match self.persist_document(&next.storage_dir, &accepted).await {
            Ok(manifest) => {
                next.manifest = manifest;
                self.persist_metadata(&next).await
            },
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            self.restore_document(current).await;
            return Err(e);
        }
        next.document = Some(accepted.document);

        self.cache.invalidate_session(id);
        self.cache.cache_asset_manifest(id, next.manifest.clone());

        tracing::info!(session_id = id, version = next.version, "Document updated");
        sessions.insert(id.to_string(), next.clone());
        Ok(next)
    }

    /// Generate a document from `request`, optionally seeded by a named
    /// template, and store it as the next version.
    pub async fn apply_synthesis<S, T>(
        &self,
        id: &str,
        request: &str,
        template: Option<&str>,
        synthesizer: &S,
        templates: &T,
    ) -> Result<GameSession>
    where
        S: Synthesizer,
        T: TemplateProvider,
    {
        let template = match template {
            Some(name) => match self.cache.get_cached_template(name) {
                Some(cached) => Some(cached),
                None => match templates.load_template(name) {
                    Some(loaded) => {
                        self.cache.cache_template(name, loaded.clone());
                        Some(Arc::new(loaded))
                    },
                    None => {
                        tracing::warn!(template = name, "Unknown template, synthesising without it");
                        None
                    },
                },
            },
            None => None,
        };
        let document = synthesizer
            .synthesize(request, template.as_deref())
            .await
            .map_err(PipelineError::Synthesis)?;
        self.update_document(id, document).await
    }

    /// Apply a status change permitted by the session state machine.
    async fn transition(
        &self,
        id: &str,
        to: SessionStatus,
        last_error: Option<ErrorRecord>,
    ) -> Result<GameSession> {
        let mut sessions = self.sessions.write().await;
        let current = sessions
            .get(id)
            .ok_or_else(|| PipelineError::SessionNotFound(id.to_string()))?;
        let valid = matches!(
            (current.status, to),
            (SessionStatus::Active, SessionStatus::Archived)
                | (SessionStatus::Archived, SessionStatus::Active)
                | (SessionStatus::Active, SessionStatus::Error)
                | (SessionStatus::Error, SessionStatus::Active)
        );
        if !valid {
            tracing::warn!(
                session_id = id,
                from = %current.status,
                to = %to,
                "Invalid session state transition"
            );
            return Err(PipelineError::InvalidTransition {
                id: id.to_string(),
                from: current.status,
                to,
            });
        }

        let mut next = current.clone();
        next.status = to;
        next.last_error = last_error;
        next.last_modified = Utc::now();
        self.persist_metadata(&next).await?;
        tracing::info!(session_id = id, from = %current.status, to = %to, "Session status changed");
        sessions.insert(id.to_string(), next.clone());
        Ok(next)
    }

    pub async fn archive(&self, id: &str) -> Result<GameSession> {
        self.transition(id, SessionStatus::Archived, None).await
    }

    pub async fn restore(&self, id: &str) -> Result<GameSession> {
        self.transition(id, SessionStatus::Active, None).await
    }

    /// Move an active session to `error` after an unrecoverable failure.
    pub async fn mark_error(&self, id: &str, record: ErrorRecord) -> Result<GameSession> {
        self.transition(id, SessionStatus::Error, Some(record)).await
    }

    /// Clear the error state. Only an explicit reset leaves `error`.
    pub async fn reset_error(&self, id: &str) -> Result<GameSession> {
        let status = self.get_session(id).await.map(|s| s.status);
        if let Some(from @ (SessionStatus::Active | SessionStatus::Archived)) = status {
            return Err(PipelineError::InvalidTransition {
                id: id.to_string(),
                from,
                to: SessionStatus::Active,
            });
        }
        self.transition(id, SessionStatus::Active, None).await
    }

    /// Refresh the last-modified timestamp.
    pub async fn touch(&self, id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| PipelineError::SessionNotFound(id.to_string()))?;
        session.last_modified = Utc::now();
        self.persist_metadata(session).await
    }

    pub async fn statistics(&self) -> SessionStatistics {
        let sessions = self.sessions.read().await;
        let mut stats = SessionStatistics {
            total: sessions.len(),
            ..SessionStatistics::default()
        };
        for session in sessions.values() {
            match session.status {
                SessionStatus::Active => stats.active += 1,
                SessionStatus::Archived => stats.archived += 1,
                SessionStatus::Error => stats.error += 1,
            }
        }
        stats
    }

    /// Archive active sessions untouched for `older_than_days`. Returns how
    /// many were archived.
    pub async fn archive_inactive_sessions(&self, older_than_days: u64) -> Result<usize> {
        let max_idle = Duration::from_secs(older_than_days.saturating_mul(86_400));
        let stale: Vec<String> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.status == SessionStatus::Active && s.idle_for() > max_idle)
            .map(|s| s.id.to_string())
            .collect();

        let mut archived = 0;
        for id in stale {
            match self.archive(&id).await {
                Ok(_) => archived += 1,
                Err(e) => tracing::warn!(session_id = %id, error = %e, "Failed to archive session"),
            }
        }
        Ok(archived)
    }

    /// Delete archived sessions untouched for `older_than_days`, record and
    /// files. Returns how many were deleted.
    pub async fn cleanup_archived_sessions(&self, older_than_days: u64) -> Result<usize> {
        let max_idle = Duration::from_secs(older_than_days.saturating_mul(86_400));
        let stale: Vec<String> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.status == SessionStatus::Archived && s.idle_for() > max_idle)
            .map(|s| s.id.to_string())
            .collect();

        let mut removed = 0;
        for id in stale {
            match self.remove_session(&id).await {
                Ok(_) => removed += 1,
                Err(e) => tracing::warn!(session_id = %id, error = %e, "Failed to delete session"),
            }
        }
        Ok(removed)
    }

    /// Ids of sessions untouched for longer than `max_idle`, any status.
    pub async fn inactive_sessions(&self, max_idle: Duration) -> Vec<String> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.idle_for() > max_idle)
            .map(|s| s.id.to_string())
            .collect()
    }

    pub async fn known_ids(&self) -> HashSet<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Forget a session and delete its storage. Returns the bytes freed.
    pub async fn remove_session(&self, id: &str) -> Result<u64> {
        let session = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| PipelineError::SessionNotFound(id.to_string()))?;
        self.cache.invalidate_session(id);
        let freed = storage::remove_path(&session.storage_dir).await?;
        tracing::info!(session_id = id, bytes_freed = freed, "Session removed");
        Ok(freed)
    }

    #[cfg(test)]
    pub(crate) async fn backdate(&self, id: &str, age: Duration) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(id)
            && let Ok(age) = chrono::Duration::from_std(age)
        {
            session.last_modified = Utc::now() - age;
        }
    }
}

#[cfg(test)]
mod tests {
    use playforge_core::ValidationCode;
    use playforge_core::test_helpers::{complete_document, minimal_document};
    use serde_json::json;

    use super::*;
    use crate::cache::CacheCategory;
    use crate::config::CacheConfig;

    async fn manager(root: &Path) -> SessionManager {
        let cache = Arc::new(CacheLayer::new(&CacheConfig::default()));
        SessionManager::open(root, cache).await.unwrap()
    }

    #[tokio::test]
    async fn minimal_document_creates_version_one() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        let session = mgr.create_session(None, minimal_document()).await.unwrap();
        assert_eq!(session.version, 1);
        assert_eq!(session.status, SessionStatus::Active);

        let document = session.document.as_ref().unwrap();
        assert_eq!(document.properties.name, "T");
        assert!(playforge_core::schema::is_uuid_v4(&document.properties.project_uuid));
        assert!(session.document_path().exists());
        assert!(session.storage_dir.join(MANIFEST_FILE).exists());
    }

    #[tokio::test]
    async fn versions_bump_only_on_accepted_updates() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        let session = mgr.create_session(None, minimal_document()).await.unwrap();
        let id = session.id.to_string();

        let updated = mgr.update_document(&id, complete_document("Second")).await.unwrap();
        assert_eq!(updated.version, 2);

        let err = mgr
            .update_document(&id, json!({ "properties": {}, "resources": [], "objects": [], "layouts": [] }))
            .await
            .unwrap_err();
        let PipelineError::Validation(doc_err) = &err else {
            panic!("expected validation error, got {err:?}");
        };
        assert!(
            doc_err
                .violations()
                .iter()
                .any(|v| v.code == ValidationCode::NoLayouts)
        );

        let current = mgr.get_session(&id).await.unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(current.document.unwrap().properties.name, "Second");
    }

    #[tokio::test]
    async fn identical_documents_reuse_the_sanitised_tree() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(CacheLayer::new(&CacheConfig::default()));
        let mgr = SessionManager::open(dir.path(), Arc::clone(&cache)).await.unwrap();
        let session = mgr.create_session(None, minimal_document()).await.unwrap();
        let updated = mgr
            .update_document(session.id.as_str(), minimal_document())
            .await
            .unwrap();

        let structures = cache.statistics().category(CacheCategory::Structure);
        assert_eq!((structures.misses, structures.hits), (1, 1));
        let validations = cache.statistics().category(CacheCategory::Validation);
        assert_eq!((validations.misses, validations.hits), (1, 0));

        // The generated project id is not regenerated.
        let uuid = |s: &GameSession| s.document.as_ref().unwrap().properties.project_uuid.clone();
        assert_eq!(uuid(&updated), uuid(&session));
    }

    #[tokio::test]
    async fn failed_metadata_write_restores_the_previous_document() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        let session = mgr.create_session(None, complete_document("First")).await.unwrap();
        let id = session.id.to_string();
        let manifest_before = std::fs::read(session.storage_dir.join(MANIFEST_FILE)).unwrap();

        // A directory in place of the metadata file makes the rename fail.
        let metadata = session.storage_dir.join(METADATA_FILE);
        std::fs::remove_file(&metadata).unwrap();
        std::fs::create_dir_all(metadata.join("blocker")).unwrap();

        assert!(mgr.update_document(&id, complete_document("Second")).await.is_err());

        let stored: GameDocument = storage::read_json(&session.document_path()).await.unwrap();
        assert_eq!(stored.properties.name, "First");
        assert_eq!(
            std::fs::read(session.storage_dir.join(MANIFEST_FILE)).unwrap(),
            manifest_before
        );
        let current = mgr.get_session(&id).await.unwrap();
        assert_eq!(current.version, 1);
        assert_eq!(current.document.unwrap().properties.name, "First");
    }

    #[tokio::test]
    async fn rejected_documents_hit_the_validation_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(CacheLayer::new(&CacheConfig::default()));
        let mgr = SessionManager::open(dir.path(), Arc::clone(&cache)).await.unwrap();
        let session = mgr.create_session(None, minimal_document()).await.unwrap();
        let broken = json!({ "properties": {}, "objects": [], "layouts": [] });
        for _ in 0..2 {
            assert!(mgr.update_document(session.id.as_str(), broken.clone()).await.is_err());
        }

        let validations = cache.statistics().category(CacheCategory::Validation);
        assert_eq!((validations.misses, validations.hits), (2, 1));
        assert_eq!(cache.statistics().category(CacheCategory::Structure).hits, 0);
    }

    #[tokio::test]
    async fn state_machine_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        let id = mgr
            .create_session(None, minimal_document())
            .await
            .unwrap()
            .id
            .to_string();

        mgr.archive(&id).await.unwrap();
        // Archived sessions cannot be edited or errored.
        assert!(matches!(
            mgr.update_document(&id, minimal_document()).await,
            Err(PipelineError::InvalidTransition { from: SessionStatus::Archived, .. })
        ));
        assert!(mgr.archive(&id).await.is_err());
        mgr.restore(&id).await.unwrap();

        let record = crate::recovery::ErrorRecoveryEngine::new(Default::default())
            .record(&id, &PipelineError::Cancelled(id.clone()));
        let errored = mgr.mark_error(&id, record).await.unwrap();
        assert_eq!(errored.status, SessionStatus::Error);
        assert!(errored.last_error.is_some());
        // Error is terminal for ordinary transitions.
        assert!(mgr.restore(&id).await.is_err());
        assert!(mgr.archive(&id).await.is_err());

        let reset = mgr.reset_error(&id).await.unwrap();
        assert_eq!(reset.status, SessionStatus::Active);
        assert!(reset.last_error.is_none());
        assert!(mgr.reset_error(&id).await.is_err());
    }

    #[tokio::test]
    async fn sessions_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let owner = OwnerRef {
            workspace_id: "w1".into(),
            user_id: "u1".into(),
        };
        let id = {
            let mgr = manager(dir.path()).await;
            let session = mgr
                .create_session(Some(owner.clone()), complete_document("Kept"))
                .await
                .unwrap();
            mgr.archive(session.id.as_str()).await.unwrap();
            session.id
        };

        let mgr = manager(dir.path()).await;
        let session = mgr.get_session(id.as_str()).await.unwrap();
        assert_eq!(session.status, SessionStatus::Archived);
        assert_eq!(session.owner.as_ref(), Some(&owner));
        assert_eq!(session.document.unwrap().properties.name, "Kept");
        assert_eq!(session.manifest.len(), 1);
        // Archived sessions are not returned as the owner's active one.
        assert!(mgr.find_active_for_owner(&owner).await.is_none());
    }

    #[tokio::test]
    async fn get_or_create_rejects_unsafe_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        let too_long = "x".repeat(65);
        for id in ["../escape", "", "a/b", too_long.as_str()] {
            assert!(matches!(
                mgr.get_or_create_session(id, None).await,
                Err(PipelineError::InvalidSessionId(_))
            ));
        }
        let first = mgr.get_or_create_session("game-1", None).await.unwrap();
        let again = mgr.get_or_create_session("game-1", None).await.unwrap();
        assert_eq!(first.created_at, again.created_at);
        assert_eq!(mgr.statistics().await.total, 1);
    }

    #[tokio::test]
    async fn inactive_sessions_are_archived_then_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path()).await;
        let old = mgr.create_session(None, minimal_document()).await.unwrap();
        let fresh = mgr.create_session(None, minimal_document()).await.unwrap();
        mgr.backdate(old.id.as_str(), Duration::from_secs(10 * 86_400))
            .await;

        assert_eq!(mgr.archive_inactive_sessions(7).await.unwrap(), 1);
        let stats = mgr.statistics().await;
        assert_eq!((stats.active, stats.archived), (1, 1));

        // Archiving refreshed the timestamp.
        assert_eq!(mgr.cleanup_archived_sessions(7).await.unwrap(), 0);
        mgr.backdate(old.id.as_str(), Duration::from_secs(10 * 86_400))
            .await;
        assert_eq!(mgr.cleanup_archived_sessions(7).await.unwrap(), 1);
        assert!(!old.storage_dir.exists());
        assert!(mgr.get_session(fresh.id.as_str()).await.is_some());
    }

    struct EchoSynth;

    impl Synthesizer for EchoSynth {
        async fn synthesize(
            &self,
            request: &str,
            template: Option<&Value>,
        ) -> std::result::Result<Value, String> {
            let mut doc = template.cloned().ok_or("no template")?;
            doc["properties"]["name"] = json!(request);
            Ok(doc)
        }
    }

    struct Templates;

    impl TemplateProvider for Templates {
        fn load_template(&self, name: &str) -> Option<Value> {
            (name == "basic").then(minimal_document)
        }
    }

    #[tokio::test]
    async fn synthesis_goes_through_validation() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(CacheLayer::new(&CacheConfig::default()));
        let mgr = SessionManager::open(dir.path(), Arc::clone(&cache)).await.unwrap();
        let id = mgr
            .create_session(None, minimal_document())
            .await
            .unwrap()
            .id
            .to_string();

        let session = mgr
            .apply_synthesis(&id, "<b>Space</b> Race", Some("basic"), &EchoSynth, &Templates)
            .await
            .unwrap();
        assert_eq!(session.version, 2);
        assert_eq!(session.document.unwrap().properties.name, "Space Race");
        assert!(cache.get_cached_template("basic").is_some());

        let err = mgr
            .apply_synthesis(&id, "x", Some("missing"), &EchoSynth, &Templates)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Synthesis(_)));
        assert_eq!(mgr.get_session(&id).await.unwrap().version, 2);
    }
}
