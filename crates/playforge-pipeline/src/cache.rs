//! In-process TTL cache for templates, document structures, validation
//! results, asset manifests and build artifacts.
//!
//! Constructed once and shared by reference. When disabled every lookup
//! misses and every store is dropped.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use playforge_core::{AssetManifest, ValidationError};

use crate::config::CacheConfig;
use crate::runtime::BuildKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCategory {
    Template,
    Structure,
    Validation,
    AssetManifest,
    Artifact,
}

impl CacheCategory {
    pub const ALL: [CacheCategory; 5] = [
        Self::Template,
        Self::Structure,
        Self::Validation,
        Self::AssetManifest,
        Self::Artifact,
    ];
}

/// A successful build remembered by session, kind and document hash.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedArtifact {
    pub output_dir: PathBuf,
    pub entry_point: PathBuf,
    pub zip_path: Option<PathBuf>,
    pub file_size: u64,
    pub build_time: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategoryStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatistics {
    pub enabled: bool,
    pub categories: Vec<(CacheCategory, CategoryStats)>,
}

impl CacheStatistics {
    pub fn category(&self, category: CacheCategory) -> CategoryStats {
        self.categories
            .iter()
            .find(|(c, _)| *c == category)
            .map(|(_, s)| *s)
            .unwrap_or_default()
    }

    pub fn hit_rate(&self) -> f64 {
        let (hits, total) = self
            .categories
            .iter()
            .fold((0, 0), |(h, t), (_, s)| (h + s.hits, t + s.hits + s.misses));
        if total == 0 { 0.0 } else { hits as f64 / total as f64 }
    }
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// One category: a map with per-entry expiry and hit/miss counters.
struct TtlMap<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, Entry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: Eq + Hash, V: Clone> TtlMap<K, V> {
    fn new(ttl_secs: u64) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_secs),
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let found = match entries.get(key).map(|e| e.expires_at > now) {
            Some(true) => entries.get(key).map(|e| e.value.clone()),
            Some(false) => {
                entries.remove(key);
                None
            },
            None => None,
        };
        drop(entries);
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    fn insert(&self, key: K, value: V) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.lock().insert(key, entry);
    }

    fn retain(&self, mut keep: impl FnMut(&K) -> bool) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|k, _| keep(k));
        before - entries.len()
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let n = entries.len();
        entries.clear();
        n
    }

    fn stats(&self) -> CategoryStats {
        CategoryStats {
            entries: self.entries.lock().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

type ArtifactKey = (String, BuildKind, String);

pub struct CacheLayer {
    enabled: bool,
    templates: TtlMap<String, Arc<Value>>,
    structures: TtlMap<String, Arc<Value>>,
    validations: TtlMap<String, Arc<Vec<ValidationError>>>,
    manifests: TtlMap<String, Arc<AssetManifest>>,
    artifacts: TtlMap<ArtifactKey, CachedArtifact>,
}

impl CacheLayer {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            templates: TtlMap::new(config.template_ttl_secs),
            structures: TtlMap::new(config.structure_ttl_secs),
            validations: TtlMap::new(config.validation_ttl_secs),
            manifests: TtlMap::new(config.assets_ttl_secs),
            artifacts: TtlMap::new(config.artifact_ttl_secs),
        }
    }

    pub fn disabled() -> Self {
        Self::new(&CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn cache_template(&self, name: &str, template: Value) {
        if self.enabled {
            self.templates.insert(name.to_string(), Arc::new(template));
        }
    }

    pub fn get_cached_template(&self, name: &str) -> Option<Arc<Value>> {
        if !self.enabled {
            return None;
        }
        self.templates.get(name)
    }

    /// Cache a document structure by its content hash.
    pub fn cache_game_structure(&self, hash: &str, structure: Value) {
        if self.enabled {
            self.structures.insert(hash.to_string(), Arc::new(structure));
        }
    }

    pub fn get_cached_game_structure(&self, hash: &str) -> Option<Arc<Value>> {
        if !self.enabled {
            return None;
        }
        self.structures.get(hash)
    }

    /// Cache the full [`validate`](playforge_core::validator::validate)
    /// report for the document with content hash `hash`.
    pub fn cache_validation_result(&self, hash: &str, report: Vec<ValidationError>) {
        if self.enabled {
            self.validations.insert(hash.to_string(), Arc::new(report));
        }
    }

    pub fn get_cached_validation_result(&self, hash: &str) -> Option<Arc<Vec<ValidationError>>> {
        if !self.enabled {
            return None;
        }
        self.validations.get(hash)
    }

    pub fn cache_asset_manifest(&self, session_id: &str, manifest: AssetManifest) {
        if self.enabled {
            self.manifests
                .insert(session_id.to_string(), Arc::new(manifest));
        }
    }

    pub fn get_cached_asset_manifest(&self, session_id: &str) -> Option<Arc<AssetManifest>> {
        if !self.enabled {
            return None;
        }
        self.manifests.get(session_id)
    }

    pub fn cache_artifact(
        &self,
        session_id: &str,
        kind: BuildKind,
        document_hash: &str,
        artifact: CachedArtifact,
    ) {
        if self.enabled {
            self.artifacts.insert(
                (session_id.to_string(), kind, document_hash.to_string()),
                artifact,
            );
        }
    }

    pub fn get_cached_artifact(
        &self,
        session_id: &str,
        kind: BuildKind,
        document_hash: &str,
    ) -> Option<CachedArtifact> {
        if !self.enabled {
            return None;
        }
        self.artifacts.get(&(
            session_id.to_string(),
            kind,
            document_hash.to_string(),
        ))
    }

    /// Drop everything keyed by `session_id`. Called whenever its document
    /// version changes.
    pub fn invalidate_session(&self, session_id: &str) -> usize {
        let manifests = self.manifests.retain(|id| id != session_id);
        let artifacts = self.artifacts.retain(|(id, _, _)| id != session_id);
        manifests + artifacts
    }

    pub fn purge_expired(&self) -> usize {
        self.templates.purge_expired()
            + self.structures.purge_expired()
            + self.validations.purge_expired()
            + self.manifests.purge_expired()
            + self.artifacts.purge_expired()
    }

    pub fn clear(&self) -> usize {
        let removed = self.templates.clear()
            + self.structures.clear()
            + self.validations.clear()
            + self.manifests.clear()
            + self.artifacts.clear();
        tracing::info!(removed, "Cache cleared");
        removed
    }

    pub fn statistics(&self) -> CacheStatistics {
        let categories = CacheCategory::ALL
            .into_iter()
            .map(|category| {
                let stats = match category {
                    CacheCategory::Template => self.templates.stats(),
                    CacheCategory::Structure => self.structures.stats(),
                    CacheCategory::Validation => self.validations.stats(),
                    CacheCategory::AssetManifest => self.manifests.stats(),
                    CacheCategory::Artifact => self.artifacts.stats(),
                };
                (category, stats)
            })
            .collect();
        CacheStatistics {
            enabled: self.enabled,
            categories,
        }
    }
}
