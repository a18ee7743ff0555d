use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::runtime::{BuildPolicy, Compression};

/// Top-level pipeline configuration, loaded from `playforge.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub toolchain: ToolchainConfig,
    pub sandbox: SandboxConfig,
    pub limits: LimitsConfig,
    pub cache: CacheConfig,
    pub recovery: RecoveryConfig,
    pub cleanup: CleanupConfig,
    pub export: ExportDefaults,
}

/// External game-engine command line.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub cli_path: PathBuf,
    /// Subcommands the sandbox will run. Anything else is refused.
    pub allowed_commands: Vec<String>,
    pub command_timeout_secs: u64,
    pub max_argument_length: usize,
    /// Build target passed as `--target`.
    pub target: String,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            cli_path: PathBuf::from("gdexport"),
            allowed_commands: vec!["export".into(), "build".into(), "preview".into()],
            command_timeout_secs: 120,
            max_argument_length: 1000,
            target: "html5".to_string(),
        }
    }
}

impl ToolchainConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Every session directory, workspace and archive lives under this root.
    pub root: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("storage/playforge"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Toolchain processes allowed to run at once across all sessions.
    pub max_concurrent_builds: usize,
    pub max_export_size_bytes: u64,
    /// What a second build request for a busy session does.
    pub concurrent_build_policy: BuildPolicy,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_builds: 3,
            max_export_size_bytes: 100 * 1024 * 1024,
            concurrent_build_policy: BuildPolicy::Queue,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub template_ttl_secs: u64,
    pub structure_ttl_secs: u64,
    pub validation_ttl_secs: u64,
    pub assets_ttl_secs: u64,
    pub artifact_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            template_ttl_secs: 3600,
            structure_ttl_secs: 1800,
            validation_ttl_secs: 600,
            assets_ttl_secs: 7200,
            artifact_ttl_secs: 7200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    /// Same-kind failures for one session before a fallback is suggested.
    pub fallback_threshold: u32,
    pub error_window_hours: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 2000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            fallback_threshold: 2,
            error_window_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub interval_secs: u64,
    pub temp_file_max_age_hours: u64,
    pub inactive_session_hours: u64,
    /// Unknown directories younger than this are left alone; a build may
    /// be creating them.
    pub orphan_grace_secs: u64,
    pub export_max_age_hours: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            temp_file_max_age_hours: 24,
            inactive_session_hours: 72,
            orphan_grace_secs: 3600,
            export_max_age_hours: 24,
        }
    }
}

/// Export options used when a caller does not specify them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExportDefaults {
    pub minify: bool,
    pub mobile_optimized: bool,
    pub compression: Compression,
}

impl Default for ExportDefaults {
    fn default() -> Self {
        Self {
            minify: true,
            mobile_optimized: false,
            compression: Compression::Standard,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be > 0")]
    NotPositive { field: &'static str },
    #[error("{0}")]
    Invalid(String),
}

impl PipelineConfig {
    /// Reject values the pipeline cannot run with, logging softer issues.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("toolchain.command_timeout_secs", self.toolchain.command_timeout_secs),
            (
                "toolchain.max_argument_length",
                self.toolchain.max_argument_length as u64,
            ),
            (
                "limits.max_concurrent_builds",
                self.limits.max_concurrent_builds as u64,
            ),
            ("limits.max_export_size_bytes", self.limits.max_export_size_bytes),
            ("recovery.max_attempts", u64::from(self.recovery.max_attempts)),
            ("cleanup.interval_secs", self.cleanup.interval_secs),
            (
                "cleanup.temp_file_max_age_hours",
                self.cleanup.temp_file_max_age_hours,
            ),
            (
                "cleanup.inactive_session_hours",
                self.cleanup.inactive_session_hours,
            ),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::NotPositive { field });
            }
        }

        if self.toolchain.allowed_commands.is_empty() {
            return Err(ConfigError::Invalid(
                "toolchain.allowed_commands must not be empty".to_string(),
            ));
        }
        if let Some(bad) = self
            .toolchain
            .allowed_commands
            .iter()
            .find(|c| c.is_empty() || !c.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '-'))
        {
            return Err(ConfigError::Invalid(format!(
                "toolchain.allowed_commands entry `{bad}` is not a plain subcommand name"
            )));
        }
        if self.toolchain.cli_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "toolchain.cli_path must not be empty".to_string(),
            ));
        }
        if self.sandbox.root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "sandbox.root must not be empty".to_string(),
            ));
        }
        if !(self.recovery.backoff_multiplier >= 1.0) {
            return Err(ConfigError::Invalid(
                "recovery.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }

        if self.recovery.retry_delay_ms > self.recovery.max_delay_ms {
            tracing::warn!(
                retry_delay_ms = self.recovery.retry_delay_ms,
                max_delay_ms = self.recovery.max_delay_ms,
                "recovery.retry_delay_ms exceeds max_delay_ms, every retry waits the maximum"
            );
        }
        if !self.cache.enabled {
            tracing::warn!("Cache disabled, every validation and build runs in full");
        }
        if self.toolchain.command_timeout_secs > 600 {
            tracing::warn!(
                secs = self.toolchain.command_timeout_secs,
                "Toolchain timeout above 10 minutes holds build slots for a long time"
            );
        }
        Ok(())
    }

    /// Load config from `playforge.toml` if it exists, then apply env var overrides.
    pub fn load() -> Self {
        Self::load_from("playforge.toml")
    }

    pub fn load_from(path: impl AsRef<std::path::Path>) -> Self {
        let path = path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<PipelineConfig>(&content) {
                Ok(cfg) => {
                    tracing::info!(path = %path.display(), "Loaded configuration");
                    cfg
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Failed to parse config: {e}, using defaults");
                    PipelineConfig::default()
                },
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "No config file found, using defaults");
                PipelineConfig::default()
            },
        };
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(cli) = std::env::var("PLAYFORGE_CLI_PATH")
            && !cli.is_empty()
        {
            self.toolchain.cli_path = PathBuf::from(cli);
        }
        if let Ok(root) = std::env::var("PLAYFORGE_SANDBOX_ROOT")
            && !root.is_empty()
        {
            self.sandbox.root = PathBuf::from(root);
        }
        if let Ok(val) = std::env::var("PLAYFORGE_MAX_CONCURRENT_BUILDS")
            && let Ok(n) = val.parse::<usize>()
        {
            self.limits.max_concurrent_builds = n;
        }
        if let Ok(val) = std::env::var("PLAYFORGE_COMMAND_TIMEOUT_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            self.toolchain.command_timeout_secs = n;
        }
        if let Ok(val) = std::env::var("PLAYFORGE_CACHE_ENABLED")
            && let Ok(enabled) = val.parse::<bool>()
        {
            self.cache.enabled = enabled;
        }
        if let Ok(val) = std::env::var("PLAYFORGE_MAX_RETRIES")
            && let Ok(n) = val.parse::<u32>()
        {
            self.recovery.max_attempts = n;
        }
        if let Ok(val) = std::env::var("PLAYFORGE_MAX_EXPORT_SIZE")
            && let Ok(n) = val.parse::<u64>()
        {
            self.limits.max_export_size_bytes = n;
        }
    }
}
