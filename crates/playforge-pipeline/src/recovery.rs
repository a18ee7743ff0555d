//! Bounded retry around fallible build steps, plus the bookkeeping that
//! turns failures into caller-facing [`ErrorRecord`]s.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use playforge_core::{ValidationCode, ValidationError};

use crate::config::RecoveryConfig;
use crate::error::{ErrorKind, PipelineError, Result};

/// Error rate above which [`RecoveryHealth::status`] reports degraded.
const DEGRADED_ERROR_RATE: f64 = 0.1;

/// Structured, serialisable description of one handled failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub session_id: String,
    pub kind: ErrorKind,
    pub code: String,
    pub user_message: String,
    pub suggested_action: String,
    pub retryable: bool,
    pub recoverable: bool,
    /// Failures of this kind for this session within the tracking window,
    /// this one included.
    pub occurrences: u32,
    pub suggest_fallback: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<ValidationError>,
    pub debug: DebugInfo,
}

/// Internal details. Never shown to end users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    pub detail: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryHealth {
    pub status: HealthStatus,
    pub operations: u64,
    pub failed_operations: u64,
    pub retries: u64,
    pub error_rate: f64,
    /// (session, kind) pairs with failures inside the tracking window.
    pub tracked_errors: usize,
}

#[derive(Debug, Clone, Copy)]
struct Tally {
    count: u32,
    last_seen: Instant,
}

pub struct ErrorRecoveryEngine {
    config: RecoveryConfig,
    window: Duration,
    tallies: Mutex<HashMap<(String, ErrorKind), Tally>>,
    validation_patterns: Mutex<HashMap<ValidationCode, u64>>,
    operations: AtomicU64,
    failed_operations: AtomicU64,
    retries: AtomicU64,
}

impl ErrorRecoveryEngine {
    pub fn new(config: RecoveryConfig) -> Self {
        let window = Duration::from_secs(config.error_window_hours.saturating_mul(3600));
        Self {
            config,
            window,
            tallies: Mutex::new(HashMap::new()),
            validation_patterns: Mutex::new(HashMap::new()),
            operations: AtomicU64::new(0),
            failed_operations: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// `max_attempts` is reached. The closure receives the 1-based attempt.
    ///
    /// The error returned is the one from the last attempt. Cancelling
    /// `cancel` during a backoff stops retrying immediately.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        kind: ErrorKind,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.operations.fetch_add(1, Ordering::Relaxed);
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(operation = %kind, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                },
                Err(e) => e,
            };

            if !err.is_retryable() {
                tracing::debug!(operation = %kind, attempt, error = %err, "Not retryable");
                self.failed_operations.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
            if attempt >= max_attempts {
                tracing::warn!(operation = %kind, attempts = attempt, error = %err, "Retries exhausted");
                self.failed_operations.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }

            let delay = self.delay_for(attempt);
            tracing::warn!(
                operation = %kind,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retry scheduled"
            );
            self.retries.fetch_add(1, Ordering::Relaxed);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {},
                _ = cancel.cancelled() => {
                    self.failed_operations.fetch_add(1, Ordering::Relaxed);
                    return Err(err);
                },
            }
            attempt += 1;
        }
    }

    /// Backoff before attempt `attempt + 1`, with up to 10% jitter, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let base = self.config.retry_delay_ms as f64 * self.config.backoff_multiplier.powi(exponent);
        let jitter = if base > 0.0 {
            rand::rng().random_range(0.0..0.1) * base
        } else {
            0.0
        };
        let ms = (base + jitter).min(self.config.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Count `error` against `session_id` and describe it for the caller.
    pub fn record(&self, session_id: &str, error: &PipelineError) -> ErrorRecord {
        let kind = error.kind();
        let occurrences = {
            let now = Instant::now();
            let mut tallies = self.tallies.lock();
            let tally = tallies
                .entry((session_id.to_string(), kind))
                .or_insert(Tally {
                    count: 0,
                    last_seen: now,
                });
            if now.duration_since(tally.last_seen) > self.window {
                tally.count = 0;
            }
            tally.count += 1;
            tally.last_seen = now;
            tally.count
        };

        let validation_errors = match error {
            PipelineError::Validation(e) => e.violations().to_vec(),
            _ => Vec::new(),
        };
        if !validation_errors.is_empty() {
            let mut patterns = self.validation_patterns.lock();
            for violation in &validation_errors {
                *patterns.entry(violation.code).or_insert(0) += 1;
            }
        }

        let suggest_fallback = occurrences >= self.config.fallback_threshold.max(1);
        let fallback_suggestions = if suggest_fallback {
            fallback_suggestions(kind)
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            Vec::new()
        };

        let failure = error.exec_error().and_then(|e| e.failure());
        tracing::info!(
            session_id,
            kind = %kind,
            code = error.code(),
            occurrences,
            suggest_fallback,
            "Error recorded"
        );

        ErrorRecord {
            session_id: session_id.to_string(),
            kind,
            code: error.code().to_string(),
            user_message: error.user_message(),
            suggested_action: error.suggested_action().to_string(),
            retryable: error.is_retryable(),
            recoverable: error.is_recoverable(),
            occurrences,
            suggest_fallback,
            fallback_suggestions,
            validation_errors,
            debug: DebugInfo {
                command: failure.map(|f| f.command.clone()),
                exit_code: failure.and_then(|f| f.exit_code),
                stderr: failure.map(|f| f.stderr.clone()),
                detail: error.to_string(),
                occurred_at: Utc::now(),
            },
        }
    }

    pub fn error_count(&self, session_id: &str, kind: ErrorKind) -> u32 {
        let tallies = self.tallies.lock();
        match tallies.get(&(session_id.to_string(), kind)) {
            Some(tally) if tally.last_seen.elapsed() <= self.window => tally.count,
            _ => 0,
        }
    }

    pub fn should_suggest_fallback(&self, session_id: &str, kind: ErrorKind) -> bool {
        self.error_count(session_id, kind) >= self.config.fallback_threshold.max(1)
    }

    /// Global tally of validation failures by rule, most frequent first.
    pub fn validation_pattern_counts(&self) -> Vec<(ValidationCode, u64)> {
        let mut counts: Vec<_> = self
            .validation_patterns
            .lock()
            .iter()
            .map(|(code, n)| (*code, *n))
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.as_str().cmp(b.0.as_str())));
        counts
    }

    /// Forget every failure tracked for `session_id`.
    pub fn reset_session(&self, session_id: &str) {
        self.tallies.lock().retain(|(id, _), _| id != session_id);
    }

    /// Drop tallies that fell out of the tracking window. Returns how many.
    pub fn prune_expired(&self) -> usize {
        let mut tallies = self.tallies.lock();
        let before = tallies.len();
        tallies.retain(|_, tally| tally.last_seen.elapsed() <= self.window);
        before - tallies.len()
    }

    pub fn health(&self) -> RecoveryHealth {
        let operations = self.operations.load(Ordering::Relaxed);
        let failed_operations = self.failed_operations.load(Ordering::Relaxed);
        let error_rate = if operations == 0 {
            0.0
        } else {
            failed_operations as f64 / operations as f64
        };
        RecoveryHealth {
            status: if error_rate > DEGRADED_ERROR_RATE {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            operations,
            failed_operations,
            retries: self.retries.load(Ordering::Relaxed),
            error_rate,
            tracked_errors: self.tallies.lock().len(),
        }
    }
}

/// Simpler paths to offer once a session keeps failing the same way.
pub fn fallback_suggestions(kind: ErrorKind) -> &'static [&'static str] {
    match kind {
        ErrorKind::Cli => &[
            "Try creating a simpler game with fewer objects",
            "Use a basic game template instead of complex generation",
        ],
        ErrorKind::Validation => &[
            "Start with a basic game template",
            "Try describing your game in simpler terms",
        ],
        ErrorKind::Preview => &[
            "Try exporting the game directly instead of preview",
            "Simplify the game by removing complex elements",
        ],
        ErrorKind::Export => &[
            "Try exporting without mobile optimization",
            "Use standard compression instead of maximum",
        ],
        ErrorKind::Sandbox | ErrorKind::Session | ErrorKind::Storage => &[],
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::error::{CommandFailure, ExecError, FailureSignal};

    fn engine() -> ErrorRecoveryEngine {
        ErrorRecoveryEngine::new(RecoveryConfig {
            retry_delay_ms: 1,
            max_delay_ms: 5,
            ..RecoveryConfig::default()
        })
    }

    fn export_failure(signal: FailureSignal) -> PipelineError {
        PipelineError::ExportBuild {
            detail: "toolchain failed".into(),
            cause: Some(ExecError::CommandFailed(Box::new(CommandFailure {
                command: "export game.json".into(),
                exit_code: Some(1),
                stdout: String::new(),
                stderr: "EBUSY: engine lock held".into(),
                signal,
            }))),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_to_the_limit() {
        let engine = engine();
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let result: Result<()> = engine
            .execute_with_retry(ErrorKind::Export, &CancellationToken::new(), |attempt| {
                seen.fetch_add(1, Ordering::SeqCst);
                assert_eq!(attempt, seen.load(Ordering::SeqCst));
                async { Err(export_failure(FailureSignal::ResourceBusy)) }
            })
            .await;
        assert!(matches!(result, Err(PipelineError::ExportBuild { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(engine.health().retries, 2);
    }

    #[tokio::test]
    async fn permanent_failures_fail_fast() {
        let engine = engine();
        let calls = AtomicU32::new(0);
        let result: Result<()> = engine
            .execute_with_retry(ErrorKind::Export, &CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(export_failure(FailureSignal::Other)) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sandbox_violations_are_never_retried() {
        let engine = engine();
        let calls = AtomicU32::new(0);
        let result: Result<()> = engine
            .execute_with_retry(ErrorKind::Cli, &CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ExecError::CommandNotAllowed("rm".into()).into()) }
            })
            .await;
        assert!(matches!(result, Err(PipelineError::SandboxViolation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_on_a_later_attempt() {
        let engine = engine();
        let result = engine
            .execute_with_retry(ErrorKind::Preview, &CancellationToken::new(), |attempt| async move {
                if attempt < 2 {
                    Err(export_failure(FailureSignal::Timeout))
                } else {
                    Ok(attempt)
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 2);
        let health = engine.health();
        assert_eq!(health.failed_operations, 0);
        assert_eq!(health.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn cancellation_stops_the_backoff() {
        let engine = ErrorRecoveryEngine::new(RecoveryConfig {
            retry_delay_ms: 60_000,
            max_delay_ms: 60_000,
            ..RecoveryConfig::default()
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let result: Result<()> = engine
            .execute_with_retry(ErrorKind::Export, &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(export_failure(FailureSignal::ResourceBusy)) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let engine = ErrorRecoveryEngine::new(RecoveryConfig {
            retry_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 350,
            ..RecoveryConfig::default()
        });
        let first = engine.delay_for(1).as_millis();
        let second = engine.delay_for(2).as_millis();
        assert!((100..=110).contains(&first), "{first}");
        assert!((200..=220).contains(&second), "{second}");
        assert_eq!(engine.delay_for(3).as_millis(), 350);
        assert_eq!(engine.delay_for(40).as_millis(), 350);
    }

    #[test]
    fn fallback_is_suggested_after_threshold() {
        let engine = engine();
        let err = export_failure(FailureSignal::Other);

        let first = engine.record("s1", &err);
        assert_eq!(first.occurrences, 1);
        assert!(!first.suggest_fallback);
        assert!(first.fallback_suggestions.is_empty());

        let second = engine.record("s1", &err);
        assert!(second.suggest_fallback);
        assert_eq!(
            second.fallback_suggestions,
            fallback_suggestions(ErrorKind::Export)
        );
        assert!(engine.should_suggest_fallback("s1", ErrorKind::Export));
        // Tracked per session and per kind.
        assert!(!engine.should_suggest_fallback("s2", ErrorKind::Export));
        assert!(!engine.should_suggest_fallback("s1", ErrorKind::Preview));

        engine.reset_session("s1");
        assert_eq!(engine.error_count("s1", ErrorKind::Export), 0);
    }

    #[test]
    fn records_keep_stderr_in_debug_only() {
        let record = engine().record("s1", &export_failure(FailureSignal::Other));
        assert_eq!(record.kind, ErrorKind::Export);
        assert_eq!(record.code, "export_build_failed");
        assert!(!record.user_message.contains("EBUSY"));
        assert_eq!(record.debug.stderr.as_deref(), Some("EBUSY: engine lock held"));
        assert_eq!(record.debug.exit_code, Some(1));
        assert!(!record.retryable);
    }

    #[test]
    fn validation_patterns_are_tallied() {
        let engine = engine();
        let err = playforge_core::validator::validate_and_sanitize(serde_json::json!({
            "properties": { "name": "" },
            "resources": [],
            "objects": [],
            "layouts": []
        }))
        .unwrap_err();
        let record = engine.record("s1", &err.into());
        assert_eq!(record.kind, ErrorKind::Validation);
        assert!(!record.validation_errors.is_empty());
        let counts = engine.validation_pattern_counts();
        assert!(counts.iter().any(|(code, n)| *code == ValidationCode::NoLayouts && *n == 1));
    }

    #[test]
    fn stale_tallies_expire() {
        let engine = ErrorRecoveryEngine::new(RecoveryConfig {
            error_window_hours: 0,
            ..RecoveryConfig::default()
        });
        engine.record("s1", &export_failure(FailureSignal::Other));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(engine.error_count("s1", ErrorKind::Export), 0);
        assert_eq!(engine.prune_expired(), 1);
    }
}
