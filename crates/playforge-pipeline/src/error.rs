use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use playforge_core::DocumentError;

use crate::session::SessionStatus;

/// Why a toolchain invocation failed, decided once at the process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSignal {
    NotFound,
    PermissionDenied,
    Timeout,
    ResourceBusy,
    /// Killed by a signal, typically the OOM killer.
    Terminated,
    Other,
}

impl FailureSignal {
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Timeout | Self::ResourceBusy | Self::Terminated)
    }
}

/// Captured output of a toolchain run that exited unsuccessfully.
#[derive(Debug, Clone)]
pub struct CommandFailure {
    pub command: String,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub signal: FailureSignal,
}

/// Errors raised by the sandboxed executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("command `{0}` is not in the allow-list")]
    CommandNotAllowed(String),
    #[error("`{}` resolves outside the sandbox root", .0.display())]
    DirectoryTraversal(PathBuf),
    #[error("working directory `{}` does not exist", .0.display())]
    WorkingDirectoryMissing(PathBuf),
    #[error("failed to start toolchain: {source}")]
    Spawn {
        signal: FailureSignal,
        #[source]
        source: std::io::Error,
    },
    #[error("toolchain did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("`{}` failed with {}", .0.command, exit_description(.0.exit_code))]
    CommandFailed(Box<CommandFailure>),
    #[error("toolchain run was cancelled")]
    Cancelled,
    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_description(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "a signal".to_string(),
    }
}

impl ExecError {
    pub fn signal(&self) -> FailureSignal {
        match self {
            Self::Spawn { signal, .. } => *signal,
            Self::CommandFailed(failure) => failure.signal,
            Self::TimedOut(_) => FailureSignal::Timeout,
            _ => FailureSignal::Other,
        }
    }

    /// Disallowed commands and path escapes. Never retried.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            Self::CommandNotAllowed(_) | Self::DirectoryTraversal(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TimedOut(_) => true,
            Self::Spawn { signal, .. } => signal.is_transient(),
            Self::CommandFailed(failure) => failure.signal.is_transient(),
            _ => false,
        }
    }

    pub fn failure(&self) -> Option<&CommandFailure> {
        match self {
            Self::CommandFailed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Coarse error category used for frequency tracking and fallbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Cli,
    Validation,
    Preview,
    Export,
    Sandbox,
    Session,
    Storage,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Validation => "validation",
            Self::Preview => "preview",
            Self::Export => "export",
            Self::Sandbox => "sandbox",
            Self::Session => "session",
            Self::Storage => "storage",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every error the pipeline surfaces to its callers.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid game document: {0}")]
    Validation(#[from] DocumentError),
    #[error("toolchain error: {0}")]
    Cli(#[source] ExecError),
    #[error("preview build failed: {detail}")]
    PreviewBuild {
        detail: String,
        #[source]
        cause: Option<ExecError>,
    },
    #[error("export build failed: {detail}")]
    ExportBuild {
        detail: String,
        #[source]
        cause: Option<ExecError>,
    },
    #[error("sandbox violation: {0}")]
    SandboxViolation(#[source] ExecError),
    #[error("session `{0}` not found")]
    SessionNotFound(String),
    #[error("invalid session id `{0}`")]
    InvalidSessionId(String),
    #[error("session `{id}` cannot go from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("a build is already running for session `{0}`")]
    BuildInProgress(String),
    #[error("build for session `{0}` was cancelled")]
    Cancelled(String),
    #[error("no export archive exists for session `{0}`")]
    ExportNotFound(String),
    #[error("document synthesis failed: {0}")]
    Synthesis(String),
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl From<ExecError> for PipelineError {
    fn from(e: ExecError) -> Self {
        if e.is_violation() {
            Self::SandboxViolation(e)
        } else {
            Self::Cli(e)
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Cli(_) => ErrorKind::Cli,
            Self::PreviewBuild { .. } => ErrorKind::Preview,
            Self::ExportBuild { .. } | Self::ExportNotFound(_) | Self::Archive(_) => {
                ErrorKind::Export
            },
            Self::SandboxViolation(_) => ErrorKind::Sandbox,
            Self::SessionNotFound(_)
            | Self::InvalidSessionId(_)
            | Self::InvalidTransition { .. }
            | Self::BuildInProgress(_)
            | Self::Cancelled(_)
            | Self::Synthesis(_) => ErrorKind::Session,
            Self::Storage(_) | Self::Serialization(_) => ErrorKind::Storage,
        }
    }

    /// Short machine code for callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_failed",
            Self::Cli(_) => "cli_failed",
            Self::PreviewBuild { .. } => "preview_build_failed",
            Self::ExportBuild { .. } => "export_build_failed",
            Self::SandboxViolation(_) => "sandbox_violation",
            Self::SessionNotFound(_) => "session_not_found",
            Self::InvalidSessionId(_) => "invalid_session_id",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::BuildInProgress(_) => "build_in_progress",
            Self::Cancelled(_) => "cancelled",
            Self::ExportNotFound(_) => "export_not_found",
            Self::Synthesis(_) => "synthesis_failed",
            Self::Storage(_) | Self::Serialization(_) => "storage_error",
            Self::Archive(_) => "archive_failed",
        }
    }

    /// The underlying toolchain error, if any.
    pub fn exec_error(&self) -> Option<&ExecError> {
        match self {
            Self::Cli(e) | Self::SandboxViolation(e) => Some(e),
            Self::PreviewBuild { cause, .. } | Self::ExportBuild { cause, .. } => cause.as_ref(),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SandboxViolation(_) => false,
            _ => self.exec_error().is_some_and(ExecError::is_retryable),
        }
    }

    /// Whether the caller can get past this without operator intervention.
    pub fn is_recoverable(&self) -> bool {
        if self.is_retryable() {
            return true;
        }
        match self {
            Self::Validation(_)
            | Self::BuildInProgress(_)
            | Self::Cancelled(_)
            | Self::ExportNotFound(_)
            | Self::Synthesis(_) => true,
            Self::SandboxViolation(_) | Self::Storage(_) | Self::Serialization(_) => false,
            _ => !matches!(
                self.exec_error().map(ExecError::signal),
                Some(FailureSignal::NotFound | FailureSignal::PermissionDenied)
            ),
        }
    }

    pub fn user_message(&self) -> String {
        if let Some(signal) = self.exec_error().map(ExecError::signal) {
            match signal {
                FailureSignal::NotFound => {
                    return "The game build tools are not available right now.".to_string();
                },
                FailureSignal::PermissionDenied => {
                    return "The game build tools could not be started.".to_string();
                },
                FailureSignal::Timeout => {
                    return "Building your game took too long. Please try again.".to_string();
                },
                FailureSignal::ResourceBusy => {
                    return "The build system is busy. Please try again in a moment.".to_string();
                },
                FailureSignal::Terminated | FailureSignal::Other => {},
            }
        }
        match self {
            Self::Validation(e) => {
                let count = e.violations().len();
                if count == 0 {
                    "The game data could not be read.".to_string()
                } else {
                    format!("The game data has {count} problem(s) that need fixing.")
                }
            },
            Self::Cli(_) => "The game build tools reported an error.".to_string(),
            Self::PreviewBuild { .. } => "We couldn't build a preview of your game.".to_string(),
            Self::ExportBuild { .. } | Self::Archive(_) => {
                "We couldn't export your game.".to_string()
            },
            Self::SandboxViolation(_) => "That build request is not permitted.".to_string(),
            Self::SessionNotFound(_) | Self::InvalidSessionId(_) => {
                "This game session could not be found.".to_string()
            },
            Self::InvalidTransition { to, .. } => {
                format!("This game session cannot be moved to {to}.")
            },
            Self::BuildInProgress(_) => "A build for this game is already running.".to_string(),
            Self::Cancelled(_) => "The build was cancelled.".to_string(),
            Self::ExportNotFound(_) => "No export is available yet for this game.".to_string(),
            Self::Synthesis(_) => "We couldn't generate your game from that description.".to_string(),
            Self::Storage(_) | Self::Serialization(_) => {
                "Saving your game failed. Please try again.".to_string()
            },
        }
    }

    /// Machine-actionable remediation hint.
    pub fn suggested_action(&self) -> &'static str {
        if self.is_retryable() {
            return "retry_later";
        }
        match self {
            Self::Validation(_) => "fix_document",
            Self::SandboxViolation(_) => "contact_support",
            Self::PreviewBuild { .. } | Self::ExportBuild { .. } | Self::Archive(_) => {
                "simplify_game"
            },
            Self::Cli(_) => "contact_support",
            Self::SessionNotFound(_) | Self::InvalidSessionId(_) => "create_session",
            Self::InvalidTransition { from, .. } => match from {
                SessionStatus::Archived => "restore_session",
                SessionStatus::Error => "reset_session",
                SessionStatus::Active => "none",
            },
            Self::BuildInProgress(_) => "wait_for_build",
            Self::Cancelled(_) => "rebuild",
            Self::ExportNotFound(_) => "export_game",
            Self::Synthesis(_) => "rephrase_request",
            Self::Storage(_) | Self::Serialization(_) => "retry_later",
        }
    }
}
