//! Restricted execution of the external toolchain.
//!
//! The executor only ever runs the configured toolchain binary, with an
//! allow-listed subcommand as its first argument, inside a working directory
//! that canonicalizes to somewhere below the sandbox root. Arguments travel as
//! a discrete argument vector and are stripped of shell metacharacters
//! regardless, since toolchains are frequently thin shell wrappers.
//!
//! Failures are classified into a [`FailureSignal`] here, from exit codes,
//! spawn errors and errno tokens, so nothing upstream inspects error text.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::ToolchainConfig;
use crate::error::{CommandFailure, ExecError, FailureSignal};

/// Characters removed from every argument value.
const SHELL_METACHARACTERS: &[char] = &[';', '|', '&', '`', '$', '(', ')', '<', '>', '\n', '\r', '\0'];

const ISOLATED_DIR: &str = "isolated";

/// Conventional exit statuses some toolchain wrappers use.
const EXIT_TIMEOUT: i32 = 124;
const EXIT_NOT_EXECUTABLE: i32 = 126;
const EXIT_NOT_FOUND: i32 = 127;
/// `EX_TEMPFAIL` from sysexits.h.
const EXIT_TEMPFAIL: i32 = 75;
/// `ETXTBSY`: the binary is still open for writing.
const ETXTBSY: i32 = 26;

/// One element of a toolchain invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandArg {
    /// A bare positional value.
    Value(String),
    /// `--name`, followed by `value` as a separate argument when present.
    Flag { name: String, value: Option<String> },
}

impl CommandArg {
    pub fn value(v: impl Into<String>) -> Self {
        Self::Value(v.into())
    }

    pub fn flag(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Flag {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    pub fn switch(name: impl Into<String>) -> Self {
        Self::Flag {
            name: name.into(),
            value: None,
        }
    }
}

/// Output of a successful toolchain run.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

#[derive(Debug)]
pub struct SandboxedExecutor {
    root: PathBuf,
    cli_path: PathBuf,
    allowed_commands: Vec<String>,
    timeout: Duration,
    max_argument_length: usize,
}

impl SandboxedExecutor {
    /// Create the sandbox root if needed and canonicalize it.
    pub fn new(config: &ToolchainConfig, root: &Path) -> Result<Self, ExecError> {
        std::fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        Ok(Self {
            root,
            cli_path: config.cli_path.clone(),
            allowed_commands: config.allowed_commands.clone(),
            timeout: config.command_timeout(),
            max_argument_length: config.max_argument_length,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cli_path(&self) -> &Path {
        &self.cli_path
    }

    /// Strip shell metacharacters and cap the length of one argument.
    pub fn sanitize_argument(&self, arg: &str) -> String {
        arg.chars()
            .filter(|c| !SHELL_METACHARACTERS.contains(c))
            .take(self.max_argument_length)
            .collect()
    }

    /// The argument vector handed to the toolchain for `command` and `args`.
    pub fn build_argv(&self, command: &str, args: &[CommandArg]) -> Result<Vec<String>, ExecError> {
        if !self.allowed_commands.iter().any(|c| c == command) {
            return Err(ExecError::CommandNotAllowed(command.to_string()));
        }
        let mut argv = Vec::with_capacity(args.len() * 2 + 1);
        argv.push(command.to_string());
        for arg in args {
            match arg {
                CommandArg::Value(v) => argv.push(self.sanitize_argument(v)),
                CommandArg::Flag { name, value } => {
                    let name: String = name
                        .chars()
                        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
                        .collect();
                    let name = name.trim_start_matches('-');
                    if name.is_empty() {
                        continue;
                    }
                    argv.push(format!("--{name}"));
                    if let Some(value) = value {
                        argv.push(self.sanitize_argument(value));
                    }
                },
            }
        }
        Ok(argv)
    }

    /// Canonicalize `dir` and require it to sit below the sandbox root.
    pub fn resolve_working_dir(&self, dir: &Path) -> Result<PathBuf, ExecError> {
        let canonical = match dir.canonicalize() {
            Ok(path) => path,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ExecError::WorkingDirectoryMissing(dir.to_path_buf()));
            },
            Err(e) => return Err(e.into()),
        };
        if !canonical.starts_with(&self.root) {
            return Err(ExecError::DirectoryTraversal(dir.to_path_buf()));
        }
        if !canonical.is_dir() {
            return Err(ExecError::WorkingDirectoryMissing(dir.to_path_buf()));
        }
        Ok(canonical)
    }

    pub async fn execute(
        &self,
        command: &str,
        args: &[CommandArg],
        working_dir: &Path,
    ) -> Result<ExecOutput, ExecError> {
        self.execute_cancellable(command, args, working_dir, &CancellationToken::new())
            .await
    }

    /// Run the toolchain, killing it on timeout or when `cancel` fires.
    pub async fn execute_cancellable(
        &self,
        command: &str,
        args: &[CommandArg],
        working_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, ExecError> {
        let argv = self.build_argv(command, args)?;
        let cwd = self.resolve_working_dir(working_dir)?;

        let mut cmd = tokio::process::Command::new(&self.cli_path);
        cmd.args(&argv)
            .current_dir(&cwd)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in ["PATH", "HOME", "LANG"] {
            if let Some(value) = std::env::var_os(key) {
                cmd.env(key, value);
            }
        }

        let started = Instant::now();
        let child = cmd.spawn().map_err(|source| ExecError::Spawn {
            signal: classify_spawn_error(&source),
            source,
        })?;
        tracing::debug!(command, cwd = %cwd.display(), "Toolchain spawned");

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = tokio::time::sleep(self.timeout) => {
                tracing::warn!(command, timeout = ?self.timeout, "Toolchain timed out, killed");
                return Err(ExecError::TimedOut(self.timeout));
            },
            _ = cancel.cancelled() => {
                tracing::info!(command, "Toolchain run cancelled, killed");
                return Err(ExecError::Cancelled);
            },
        };

        let duration = started.elapsed();
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if output.status.success() {
            tracing::debug!(command, ?duration, "Toolchain finished");
            return Ok(ExecOutput {
                exit_code: 0,
                stdout,
                stderr,
                duration,
            });
        }

        let signal = classify_exit(output.status, &stderr);
        tracing::warn!(
            command,
            exit_code = ?output.status.code(),
            ?signal,
            "Toolchain failed"
        );
        tracing::debug!(command, %stderr, "Toolchain stderr");
        Err(ExecError::CommandFailed(Box::new(CommandFailure {
            command: argv.join(" "),
            exit_code: output.status.code(),
            stdout,
            stderr,
            signal,
        })))
    }

    fn isolated_path(&self, session_id: &str) -> Result<PathBuf, ExecError> {
        let valid = !session_id.is_empty()
            && session_id.len() <= 64
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
        if !valid {
            return Err(ExecError::DirectoryTraversal(PathBuf::from(session_id)));
        }
        Ok(self.root.join(ISOLATED_DIR).join(session_id))
    }

    /// A fresh, owner-only directory for one session's build. Anything left
    /// over from a previous build is discarded first.
    pub async fn create_isolated_workspace(&self, session_id: &str) -> Result<PathBuf, ExecError> {
        let path = self.isolated_path(session_id)?;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&path).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700)).await?;
        }
        tracing::debug!(session_id, path = %path.display(), "Isolated workspace created");
        Ok(path)
    }

    pub async fn cleanup_isolated_workspace(&self, session_id: &str) -> Result<(), ExecError> {
        let path = self.isolated_path(session_id)?;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Blocking form of [`Self::cleanup_isolated_workspace`] for drop paths
    /// that cannot await.
    pub fn discard_isolated_workspace(&self, session_id: &str) -> Result<(), ExecError> {
        let path = self.isolated_path(session_id)?;
        match std::fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the toolchain binary can be found.
    pub fn toolchain_available(&self) -> bool {
        if self.cli_path.components().count() > 1 {
            return self.cli_path.is_file();
        }
        std::env::var_os("PATH").is_some_and(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(&self.cli_path).is_file())
        })
    }
}

fn classify_spawn_error(e: &std::io::Error) -> FailureSignal {
    match e.kind() {
        std::io::ErrorKind::NotFound => FailureSignal::NotFound,
        std::io::ErrorKind::PermissionDenied => FailureSignal::PermissionDenied,
        _ if e.raw_os_error() == Some(ETXTBSY) => FailureSignal::ResourceBusy,
        _ => FailureSignal::Other,
    }
}

/// Exit status first; errno tokens on stderr for toolchains that only ever
/// exit with 1.
fn classify_exit(status: ExitStatus, stderr: &str) -> FailureSignal {
    match status.code() {
        None => return FailureSignal::Terminated,
        Some(EXIT_NOT_FOUND) => return FailureSignal::NotFound,
        Some(EXIT_NOT_EXECUTABLE) => return FailureSignal::PermissionDenied,
        Some(EXIT_TEMPFAIL) => return FailureSignal::ResourceBusy,
        Some(EXIT_TIMEOUT) => return FailureSignal::Timeout,
        Some(_) => {},
    }
    for token in stderr.split(|c: char| !c.is_ascii_alphanumeric()) {
        match token {
            "ENOENT" => return FailureSignal::NotFound,
            "EACCES" | "EPERM" => return FailureSignal::PermissionDenied,
            "EBUSY" | "EAGAIN" | "ETXTBSY" => return FailureSignal::ResourceBusy,
            "ETIMEDOUT" => return FailureSignal::Timeout,
            _ => {},
        }
    }
    FailureSignal::Other
}
