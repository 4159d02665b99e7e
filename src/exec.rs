//! # Execution Context - Shell Commands Through an Optional Indirection Layer
//!
//! Every interaction with the container engine is a shell command. On hosts
//! where the engine lives inside a WSL2 distro, commands are prefixed with an
//! indirection string (`wsl -d <distro> --`); elevated commands substitute a
//! privilege-escalating variant of that prefix (`wsl -d <distro> -u root --`).
//!
//! ## Execution Modes
//!
//! | Mode      | Method                          | Output                         |
//! |-----------|---------------------------------|--------------------------------|
//! | Blocking  | [`CommandExecutor::run`]        | stdout lines, error on exit≠0  |
//! | Streaming | [`CommandExecutor::spawn`]      | live [`ProcessHandle`]         |
//! | Detached  | [`CommandExecutor::spawn_detached`] | nothing; fire-and-forget   |
//!
//! ## Output Draining
//!
//! A spawned process gets one background task per output stream. Each task
//! reads lines and pushes them into an unbounded channel; the task ends when
//! its stream closes. The owner of the handle drains the channels without
//! blocking via [`ProcessHandle::try_stdout_line`] and
//! [`ProcessHandle::try_stderr_line`]. Ordering is preserved per stream
//! only.
//!
//! ## Secrets
//!
//! [`ShellCommand`] tracks which arguments are secret. Its `Display` form
//! masks them, and that redacted form is the only one that reaches logs or
//! error values.
//!
//! This module is the only place in the crate that creates OS processes.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::debug;

/// Replacement text for secret arguments in redacted output.
const REDACTED: &str = "'***'";

// ============================================================================
// Shell Command
// ============================================================================

/// Shell-escapes a string for safe use in `sh -c` commands.
///
/// Strings made only of characters that need no quoting are returned as-is
/// so that logged commands stay readable.
pub fn shell_escape(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+%".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// A shell command line with knowledge of its secret arguments.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ShellCommand {
    line: String,
    /// `(needle, replacement)` pairs applied when redacting.
    secrets: Vec<(String, String)>,
}

impl ShellCommand {
    /// Starts a command with a program name.
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            line: shell_escape(program.as_ref()),
            secrets: Vec::new(),
        }
    }

    /// Starts a command from a raw, already-quoted line.
    pub fn raw(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            secrets: Vec::new(),
        }
    }

    /// Appends an escaped argument.
    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.push(&shell_escape(arg.as_ref()));
        self
    }

    /// Appends several escaped arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    /// Appends an escaped argument that must never be logged.
    #[must_use]
    pub fn secret_arg(mut self, arg: impl AsRef<str>) -> Self {
        let escaped = shell_escape(arg.as_ref());
        self.push(&escaped);
        if !arg.as_ref().is_empty() {
            self.secrets.push((escaped, REDACTED.to_string()));
        }
        self
    }

    /// Appends `KEY=value` as a single argument, masking the value.
    ///
    /// `key` must be a valid environment variable name; it is not quoted.
    #[must_use]
    pub fn secret_env_arg(mut self, key: &str, value: &str) -> Self {
        let token = format!("{}={}", key, shell_escape(value));
        self.push(&token);
        if !value.is_empty() {
            self.secrets.push((token, format!("{}={}", key, REDACTED)));
        }
        self
    }

    /// Appends raw text without escaping.
    #[must_use]
    pub fn raw_arg(mut self, text: &str) -> Self {
        self.push(text);
        self
    }

    /// Returns a copy of this command prefixed by `prefix`.
    #[must_use]
    pub fn prefixed(&self, prefix: &str) -> Self {
        if prefix.is_empty() {
            return self.clone();
        }
        Self {
            line: format!("{} {}", prefix, self.line),
            secrets: self.secrets.clone(),
        }
    }

    /// Returns a copy of this command passed as one quoted word to `prefix`.
    ///
    /// For prefixes that hand their arguments to another shell (`ssh`,
    /// `eval`), which would otherwise strip one level of quoting.
    #[must_use]
    pub fn quoted_under(&self, prefix: &str) -> Self {
        let quote = |s: &str| s.replace('\'', "'\\''");
        let inner = shell_escape(&self.line);
        let line = if prefix.is_empty() {
            inner
        } else {
            format!("{} {}", prefix, inner)
        };
        Self {
            line,
            secrets: self
                .secrets
                .iter()
                .map(|(needle, replacement)| (quote(needle), quote(replacement)))
                .collect(),
        }
    }

    /// Returns the executable command line, secrets included.
    pub fn as_str(&self) -> &str {
        &self.line
    }

    /// Returns the command line with secrets masked.
    pub fn redacted(&self) -> String {
        self.secrets
            .iter()
            .fold(self.line.clone(), |line, (needle, replacement)| {
                line.replace(needle.as_str(), replacement)
            })
    }

    fn push(&mut self, text: &str) {
        if !self.line.is_empty() {
            self.line.push(' ');
        }
        self.line.push_str(text);
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Debug for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ShellCommand").field(&self.redacted()).finish()
    }
}

// ============================================================================
// Indirection Layer
// ============================================================================

/// Intermediate shell environment commands are routed through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Indirection {
    /// A WSL2 distribution on Windows.
    Wsl { distro: String },
    /// Arbitrary prefixes, e.g. `ssh gpu-box` / `ssh gpu-box sudo`.
    ///
    /// The prefix receives the whole command line as a single quoted word
    /// and must evaluate it through a shell.
    Custom {
        prefix: String,
        elevated_prefix: String,
    },
}

impl Indirection {
    /// Routes commands through a WSL2 distribution.
    pub fn wsl(distro: impl Into<String>) -> Self {
        Self::Wsl {
            distro: distro.into(),
        }
    }

    /// Prefix for ordinary commands.
    pub fn prefix(&self) -> String {
        match self {
            Self::Wsl { distro } => format!("wsl -d {} --", shell_escape(distro)),
            Self::Custom { prefix, .. } => prefix.clone(),
        }
    }

    /// Prefix for commands needing elevated privileges.
    pub fn elevated_prefix(&self) -> String {
        match self {
            Self::Wsl { distro } => format!("wsl -d {} -u root --", shell_escape(distro)),
            Self::Custom {
                elevated_prefix, ..
            } => elevated_prefix.clone(),
        }
    }

    /// WSL distro name, if this is a WSL indirection.
    pub fn distro(&self) -> Option<&str> {
        match self {
            Self::Wsl { distro } => Some(distro),
            Self::Custom { .. } => None,
        }
    }
}

// ============================================================================
// Process Handle
// ============================================================================

/// Which output stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Live handle to a spawned process with streamable output.
///
/// Dropping the handle does not kill the process.
pub struct ProcessHandle {
    /// Redacted command line.
    command: String,
    /// OS process, absent for scripted handles.
    child: Option<Child>,
    stdout: mpsc::UnboundedReceiver<String>,
    stderr: mpsc::UnboundedReceiver<String>,
    /// Exit code once observed (or scripted).
    exit_code: Option<i32>,
}

impl ProcessHandle {
    /// Wraps a spawned child, starting one listener task per output stream.
    fn from_child(command: String, mut child: Child) -> Self {
        let (stdout_tx, stdout) = mpsc::unbounded_channel();
        let (stderr_tx, stderr) = mpsc::unbounded_channel();

        if let Some(out) = child.stdout.take() {
            forward_lines(out, stdout_tx);
        }
        if let Some(err) = child.stderr.take() {
            forward_lines(err, stderr_tx);
        }

        Self {
            command,
            child: Some(child),
            stdout,
            stderr,
            exit_code: None,
        }
    }

    /// Creates a handle with pre-recorded output and no OS process.
    ///
    /// The handle reports itself as running until [`Self::with_exit_code`]
    /// is applied. Used by alternative [`CommandExecutor`] implementations.
    pub fn scripted<I, J>(command: impl Into<String>, stdout: I, stderr: J) -> Self
    where
        I: IntoIterator<Item = String>,
        J: IntoIterator<Item = String>,
    {
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        for line in stdout {
            let _ = stdout_tx.send(line);
        }
        for line in stderr {
            let _ = stderr_tx.send(line);
        }

        Self {
            command: command.into(),
            child: None,
            stdout: stdout_rx,
            stderr: stderr_rx,
            exit_code: None,
        }
    }

    /// Marks a scripted handle as exited with `code`.
    #[must_use]
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    /// Redacted command line this process was started from.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// OS process id, if known.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Next buffered stdout line, without blocking.
    pub fn try_stdout_line(&mut self) -> Option<String> {
        self.stdout.try_recv().ok()
    }

    /// Next buffered stderr line, without blocking.
    pub fn try_stderr_line(&mut self) -> Option<String> {
        self.stderr.try_recv().ok()
    }

    /// Waits for the next stderr line; `None` once the stream is closed.
    pub async fn next_stderr_line(&mut self) -> Option<String> {
        self.stderr.recv().await
    }

    /// Moves output draining to a background task calling `forward` per line.
    ///
    /// Afterwards the `try_*_line` methods return nothing. The task ends once
    /// both streams close.
    pub fn forward_output<F>(&mut self, mut forward: F)
    where
        F: FnMut(OutputStream, String) + Send + 'static,
    {
        let mut stdout = std::mem::replace(&mut self.stdout, closed_receiver());
        let mut stderr = std::mem::replace(&mut self.stderr, closed_receiver());

        tokio::spawn(async move {
            let (mut stdout_open, mut stderr_open) = (true, true);
            while stdout_open || stderr_open {
                tokio::select! {
                    line = stdout.recv(), if stdout_open => match line {
                        Some(line) => forward(OutputStream::Stdout, line),
                        None => stdout_open = false,
                    },
                    line = stderr.recv(), if stderr_open => match line {
                        Some(line) => forward(OutputStream::Stderr, line),
                        None => stderr_open = false,
                    },
                }
            }
        });
    }

    /// Returns the exit code if the process has exited, without blocking.
    pub fn try_wait(&mut self) -> Result<Option<i32>> {
        if self.exit_code.is_some() {
            return Ok(self.exit_code);
        }
        if let Some(child) = self.child.as_mut()
            && let Some(status) = child.try_wait()?
        {
            self.exit_code = Some(status.code().unwrap_or(-1));
        }
        Ok(self.exit_code)
    }

    /// Waits for the process to exit and returns its exit code.
    ///
    /// A scripted handle without an exit code never completes.
    pub async fn wait(&mut self) -> Result<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        match self.child.as_mut() {
            Some(child) => {
                let code = child.wait().await?.code().unwrap_or(-1);
                self.exit_code = Some(code);
                Ok(code)
            }
            None => std::future::pending().await,
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("command", &self.command)
            .field("pid", &self.pid())
            .field("exit_code", &self.exit_code)
            .finish()
    }
}

fn closed_receiver() -> mpsc::UnboundedReceiver<String> {
    let (_tx, rx) = mpsc::unbounded_channel();
    rx
}

/// Pushes every line of `reader` into `tx` until the stream closes.
fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

// ============================================================================
// Executor Trait
// ============================================================================

/// Runs shell commands on behalf of the orchestrator.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Runs a command to completion and returns its stdout lines.
    ///
    /// # Errors
    ///
    /// [`Error::CommandFailed`] when the process exits non-zero.
    async fn run(&self, command: &ShellCommand, elevated: bool) -> Result<Vec<String>>;

    /// Spawns a command and returns immediately with a live handle.
    async fn spawn(&self, command: &ShellCommand) -> Result<ProcessHandle>;

    /// Spawns a command with output discarded, without tracking it.
    async fn spawn_detached(&self, command: &ShellCommand) -> Result<()>;

    /// Returns true if commands are routed through an indirection layer.
    fn uses_indirection(&self) -> bool;
}

// ============================================================================
// ExecutionContext Implementation
// ============================================================================

/// Executes commands through the host shell, optionally prefixed by an
/// [`Indirection`].
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    indirection: Option<Indirection>,
}

impl ExecutionContext {
    /// Creates a context that runs commands directly on the host.
    pub fn local() -> Self {
        Self { indirection: None }
    }

    /// Creates a context routing commands through `indirection`.
    pub fn new(indirection: Option<Indirection>) -> Self {
        Self { indirection }
    }

    /// Returns the indirection layer, if any.
    pub fn indirection(&self) -> Option<&Indirection> {
        self.indirection.as_ref()
    }

    /// Applies the indirection prefix to `command`.
    pub fn wrap(&self, command: &ShellCommand, elevated: bool) -> ShellCommand {
        match &self.indirection {
            Some(ind @ Indirection::Custom { .. }) if elevated => {
                command.quoted_under(&ind.elevated_prefix())
            }
            Some(ind @ Indirection::Custom { .. }) => command.quoted_under(&ind.prefix()),
            Some(ind) if elevated => command.prefixed(&ind.elevated_prefix()),
            Some(ind) => command.prefixed(&ind.prefix()),
            None => command.clone(),
        }
    }

    /// Builds the host shell invocation for a full command line.
    fn host_shell(line: &str) -> Command {
        #[cfg(target_os = "windows")]
        {
            let mut cmd = Command::new("cmd");
            cmd.args(["/C", line]);
            cmd
        }

        #[cfg(not(target_os = "windows"))]
        {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", line]);
            cmd
        }
    }
}

#[async_trait]
impl CommandExecutor for ExecutionContext {
    async fn run(&self, command: &ShellCommand, elevated: bool) -> Result<Vec<String>> {
        let full = self.wrap(command, elevated);
        debug!("Running command: {}", full);

        let output = Self::host_shell(full.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::SpawnFailed {
                command: full.redacted(),
                reason: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::CommandFailed {
                command: full.redacted(),
                exit_code: output.status.code().unwrap_or(-1),
                stdout: stdout.trim().to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(stdout.lines().map(str::to_string).collect())
    }

    async fn spawn(&self, command: &ShellCommand) -> Result<ProcessHandle> {
        let full = self.wrap(command, false);
        debug!("Spawning command: {}", full);

        let child = Self::host_shell(full.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::SpawnFailed {
                command: full.redacted(),
                reason: e.to_string(),
            })?;

        Ok(ProcessHandle::from_child(full.redacted(), child))
    }

    async fn spawn_detached(&self, command: &ShellCommand) -> Result<()> {
        let full = self.wrap(command, false);
        debug!("Spawning detached command: {}", full);

        Self::host_shell(full.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::SpawnFailed {
                command: full.redacted(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    fn uses_indirection(&self) -> bool {
        self.indirection.is_some()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_escape() {
        assert_eq!(shell_escape("podman"), "podman");
        assert_eq!(shell_escape("$oauthtoken"), "'$oauthtoken'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
        assert_eq!(shell_escape(""), "''");
    }

    #[test]
    fn test_secret_redaction() {
        let cmd = ShellCommand::new("podman")
            .arg("login")
            .arg("-p")
            .secret_arg("hunter2");
        assert_eq!(cmd.as_str(), "podman login -p hunter2");
        assert_eq!(cmd.to_string(), "podman login -p '***'");

        let cmd = ShellCommand::new("podman")
            .arg("-e")
            .secret_env_arg("NGC_API_KEY", "nvapi-abc");
        assert_eq!(cmd.as_str(), "podman -e NGC_API_KEY=nvapi-abc");
        assert_eq!(cmd.to_string(), "podman -e NGC_API_KEY='***'");
    }

    #[test]
    fn test_wsl_prefixes() {
        let ctx = ExecutionContext::new(Some(Indirection::wsl("NVIDIA-Workbench")));
        let cmd = ShellCommand::new("podman").arg("ps");
        assert_eq!(
            ctx.wrap(&cmd, false).as_str(),
            "wsl -d NVIDIA-Workbench -- podman ps"
        );
        assert_eq!(
            ctx.wrap(&cmd, true).as_str(),
            "wsl -d NVIDIA-Workbench -u root -- podman ps"
        );
        assert!(ctx.uses_indirection());
    }

    #[test]
    fn test_custom_prefix_receives_quoted_line() {
        let ctx = ExecutionContext::new(Some(Indirection::Custom {
            prefix: "ssh gpu-box".to_string(),
            elevated_prefix: "ssh root@gpu-box".to_string(),
        }));
        let cmd = ShellCommand::new("podman")
            .arg("login")
            .arg("-u")
            .arg("$oauthtoken")
            .arg("-p")
            .secret_arg("nvapi abc");

        let wrapped = ctx.wrap(&cmd, false);
        assert_eq!(
            wrapped.as_str(),
            r#"ssh gpu-box 'podman login -u '\''$oauthtoken'\'' -p '\''nvapi abc'\'''"#
        );
        assert!(!wrapped.to_string().contains("nvapi abc"));
        assert!(ctx.wrap(&cmd, true).as_str().starts_with("ssh root@gpu-box '"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reparsing_prefix_keeps_arguments_intact() {
        let ctx = ExecutionContext::new(Some(Indirection::Custom {
            prefix: "eval".to_string(),
            elevated_prefix: "eval".to_string(),
        }));

        let lines = ctx
            .run(&ShellCommand::new("echo").arg("$oauthtoken"), false)
            .await
            .unwrap();
        assert_eq!(lines, vec!["$oauthtoken"]);

        let lines = ctx
            .run(&ShellCommand::new("echo").arg("a  b"), true)
            .await
            .unwrap();
        assert_eq!(lines, vec!["a  b"]);
    }

    #[test]
    fn test_local_context_leaves_command_untouched() {
        let ctx = ExecutionContext::local();
        let cmd = ShellCommand::new("podman").arg("ps");
        assert_eq!(ctx.wrap(&cmd, true).as_str(), "podman ps");
        assert!(!ctx.uses_indirection());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_stdout_and_failure() {
        let ctx = ExecutionContext::local();

        let lines = ctx
            .run(&ShellCommand::raw("printf 'a\\nb\\n'"), false)
            .await
            .unwrap();
        assert_eq!(lines, vec!["a", "b"]);

        let err = ctx
            .run(&ShellCommand::raw("echo oops >&2; exit 3"), false)
            .await
            .unwrap_err();
        match err {
            Error::CommandFailed {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_streams_both_outputs() {
        let ctx = ExecutionContext::local();
        let mut handle = ctx
            .spawn(&ShellCommand::raw("echo out; echo err >&2"))
            .await
            .unwrap();

        assert_eq!(handle.wait().await.unwrap(), 0);
        assert_eq!(handle.next_stderr_line().await.as_deref(), Some("err"));

        // The stdout listener may still be flushing; give it a moment.
        let mut out = None;
        for _ in 0..50 {
            out = handle.try_stdout_line();
            if out.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(out.as_deref(), Some("out"));
    }

    #[tokio::test]
    async fn test_scripted_handle() {
        let mut handle = ProcessHandle::scripted(
            "podman pull x",
            Vec::new(),
            vec!["Copying blob".to_string()],
        )
        .with_exit_code(0);

        assert_eq!(handle.try_stderr_line().as_deref(), Some("Copying blob"));
        assert_eq!(handle.try_stderr_line(), None);
        assert_eq!(handle.try_wait().unwrap(), Some(0));
        assert_eq!(handle.pid(), None);
    }
}
