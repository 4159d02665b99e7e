//! Error types for the NIM orchestration layer.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for orchestration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing NIM containers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Command Execution Errors
    // =========================================================================
    /// A shell command exited with a non-zero status.
    ///
    /// `command` is the redacted form; secrets never appear here.
    #[error("command '{command}' failed with exit code {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// The operating system refused to create the process.
    #[error("failed to spawn '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    // =========================================================================
    // Deployment Errors
    // =========================================================================
    /// Cache directory could not be created or made writable.
    #[error("failed to set up cache directory {}: {reason}", .path.display())]
    DirectorySetupFailed { path: PathBuf, reason: String },

    /// Registry login was rejected.
    #[error("failed to authenticate to registry '{registry}': {reason}")]
    AuthFailed { registry: String, reason: String },

    /// Image pull exited unsuccessfully.
    #[error("failed to pull image '{reference}': {reason}")]
    ImagePullFailed { reference: String, reason: String },

    /// The health endpoint never reported ready.
    #[error("model '{model}' not ready after {elapsed:?} (timeout {timeout:?})")]
    ReadinessTimeout {
        model: String,
        elapsed: Duration,
        timeout: Duration,
    },

    /// The launched container process exited while waiting for readiness.
    #[error("container for model '{model}' exited with code {exit_code} before becoming ready")]
    ContainerExited { model: String, exit_code: i32 },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Operation requires a running model.
    #[error("model '{0}' is not running")]
    NotRunning(String),

    /// No free host port could be found.
    #[error("no free port available at or above {base}")]
    PortExhausted { base: u16 },

    // =========================================================================
    // Input Errors
    // =========================================================================
    /// Unrecognized model name.
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// Unrecognized offloading policy token.
    #[error("unknown offloading policy: {0}")]
    UnknownOffloadingPolicy(String),

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Returns true for [`Error::NotRunning`].
    pub fn is_not_running(&self) -> bool {
        matches!(self, Self::NotRunning(_))
    }

    /// Returns true for [`Error::ReadinessTimeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ReadinessTimeout { .. })
    }

    /// Returns the exit code for failures caused by a process exit.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::CommandFailed { exit_code, .. } | Self::ContainerExited { exit_code, .. } => {
                Some(*exit_code)
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
