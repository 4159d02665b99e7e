//! # Registry Client - Login and Image Pull
//!
//! Authenticates the container engine against the image registry and pulls
//! images with streamed progress.
//!
//! ## Authentication
//!
//! The registry accepts API-key credentials with a fixed service-account
//! username (`$oauthtoken` for `nvcr.io`). The credential is an opaque
//! secret: it is passed to the engine unmodified and masked in every log
//! line and error.
//!
//! ## Pull Progress
//!
//! Engines write pull progress ("Copying blob ...") to stderr. [`PullProgress`]
//! exposes those lines as they arrive and resolves to success or
//! [`Error::ImagePullFailed`] once the pull process exits.
//!
//! ## Example
//!
//! ```rust,ignore
//! let registry = RegistryClient::new(executor, "podman", "nvcr.io", "$oauthtoken");
//! registry.login(&credential).await?;
//! let mut progress = registry.pull("nvcr.io/nim/black-forest-labs/flux.1-dev:1.0.0").await?;
//! while let Some(line) = progress.next_line().await {
//!     println!("{line}");
//! }
//! progress.finish().await?;
//! ```

use crate::error::{Error, Result};
use crate::exec::{CommandExecutor, ProcessHandle, ShellCommand};
use crate::models::ModelIdentity;
use crate::readiness::{LineSink, OutputStream};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tracing::{debug, info};

/// Authenticates to the registry and pulls images through the engine CLI.
pub struct RegistryClient {
    executor: Arc<dyn CommandExecutor>,
    runtime: String,
    registry: String,
    username: String,
}

impl RegistryClient {
    /// Creates a client for `registry` using the `runtime` engine binary.
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        runtime: impl Into<String>,
        registry: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            runtime: runtime.into(),
            registry: registry.into(),
            username: username.into(),
        }
    }

    /// Registry host this client authenticates against.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Builds the login command.
    pub fn login_command(&self, credential: &SecretString) -> ShellCommand {
        ShellCommand::new(&self.runtime)
            .arg("login")
            .arg(&self.registry)
            .arg("-u")
            .arg(&self.username)
            .arg("-p")
            .secret_arg(credential.expose_secret())
    }

    /// Builds the pull command.
    pub fn pull_command(&self, reference: &str) -> ShellCommand {
        ShellCommand::new(&self.runtime).arg("pull").arg(reference)
    }

    /// Logs the engine into the registry.
    ///
    /// # Errors
    ///
    /// [`Error::AuthFailed`] when the engine rejects the credential.
    pub async fn login(&self, credential: &SecretString) -> Result<()> {
        debug!("Logging in to {}", self.registry);

        self.executor
            .run(&self.login_command(credential), false)
            .await
            .map_err(|e| Error::AuthFailed {
                registry: self.registry.clone(),
                reason: match e {
                    Error::CommandFailed { stderr, .. } => stderr,
                    other => other.to_string(),
                },
            })?;

        info!("Authenticated to {}", self.registry);
        Ok(())
    }

    /// Starts pulling `reference` and returns a progress stream.
    pub async fn pull(&self, reference: &str) -> Result<PullProgress> {
        let handle = self
            .executor
            .spawn(&self.pull_command(reference))
            .await
            .map_err(|e| Error::ImagePullFailed {
                reference: reference.to_string(),
                reason: e.to_string(),
            })?;

        Ok(PullProgress {
            reference: reference.to_string(),
            handle,
            last_line: None,
        })
    }

    /// Pulls the image for `model`, forwarding progress to `sink`.
    pub async fn pull_to_completion(&self, model: ModelIdentity, sink: &dyn LineSink) -> Result<()> {
        let reference = model.image();
        info!("Pulling image {} for {}", reference, model);

        let mut progress = self.pull(reference).await?;
        while let Some(line) = progress.next_line().await {
            sink.line(model, OutputStream::Stderr, &line);
        }
        progress.finish().await?;

        info!("{} image downloaded successfully", model);
        Ok(())
    }
}

/// Streamed progress of an in-flight image pull.
#[derive(Debug)]
pub struct PullProgress {
    reference: String,
    handle: ProcessHandle,
    /// Most recent progress line, reported on failure.
    last_line: Option<String>,
}

impl PullProgress {
    /// Image being pulled.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Next progress line; `None` once the engine closes stderr.
    pub async fn next_line(&mut self) -> Option<String> {
        let line = self.handle.next_stderr_line().await?;
        self.last_line = Some(line.clone());
        Some(line)
    }

    /// Waits for the pull to exit.
    ///
    /// # Errors
    ///
    /// [`Error::ImagePullFailed`] on a non-zero exit.
    pub async fn finish(mut self) -> Result<()> {
        let code = self.handle.wait().await.map_err(|e| Error::ImagePullFailed {
            reference: self.reference.clone(),
            reason: e.to_string(),
        })?;

        if code != 0 {
            let detail = self
                .last_line
                .take()
                .unwrap_or_else(|| "no output".to_string());
            return Err(Error::ImagePullFailed {
                reference: self.reference,
                reason: format!("exit code {}: {}", code, detail),
            });
        }
        Ok(())
    }
}
