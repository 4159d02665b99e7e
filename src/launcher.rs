//! # Container Launcher
//!
//! Composes the engine `run` command for a NIM container and spawns it
//! without waiting for readiness.
//!
//! ## Run Command Layout
//!
//! ```text
//! <runtime> run --rm
//!     --device=nvidia.com/gpu=all          all GPUs via CDI
//!     --name=<model>                       inventory key and stop target
//!     --shm-size=<size>
//!     -e NGC_API_KEY=<credential>          masked in logs
//!     -e NIM_RELAX_MEM_CONSTRAINTS=1
//!     -e NIM_OFFLOADING_POLICY=<policy>
//!     -e NIM_MODEL_VARIANT=<variant>
//!     [-e HF_TOKEN=<token>]                masked in logs
//!     -v <cache>:/opt/nim/.cache
//!     -p <port>:8000
//!     <image>
//! ```
//!
//! The container runs in the foreground of the spawned process, so its
//! output arrives on the process's stdout/stderr. `--rm` removes the
//! container once it stops, which keeps names free for the next launch.
//!
//! A container that fails immediately is not detected here; the readiness
//! monitor observes the process exit.

use crate::constants::{
    CONTAINER_CACHE_PATH, ENV_HF_TOKEN, ENV_MODEL_VARIANT, ENV_NGC_API_KEY, ENV_OFFLOADING_POLICY,
    ENV_RELAX_MEM_CONSTRAINTS, GPU_DEVICE_ALL, NIM_INTERNAL_PORT, validate_container_name,
};
use crate::error::{Error, Result};
use crate::exec::{CommandExecutor, ProcessHandle, ShellCommand};
use crate::models::{ModelIdentity, OffloadingPolicy};
use secrecy::{ExposeSecret, SecretString};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Everything that varies between two launches.
#[derive(Debug)]
pub struct LaunchRequest<'a> {
    pub model: ModelIdentity,
    pub port: u16,
    pub policy: OffloadingPolicy,
    pub credential: &'a SecretString,
    pub hf_token: Option<&'a SecretString>,
    pub cache_dir: &'a Path,
}

/// Builds and spawns NIM container run commands.
pub struct ContainerLauncher {
    executor: Arc<dyn CommandExecutor>,
    runtime: String,
    shm_size: String,
}

impl ContainerLauncher {
    /// Creates a launcher for the `runtime` engine binary.
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        runtime: impl Into<String>,
        shm_size: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            runtime: runtime.into(),
            shm_size: shm_size.into(),
        }
    }

    /// Builds the run command for `request`.
    pub fn run_command(&self, request: &LaunchRequest<'_>) -> Result<ShellCommand> {
        let name = request.model.name();
        validate_container_name(name).map_err(|reason| Error::SpawnFailed {
            command: format!("{} run", self.runtime),
            reason: format!("invalid container name '{}': {}", name, reason),
        })?;

        let mut cmd = ShellCommand::new(&self.runtime)
            .args(["run", "--rm"])
            .arg(format!("--device={}", GPU_DEVICE_ALL))
            .arg(format!("--name={}", name))
            .arg(format!("--shm-size={}", self.shm_size))
            .arg("-e")
            .secret_env_arg(ENV_NGC_API_KEY, request.credential.expose_secret())
            .arg("-e")
            .arg(format!("{}=1", ENV_RELAX_MEM_CONSTRAINTS))
            .arg("-e")
            .arg(format!("{}={}", ENV_OFFLOADING_POLICY, request.policy.as_token()))
            .arg("-e")
            .arg(format!("{}={}", ENV_MODEL_VARIANT, request.model.variant()));

        if let Some(token) = request.hf_token {
            cmd = cmd
                .arg("-e")
                .secret_env_arg(ENV_HF_TOKEN, token.expose_secret());
        }

        Ok(cmd
            .arg("-v")
            .arg(format!(
                "{}:{}",
                request.cache_dir.to_string_lossy(),
                CONTAINER_CACHE_PATH
            ))
            .arg("-p")
            .arg(format!("{}:{}", request.port, NIM_INTERNAL_PORT))
            .arg(request.model.image()))
    }

    /// Builds the stop command for `model`.
    pub fn stop_command(&self, model: ModelIdentity) -> ShellCommand {
        ShellCommand::new(&self.runtime).arg("stop").arg(model.name())
    }

    /// Spawns the container; returns as soon as the process exists.
    pub async fn start(&self, request: &LaunchRequest<'_>) -> Result<ProcessHandle> {
        let cmd = self.run_command(request)?;
        let handle = self.executor.spawn(&cmd).await?;
        info!(
            "Started NIM container for {} on port {}",
            request.model, request.port
        );
        Ok(handle)
    }
}
