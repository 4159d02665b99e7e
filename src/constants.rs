//! # Orchestration Constants
//!
//! Fixed values shared by the NIM container contract: internal ports,
//! health paths, mount targets, environment variable names, and the
//! default timing and port-allocation bounds.
//!
//! Values that operators may reasonably change (base port, timeouts,
//! shared-memory size, engine binary) are only *defaults* here; the
//! effective values live in [`crate::config::OrchestratorConfig`].
//!
//! ## Cross-References
//!
//! - [`crate::launcher`]: Uses the container contract constants
//! - [`crate::readiness`]: Uses the health path and poll interval
//! - [`crate::port`]: Uses the default base port
//! - [`crate::platform`]: Uses the WSL distro name

use std::time::Duration;

// =============================================================================
// NIM Container Contract
// =============================================================================
//
// Every NIM image listens on the same internal port, exposes the same health
// endpoint and expects its model cache at the same path. The launcher maps
// host resources onto these fixed targets.
// =============================================================================

/// Port the inference service listens on inside the container.
pub const NIM_INTERNAL_PORT: u16 = 8000;

/// Readiness endpoint exposed by every NIM service.
///
/// Returns HTTP 200 once the model is loaded and accepting requests.
pub const HEALTH_PATH: &str = "/v1/health/ready";

/// Cache location inside the container where weights are stored.
pub const CONTAINER_CACHE_PATH: &str = "/opt/nim/.cache";

/// Device binding exposing every GPU through CDI.
pub const GPU_DEVICE_ALL: &str = "nvidia.com/gpu=all";

/// Host the published port is reachable on.
pub const LOCALHOST: &str = "localhost";

// =============================================================================
// Container Environment Variables
// =============================================================================

/// Registry credential consumed by the service to fetch model weights.
pub const ENV_NGC_API_KEY: &str = "NGC_API_KEY";

/// Lets the service start on GPUs below its nominal memory requirement.
pub const ENV_RELAX_MEM_CONSTRAINTS: &str = "NIM_RELAX_MEM_CONSTRAINTS";

/// Weight offloading policy token.
pub const ENV_OFFLOADING_POLICY: &str = "NIM_OFFLOADING_POLICY";

/// Model sub-mode selector (base/canny/depth).
pub const ENV_MODEL_VARIANT: &str = "NIM_MODEL_VARIANT";

/// Optional external model-hub token.
pub const ENV_HF_TOKEN: &str = "HF_TOKEN";

// =============================================================================
// Registry Defaults
// =============================================================================

/// Default container registry host.
pub const DEFAULT_REGISTRY: &str = "nvcr.io";

/// Fixed service-account identity used with API-key credentials.
///
/// The registry ignores the username for API-key logins but requires
/// this literal value.
pub const DEFAULT_REGISTRY_USERNAME: &str = "$oauthtoken";

// =============================================================================
// Engine Defaults
// =============================================================================

/// Default container engine binary.
pub const DEFAULT_RUNTIME: &str = "podman";

/// Default shared-memory size for inference containers.
///
/// **Rationale**: Diffusion pipelines exchange large tensors between worker
/// processes through `/dev/shm`; the engine default (64 MiB) is far too small.
pub const DEFAULT_SHM_SIZE: &str = "16GB";

/// WSL distribution that hosts the container engine on Windows.
pub const DEFAULT_WSL_DISTRO: &str = "NVIDIA-Workbench";

/// Directory under the home directory holding per-model caches.
pub const CACHE_DIR_NAME: &str = "nimcache";

// =============================================================================
// Port Allocation
// =============================================================================

/// First host port tried when allocating a port for a new deployment.
pub const DEFAULT_BASE_PORT: u16 = 8003;

/// Highest host port the allocator will consider.
pub const DEFAULT_MAX_PORT: u16 = u16::MAX;

// =============================================================================
// Timeouts
// =============================================================================
//
// The readiness wait is the only timeout on the deploy path. Model weights
// are downloaded on first start, so the default is generous.
// =============================================================================

/// Default upper bound on the readiness wait (30 minutes).
///
/// **Rationale**: First start of a large model downloads tens of gigabytes
/// of weights before the health endpoint turns green.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Interval between readiness probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Per-request timeout for a single health probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout for a single TCP connect attempt when probing a port.
pub const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

// =============================================================================
// Container Name Validation
// =============================================================================

/// Valid characters for container names.
///
/// Names are interpolated into shell commands, so only characters that need
/// no quoting are accepted.
pub const CONTAINER_NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_.";

/// Maximum container name length.
pub const MAX_CONTAINER_NAME_LEN: usize = 128;

/// Validates a container name for use in shell commands.
///
/// # Returns
///
/// `Ok(())` if valid, `Err(reason)` with a description of the failure.
#[inline]
#[must_use = "validation result must be checked before interpolating the name"]
pub fn validate_container_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("container name cannot be empty");
    }
    if name.len() > MAX_CONTAINER_NAME_LEN {
        return Err("container name exceeds maximum length");
    }
    if !name.chars().all(|c| CONTAINER_NAME_VALID_CHARS.contains(c)) {
        return Err("container name contains invalid characters");
    }
    Ok(())
}
