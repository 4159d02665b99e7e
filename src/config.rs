//! Orchestrator configuration.
//!
//! Values come from three layers, later ones overriding earlier ones:
//!
//! 1. [`OrchestratorConfig::default`] (platform-aware indirection)
//! 2. a JSON file ([`OrchestratorConfig::from_json_file`])
//! 3. `NIMRUN_*` environment variables ([`OrchestratorConfig::with_env_overrides`])
//!
//! | Variable                    | Field                |
//! |-----------------------------|----------------------|
//! | `NIMRUN_RUNTIME`            | `runtime`            |
//! | `NIMRUN_WSL_DISTRO`         | `indirection` (WSL)  |
//! | `NIMRUN_NO_INDIRECTION`     | `indirection = None` |
//! | `NIMRUN_BASE_PORT`          | `base_port`          |
//! | `NIMRUN_SHM_SIZE`           | `shm_size`           |
//! | `NIMRUN_CACHE_ROOT`         | `cache_root`         |
//! | `NIMRUN_READY_TIMEOUT_SECS` | `ready_timeout_secs` |

use crate::constants::{
    CACHE_DIR_NAME, DEFAULT_BASE_PORT, DEFAULT_MAX_PORT, DEFAULT_POLL_INTERVAL,
    DEFAULT_PROBE_TIMEOUT, DEFAULT_READY_TIMEOUT, DEFAULT_REGISTRY, DEFAULT_REGISTRY_USERNAME,
    DEFAULT_RUNTIME, DEFAULT_SHM_SIZE,
};
use crate::error::{Error, Result};
use crate::exec::Indirection;
use crate::platform::Platform;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for a [`LifecycleManager`](crate::manager::LifecycleManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Container engine binary (`podman`, `docker`).
    pub runtime: String,
    /// Shell indirection layer, if the engine is not on the host.
    pub indirection: Option<Indirection>,
    /// First host port tried for new deployments.
    pub base_port: u16,
    /// Last host port the allocator may hand out.
    pub max_port: u16,
    /// Shared-memory size passed to `--shm-size`.
    pub shm_size: String,
    /// Registry host to authenticate against.
    pub registry: String,
    /// Service-account username for registry login.
    pub registry_username: String,
    /// Root of the per-model cache tree; `<home>/nimcache` when unset.
    pub cache_root: Option<PathBuf>,
    /// Upper bound on the readiness wait, in seconds.
    pub ready_timeout_secs: u64,
    /// Interval between readiness probes, in milliseconds.
    pub poll_interval_ms: u64,
    /// Per-request health probe timeout, in milliseconds.
    pub probe_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            runtime: DEFAULT_RUNTIME.to_string(),
            indirection: Platform::detect().default_indirection(),
            base_port: DEFAULT_BASE_PORT,
            max_port: DEFAULT_MAX_PORT,
            shm_size: DEFAULT_SHM_SIZE.to_string(),
            registry: DEFAULT_REGISTRY.to_string(),
            registry_username: DEFAULT_REGISTRY_USERNAME.to_string(),
            cache_root: None,
            ready_timeout_secs: DEFAULT_READY_TIMEOUT.as_secs(),
            poll_interval_ms: millis(DEFAULT_POLL_INTERVAL),
            probe_timeout_ms: millis(DEFAULT_PROBE_TIMEOUT),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl OrchestratorConfig {
    /// Loads a configuration from a JSON file; missing fields keep defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `NIMRUN_*` environment variable overrides.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary variable lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(runtime) = lookup("NIMRUN_RUNTIME") {
            self.runtime = runtime;
        }
        if let Some(distro) = lookup("NIMRUN_WSL_DISTRO") {
            self.indirection = Some(Indirection::wsl(distro));
        }
        if lookup("NIMRUN_NO_INDIRECTION").is_some_and(|v| v == "1" || v == "true") {
            self.indirection = None;
        }
        if let Some(port) = lookup("NIMRUN_BASE_PORT") {
            self.base_port = port
                .parse()
                .map_err(|_| Error::InvalidConfig(format!("invalid NIMRUN_BASE_PORT: {}", port)))?;
        }
        if let Some(size) = lookup("NIMRUN_SHM_SIZE") {
            self.shm_size = size;
        }
        if let Some(root) = lookup("NIMRUN_CACHE_ROOT") {
            self.cache_root = Some(PathBuf::from(root));
        }
        if let Some(secs) = lookup("NIMRUN_READY_TIMEOUT_SECS") {
            self.ready_timeout_secs = secs.parse().map_err(|_| {
                Error::InvalidConfig(format!("invalid NIMRUN_READY_TIMEOUT_SECS: {}", secs))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Checks field consistency.
    pub fn validate(&self) -> Result<()> {
        if self.runtime.trim().is_empty() {
            return Err(Error::InvalidConfig("runtime cannot be empty".to_string()));
        }
        if self.base_port == 0 {
            return Err(Error::InvalidConfig("base_port cannot be 0".to_string()));
        }
        if self.max_port < self.base_port {
            return Err(Error::InvalidConfig(format!(
                "max_port {} is below base_port {}",
                self.max_port, self.base_port
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Readiness timeout.
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    /// Readiness poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Per-request health probe timeout.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Default cache root relative to a home directory.
    pub fn cache_root_in(home: &Path) -> PathBuf {
        home.join(CACHE_DIR_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.base_port, 8003);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("NIMRUN_RUNTIME", "docker"),
            ("NIMRUN_BASE_PORT", "5000"),
            ("NIMRUN_NO_INDIRECTION", "1"),
        ]
        .into_iter()
        .collect();

        let config = OrchestratorConfig::default()
            .with_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.runtime, "docker");
        assert_eq!(config.base_port, 5000);
        assert!(config.indirection.is_none());
    }

    #[test]
    fn test_invalid_port_override_rejected() {
        let result =
            OrchestratorConfig::default().with_overrides(|k| {
                (k == "NIMRUN_BASE_PORT").then(|| "not-a-port".to_string())
            });
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"base_port": 9000, "indirection": {"kind": "wsl", "distro": "Ubuntu"}}"#)
                .unwrap();
        assert_eq!(config.base_port, 9000);
        assert_eq!(config.runtime, "podman");
        assert_eq!(config.indirection, Some(Indirection::wsl("Ubuntu")));
    }
}
