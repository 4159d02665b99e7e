//! Container inventory queried from the engine.
//!
//! The engine is the source of truth for what is actually running. Every
//! query runs `<runtime> ps -a --format json` afresh; nothing is cached.
//!
//! Two output shapes are accepted:
//!
//! - **podman**: one JSON array, `Names` as a list, `Ports` as objects
//!   (`{"host_port": 8003, "container_port": 8000, "range": 1, ...}`)
//! - **docker**: one JSON object per line, `Names` comma-joined, `Ports` as
//!   text (`0.0.0.0:8003->8000/tcp, :::8003->8000/tcp`)

use crate::error::Result;
use crate::exec::{CommandExecutor, ShellCommand};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Read-only snapshot of one container as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalContainer {
    /// Container name.
    pub name: String,
    /// Engine container ID.
    pub id: String,
    /// Image reference.
    pub image: String,
    /// Published host ports, ascending.
    pub host_ports: Vec<u16>,
    /// Engine state string (`running`, `exited`, ...).
    pub state: String,
}

impl ExternalContainer {
    /// First published host port.
    pub fn port(&self) -> Option<u16> {
        self.host_ports.first().copied()
    }
}

// =============================================================================
// Raw Engine Output
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawContainer {
    #[serde(rename = "Id", alias = "ID", default)]
    id: String,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Names", default)]
    names: Option<RawNames>,
    #[serde(rename = "Ports", default)]
    ports: Option<RawPorts>,
    #[serde(rename = "State", default)]
    state: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawNames {
    List(Vec<String>),
    Joined(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPorts {
    Structured(Vec<RawPort>),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct RawPort {
    #[serde(default)]
    host_port: u16,
    #[serde(default)]
    range: Option<u16>,
}

impl RawNames {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::List(names) => names,
            Self::Joined(joined) => joined
                .split(',')
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .collect(),
        }
    }
}

impl RawPorts {
    fn host_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = match self {
            Self::Structured(ports) => ports
                .iter()
                .filter(|p| p.host_port != 0)
                .flat_map(|p| {
                    let range = p.range.unwrap_or(1).max(1);
                    (0..range).filter_map(move |offset| p.host_port.checked_add(offset))
                })
                .collect(),
            Self::Text(text) => text.split(',').filter_map(parse_docker_port).collect(),
        };
        ports.sort_unstable();
        ports.dedup();
        ports
    }
}

/// Parses the host side of `0.0.0.0:8003->8000/tcp`.
fn parse_docker_port(mapping: &str) -> Option<u16> {
    let (host, _container) = mapping.trim().split_once("->")?;
    host.rsplit(':').next()?.parse().ok()
}

impl RawContainer {
    fn into_external(self) -> Vec<ExternalContainer> {
        let host_ports = self.ports.as_ref().map(RawPorts::host_ports).unwrap_or_default();
        let state = match self.state {
            Some(serde_json::Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        self.names
            .map(RawNames::into_vec)
            .unwrap_or_default()
            .into_iter()
            .map(|name| ExternalContainer {
                name: name.trim_start_matches('/').to_string(),
                id: self.id.clone(),
                image: self.image.clone(),
                host_ports: host_ports.clone(),
                state: state.clone(),
            })
            .collect()
    }
}

/// Parses engine listing output into container snapshots.
///
/// Accepts a JSON array or line-delimited JSON objects.
pub fn parse_listing(output: &str) -> Result<Vec<ExternalContainer>> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let raw: Vec<RawContainer> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else {
        trimmed
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<std::result::Result<_, _>>()?
    };

    Ok(raw.into_iter().flat_map(RawContainer::into_external).collect())
}

// =============================================================================
// ContainerInventory
// =============================================================================

/// Queries the engine for known containers.
pub struct ContainerInventory {
    executor: Arc<dyn CommandExecutor>,
    runtime: String,
}

impl ContainerInventory {
    /// Creates an inventory backed by the `runtime` engine binary.
    pub fn new(executor: Arc<dyn CommandExecutor>, runtime: impl Into<String>) -> Self {
        Self {
            executor,
            runtime: runtime.into(),
        }
    }

    /// Builds the listing command.
    pub fn listing_command(&self) -> ShellCommand {
        ShellCommand::new(&self.runtime).args(["ps", "-a", "--format", "json"])
    }

    /// Returns containers with at least one published port, keyed by name.
    ///
    /// # Errors
    ///
    /// Fails if the listing command fails or its output cannot be parsed.
    pub async fn try_list(&self) -> Result<HashMap<String, ExternalContainer>> {
        let lines = self.executor.run(&self.listing_command(), false).await?;
        let containers = parse_listing(&lines.join("\n"))?;

        let map: HashMap<_, _> = containers
            .into_iter()
            .filter(|c| !c.host_ports.is_empty())
            .map(|c| (c.name.clone(), c))
            .collect();
        debug!("Engine reports {} containers with published ports", map.len());
        Ok(map)
    }

    /// Like [`try_list`](Self::try_list), but a failed query yields an
    /// empty map, as an engine that cannot be queried lists nothing.
    pub async fn list(&self) -> HashMap<String, ExternalContainer> {
        self.try_list().await.unwrap_or_else(|e| {
            warn!("Container listing failed, assuming none: {}", e);
            HashMap::new()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PODMAN_OUTPUT: &str = r#"[
      {"Id": "abc123", "Image": "nvcr.io/nim/black-forest-labs/flux.1-dev:1.0.0",
       "Names": ["flux-dev"], "State": "running",
       "Ports": [{"host_ip": "", "container_port": 8000, "host_port": 8003, "range": 1, "protocol": "tcp"}]},
      {"Id": "def456", "Image": "docker.io/library/alpine:latest",
       "Names": ["scratch"], "State": "exited", "Ports": null}
    ]"#;

    const DOCKER_OUTPUT: &str = concat!(
        r#"{"ID":"abc123","Image":"nvcr.io/nim/black-forest-labs/flux.1-schnell:1.0.0","Names":"flux-schnell","Ports":"0.0.0.0:8004->8000/tcp, :::8004->8000/tcp","State":"running"}"#,
        "\n",
        r#"{"ID":"zzz","Image":"redis","Names":"cache","Ports":"6379/tcp","State":"running"}"#
    );

    #[test]
    fn test_parse_podman_listing() {
        let containers = parse_listing(PODMAN_OUTPUT).unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].name, "flux-dev");
        assert_eq!(containers[0].host_ports, vec![8003]);
        assert_eq!(containers[0].state, "running");
        assert!(containers[1].host_ports.is_empty());
    }

    #[test]
    fn test_parse_docker_listing() {
        let containers = parse_listing(DOCKER_OUTPUT).unwrap();
        assert_eq!(containers[0].name, "flux-schnell");
        assert_eq!(containers[0].host_ports, vec![8004]);
        // Exposed but unpublished port.
        assert!(containers[1].host_ports.is_empty());
    }

    #[test]
    fn test_parse_port_range() {
        let out = r#"[{"Id":"a","Image":"i","Names":["multi"],
            "Ports":[{"host_port":9000,"container_port":9000,"range":3}]}]"#;
        let containers = parse_listing(out).unwrap();
        assert_eq!(containers[0].host_ports, vec![9000, 9001, 9002]);
    }

    #[test]
    fn test_parse_empty_and_garbage() {
        assert!(parse_listing("").unwrap().is_empty());
        assert!(parse_listing("[]").unwrap().is_empty());
        assert!(parse_listing("not json").is_err());
    }
}
