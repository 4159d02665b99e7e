//! Shared test doubles for orchestration tests.
//!
//! [`FakeEngine`] stands in for a podman binary reached through the shell:
//! it keeps a table of running containers, answers `ps`, `login`, `pull`,
//! `run` and `stop` the way the real engine would, and records every command
//! it receives.

#![allow(dead_code)]

use async_trait::async_trait;
use nimrun::{
    CommandExecutor, Error, HealthProbe, LifecycleManager, LineSink, ModelIdentity,
    OrchestratorConfig, OutputStream, PortProbe, ProcessHandle, Result, ShellCommand,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// =============================================================================
// Fake Engine
// =============================================================================

/// One command received by the fake engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub line: String,
    pub elevated: bool,
    pub detached: bool,
}

#[derive(Default)]
struct EngineState {
    /// Container name to published host port.
    containers: BTreeMap<String, u16>,
    /// Directories created inside the indirection layer.
    dirs: BTreeSet<String>,
    invocations: Vec<Invocation>,
    failing_stops: HashSet<String>,
    /// Number of upcoming `ps` calls that fail.
    failing_listings: usize,
    reject_login: bool,
    fail_pull: bool,
    crash_on_run: bool,
}

/// In-memory podman.
pub struct FakeEngine {
    indirection: bool,
    state: Mutex<EngineState>,
}

impl FakeEngine {
    /// Engine running on the host.
    pub fn local() -> Arc<Self> {
        Arc::new(Self {
            indirection: false,
            state: Mutex::new(EngineState::default()),
        })
    }

    /// Engine reached through an indirection layer with `$HOME=/home/nim`.
    pub fn behind_indirection() -> Arc<Self> {
        Arc::new(Self {
            indirection: true,
            state: Mutex::new(EngineState::default()),
        })
    }

    /// Simulates a container started outside the manager.
    pub fn add_container(&self, name: &str, port: u16) {
        self.state()
            .containers
            .insert(name.to_string(), port);
    }

    /// Simulates a container that went away outside the manager.
    pub fn remove_container(&self, name: &str) {
        self.state().containers.remove(name);
    }

    pub fn has_container(&self, name: &str) -> bool {
        self.state().containers.contains_key(name)
    }

    pub fn port_in_use(&self, port: u16) -> bool {
        self.state().containers.values().any(|p| *p == port)
    }

    pub fn fail_stop(&self, name: &str) {
        self.state().failing_stops.insert(name.to_string());
    }

    /// Makes the next `count` container listings fail.
    pub fn fail_listings(&self, count: usize) {
        self.state().failing_listings = count;
    }

    pub fn reject_login(&self) {
        self.state().reject_login = true;
    }

    pub fn fail_pull(&self) {
        self.state().fail_pull = true;
    }

    pub fn crash_on_run(&self) {
        self.state().crash_on_run = true;
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.state().invocations.clone()
    }

    /// Number of synchronous or spawned commands starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.state()
            .invocations
            .iter()
            .filter(|i| !i.detached && i.line.starts_with(prefix))
            .count()
    }

    /// Number of detached commands starting with `prefix`.
    pub fn count_detached(&self, prefix: &str) -> usize {
        self.state()
            .invocations
            .iter()
            .filter(|i| i.detached && i.line.starts_with(prefix))
            .count()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap()
    }
}

fn failed(line: &str, exit_code: i32, stderr: &str) -> Error {
    Error::CommandFailed {
        command: line.to_string(),
        exit_code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

fn listing(containers: &BTreeMap<String, u16>) -> String {
    let entries: Vec<serde_json::Value> = containers
        .iter()
        .enumerate()
        .map(|(i, (name, port))| {
            serde_json::json!({
                "Id": format!("{:064x}", i + 1),
                "Image": "nvcr.io/nim/test:1.0.0",
                "Names": [name],
                "State": "running",
                "Ports": [{
                    "host_ip": "",
                    "container_port": 8000,
                    "host_port": port,
                    "range": 1,
                    "protocol": "tcp"
                }]
            })
        })
        .collect();
    serde_json::Value::Array(entries).to_string()
}

fn published_port(words: &[&str]) -> Option<u16> {
    words
        .windows(2)
        .find(|w| w[0] == "-p")
        .and_then(|w| w[1].split(':').next())
        .and_then(|p| p.parse().ok())
}

#[async_trait]
impl CommandExecutor for FakeEngine {
    async fn run(&self, command: &ShellCommand, elevated: bool) -> Result<Vec<String>> {
        let line = command.as_str().to_string();
        let words: Vec<&str> = line.split_whitespace().collect();
        let mut state = self.state();
        state.invocations.push(Invocation {
            line: line.clone(),
            elevated,
            detached: false,
        });

        match words.as_slice() {
            ["podman", "ps", ..] => {
                if state.failing_listings > 0 {
                    state.failing_listings -= 1;
                    return Err(failed(&line, 255, "Error: cannot connect to the engine"));
                }
                Ok(vec![listing(&state.containers)])
            }
            ["podman", "login", ..] => {
                if state.reject_login {
                    Err(failed(&line, 125, "Error: invalid username/password"))
                } else {
                    Ok(vec!["Login Succeeded!".to_string()])
                }
            }
            ["podman", "stop", name] => {
                if state.failing_stops.contains(*name) {
                    return Err(failed(&line, 125, "Error: timed out waiting for container"));
                }
                match state.containers.remove(*name) {
                    Some(_) => Ok(vec![name.to_string()]),
                    None => Err(failed(&line, 125, "Error: no container with name or ID found")),
                }
            }
            ["echo", "$HOME"] => Ok(vec!["/home/nim".to_string()]),
            ["test", "-d", path] => {
                if state.dirs.contains(*path) {
                    Ok(Vec::new())
                } else {
                    Err(failed(&line, 1, ""))
                }
            }
            ["mkdir", "-p", path] => {
                state.dirs.insert(path.to_string());
                Ok(Vec::new())
            }
            ["chmod", ..] => Ok(Vec::new()),
            _ => Err(failed(&line, 127, "command not found")),
        }
    }

    async fn spawn(&self, command: &ShellCommand) -> Result<ProcessHandle> {
        let line = command.as_str().to_string();
        let words: Vec<&str> = line.split_whitespace().collect();
        let mut state = self.state();
        state.invocations.push(Invocation {
            line: line.clone(),
            elevated: false,
            detached: false,
        });

        match words.as_slice() {
            ["podman", "pull", reference] => {
                if state.fail_pull {
                    return Ok(ProcessHandle::scripted(
                        line.clone(),
                        Vec::new(),
                        vec![
                            format!("Trying to pull {}...", reference),
                            "Error: initializing source: unauthorized".to_string(),
                        ],
                    )
                    .with_exit_code(125));
                }
                Ok(ProcessHandle::scripted(
                    line.clone(),
                    Vec::new(),
                    vec![
                        format!("Trying to pull {}...", reference),
                        "Copying blob 4f4fb700ef54 done".to_string(),
                        "Writing manifest to image destination".to_string(),
                    ],
                )
                .with_exit_code(0))
            }
            ["podman", "run", ..] => {
                if state.crash_on_run {
                    return Ok(ProcessHandle::scripted(
                        line.clone(),
                        Vec::new(),
                        vec!["ERROR no CUDA-capable device is detected".to_string()],
                    )
                    .with_exit_code(1));
                }
                let name = words
                    .iter()
                    .find_map(|w| w.strip_prefix("--name="))
                    .unwrap_or_default()
                    .to_string();
                let port = published_port(&words).unwrap_or_default();
                state.containers.insert(name, port);
                Ok(ProcessHandle::scripted(
                    line.clone(),
                    vec!["INFO Starting NIM inference server".to_string()],
                    Vec::new(),
                ))
            }
            _ => Err(Error::SpawnFailed {
                command: line.clone(),
                reason: "unsupported by fake engine".to_string(),
            }),
        }
    }

    async fn spawn_detached(&self, command: &ShellCommand) -> Result<()> {
        let line = command.as_str().to_string();
        let mut state = self.state();
        state.invocations.push(Invocation {
            line: line.clone(),
            elevated: false,
            detached: true,
        });
        if let Some(name) = line.strip_prefix("podman stop ") {
            state.containers.remove(name.trim());
        }
        Ok(())
    }

    fn uses_indirection(&self) -> bool {
        self.indirection
    }
}

// =============================================================================
// Probes and Sinks
// =============================================================================

/// Port probe reporting fixed busy ports plus every engine-published port.
pub struct FakePorts {
    engine: Arc<FakeEngine>,
    busy: HashSet<u16>,
}

impl FakePorts {
    pub fn new(engine: &Arc<FakeEngine>, busy: impl IntoIterator<Item = u16>) -> Arc<Self> {
        Arc::new(Self {
            engine: Arc::clone(engine),
            busy: busy.into_iter().collect(),
        })
    }
}

#[async_trait]
impl PortProbe for FakePorts {
    async fn is_in_use(&self, port: u16) -> bool {
        self.busy.contains(&port) || self.engine.port_in_use(port)
    }
}

/// Health probe that is ready once a container publishes the probed port.
pub struct FakeHealth {
    engine: Arc<FakeEngine>,
    healthy: AtomicBool,
    probes: AtomicUsize,
}

impl FakeHealth {
    pub fn healthy(engine: &Arc<FakeEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine: Arc::clone(engine),
            healthy: AtomicBool::new(true),
            probes: AtomicUsize::new(0),
        })
    }

    pub fn never_ready(engine: &Arc<FakeEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine: Arc::clone(engine),
            healthy: AtomicBool::new(false),
            probes: AtomicUsize::new(0),
        })
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

fn url_port(url: &str) -> Option<u16> {
    let rest = url.strip_prefix("http://")?;
    let authority = rest.split('/').next()?;
    authority.rsplit(':').next()?.parse().ok()
}

#[async_trait]
impl HealthProbe for FakeHealth {
    async fn is_ready(&self, url: &str) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.healthy.load(Ordering::SeqCst)
            && url_port(url).is_some_and(|port| self.engine.port_in_use(port))
    }
}

/// Sink collecting every line it receives.
#[derive(Default)]
pub struct CollectingSink {
    lines: Mutex<Vec<(ModelIdentity, OutputStream, String)>>,
}

impl CollectingSink {
    pub fn lines(&self) -> Vec<(ModelIdentity, OutputStream, String)> {
        self.lines.lock().unwrap().clone()
    }
}

impl LineSink for CollectingSink {
    fn line(&self, model: ModelIdentity, stream: OutputStream, line: &str) {
        self.lines
            .lock()
            .unwrap()
            .push((model, stream, line.to_string()));
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Configuration with a local engine, a temporary cache root and ports
/// starting at 8003.
pub fn test_config(cache_root: &Path) -> OrchestratorConfig {
    OrchestratorConfig {
        runtime: "podman".to_string(),
        indirection: None,
        base_port: 8003,
        max_port: 8100,
        cache_root: Some(cache_root.to_path_buf()),
        ready_timeout_secs: 30,
        poll_interval_ms: 1000,
        ..OrchestratorConfig::default()
    }
}

/// Manager wired to the given fakes.
pub fn manager(
    config: OrchestratorConfig,
    engine: &Arc<FakeEngine>,
    ports: Arc<FakePorts>,
    health: Arc<FakeHealth>,
    sink: Arc<CollectingSink>,
) -> LifecycleManager {
    LifecycleManager::builder(config)
        .executor(Arc::clone(engine) as Arc<dyn CommandExecutor>)
        .port_probe(ports)
        .health_probe(health)
        .sink(sink)
        .build()
        .unwrap()
}
