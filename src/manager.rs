//! # Lifecycle Manager - Deploy, Reconcile, Stop
//!
//! The orchestrator tying every component together. It owns the in-memory
//! deployment records and the live process handles, and treats the engine's
//! container listing as the source of truth whenever the two disagree.
//!
//! ## Deploy Sequence
//!
//! ```text
//! deploy(model)
//!   │
//!   ├─ is_running(model)? ── yes ──► AlreadyRunning { port }
//!   │
//!   ├─ allocate_port(base..=max)
//!   ├─ cache.ensure(model)           world-writable weight cache
//!   ├─ registry.login(credential)
//!   ├─ registry.pull(image)          progress ──► LineSink
//!   ├─ launcher.start(request)       returns immediately
//!   ├─ readiness.wait_ready(...)     logs ──► LineSink
//!   │
//!   └─ record { port, process, started_at } ──► Started { port, ready_after }
//! ```
//!
//! Nothing is recorded until the container has reported ready. A container
//! that timed out keeps running and is picked up as untracked by the next
//! reconciliation.
//!
//! ## Reconciliation
//!
//! | Engine listing | Record | Action                           | Result |
//! |----------------|--------|----------------------------------|--------|
//! | present        | yes    | none                             | true   |
//! | present        | no     | force stop, errors logged        | false  |
//! | absent         | yes    | drop record                      | false  |
//! | absent         | no     | none                             | false  |
//!
//! ## Concurrency
//!
//! Every mutating operation takes `&mut self`, so two deploys can never race
//! for the same port. Callers sharing a manager across tasks wrap it in a
//! `tokio::sync::Mutex`.

use crate::cache::CacheDirectoryManager;
use crate::config::OrchestratorConfig;
use crate::constants::{HEALTH_PATH, LOCALHOST};
use crate::error::{Error, Result};
use crate::exec::{CommandExecutor, ExecutionContext, ProcessHandle};
use crate::inventory::{ContainerInventory, ExternalContainer};
use crate::launcher::{ContainerLauncher, LaunchRequest};
use crate::models::{ModelIdentity, OffloadingPolicy};
use crate::port::{PortProbe, TcpPortProbe, allocate_port};
use crate::readiness::{HealthProbe, HttpHealthProbe, LineSink, ReadinessMonitor, TracingSink};
use crate::registry::RegistryClient;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Records and Outcomes
// =============================================================================

/// A deployment started and tracked by this manager.
#[derive(Debug)]
pub struct DeploymentRecord {
    model: ModelIdentity,
    port: u16,
    started_at: DateTime<Utc>,
    process: Option<ProcessHandle>,
}

impl DeploymentRecord {
    /// Model served by the container.
    pub fn model(&self) -> ModelIdentity {
        self.model
    }

    /// Host port mapped to the container's service port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// When the container reported ready.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// PID of the foreground engine process, if still attached.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ProcessHandle::pid)
    }
}

/// Result of a successful [`LifecycleManager::deploy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
    /// The model was already running; nothing was launched.
    AlreadyRunning { port: u16 },
    /// A new container was launched and reported ready.
    Started { port: u16, ready_after: Duration },
}

impl DeployOutcome {
    /// Host port serving the model.
    pub fn port(&self) -> u16 {
        match self {
            Self::AlreadyRunning { port } | Self::Started { port, .. } => *port,
        }
    }
}

/// Health endpoint URL for a container published on `port`.
pub fn health_url(port: u16) -> String {
    format!("http://{}:{}{}", LOCALHOST, port, HEALTH_PATH)
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for a [`LifecycleManager`] with injectable collaborators.
///
/// Anything left unset falls back to the real implementation.
pub struct LifecycleManagerBuilder {
    config: OrchestratorConfig,
    executor: Option<Arc<dyn CommandExecutor>>,
    port_probe: Option<Arc<dyn PortProbe>>,
    health_probe: Option<Arc<dyn HealthProbe>>,
    sink: Option<Arc<dyn LineSink>>,
}

impl LifecycleManagerBuilder {
    /// Replaces the command executor.
    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Replaces the port probe used by the allocator.
    #[must_use]
    pub fn port_probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.port_probe = Some(probe);
        self
    }

    /// Replaces the readiness health probe.
    #[must_use]
    pub fn health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.health_probe = Some(probe);
        self
    }

    /// Replaces the sink receiving pull progress and container output.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn LineSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validates the configuration and assembles the manager.
    pub fn build(self) -> Result<LifecycleManager> {
        let config = self.config;
        config.validate()?;

        let executor: Arc<dyn CommandExecutor> = match self.executor {
            Some(executor) => executor,
            None => Arc::new(ExecutionContext::new(config.indirection.clone())),
        };
        let port_probe: Arc<dyn PortProbe> = match self.port_probe {
            Some(probe) => probe,
            None => Arc::new(TcpPortProbe::new()),
        };
        let health_probe: Arc<dyn HealthProbe> = match self.health_probe {
            Some(probe) => probe,
            None => Arc::new(HttpHealthProbe::with_timeout(config.probe_timeout())?),
        };
        let sink: Arc<dyn LineSink> = match self.sink {
            Some(sink) => sink,
            None => Arc::new(TracingSink),
        };

        let cache = CacheDirectoryManager::new(Arc::clone(&executor), config.cache_root.clone());
        let registry = RegistryClient::new(
            Arc::clone(&executor),
            &config.runtime,
            &config.registry,
            &config.registry_username,
        );
        let inventory = ContainerInventory::new(Arc::clone(&executor), &config.runtime);
        let launcher =
            ContainerLauncher::new(Arc::clone(&executor), &config.runtime, &config.shm_size);

        Ok(LifecycleManager {
            config,
            executor,
            port_probe,
            health_probe,
            sink,
            cache,
            registry,
            inventory,
            launcher,
            deployments: BTreeMap::new(),
        })
    }
}

// =============================================================================
// LifecycleManager
// =============================================================================

/// Deploys NIM containers and keeps track of the ones it started.
pub struct LifecycleManager {
    config: OrchestratorConfig,
    executor: Arc<dyn CommandExecutor>,
    port_probe: Arc<dyn PortProbe>,
    health_probe: Arc<dyn HealthProbe>,
    sink: Arc<dyn LineSink>,
    cache: CacheDirectoryManager,
    registry: RegistryClient,
    inventory: ContainerInventory,
    launcher: ContainerLauncher,
    deployments: BTreeMap<ModelIdentity, DeploymentRecord>,
}

impl LifecycleManager {
    /// Creates a manager with real collaborators.
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Starts a builder for injecting collaborators.
    pub fn builder(config: OrchestratorConfig) -> LifecycleManagerBuilder {
        LifecycleManagerBuilder {
            config,
            executor: None,
            port_probe: None,
            health_probe: None,
            sink: None,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Records of deployments this manager started, ordered by model.
    pub fn tracked(&self) -> impl Iterator<Item = &DeploymentRecord> {
        self.deployments.values()
    }

    /// Current engine listing, keyed by container name; empty if the engine
    /// cannot be queried.
    pub async fn containers(&self) -> HashMap<String, ExternalContainer> {
        self.inventory.list().await
    }

    /// Deploys `model` and waits until it serves requests.
    ///
    /// Idempotent: if the model is already running, returns
    /// [`DeployOutcome::AlreadyRunning`] without launching anything.
    ///
    /// # Errors
    ///
    /// Propagates the first failing step: [`Error::PortExhausted`],
    /// [`Error::DirectorySetupFailed`], [`Error::AuthFailed`],
    /// [`Error::ImagePullFailed`], [`Error::SpawnFailed`],
    /// [`Error::ContainerExited`] or [`Error::ReadinessTimeout`].
    pub async fn deploy(
        &mut self,
        model: ModelIdentity,
        policy: OffloadingPolicy,
        credential: &SecretString,
        hf_token: Option<&SecretString>,
    ) -> Result<DeployOutcome> {
        if self.is_running(model).await {
            if let Some(record) = self.deployments.get(&model) {
                info!("{} already running on port {}", model, record.port);
                return Ok(DeployOutcome::AlreadyRunning { port: record.port });
            }
        }

        info!("Deploying {} (offloading policy {})", model, policy);

        let port =
            allocate_port(self.port_probe.as_ref(), self.config.base_port, self.config.max_port)
                .await?;
        debug!("Allocated port {} for {}", port, model);

        let cache_dir = self.cache.ensure(model).await?;
        self.registry.login(credential).await?;
        self.registry
            .pull_to_completion(model, self.sink.as_ref())
            .await?;

        let request = LaunchRequest {
            model,
            port,
            policy,
            credential,
            hf_token,
            cache_dir: &cache_dir,
        };
        let mut process = self.launcher.start(&request).await?;

        let ready_after = ReadinessMonitor::new(self.health_probe.as_ref(), self.sink.as_ref())
            .with_interval(self.config.poll_interval())
            .wait_ready(model, &mut process, &health_url(port), self.config.ready_timeout())
            .await
            .inspect_err(|e| warn!("{} did not become ready: {}", model, e))?;

        let sink = Arc::clone(&self.sink);
        process.forward_output(move |stream, line| sink.line(model, stream, &line));

        self.deployments.insert(
            model,
            DeploymentRecord {
                model,
                port,
                started_at: Utc::now(),
                process: Some(process),
            },
        );

        info!("{} serving at {}", model, self.base_url_for(port));
        Ok(DeployOutcome::Started { port, ready_after })
    }

    /// Returns true if `model` is running and tracked, reconciling first.
    ///
    /// An untracked container of the same name is force-stopped; a record
    /// whose container disappeared is dropped. Both report false. When the
    /// engine cannot be queried nothing is reconciled and the answer is
    /// whether a record exists.
    pub async fn is_running(&mut self, model: ModelIdentity) -> bool {
        let tracked = self.deployments.contains_key(&model);
        let present = match self.inventory.try_list().await {
            Ok(containers) => containers.contains_key(model.name()),
            Err(e) => {
                warn!("Container listing failed, keeping records as they are: {}", e);
                return tracked;
            }
        };

        match (present, tracked) {
            (true, true) => true,
            (true, false) => {
                warn!("Found untracked container {}, stopping it", model);
                if let Err(e) = self.issue_stop(model).await {
                    warn!("Failed to stop untracked container {}: {}", model, e);
                }
                false
            }
            (false, true) => {
                warn!("Container for {} is gone, dropping its record", model);
                self.deployments.remove(&model);
                false
            }
            (false, false) => false,
        }
    }

    /// Returns the host port serving `model`.
    ///
    /// # Errors
    ///
    /// [`Error::NotRunning`] if the model is not running.
    pub async fn get_port(&mut self, model: ModelIdentity) -> Result<u16> {
        if !self.is_running(model).await {
            return Err(Error::NotRunning(model.to_string()));
        }
        self.deployments
            .get(&model)
            .map(|record| record.port)
            .ok_or_else(|| Error::NotRunning(model.to_string()))
    }

    /// Returns the base URL clients use to reach `model`.
    pub async fn base_url(&mut self, model: ModelIdentity) -> Result<String> {
        let port = self.get_port(model).await?;
        Ok(self.base_url_for(port))
    }

    /// Stops `model`.
    ///
    /// Without `force`, a model that is not running is a no-op. With
    /// `force`, the stop command is issued regardless.
    ///
    /// # Errors
    ///
    /// [`Error::CommandFailed`] if the engine rejects the stop.
    pub async fn stop(&mut self, model: ModelIdentity, force: bool) -> Result<()> {
        if !force && !self.is_running(model).await {
            debug!("{} is not running, nothing to stop", model);
            return Ok(());
        }
        self.issue_stop(model).await
    }

    /// Stops the engine's container for `model`, whether or not this
    /// manager started it.
    ///
    /// Returns false if the engine lists no such container.
    ///
    /// # Errors
    ///
    /// Fails if the engine cannot be queried or rejects the stop.
    pub async fn stop_container(&mut self, model: ModelIdentity) -> Result<bool> {
        if !self.inventory.try_list().await?.contains_key(model.name()) {
            self.deployments.remove(&model);
            return Ok(false);
        }
        self.issue_stop(model).await?;
        Ok(true)
    }

    /// Stops every tracked deployment, continuing past failures.
    ///
    /// Each model additionally gets a detached stop, so containers whose
    /// synchronous stop failed are still asked to go away.
    pub async fn cleanup(&mut self) {
        let models: Vec<ModelIdentity> = self.deployments.keys().copied().collect();
        if models.is_empty() {
            return;
        }
        info!("Cleaning up {} deployments", models.len());

        for model in models {
            if let Err(e) = self.stop(model, false).await {
                warn!("Failed to stop {} during cleanup: {}", model, e);
            }
            let cmd = self.launcher.stop_command(model);
            if let Err(e) = self.executor.spawn_detached(&cmd).await {
                warn!("Failed to issue detached stop for {}: {}", model, e);
            }
        }

        self.deployments.clear();
    }

    /// Consumes the manager after stopping every tracked deployment.
    pub async fn shutdown(mut self) {
        self.cleanup().await;
    }

    /// Runs the stop command and forgets the record on success.
    async fn issue_stop(&mut self, model: ModelIdentity) -> Result<()> {
        info!("Stopping {}", model);
        self.executor
            .run(&self.launcher.stop_command(model), false)
            .await?;
        self.deployments.remove(&model);
        info!("Stopped {}", model);
        Ok(())
    }

    fn base_url_for(&self, port: u16) -> String {
        format!("http://{}:{}", LOCALHOST, port)
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        if !self.deployments.is_empty() {
            let models: Vec<&str> = self.deployments.keys().map(|m| m.name()).collect();
            warn!(
                "LifecycleManager dropped with running deployments ({}); call shutdown() to stop them",
                models.join(", ")
            );
        }
    }
}
