//! # nimrun
//!
//! **GPU Inference Container Lifecycle Orchestrator**
//!
//! This crate deploys NVIDIA NIM image-generation microservices as local
//! containers and keeps track of them: it picks a free host port, prepares a
//! writable weight cache, authenticates to the registry, pulls the image,
//! launches the container with GPU access and waits until the service
//! answers its health endpoint.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         LifecycleManager                            │
//! │   deploy(model) │ is_running(model) │ get_port(model) │ stop │ ...  │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐ ┌──────────────┐ ┌──────────────┐ ┌────────────┐  │
//! │  │ allocate_port│ │ CacheDirectory│ │RegistryClient│ │ Container  │  │
//! │  │  PortProbe   │ │   Manager    │ │ login / pull │ │  Launcher  │  │
//! │  └──────────────┘ └──────────────┘ └──────────────┘ └────────────┘  │
//! │  ┌─────────────────────────────┐  ┌─────────────────────────────┐   │
//! │  │ ReadinessMonitor            │  │ ContainerInventory          │   │
//! │  │ HealthProbe + LineSink      │  │ `<engine> ps -a --format json`│ │
//! │  └─────────────────────────────┘  └─────────────────────────────┘   │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                     CommandExecutor (exec)                          │
//! │   local:  sh -c "<cmd>"                                             │
//! │   WSL:    wsl -d <distro> -- <cmd>   /  wsl -d <distro> -u root --  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Deployment Lifecycle
//!
//! ```text
//!   ┌──────────┐  deploy   ┌──────────┐  healthy  ┌─────────┐
//!   │ (absent) │ ────────► │ starting │ ────────► │ running │
//!   └──────────┘           └────┬─────┘           └────┬────┘
//!        ▲                      │ timeout / exit       │ stop / vanished
//!        │                      ▼                      │
//!        │               ┌────────────┐                │
//!        └────────────── │ untracked  │ ◄──────────────┘
//!          reconcile     └────────────┘
//! ```
//!
//! The engine's container listing is authoritative. Containers present in
//! the engine but not tracked by this process are stopped during
//! reconciliation, and records whose containers disappeared are dropped.
//!
//! # Secrets
//!
//! Registry credentials and Hugging Face tokens are carried as
//! [`secrecy::SecretString`] and masked in every logged command line and
//! every error message.
//!
//! # Example
//!
//! ```rust,ignore
//! use nimrun::{LifecycleManager, ModelIdentity, OffloadingPolicy, OrchestratorConfig};
//! use secrecy::SecretString;
//!
//! #[tokio::main]
//! async fn main() -> nimrun::Result<()> {
//!     let config = OrchestratorConfig::default().with_env_overrides()?;
//!     let mut manager = LifecycleManager::new(config)?;
//!
//!     let credential = SecretString::from(std::env::var("NGC_API_KEY").unwrap_or_default());
//!     let outcome = manager
//!         .deploy(ModelIdentity::FluxDev, OffloadingPolicy::Default, &credential, None)
//!         .await?;
//!     println!("serving on port {}", outcome.port());
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod constants;
pub mod error;
pub mod exec;
pub mod inventory;
pub mod launcher;
pub mod manager;
pub mod models;
pub mod platform;
pub mod port;
pub mod readiness;
pub mod registry;

// Re-exports
pub use cache::CacheDirectoryManager;
pub use config::OrchestratorConfig;
pub use error::{Error, Result};
pub use exec::{
    CommandExecutor, ExecutionContext, Indirection, OutputStream, ProcessHandle, ShellCommand,
};
pub use inventory::{ContainerInventory, ExternalContainer};
pub use launcher::{ContainerLauncher, LaunchRequest};
pub use manager::{DeployOutcome, DeploymentRecord, LifecycleManager, LifecycleManagerBuilder};
pub use models::{ModelFamily, ModelIdentity, OffloadingPolicy, Variant};
pub use platform::{Os, Platform};
pub use port::{PortProbe, TcpPortProbe, allocate_port};
pub use readiness::{HealthProbe, HttpHealthProbe, LineSink, ReadinessMonitor, TracingSink};
pub use registry::{PullProgress, RegistryClient};
