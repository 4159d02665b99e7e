//! nimrun - NIM container lifecycle CLI
//!
//! Deploys NVIDIA NIM image-generation services as local GPU containers.
//!
//! ## Usage
//!
//! ```sh
//! nimrun models
//! nimrun ps
//! NGC_API_KEY=nvapi-... nimrun serve flux-dev [--offloading system_ram]
//! nimrun stop flux-dev [--force]
//! ```
//!
//! `serve` blocks until Ctrl-C, then stops the container it started.
//!
//! ## Configuration
//!
//! Defaults can be overridden by a JSON file (`--config`) and then by
//! `NIMRUN_*` environment variables; see [`OrchestratorConfig`].

use clap::{Parser, Subcommand};
use nimrun::{
    DeployOutcome, LifecycleManager, ModelIdentity, OffloadingPolicy, OrchestratorConfig,
};
use secrecy::SecretString;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Parser)]
#[command(name = "nimrun")]
#[command(about = "Deploy NVIDIA NIM inference containers locally", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error or a full directive)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Command {
    /// List the supported models
    Models,
    /// List engine containers with published ports
    Ps,
    /// Deploy a model and serve it until Ctrl-C
    Serve {
        /// Model name, e.g. flux-dev
        model: ModelIdentity,

        /// Memory offloading policy (none, system_ram, disk, default)
        #[arg(long, default_value = "default")]
        offloading: OffloadingPolicy,

        /// Registry API key
        #[arg(long, env = "NGC_API_KEY", hide_env_values = true)]
        api_key: String,

        /// Hugging Face token for gated weights
        #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
        hf_token: Option<String>,
    },
    /// Stop a model's container
    Stop {
        /// Model name, e.g. flux-dev
        model: ModelIdentity,

        /// Issue the stop even if the model is not reported running
        #[arg(long)]
        force: bool,
    },
}

// =============================================================================
// Commands
// =============================================================================

fn load_config(path: Option<&PathBuf>) -> nimrun::Result<OrchestratorConfig> {
    let config = match path {
        Some(path) => OrchestratorConfig::from_json_file(path)?,
        None => OrchestratorConfig::default(),
    };
    config.with_env_overrides()
}

fn cmd_models() {
    println!("{:<18} {:<8} IMAGE", "MODEL", "VARIANT");
    for model in ModelIdentity::ALL {
        println!(
            "{:<18} {:<8} {}",
            model.name(),
            model.variant().as_str(),
            model.image()
        );
    }
}

async fn cmd_ps(config: OrchestratorConfig) -> nimrun::Result<()> {
    let manager = LifecycleManager::new(config)?;
    let mut containers: Vec<_> = manager.containers().await.into_values().collect();
    containers.sort_by(|a, b| a.name.cmp(&b.name));

    println!("{:<24} {:<8} {:<10} IMAGE", "NAME", "PORT", "STATE");
    for c in containers {
        let port = c.port().map(|p| p.to_string()).unwrap_or_default();
        println!("{:<24} {:<8} {:<10} {}", c.name, port, c.state, c.image);
    }
    Ok(())
}

async fn cmd_serve(
    config: OrchestratorConfig,
    model: ModelIdentity,
    offloading: OffloadingPolicy,
    api_key: String,
    hf_token: Option<String>,
) -> nimrun::Result<()> {
    let credential = SecretString::from(api_key);
    let hf_token = hf_token.map(SecretString::from);

    let mut manager = LifecycleManager::new(config)?;
    let outcome = manager
        .deploy(model, offloading, &credential, hf_token.as_ref())
        .await?;

    match outcome {
        DeployOutcome::AlreadyRunning { port } => {
            eprintln!("{} is already running on port {}", model, port);
        }
        DeployOutcome::Started { port, ready_after } => {
            eprintln!(
                "{} ready on http://localhost:{} after {:.0}s",
                model,
                port,
                ready_after.as_secs_f64()
            );
        }
    }

    eprintln!("Press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
    }

    info!("Shutting down");
    manager.shutdown().await;
    Ok(())
}

async fn cmd_stop(
    config: OrchestratorConfig,
    model: ModelIdentity,
    force: bool,
) -> nimrun::Result<()> {
    let mut manager = LifecycleManager::new(config)?;
    if force {
        manager.stop(model, true).await?;
    } else if !manager.stop_container(model).await? {
        eprintln!("{} is not running", model);
        return Ok(());
    }
    eprintln!("Stopped {}", model);
    Ok(())
}

async fn run(command: Command, config_path: Option<&PathBuf>) -> nimrun::Result<()> {
    match command {
        Command::Models => {
            cmd_models();
            Ok(())
        }
        Command::Ps => cmd_ps(load_config(config_path)?).await,
        Command::Serve {
            model,
            offloading,
            api_key,
            hf_token,
        } => {
            let config = load_config(config_path)?;
            cmd_serve(config, model, offloading, api_key, hf_token).await
        }
        Command::Stop { model, force } => {
            cmd_stop(load_config(config_path)?, model, force).await
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli.command, cli.config.as_ref()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
