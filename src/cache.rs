//! Per-model cache directories.
//!
//! Each model gets `<cache_root>/<model>/<version>`, mounted into the
//! container as its weight cache. The service inside the container runs as
//! an arbitrary UID, so the directory must be world-writable.
//!
//! ## Modes
//!
//! | Mode        | Home directory            | Creation                     |
//! |-------------|---------------------------|------------------------------|
//! | Local       | `dirs::home_dir()`        | `std::fs` + `0o777`          |
//! | Indirection | `echo $HOME` in the layer | `mkdir -p` + elevated `chmod`|
//!
//! In indirection mode the cache lives on the layer's filesystem, not the
//! host's; the home directory is discovered once and reused for the
//! lifetime of the manager.

use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::exec::{CommandExecutor, ShellCommand};
use crate::models::ModelIdentity;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Creates and tracks per-model cache directories.
pub struct CacheDirectoryManager {
    executor: Arc<dyn CommandExecutor>,
    /// Explicit root from configuration.
    configured_root: Option<PathBuf>,
    /// Root resolved on first use.
    resolved_root: OnceCell<PathBuf>,
}

impl CacheDirectoryManager {
    /// Creates a manager; `cache_root` overrides the home-relative default.
    pub fn new(executor: Arc<dyn CommandExecutor>, cache_root: Option<PathBuf>) -> Self {
        Self {
            executor,
            configured_root: cache_root,
            resolved_root: OnceCell::new(),
        }
    }

    /// Returns the cache root, discovering the home directory if needed.
    pub async fn root(&self) -> Result<&Path> {
        let root = self
            .resolved_root
            .get_or_try_init(|| async {
                if let Some(root) = &self.configured_root {
                    return Ok(root.clone());
                }
                let home = self.home_dir().await?;
                Ok::<_, Error>(OrchestratorConfig::cache_root_in(&home))
            })
            .await?;
        Ok(root.as_path())
    }

    /// Computes the cache path for `model` without touching the filesystem.
    pub async fn path_for(&self, model: ModelIdentity) -> Result<PathBuf> {
        let root = self.root().await?;
        if self.executor.uses_indirection() {
            // Paths inside the layer are POSIX regardless of the host.
            let root = root.to_string_lossy();
            Ok(PathBuf::from(format!(
                "{}/{}/{}",
                root.trim_end_matches('/'),
                model.name(),
                model.version()
            )))
        } else {
            Ok(root.join(model.name()).join(model.version()))
        }
    }

    /// Ensures the cache directory for `model` exists and is world-writable.
    ///
    /// Returns immediately if the directory already exists.
    ///
    /// # Errors
    ///
    /// [`Error::DirectorySetupFailed`] if creation or the permission change
    /// fails.
    pub async fn ensure(&self, model: ModelIdentity) -> Result<PathBuf> {
        let path = self.path_for(model).await?;
        let created = if self.executor.uses_indirection() {
            self.ensure_in_layer(&path).await?
        } else {
            ensure_local(&path)?
        };

        if created {
            info!("Directory setup completed for {}: {}", model, path.display());
        } else {
            debug!("Cache directory for {} already present: {}", model, path.display());
        }
        Ok(path)
    }

    /// Discovers the home directory of whichever side runs the engine.
    async fn home_dir(&self) -> Result<PathBuf> {
        if !self.executor.uses_indirection() {
            return dirs::home_dir().ok_or_else(|| {
                Error::InvalidConfig("cannot determine home directory".to_string())
            });
        }

        let lines = self
            .executor
            .run(&ShellCommand::raw("echo $HOME"), false)
            .await?;
        let home = lines
            .iter()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
            .ok_or_else(|| {
                Error::InvalidConfig("indirection layer reported an empty $HOME".to_string())
            })?;
        debug!("Indirection layer home directory: {}", home);
        Ok(PathBuf::from(home))
    }

    /// Creates the directory inside the indirection layer.
    ///
    /// Returns false if it already existed.
    async fn ensure_in_layer(&self, path: &Path) -> Result<bool> {
        let target = path.to_string_lossy();

        match self
            .executor
            .run(&ShellCommand::new("test").arg("-d").arg(&*target), false)
            .await
        {
            Ok(_) => return Ok(false),
            Err(Error::CommandFailed { .. }) => {}
            Err(e) => return Err(e),
        }

        let setup_failed = |e: Error| Error::DirectorySetupFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        self.executor
            .run(&ShellCommand::new("mkdir").arg("-p").arg(&*target), false)
            .await
            .map_err(setup_failed)?;

        self.executor
            .run(
                &ShellCommand::new("chmod").args(["-R", "777"]).arg(&*target),
                true,
            )
            .await
            .map_err(setup_failed)?;

        Ok(true)
    }
}

/// Creates the directory on the host filesystem.
///
/// Returns false if it already existed. Only directories created by this
/// call have their permissions changed.
fn ensure_local(path: &Path) -> Result<bool> {
    if path.is_dir() {
        return Ok(false);
    }

    let mut missing = Vec::new();
    let mut current = Some(path);
    while let Some(dir) = current {
        if dir.exists() {
            break;
        }
        missing.push(dir.to_path_buf());
        current = dir.parent();
    }

    std::fs::create_dir_all(path).map_err(|e| Error::DirectorySetupFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    for dir in missing.iter().rev() {
        make_world_writable(dir)?;
    }
    Ok(true)
}

#[cfg(unix)]
fn make_world_writable(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777)).map_err(|e| {
        Error::DirectorySetupFailed {
            path: dir.to_path_buf(),
            reason: format!("chmod 777 failed: {}", e),
        }
    })
}

#[cfg(not(unix))]
fn make_world_writable(_dir: &Path) -> Result<()> {
    Ok(())
}
