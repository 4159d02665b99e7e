//! Platform detection.
//!
//! Detects the host OS to decide whether commands must be routed through
//! the WSL indirection layer.

use crate::constants::DEFAULT_WSL_DISTRO;
use crate::exec::Indirection;

/// Detected platform information.
#[derive(Debug, Clone)]
pub struct Platform {
    /// Operating system.
    pub os: Os,
}

/// Operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
    Linux,
    Darwin,
    Windows,
    Unknown,
}

impl Platform {
    /// Detects the current platform.
    pub fn detect() -> Self {
        Self {
            os: Self::detect_os(),
        }
    }

    fn detect_os() -> Os {
        #[cfg(target_os = "linux")]
        return Os::Linux;

        #[cfg(target_os = "macos")]
        return Os::Darwin;

        #[cfg(target_os = "windows")]
        return Os::Windows;

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        return Os::Unknown;
    }

    /// Returns true if container commands must go through WSL.
    ///
    /// The GPU container stack on Windows lives inside a WSL2 distro;
    /// everywhere else the engine runs natively.
    pub fn requires_indirection(&self) -> bool {
        self.os == Os::Windows
    }

    /// Returns the indirection layer appropriate for this platform.
    pub fn default_indirection(&self) -> Option<Indirection> {
        self.requires_indirection()
            .then(|| Indirection::wsl(DEFAULT_WSL_DISTRO))
    }
}
