//! Model catalogue and offloading policies.
//!
//! Every [`ModelIdentity`] maps to exactly one registry image and one
//! [`Variant`]. Both mappings are exhaustive `match`es, so adding an
//! identity without an image or variant is a compile error rather than a
//! silent fallthrough.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Model Identity
// =============================================================================

/// Supported NIM model variants.
///
/// The raw name (see [`ModelIdentity::name`]) doubles as the container name,
/// which makes it the lookup key in the engine's inventory and the target of
/// stop commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelIdentity {
    FluxDev,
    FluxDevCanny,
    FluxDevDepth,
    FluxSchnell,
    FluxKontext,
    Sd35Large,
    Sd35LargeCanny,
    Sd35LargeDepth,
}

/// Model family an identity belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFamily {
    Flux,
    StableDiffusion35,
}

/// Sub-mode passed to the container as `NIM_MODEL_VARIANT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Base,
    Canny,
    Depth,
}

impl Variant {
    /// Returns the token sent to the container.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Canny => "canny",
            Self::Depth => "depth",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ModelIdentity {
    /// All supported identities, in catalogue order.
    pub const ALL: [ModelIdentity; 8] = [
        Self::FluxDev,
        Self::FluxDevCanny,
        Self::FluxDevDepth,
        Self::FluxSchnell,
        Self::FluxKontext,
        Self::Sd35Large,
        Self::Sd35LargeCanny,
        Self::Sd35LargeDepth,
    ];

    /// Raw name, also used as the container name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::FluxDev => "flux-dev",
            Self::FluxDevCanny => "flux-dev-canny",
            Self::FluxDevDepth => "flux-dev-depth",
            Self::FluxSchnell => "flux-schnell",
            Self::FluxKontext => "flux-kontext",
            Self::Sd35Large => "sd35-large",
            Self::Sd35LargeCanny => "sd35-large-canny",
            Self::Sd35LargeDepth => "sd35-large-depth",
        }
    }

    /// Registry image reference.
    pub fn image(&self) -> &'static str {
        match self {
            Self::FluxDev | Self::FluxDevCanny | Self::FluxDevDepth => {
                "nvcr.io/nim/black-forest-labs/flux.1-dev:1.0.0"
            }
            Self::FluxSchnell => "nvcr.io/nim/black-forest-labs/flux.1-schnell:1.0.0",
            Self::FluxKontext => "nvcr.io/nim/black-forest-labs/flux.1-kontext-dev:1.0.0",
            Self::Sd35Large | Self::Sd35LargeCanny | Self::Sd35LargeDepth => {
                "nvcr.io/nim/stabilityai/stable-diffusion-3.5-large:1.0.0"
            }
        }
    }

    /// Variant tag selecting the sub-mode inside a shared image.
    pub fn variant(&self) -> Variant {
        match self {
            Self::FluxDev | Self::FluxSchnell | Self::FluxKontext | Self::Sd35Large => {
                Variant::Base
            }
            Self::FluxDevCanny | Self::Sd35LargeCanny => Variant::Canny,
            Self::FluxDevDepth | Self::Sd35LargeDepth => Variant::Depth,
        }
    }

    /// Model family.
    pub fn family(&self) -> ModelFamily {
        match self {
            Self::FluxDev
            | Self::FluxDevCanny
            | Self::FluxDevDepth
            | Self::FluxSchnell
            | Self::FluxKontext => ModelFamily::Flux,
            Self::Sd35Large | Self::Sd35LargeCanny | Self::Sd35LargeDepth => {
                ModelFamily::StableDiffusion35
            }
        }
    }

    /// Image tag, used as the version component of the cache path.
    ///
    /// Falls back to `latest` for untagged references.
    pub fn version(&self) -> &'static str {
        image_tag(self.image()).unwrap_or("latest")
    }
}

/// Extracts the tag from an image reference, ignoring registry ports.
fn image_tag(reference: &str) -> Option<&str> {
    let last_segment = reference.rsplit('/').next()?;
    last_segment.split_once(':').map(|(_, tag)| tag)
}

impl fmt::Display for ModelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelIdentity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|m| m.name() == wanted)
            .ok_or_else(|| Error::UnknownModel(s.to_string()))
    }
}

// =============================================================================
// Offloading Policy
// =============================================================================

/// Where the service spills model weights when GPU memory runs short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffloadingPolicy {
    None,
    SystemRam,
    Disk,
    #[default]
    Default,
}

impl OffloadingPolicy {
    /// Lowercase, underscore-joined token sent to the container.
    pub fn as_token(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::SystemRam => "system_ram",
            Self::Disk => "disk",
            Self::Default => "default",
        }
    }
}

impl fmt::Display for OffloadingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_token())
    }
}

impl FromStr for OffloadingPolicy {
    type Err = Error;

    /// Accepts the token as well as display-style spellings
    /// such as `System RAM` or `system-ram`.
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .trim()
            .chars()
            .map(|c| match c {
                ' ' | '-' => '_',
                c => c.to_ascii_lowercase(),
            })
            .collect();
        match normalized.as_str() {
            "none" => Ok(Self::None),
            "system_ram" => Ok(Self::SystemRam),
            "disk" => Ok(Self::Disk),
            "default" => Ok(Self::Default),
            _ => Err(Error::UnknownOffloadingPolicy(s.to_string())),
        }
    }
}
