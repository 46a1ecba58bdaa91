//! Platforms, deployment target profiles and the platform policy.
//!
//! The policy decides, per platform, whether a derived image is built,
//! silently skipped, or rejected outright:
//!
//! ```text
//!   os != linux ─────────────────────────────► Reject
//!   profile = local-runtime, not runnable ───► Skip
//!   profile = restricted-amd64, arch != amd64 ► Skip
//!   arch ∉ {arm, arm64, amd64, 386} ─────────► Reject
//!   otherwise ───────────────────────────────► Build
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MkctrError, Result};

/// Architectures the compiler invocation knows how to target.
pub const SUPPORTED_ARCHITECTURES: &[&str] = &["arm", "arm64", "amd64", "386"];

/// An (OS, architecture, variant) triple as found in image descriptors.
///
/// Serialized with the OCI image-spec field names so that platforms read
/// from a base index are written back unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(rename = "os.features", default, skip_serializing_if = "Option::is_none")]
    pub os_features: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<String>>,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            ..Default::default()
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        let variant = variant.into();
        self.variant = if variant.is_empty() { None } else { Some(variant) };
        self
    }

    /// The variant, or the empty string when unset.
    pub fn variant_str(&self) -> &str {
        self.variant.as_deref().unwrap_or("")
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// Deployment context that narrows which platforms are built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetProfile {
    /// Build every supported Linux platform.
    #[default]
    None,
    /// Only linux/amd64 (hosting providers that run amd64 exclusively).
    #[serde(alias = "flyio")]
    RestrictedAmd64,
    /// Only what the invoking host can run, loaded into a local runtime.
    #[serde(alias = "local")]
    LocalRuntime,
}

impl TargetProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::RestrictedAmd64 => "restricted-amd64",
            Self::LocalRuntime => "local-runtime",
        }
    }
}

impl fmt::Display for TargetProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetProfile {
    type Err = MkctrError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "none" => Ok(Self::None),
            "restricted-amd64" | "flyio" => Ok(Self::RestrictedAmd64),
            "local-runtime" | "local" => Ok(Self::LocalRuntime),
            other => Err(MkctrError::Config(format!(
                "unsupported target {:?} (supported: none, restricted-amd64, local-runtime)",
                other
            ))),
        }
    }
}

/// Outcome of the platform policy for one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Build,
    /// Omit from the output without failing the run.
    Skip(String),
    /// Hard error.
    Reject(String),
}

impl Decision {
    pub fn is_build(&self) -> bool {
        matches!(self, Decision::Build)
    }

    /// Convert into a `Result`, treating both skip and reject as errors.
    ///
    /// Used where the base is a single image: there is nothing to fall
    /// back to, so any non-build outcome ends the run.
    pub fn into_result(self, platform: &Platform) -> Result<()> {
        match self {
            Decision::Build => Ok(()),
            Decision::Skip(reason) | Decision::Reject(reason) => {
                Err(MkctrError::PlatformRejected {
                    platform: platform.to_string(),
                    reason,
                })
            }
        }
    }
}

/// OS and architecture of the invoking machine, in image-spec naming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPlatform {
    pub os: String,
    pub architecture: String,
}

impl HostPlatform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
        }
    }

    /// Detect the host from the compile-time target.
    pub fn detect() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            other => other,
        };
        Self::new(os, architecture)
    }

    /// Whether a container of `platform` runs on this host's local runtime.
    ///
    /// Runtimes on macOS run linux/amd64 guests only.
    pub fn can_run(&self, platform: &Platform) -> bool {
        if platform.os != "linux" {
            return false;
        }
        match self.os.as_str() {
            "linux" => platform.architecture == self.architecture,
            "darwin" => platform.architecture == "amd64",
            _ => false,
        }
    }
}

/// Evaluate the platform policy against the detected host.
pub fn evaluate(platform: &Platform, profile: TargetProfile) -> Decision {
    evaluate_on(platform, profile, &HostPlatform::detect())
}

/// Evaluate the platform policy against an explicit host.
pub fn evaluate_on(platform: &Platform, profile: TargetProfile, host: &HostPlatform) -> Decision {
    if platform.os != "linux" {
        return Decision::Reject(format!("unsupported OS: {}", platform.os));
    }
    match profile {
        TargetProfile::LocalRuntime if !host.can_run(platform) => {
            return Decision::Skip(format!("not required for target {:?}", profile.as_str()));
        }
        TargetProfile::RestrictedAmd64 if platform.architecture != "amd64" => {
            return Decision::Skip(format!("not required for target {:?}", profile.as_str()));
        }
        _ => {}
    }
    if !SUPPORTED_ARCHITECTURES.contains(&platform.architecture.as_str()) {
        return Decision::Reject(format!("unsupported arch: {}", platform.architecture));
    }
    Decision::Build
}
