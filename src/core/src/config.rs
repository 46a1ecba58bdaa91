//! Build request configuration.
//!
//! A [`BuildRequest`] is assembled once from caller input (flags and an
//! optional build file), validated, and then shared read-only by the whole
//! run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{MkctrError, Result};
use crate::platform::TargetProfile;

/// Where the assembled image or index is delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputMode {
    /// Build only; log that nothing was delivered.
    #[default]
    None,
    /// Push to every output reference (or load into the local runtime
    /// under the `local-runtime` profile).
    Publish,
    /// Write an OCI layout (index) or `image.tar` (single image).
    Directory(PathBuf),
}

/// A repository/tag pair the result is published under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    pub repository: String,
    pub tag: String,
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// Flags forwarded verbatim to the compiler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerFlags {
    /// Link flags (`--ldflags`)
    #[serde(default)]
    pub ldflags: String,
    /// Build tags (`--tags`)
    #[serde(default)]
    pub tags: String,
    /// Verbose compiler output
    #[serde(default)]
    pub verbose: bool,
}

/// Immutable configuration for one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Base image or index reference
    pub base_image: String,

    /// Compiled artifacts: build target → path inside the image
    pub artifacts: BTreeMap<String, String>,

    /// Static files: path on disk → path inside the image
    pub static_files: BTreeMap<String, String>,

    /// Output references (repository × tag)
    pub output_refs: Vec<OutputRef>,

    /// Deployment target profile
    pub target: TargetProfile,

    /// Compiler flags
    pub compiler: CompilerFlags,

    /// OCI annotations applied to manifests and indexes
    pub annotations: BTreeMap<String, String>,

    /// Replacement for the image's default command
    pub command: Vec<String>,

    /// Delivery mode
    pub output: OutputMode,
}

impl BuildRequest {
    /// Check the request before any build work starts.
    pub fn validate(&self) -> Result<()> {
        if self.base_image.trim().is_empty() {
            return Err(MkctrError::Config("base image must be set".to_string()));
        }
        if self.output_refs.is_empty() {
            return Err(MkctrError::Config(
                "registries and tags must be set".to_string(),
            ));
        }
        if self.artifacts.is_empty() && self.static_files.is_empty() {
            return Err(MkctrError::Config(
                "at least one of --files or --gopaths must be set".to_string(),
            ));
        }
        for dst in self.artifacts.values().chain(self.static_files.values()) {
            if dst.trim().is_empty() {
                return Err(MkctrError::Config(
                    "destination path must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// The reference used for single-file exports and local loads.
    pub fn primary_ref(&self) -> Option<&OutputRef> {
        self.output_refs.first()
    }
}

/// Build settings read from a YAML or JSON file.
///
/// Every field is optional; command-line flags take precedence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildFile {
    pub base: Option<String>,
    pub gopaths: BTreeMap<String, String>,
    pub files: BTreeMap<String, String>,
    pub repos: Vec<String>,
    pub tags: Vec<String>,
    pub target: Option<TargetProfile>,
    pub ldflags: Option<String>,
    pub gotags: Option<String>,
    pub annotations: BTreeMap<String, String>,
    pub cmd: Vec<String>,
}

impl BuildFile {
    /// Load a build file; `.json` is parsed as JSON, anything else as YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MkctrError::Config(format!(
                "Failed to read build file {}: {}",
                path.display(),
                e
            ))
        })?;
        let file = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };
        Ok(file)
    }
}

/// Parse a comma-separated list of `src:dst` pairs.
pub fn parse_file_map(s: &str) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    if s.trim().is_empty() {
        return Ok(map);
    }
    for field in s.split(',') {
        let field = field.trim();
        let parts: Vec<&str> = field.split(':').collect();
        if parts.len() != 2 {
            return Err(MkctrError::Config(format!(
                "unparseable file field {:?}",
                field
            )));
        }
        map.insert(parts[0].to_string(), parts[1].to_string());
    }
    Ok(map)
}

/// Parse comma-separated `key=value` annotations.
///
/// Pairs without `=`, with an empty key, or with an empty value are dropped.
pub fn parse_annotations(s: &str) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    for pair in s.split(',') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || value.is_empty() {
            tracing::warn!(annotation = %pair, "Ignoring annotation without key or value");
            continue;
        }
        annotations.insert(key.to_string(), value.to_string());
    }
    annotations
}

/// Split a comma-separated list, dropping blank entries.
pub fn parse_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Every repository paired with every tag.
pub fn output_refs(repos: &[String], tags: &[String]) -> Vec<OutputRef> {
    repos
        .iter()
        .flat_map(|repository| {
            tags.iter().map(move |tag| OutputRef {
                repository: repository.clone(),
                tag: tag.clone(),
            })
        })
        .collect()
}
