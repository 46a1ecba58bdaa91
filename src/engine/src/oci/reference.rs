//! Image reference parsing.
//!
//! Parses references like `ghcr.io/org/app:v1` or `alpine@sha256:...` into
//! registry, repository, tag and digest.

use mkctr_core::error::{MkctrError, Result};

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname, with port if given (e.g. "ghcr.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g. "library/alpine", "org/app")
    pub repository: String,
    pub tag: Option<String>,
    /// Content digest (e.g. "sha256:abc...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a reference string.
    ///
    /// - `alpine` → docker.io/library/alpine:latest
    /// - `org/app:v1` → docker.io/org/app:v1
    /// - `localhost:5000/app` → localhost:5000/app:latest
    /// - `ghcr.io/org/app@sha256:...` → digest only, no default tag
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(MkctrError::Config("empty image reference".to_string()));
        }

        let (name_tag, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                if !digest.contains(':') {
                    return Err(MkctrError::Config(format!(
                        "invalid digest in reference {:?}: expected algorithm:hex",
                        reference
                    )));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A tag colon can only appear in the last path component; a colon in
        // the first component of a multi-part name is a registry port.
        let last_start = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_start..].rfind(':') {
            Some(colon) => {
                let split = last_start + colon;
                (&name_tag[..split], Some(name_tag[split + 1..].to_string()))
            }
            None => (name_tag, None),
        };
        if tag.as_deref() == Some("") {
            return Err(MkctrError::Config(format!(
                "empty tag in reference {:?}",
                reference
            )));
        }

        let (registry, repository) = split_registry_repository(name)?;
        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Build a reference from an output repository and tag.
    pub fn from_repo_tag(repository: &str, tag: &str) -> Result<Self> {
        Self::parse(&format!("{}:{}", repository, tag))
    }

    /// Same repository, addressed by digest.
    pub fn with_digest(&self, digest: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_string()),
        }
    }

    /// `registry/repository`, without tag or digest.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    pub fn full_reference(&self) -> String {
        let mut s = self.name();
        if let Some(tag) = &self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }

    /// The `oci-distribution` form of this reference.
    pub fn to_oci(&self) -> Result<oci_distribution::Reference> {
        self.full_reference()
            .parse::<oci_distribution::Reference>()
            .map_err(|e| MkctrError::Config(format!("invalid reference {}: {}", self, e)))
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full_reference())
    }
}

/// The first path component is a registry when it looks like a hostname.
fn split_registry_repository(name: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(MkctrError::Config(format!(
                    "empty repository in reference {:?}",
                    name
                )));
            }
            return Ok((first.to_string(), rest.to_string()));
        }
    }
    if name.is_empty() {
        return Err(MkctrError::Config("empty repository name".to_string()));
    }
    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    Ok((DEFAULT_REGISTRY.to_string(), repository))
}
