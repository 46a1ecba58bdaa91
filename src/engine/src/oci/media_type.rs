//! Manifest and layer media types, grouped into image-format families.

use mkctr_core::error::{MkctrError, Result};

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Every manifest media type a base reference may resolve to.
pub const ACCEPTED_MANIFEST_TYPES: &[&str] =
    &[OCI_MANIFEST, DOCKER_MANIFEST, OCI_INDEX, DOCKER_MANIFEST_LIST];

/// Image-format family. Layers appended to an image must match its family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Oci,
    Docker,
}

impl ImageFormat {
    /// Family of an image manifest media type.
    pub fn from_manifest_media_type(media_type: &str) -> Result<Self> {
        match media_type {
            OCI_MANIFEST => Ok(Self::Oci),
            DOCKER_MANIFEST => Ok(Self::Docker),
            other => Err(MkctrError::UnsupportedMediaType(format!(
                "unknown base image media type {}, accepted types are OCI image manifest v1 ({}) and Docker image manifest v2 ({})",
                other, OCI_MANIFEST, DOCKER_MANIFEST
            ))),
        }
    }

    pub fn layer_media_type(self) -> &'static str {
        match self {
            Self::Oci => OCI_LAYER,
            Self::Docker => DOCKER_LAYER,
        }
    }

    pub fn manifest_media_type(self) -> &'static str {
        match self {
            Self::Oci => OCI_MANIFEST,
            Self::Docker => DOCKER_MANIFEST,
        }
    }

    pub fn index_media_type(self) -> &'static str {
        match self {
            Self::Oci => OCI_INDEX,
            Self::Docker => DOCKER_MANIFEST_LIST,
        }
    }
}

/// Shape of a resolved base reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Image(ImageFormat),
    Index(ImageFormat),
}

impl ManifestKind {
    pub fn classify(media_type: &str) -> Result<Self> {
        match media_type {
            OCI_MANIFEST => Ok(Self::Image(ImageFormat::Oci)),
            DOCKER_MANIFEST => Ok(Self::Image(ImageFormat::Docker)),
            OCI_INDEX => Ok(Self::Index(ImageFormat::Oci)),
            DOCKER_MANIFEST_LIST => Ok(Self::Index(ImageFormat::Docker)),
            other => Err(MkctrError::UnsupportedMediaType(format!(
                "failed to interpret base as index or image: {}",
                other
            ))),
        }
    }
}
