//! Delivering an output set.
//!
//! Exactly one mode applies per run: push to registries (or load into the
//! local runtime under the `local-runtime` profile), export to a directory,
//! or nothing.

pub mod local;

use std::sync::Arc;

use mkctr_core::config::{BuildRequest, OutputMode, OutputRef};
use mkctr_core::error::{MkctrError, Result};
use mkctr_core::platform::TargetProfile;

pub use local::{CliDetector, DaemonDetector, ImageLoader, RuntimeDetector, LocalRuntime};

use crate::build::index::OutputSet;
use crate::oci::image::{Image, ImageIndex};
use crate::oci::layout::{image_tarball, prepare_directory, write_layout};
use crate::oci::reference::ImageReference;
use crate::oci::registry::Registry;

/// File name of a single-image export.
pub const IMAGE_TARBALL: &str = "image.tar";

pub struct Publisher {
    registry: Arc<dyn Registry>,
    local: LocalRuntime,
}

impl Publisher {
    pub fn new(registry: Arc<dyn Registry>, local: LocalRuntime) -> Self {
        Self { registry, local }
    }

    pub async fn deliver(&self, output: &OutputSet, request: &BuildRequest) -> Result<()> {
        let result = match output {
            OutputSet::Empty => return Ok(()),
            OutputSet::Single(result) => &result.image,
            OutputSet::Index(index) => return self.deliver_index(index, request).await,
        };
        self.deliver_image(result, request).await
    }

    async fn deliver_image(&self, image: &Image, request: &BuildRequest) -> Result<()> {
        match &request.output {
            OutputMode::Publish if request.target == TargetProfile::LocalRuntime => {
                for output_ref in &request.output_refs {
                    let repo_tag = output_ref.to_string();
                    let tarball = image_tarball(&repo_tag, image, self.registry.as_ref()).await?;
                    self.local.load(&repo_tag, tarball).await?;
                }
                Ok(())
            }
            OutputMode::Publish => {
                for output_ref in &request.output_refs {
                    let reference = to_reference(output_ref)?;
                    tracing::info!(reference = %reference, "Pushing");
                    self.registry.write_image(&reference, image).await?;
                }
                Ok(())
            }
            OutputMode::Directory(dir) => {
                let primary = primary_ref(request)?;
                prepare_directory(dir).await?;
                let tarball = image_tarball(&primary.to_string(), image, self.registry.as_ref()).await?;
                let path = dir.join(IMAGE_TARBALL);
                tokio::fs::write(&path, tarball).await.map_err(|e| MkctrError::Publish {
                    destination: path.display().to_string(),
                    message: e.to_string(),
                })?;
                tracing::info!(path = %path.display(), "Wrote image tarball");
                Ok(())
            }
            OutputMode::None => {
                tracing::info!("Not pushing or writing to file");
                Ok(())
            }
        }
    }

    async fn deliver_index(&self, index: &ImageIndex, request: &BuildRequest) -> Result<()> {
        match &request.output {
            OutputMode::Publish if request.target == TargetProfile::LocalRuntime => {
                Err(MkctrError::Config(
                    "cannot build multi-platform images for local target".to_string(),
                ))
            }
            OutputMode::Publish => {
                for output_ref in &request.output_refs {
                    let reference = to_reference(output_ref)?;
                    tracing::info!(reference = %reference, "Pushing");
                    self.registry.write_index(&reference, index).await?;
                }
                Ok(())
            }
            OutputMode::Directory(dir) => {
                prepare_directory(dir).await?;
                write_layout(dir, index, self.registry.as_ref()).await
            }
            OutputMode::None => {
                tracing::info!("Not pushing or writing to file");
                Ok(())
            }
        }
    }
}

fn to_reference(output_ref: &OutputRef) -> Result<ImageReference> {
    ImageReference::from_repo_tag(&output_ref.repository, &output_ref.tag)
}

fn primary_ref(request: &BuildRequest) -> Result<&OutputRef> {
    request
        .primary_ref()
        .ok_or_else(|| MkctrError::Config("registries and tags must be set".to_string()))
}
