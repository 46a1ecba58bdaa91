//! Per-platform image assembly.
//!
//! For one base image and platform: compile every artifact for that
//! platform into a scratch directory, merge the binaries with the static
//! files into one layer, and append it to the base.

use std::sync::Arc;

use mkctr_core::config::BuildRequest;
use mkctr_core::error::{MkctrError, Result};
use mkctr_core::platform::Platform;

use super::compiler::{CompileJob, Compiler, TargetEnv};
use super::layer::{build_layer, LayerSpec};
use crate::oci::image::Image;

pub struct PlatformAssembler<'a> {
    compiler: &'a dyn Compiler,
    request: &'a BuildRequest,
}

impl<'a> PlatformAssembler<'a> {
    pub fn new(compiler: &'a dyn Compiler, request: &'a BuildRequest) -> Self {
        Self { compiler, request }
    }

    /// Derive the image for `platform` from `base`.
    ///
    /// The scratch directory is removed on every exit path, including
    /// cancellation (the future being dropped).
    pub async fn assemble(&self, mut base: Image, platform: &Platform) -> Result<Image> {
        // Checked before any compiler runs.
        let format = base.format()?;
        let env = TargetEnv::for_platform(platform)?;

        let workdir = tempfile::Builder::new()
            .prefix("mkctr")
            .tempdir()
            .map_err(|e| MkctrError::Other(format!("Failed to create build directory: {}", e)))?;

        let mut spec = LayerSpec::new();
        for (source, destination) in &self.request.static_files {
            spec.add(source, destination.clone());
        }
        for (i, (target, destination)) in self.request.artifacts.iter().enumerate() {
            let job = CompileJob {
                target: target.clone(),
                platform: platform.clone(),
                env: env.clone(),
                flags: self.request.compiler.clone(),
                output: workdir.path().join(format!("out-{}", i)),
            };
            let binary = self.compiler.compile(&job).await?;
            tracing::info!(package = %target, destination = %destination, "Output");
            spec.add(binary, destination.clone());
        }

        let media_type = format.layer_media_type();
        let blob = tokio::task::spawn_blocking(move || build_layer(&spec, media_type))
            .await
            .map_err(|e| MkctrError::Other(format!("Layer build task failed: {}", e)))??;
        drop(workdir);

        base.append_layer(Arc::new(blob))?;
        Ok(base)
    }
}
