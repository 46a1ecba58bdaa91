//! Top-level build run.
//!
//! ```text
//!   base reference ──► Registry::get
//!        │
//!        ├─ Image ──► policy (fatal) ──► assemble ──► Single
//!        │
//!        └─ Index ──► plan (skip/reject logged) ──► assemble each entry
//!                                                    └─► Empty | Single | Index
//!                                                              │
//!                                                          Publisher
//! ```

use std::sync::Arc;

use mkctr_core::config::BuildRequest;
use mkctr_core::error::{MkctrError, Result};
use mkctr_core::platform::{evaluate_on, HostPlatform};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::build::assembler::PlatformAssembler;
use crate::build::compiler::Compiler;
use crate::build::index::{assemble_output, plan_index, post_process, ImageResult, OutputSet, PlannedEntry};
use crate::oci::image::{BaseImage, BaseIndex, Image};
use crate::oci::reference::ImageReference;
use crate::oci::registry::Registry;
use crate::publish::{LocalRuntime, Publisher};

pub struct Engine {
    registry: Arc<dyn Registry>,
    compiler: Arc<dyn Compiler>,
    publisher: Publisher,
    host: HostPlatform,
}

impl Engine {
    pub fn new(registry: Arc<dyn Registry>, compiler: Arc<dyn Compiler>, local: LocalRuntime) -> Self {
        Self {
            publisher: Publisher::new(registry.clone(), local),
            registry,
            compiler,
            host: HostPlatform::detect(),
        }
    }

    /// Evaluate the `local-runtime` profile against `host` instead of this machine.
    pub fn with_host(mut self, host: HostPlatform) -> Self {
        self.host = host;
        self
    }

    /// Build and deliver.
    ///
    /// Cancelling `cancel` drops all in-flight work, which kills running
    /// compilers and removes scratch directories; nothing further is
    /// published.
    pub async fn run(&self, request: &BuildRequest, cancel: CancellationToken) -> Result<OutputSet> {
        request.validate()?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!("Build cancelled");
                Err(MkctrError::Cancelled)
            }
            result = self.build_and_deliver(request) => result,
        }
    }

    async fn build_and_deliver(&self, request: &BuildRequest) -> Result<OutputSet> {
        let output = self.build(request).await?;
        self.publisher.deliver(&output, request).await?;
        Ok(output)
    }

    /// Build without delivering.
    pub async fn build(&self, request: &BuildRequest) -> Result<OutputSet> {
        let reference = ImageReference::parse(&request.base_image)?;
        match self.registry.get(&reference).await? {
            BaseImage::Image(image) => self.build_single(image, request).await,
            BaseImage::Index(index) => self.build_index(&index, request).await,
        }
    }

    async fn build_single(&self, image: Image, request: &BuildRequest) -> Result<OutputSet> {
        let platform = image.platform_from_config().map_err(|_| {
            MkctrError::Config(format!("unknown platform for image: {}", request.base_image))
        })?;
        evaluate_on(&platform, request.target, &self.host).into_result(&platform)?;

        let span = tracing::info_span!("platform", platform = %platform);
        let image = async {
            let mut image = PlatformAssembler::new(self.compiler.as_ref(), request)
                .assemble(image, &platform)
                .await?;
            post_process(&mut image, request)?;
            tracing::info!(digest = %image.digest()?, "Image digest");
            Ok::<_, MkctrError>(image)
        }
        .instrument(span)
        .await?;

        Ok(OutputSet::Single(Box::new(ImageResult {
            platform,
            image,
            origin: None,
        })))
    }

    async fn build_index(&self, index: &BaseIndex, request: &BuildRequest) -> Result<OutputSet> {
        let planned = plan_index(index, request.target, &self.host)?;
        let mut results = Vec::with_capacity(planned.len());
        for entry in planned {
            let span = tracing::info_span!("platform", platform = %entry.platform);
            let result = self.build_entry(index, entry, request).instrument(span).await?;
            results.push(result);
        }
        assemble_output(index.media_type(), results, request)
    }

    async fn build_entry(
        &self,
        index: &BaseIndex,
        entry: PlannedEntry,
        request: &BuildRequest,
    ) -> Result<ImageResult> {
        let reference = index.entry_reference(&entry.descriptor);
        let base = match self.registry.get(&reference).await? {
            BaseImage::Image(image) => image,
            BaseImage::Index(_) => {
                return Err(MkctrError::UnsupportedMediaType(format!(
                    "index entry {} is itself an index",
                    entry.descriptor.digest
                )))
            }
        };

        tracing::info!("Building");
        let mut image = PlatformAssembler::new(self.compiler.as_ref(), request)
            .assemble(base, &entry.platform)
            .await?;
        post_process(&mut image, request)?;
        tracing::info!(digest = %image.digest()?, "New digest");

        Ok(ImageResult {
            platform: entry.platform,
            image,
            origin: Some(entry.descriptor),
        })
    }
}
