//! In-memory registry, compiler and local runtime for engine tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mkctr_core::config::{BuildRequest, CompilerFlags, OutputMode, OutputRef};
use mkctr_core::error::{MkctrError, Result};
use mkctr_core::platform::{HostPlatform, Platform, TargetProfile};
use mkctr_engine::build::layer::{build_layer, LayerSpec};
use mkctr_engine::oci::image::LayerContent;
use mkctr_engine::oci::manifest::{Descriptor, IndexManifest};
use mkctr_engine::oci::media_type::{self, ImageFormat};
use mkctr_engine::publish::{ImageLoader, RuntimeDetector};
use mkctr_engine::{
    BaseImage, BaseIndex, CompileJob, Compiler, Engine, Image, ImageIndex, ImageReference,
    LocalRuntime, Registry,
};
use serde_json::json;

pub const BASE: &str = "ghcr.io/org/base:latest";
pub const OUTPUT_REPO: &str = "ghcr.io/org/app";

#[derive(Default)]
pub struct FakeRegistry {
    bases: Mutex<HashMap<String, BaseImage>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    pub pushed_images: Mutex<Vec<(String, Image)>>,
    pub pushed_indexes: Mutex<Vec<(String, ImageIndex)>>,
}

fn key(reference: &ImageReference) -> String {
    reference
        .digest
        .clone()
        .unwrap_or_else(|| reference.full_reference())
}

impl FakeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store an image fixture reachable under `reference`.
    pub fn add_image(
        &self,
        reference: &ImageReference,
        media_type: &str,
        platform: &Platform,
    ) -> Image {
        let format = ImageFormat::from_manifest_media_type(media_type).ok();
        let layer_type = format
            .map(ImageFormat::layer_media_type)
            .unwrap_or(media_type::OCI_LAYER);
        let config_type = match format {
            Some(ImageFormat::Docker) => media_type::DOCKER_CONFIG,
            _ => media_type::OCI_CONFIG,
        };

        let mut spec = LayerSpec::new();
        let dir = tempfile::TempDir::new().unwrap();
        let shell = dir.path().join("sh");
        std::fs::write(&shell, format!("shell for {}", platform)).unwrap();
        spec.add(&shell, "/bin/sh");
        let layer = build_layer(&spec, layer_type).unwrap();
        let layer_desc = layer.descriptor().unwrap();
        self.blobs
            .lock()
            .unwrap()
            .insert(layer_desc.digest.clone(), layer.compressed().unwrap().data.clone());

        let mut config = json!({
            "architecture": platform.architecture,
            "os": platform.os,
            "config": {"Env": ["PATH=/usr/bin:/bin"], "Cmd": ["/bin/sh"]},
            "rootfs": {"type": "layers", "diff_ids": [layer.diff_id()]},
            "history": [{"created_by": "base"}]
        });
        if let Some(variant) = &platform.variant {
            config["variant"] = json!(variant);
        }
        let config_raw = serde_json::to_vec(&config).unwrap();
        let config_desc = Descriptor::for_bytes(config_type, &config_raw);
        self.blobs
            .lock()
            .unwrap()
            .insert(config_desc.digest.clone(), config_raw.clone());

        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": media_type,
            "config": config_desc,
            "layers": [layer_desc],
        });
        let image = Image::from_parts(
            Some(reference.clone()),
            media_type,
            &serde_json::to_vec(&manifest).unwrap(),
            config_raw,
        )
        .unwrap();
        self.bases
            .lock()
            .unwrap()
            .insert(key(reference), BaseImage::Image(image.clone()));
        image
    }

    /// Store an index at `reference` with one image per platform.
    pub fn add_index(
        &self,
        reference: &ImageReference,
        index_type: &str,
        manifest_type: &str,
        platforms: &[Platform],
    ) -> IndexManifest {
        let mut manifest = IndexManifest::new(index_type);
        for platform in platforms {
            let placeholder = reference.with_digest(&format!("sha256:pending-{}", platform));
            let image = self.add_image(&placeholder, manifest_type, platform);
            let mut descriptor = image.descriptor().unwrap();
            descriptor.platform = Some(platform.clone());
            let entry_ref = reference.with_digest(&descriptor.digest);
            let mut bases = self.bases.lock().unwrap();
            bases.remove(&key(&placeholder));
            bases.insert(key(&entry_ref), BaseImage::Image(image));
            manifest.manifests.push(descriptor);
        }
        self.bases.lock().unwrap().insert(
            key(reference),
            BaseImage::Index(BaseIndex {
                reference: reference.clone(),
                manifest: manifest.clone(),
            }),
        );
        manifest
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn get(&self, reference: &ImageReference) -> Result<BaseImage> {
        self.bases
            .lock()
            .unwrap()
            .get(&key(reference))
            .cloned()
            .ok_or_else(|| MkctrError::Registry {
                registry: reference.registry.clone(),
                message: format!("{} not found", reference),
            })
    }

    async fn fetch_blob(&self, repository: &ImageReference, descriptor: &Descriptor) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap()
            .get(&descriptor.digest)
            .cloned()
            .ok_or_else(|| MkctrError::Registry {
                registry: repository.registry.clone(),
                message: format!("blob {} not found", descriptor.digest),
            })
    }

    async fn write_image(&self, reference: &ImageReference, image: &Image) -> Result<()> {
        self.pushed_images
            .lock()
            .unwrap()
            .push((reference.to_string(), image.clone()));
        Ok(())
    }

    async fn write_index(&self, reference: &ImageReference, index: &ImageIndex) -> Result<()> {
        self.pushed_indexes
            .lock()
            .unwrap()
            .push((reference.to_string(), index.clone()));
        Ok(())
    }
}

/// Behaviour of [`FakeCompiler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompileMode {
    #[default]
    Succeed,
    Fail,
    Hang,
}

#[derive(Default)]
pub struct FakeCompiler {
    mode: CompileMode,
    pub jobs: Mutex<Vec<CompileJob>>,
}

impl FakeCompiler {
    pub fn new(mode: CompileMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            jobs: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

#[async_trait]
impl Compiler for FakeCompiler {
    async fn compile(&self, job: &CompileJob) -> Result<PathBuf> {
        self.jobs.lock().unwrap().push(job.clone());
        match self.mode {
            CompileMode::Succeed => {
                let vars: Vec<String> = job.env.vars().iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                tokio::fs::write(&job.output, format!("{} {}", job.target, vars.join(" "))).await?;
                Ok(job.output.clone())
            }
            CompileMode::Fail => Err(MkctrError::CompileFailed {
                target: job.target.clone(),
                platform: job.platform.to_string(),
                status: "exit status: 1".to_string(),
                output: "undefined: main".to_string(),
            }),
            CompileMode::Hang => std::future::pending::<Result<PathBuf>>().await,
        }
    }
}

/// Local runtime that accepts every load and records the tag.
#[derive(Default)]
pub struct RecordingRuntime {
    pub loads: Arc<Mutex<Vec<(String, usize)>>>,
}

struct RecordingLoader {
    loads: Arc<Mutex<Vec<(String, usize)>>>,
}

#[async_trait]
impl ImageLoader for RecordingLoader {
    fn describe(&self) -> String {
        "recording".to_string()
    }

    async fn load(&self, repo_tag: &str, tarball: Vec<u8>) -> Result<()> {
        self.loads.lock().unwrap().push((repo_tag.to_string(), tarball.len()));
        Ok(())
    }
}

#[async_trait]
impl RuntimeDetector for RecordingRuntime {
    fn name(&self) -> String {
        "recording".to_string()
    }

    async fn detect(&self) -> Option<Box<dyn ImageLoader>> {
        Some(Box::new(RecordingLoader {
            loads: self.loads.clone(),
        }))
    }
}

pub fn base_ref() -> ImageReference {
    ImageReference::parse(BASE).unwrap()
}

pub fn request(target: TargetProfile, output: OutputMode) -> BuildRequest {
    BuildRequest {
        base_image: BASE.to_string(),
        artifacts: BTreeMap::from([("tool".to_string(), "/usr/bin/tool".to_string())]),
        static_files: BTreeMap::new(),
        output_refs: vec![OutputRef {
            repository: OUTPUT_REPO.to_string(),
            tag: "v1".to_string(),
        }],
        target,
        compiler: CompilerFlags::default(),
        annotations: BTreeMap::new(),
        command: Vec::new(),
        output,
    }
}

pub fn engine(registry: &Arc<FakeRegistry>, compiler: &Arc<FakeCompiler>) -> Engine {
    Engine::new(registry.clone(), compiler.clone(), LocalRuntime::new(Vec::new()))
        .with_host(HostPlatform::new("linux", "amd64"))
}

/// Regular files of the topmost layer, with their contents.
pub fn top_layer_files(image: &Image) -> Vec<(String, Vec<u8>)> {
    use std::io::Read;

    let layer = image.layers().last().unwrap();
    let LayerContent::Local(blob) = &layer.content else {
        panic!("top layer is not a built layer");
    };
    let mut archive = tar::Archive::new(blob.tar_bytes());
    let mut files = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let path = entry.path().unwrap().to_string_lossy().into_owned();
        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        files.push((path, content));
    }
    files
}
