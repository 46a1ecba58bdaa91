//! In-memory images and indexes.
//!
//! An [`Image`] pairs a manifest with its parsed config. Base layers stay
//! in the registry they came from; appended layers are held locally until
//! the image is published or exported.

use std::collections::BTreeMap;
use std::sync::Arc;

use mkctr_core::error::{MkctrError, Result};
use mkctr_core::platform::Platform;
use serde_json::{json, Value};

use super::manifest::{sha256_digest, Descriptor, ImageManifest, IndexManifest};
use super::media_type::ImageFormat;
use super::reference::ImageReference;
use super::registry::Registry;
use crate::build::layer::LayerBlob;

/// Creation time recorded for appended layers.
const ZERO_TIME: &str = "0001-01-01T00:00:00Z";

/// Where a layer's bytes live.
#[derive(Debug, Clone)]
pub enum LayerContent {
    /// In the source repository of the image.
    Remote,
    /// Built by this process.
    Local(Arc<LayerBlob>),
}

#[derive(Debug, Clone)]
pub struct ImageLayer {
    pub descriptor: Descriptor,
    pub content: LayerContent,
}

/// A single-platform image.
#[derive(Debug, Clone)]
pub struct Image {
    source: Option<ImageReference>,
    manifest: ImageManifest,
    config: Value,
    config_raw: Vec<u8>,
    layers: Vec<ImageLayer>,
}

impl Image {
    /// Build from a fetched manifest and config blob.
    ///
    /// `media_type` is the declared manifest type, used when the document
    /// itself omits it.
    pub fn from_parts(
        source: Option<ImageReference>,
        media_type: &str,
        manifest_raw: &[u8],
        config_raw: Vec<u8>,
    ) -> Result<Self> {
        let mut manifest: ImageManifest = serde_json::from_slice(manifest_raw)?;
        if manifest.media_type.is_empty() {
            manifest.media_type = media_type.to_string();
        }
        let digest = sha256_digest(&config_raw);
        if digest != manifest.config.digest {
            return Err(MkctrError::Other(format!(
                "config digest mismatch: manifest says {}, content is {}",
                manifest.config.digest, digest
            )));
        }
        let config: Value = serde_json::from_slice(&config_raw)?;
        let layers = manifest
            .layers
            .iter()
            .map(|descriptor| ImageLayer {
                descriptor: descriptor.clone(),
                content: LayerContent::Remote,
            })
            .collect();
        Ok(Self {
            source,
            manifest,
            config,
            config_raw,
            layers,
        })
    }

    /// Repository holding the base layers.
    pub fn source(&self) -> Option<&ImageReference> {
        self.source.as_ref()
    }

    pub fn manifest(&self) -> &ImageManifest {
        &self.manifest
    }

    pub fn media_type(&self) -> &str {
        &self.manifest.media_type
    }

    pub fn format(&self) -> Result<ImageFormat> {
        ImageFormat::from_manifest_media_type(&self.manifest.media_type)
    }

    pub fn config(&self) -> &Value {
        &self.config
    }

    pub fn config_raw(&self) -> &[u8] {
        &self.config_raw
    }

    pub fn layers(&self) -> &[ImageLayer] {
        &self.layers
    }

    /// Serialized manifest.
    pub fn raw_manifest(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.manifest)?)
    }

    pub fn digest(&self) -> Result<String> {
        Ok(sha256_digest(&self.raw_manifest()?))
    }

    /// Descriptor of the manifest itself.
    pub fn descriptor(&self) -> Result<Descriptor> {
        Ok(Descriptor::for_bytes(
            self.manifest.media_type.clone(),
            &self.raw_manifest()?,
        ))
    }

    /// Platform recorded in the image config.
    pub fn platform_from_config(&self) -> Result<Platform> {
        let field = |name: &str| {
            self.config
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let (os, architecture) = (field("os"), field("architecture"));
        if os.is_empty() || architecture.is_empty() {
            return Err(MkctrError::Config("unknown platform for image".to_string()));
        }
        Ok(Platform::new(os, architecture).with_variant(field("variant")))
    }

    /// Append a locally built layer on top of the existing ones.
    ///
    /// The layer's media type must belong to the image's format family.
    pub fn append_layer(&mut self, blob: Arc<LayerBlob>) -> Result<()> {
        let expected = self.format()?.layer_media_type();
        if blob.media_type() != expected {
            return Err(MkctrError::UnsupportedMediaType(format!(
                "layer media type {} cannot be appended to a {} image (expected {})",
                blob.media_type(),
                self.manifest.media_type,
                expected
            )));
        }
        let descriptor = blob.descriptor()?;

        let config = self.config_object()?;
        let rootfs = config
            .entry("rootfs")
            .or_insert_with(|| json!({"type": "layers"}));
        if !rootfs.is_object() {
            *rootfs = json!({"type": "layers"});
        }
        if !rootfs.get("diff_ids").is_some_and(Value::is_array) {
            rootfs["diff_ids"] = json!([]);
        }
        if let Some(diff_ids) = rootfs["diff_ids"].as_array_mut() {
            diff_ids.push(Value::from(blob.diff_id()));
        }
        let history = config.entry("history").or_insert_with(|| json!([]));
        if let Some(history) = history.as_array_mut() {
            history.push(json!({"created": ZERO_TIME, "created_by": "mkctr"}));
        }

        self.manifest.layers.push(descriptor.clone());
        self.layers.push(ImageLayer {
            descriptor,
            content: LayerContent::Local(blob),
        });
        self.sync_config()
    }

    /// Merge annotations into the manifest; given values win.
    pub fn add_annotations(&mut self, annotations: &BTreeMap<String, String>) {
        for (key, value) in annotations {
            self.manifest.annotations.insert(key.clone(), value.clone());
        }
    }

    /// Replace the default command (`config.Cmd`).
    pub fn set_command(&mut self, command: &[String]) -> Result<()> {
        let config = self.config_object()?;
        let runtime = config.entry("config").or_insert_with(|| json!({}));
        if !runtime.is_object() {
            *runtime = json!({});
        }
        runtime["Cmd"] = json!(command);
        self.sync_config()
    }

    fn config_object(&mut self) -> Result<&mut serde_json::Map<String, Value>> {
        self.config
            .as_object_mut()
            .ok_or_else(|| MkctrError::Serialization("image config is not an object".to_string()))
    }

    fn sync_config(&mut self) -> Result<()> {
        self.config_raw = serde_json::to_vec(&self.config)?;
        self.manifest.config.digest = sha256_digest(&self.config_raw);
        self.manifest.config.size = self.config_raw.len() as i64;
        Ok(())
    }

    /// Compressed bytes of one of this image's layers.
    pub async fn layer_data(&self, layer: &ImageLayer, registry: &dyn Registry) -> Result<Vec<u8>> {
        match &layer.content {
            LayerContent::Local(blob) => Ok(blob.compressed()?.data.clone()),
            LayerContent::Remote => {
                let source = self.source.as_ref().ok_or_else(|| {
                    MkctrError::Other(format!(
                        "layer {} has no source repository",
                        layer.descriptor.digest
                    ))
                })?;
                registry.fetch_blob(source, &layer.descriptor).await
            }
        }
    }
}

/// A resolved base reference.
#[derive(Debug, Clone)]
pub enum BaseImage {
    Image(Image),
    Index(BaseIndex),
}

/// A multi-platform base whose entries are fetched on demand.
#[derive(Debug, Clone)]
pub struct BaseIndex {
    pub reference: ImageReference,
    pub manifest: IndexManifest,
}

impl BaseIndex {
    pub fn media_type(&self) -> &str {
        &self.manifest.media_type
    }

    /// Reference to one entry by digest.
    pub fn entry_reference(&self, entry: &Descriptor) -> ImageReference {
        self.reference.with_digest(&entry.digest)
    }
}

/// An assembled index together with the images it lists.
#[derive(Debug, Clone)]
pub struct ImageIndex {
    pub manifest: IndexManifest,
    pub images: Vec<Image>,
}

impl ImageIndex {
    pub fn media_type(&self) -> &str {
        &self.manifest.media_type
    }

    pub fn raw_manifest(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.manifest)?)
    }

    pub fn digest(&self) -> Result<String> {
        Ok(sha256_digest(&self.raw_manifest()?))
    }

    pub fn descriptor(&self) -> Result<Descriptor> {
        Ok(Descriptor::for_bytes(
            self.manifest.media_type.clone(),
            &self.raw_manifest()?,
        ))
    }

    /// Merge annotations into the index manifest; given values win.
    pub fn add_annotations(&mut self, annotations: &BTreeMap<String, String>) {
        for (key, value) in annotations {
            self.manifest.annotations.insert(key.clone(), value.clone());
        }
    }
}
