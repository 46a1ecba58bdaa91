//! Container registry access.
//!
//! [`Registry`] is the seam between the engine and the network; the
//! production implementation [`OciRegistry`] uses `oci-distribution`.
//! Manifests are pushed as the exact bytes that were digested so the
//! published digest equals the one logged. Local registries (loopback,
//! private addresses, `.local` hosts) are reached over plain HTTP.

use std::net::IpAddr;

use async_trait::async_trait;
use mkctr_core::config::BuildRequest;
use mkctr_core::error::{MkctrError, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};

use super::credentials::DockerConfig;
use super::image::{BaseImage, BaseIndex, Image, ImageIndex, ImageLayer};
use super::manifest::{detect_media_type, Descriptor, ImageManifest, IndexManifest};
use super::media_type::{ManifestKind, ACCEPTED_MANIFEST_TYPES};
use super::reference::ImageReference;

/// Authentication credentials for a container registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`, else anonymous.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(username), Some(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    /// Docker config entry for `registry`, then the environment, then anonymous.
    pub async fn resolve(registry: &str) -> Self {
        let found = match DockerConfig::default_path() {
            Ok(config) => config.get(registry).await,
            Err(e) => Err(e),
        };
        match found {
            Ok(Some((username, password))) => return Self::basic(username, password),
            Ok(None) => {}
            Err(e) => tracing::warn!(registry = %registry, error = %e, "Ignoring docker config"),
        }
        Self::from_env()
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Registry operations the engine depends on.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Resolve a reference to a single image or an index.
    async fn get(&self, reference: &ImageReference) -> Result<BaseImage>;

    /// Fetch a blob from the repository of `repository`.
    async fn fetch_blob(&self, repository: &ImageReference, descriptor: &Descriptor)
        -> Result<Vec<u8>>;

    /// Push an image (blobs, then manifest) under `reference`.
    async fn write_image(&self, reference: &ImageReference, image: &Image) -> Result<()>;

    /// Push every image of an index by digest, then the index under `reference`.
    async fn write_index(&self, reference: &ImageReference, index: &ImageIndex) -> Result<()>;
}

/// Registry client over the OCI distribution API.
pub struct OciRegistry {
    client: Client,
    auth_override: Option<RegistryAuth>,
    plain_http: Vec<String>,
}

impl OciRegistry {
    /// HTTPS-only client that resolves credentials per registry.
    pub fn new() -> Self {
        Self::for_registries(std::iter::empty::<&str>())
    }

    /// Client that talks plain HTTP to whichever of `registries` are local.
    ///
    /// Entries are `host[:port]` exactly as they appear in references.
    pub fn for_registries<'a>(registries: impl IntoIterator<Item = &'a str>) -> Self {
        let mut plain_http: Vec<String> = Vec::new();
        for registry in registries {
            if is_plain_http_registry(registry) && !plain_http.iter().any(|r| r == registry) {
                plain_http.push(registry.to_string());
            }
        }
        let protocol = if plain_http.is_empty() {
            ClientProtocol::Https
        } else {
            tracing::debug!(registries = ?plain_http, "Using plain HTTP for local registries");
            ClientProtocol::HttpsExcept(plain_http.clone())
        };
        let config = ClientConfig {
            protocol,
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth_override: None,
            plain_http,
        }
    }

    /// Client for the base and output registries of a build.
    pub fn for_request(request: &BuildRequest) -> Result<Self> {
        let mut registries = vec![ImageReference::parse(&request.base_image)?.registry];
        for output in &request.output_refs {
            registries.push(ImageReference::from_repo_tag(&output.repository, &output.tag)?.registry);
        }
        Ok(Self::for_registries(registries.iter().map(String::as_str)))
    }

    /// Client that uses the same credentials for every registry.
    pub fn with_auth(auth: RegistryAuth) -> Self {
        Self {
            auth_override: Some(auth),
            ..Self::new()
        }
    }

    /// Registries reached over plain HTTP.
    pub fn plain_http_registries(&self) -> &[String] {
        &self.plain_http
    }

    async fn auth_for(&self, reference: &ImageReference) -> OciRegistryAuth {
        match &self.auth_override {
            Some(auth) => auth.to_oci_auth(),
            None => RegistryAuth::resolve(&reference.registry).await.to_oci_auth(),
        }
    }

    async fn authenticate(
        &self,
        reference: &ImageReference,
        operation: RegistryOperation,
    ) -> Result<Reference> {
        let oci_ref = reference.to_oci()?;
        let auth = self.auth_for(reference).await;
        self.client
            .auth(&oci_ref, &auth, operation)
            .await
            .map_err(|e| registry_error(reference, format!("Authentication failed: {}", e)))?;
        Ok(oci_ref)
    }

    async fn push_blob(&self, oci_ref: &Reference, reference: &ImageReference, data: &[u8], digest: &str) -> Result<()> {
        tracing::debug!(digest = %digest, size = data.len(), "Pushing blob");
        self.client
            .push_blob(oci_ref, data, digest)
            .await
            .map_err(|e| publish_error(reference, format!("Failed to push blob {}: {}", digest, e)))?;
        Ok(())
    }

    async fn push_manifest(
        &self,
        oci_ref: &Reference,
        reference: &ImageReference,
        body: Vec<u8>,
        media_type: &str,
    ) -> Result<()> {
        let content_type = media_type
            .parse()
            .map_err(|_| publish_error(reference, format!("invalid media type {}", media_type)))?;
        self.client
            .push_manifest_raw(oci_ref, body, content_type)
            .await
            .map_err(|e| publish_error(reference, format!("Failed to push manifest: {}", e)))?;
        Ok(())
    }

    /// Run the uploads of a push plan in order.
    async fn execute(&self, plan: Vec<PushStep<'_>>) -> Result<()> {
        let mut session: Option<(ImageReference, Reference)> = None;
        for step in plan {
            let oci_ref = match &session {
                Some((last, oci_ref)) if *last == step.reference => oci_ref.clone(),
                _ => self.authenticate(&step.reference, RegistryOperation::Push).await?,
            };
            session = Some((step.reference.clone(), oci_ref.clone()));

            match step.upload {
                Upload::Layer(image, layer) => {
                    let data = image.layer_data(layer, self).await?;
                    self.push_blob(&oci_ref, &step.reference, &data, &layer.descriptor.digest)
                        .await?;
                }
                Upload::Config(image) => {
                    let digest = &image.manifest().config.digest;
                    self.push_blob(&oci_ref, &step.reference, image.config_raw(), digest)
                        .await?;
                }
                Upload::Manifest { body, media_type } => {
                    self.push_manifest(&oci_ref, &step.reference, body, &media_type)
                        .await?;
                }
            }
        }
        Ok(())
    }
}

impl Default for OciRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Loopback, private and `.local` registries, which serve plain HTTP.
fn is_plain_http_registry(registry: &str) -> bool {
    let host = match registry.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => registry,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host == "localhost" || host.ends_with(".localhost") || host.ends_with(".local") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => ip.is_loopback() || ip.is_private(),
        Ok(IpAddr::V6(ip)) => ip.is_loopback(),
        Err(_) => false,
    }
}

/// One upload of a push.
#[derive(Debug)]
pub(crate) enum Upload<'a> {
    Layer(&'a Image, &'a ImageLayer),
    Config(&'a Image),
    Manifest { body: Vec<u8>, media_type: String },
}

/// An upload and the reference it is pushed under.
#[derive(Debug)]
pub(crate) struct PushStep<'a> {
    pub reference: ImageReference,
    pub upload: Upload<'a>,
}

/// Layers, then config, then the manifest under `reference`.
pub(crate) fn image_push_plan<'a>(reference: &ImageReference, image: &'a Image) -> Result<Vec<PushStep<'a>>> {
    let mut plan: Vec<PushStep<'a>> = image
        .layers()
        .iter()
        .map(|layer| PushStep {
            reference: reference.clone(),
            upload: Upload::Layer(image, layer),
        })
        .collect();
    plan.push(PushStep {
        reference: reference.clone(),
        upload: Upload::Config(image),
    });
    plan.push(PushStep {
        reference: reference.clone(),
        upload: Upload::Manifest {
            body: image.raw_manifest()?,
            media_type: image.media_type().to_string(),
        },
    });
    Ok(plan)
}

/// Every image by digest in the same repository, then the index under `reference`.
pub(crate) fn index_push_plan<'a>(reference: &ImageReference, index: &'a ImageIndex) -> Result<Vec<PushStep<'a>>> {
    let mut plan = Vec::new();
    for image in &index.images {
        let child = reference.with_digest(&image.digest()?);
        plan.extend(image_push_plan(&child, image)?);
    }
    plan.push(PushStep {
        reference: reference.clone(),
        upload: Upload::Manifest {
            body: index.raw_manifest()?,
            media_type: index.media_type().to_string(),
        },
    });
    Ok(plan)
}

/// A fetched base manifest, before its config is pulled.
#[derive(Debug)]
pub(crate) enum ParsedBase {
    Index(BaseIndex),
    Image { media_type: String, manifest: ImageManifest },
}

/// Classify a raw base manifest as an index or a single image.
///
/// A document without `mediaType` is taken as an OCI index when it lists
/// `manifests`, else as an OCI image manifest.
pub(crate) fn parse_base_manifest(reference: &ImageReference, raw: &[u8]) -> Result<ParsedBase> {
    let media_type = detect_media_type(raw)?;
    match ManifestKind::classify(&media_type)? {
        ManifestKind::Index(_) => {
            let mut manifest: IndexManifest = serde_json::from_slice(raw)?;
            if manifest.media_type.is_empty() {
                manifest.media_type = media_type;
            }
            Ok(ParsedBase::Index(BaseIndex {
                reference: reference.clone(),
                manifest,
            }))
        }
        ManifestKind::Image(_) => Ok(ParsedBase::Image {
            manifest: serde_json::from_slice(raw)?,
            media_type,
        }),
    }
}

#[async_trait]
impl Registry for OciRegistry {
    async fn get(&self, reference: &ImageReference) -> Result<BaseImage> {
        let oci_ref = reference.to_oci()?;
        let auth = self.auth_for(reference).await;

        tracing::info!(reference = %reference, "Fetching base");
        let (raw, digest) = self
            .client
            .pull_manifest_raw(&oci_ref, &auth, ACCEPTED_MANIFEST_TYPES)
            .await
            .map_err(|e| registry_error(reference, format!("Failed to pull manifest: {}", e)))?;

        match parse_base_manifest(reference, &raw)? {
            ParsedBase::Index(index) => {
                tracing::debug!(reference = %reference, digest = %digest, media_type = %index.media_type(), "Resolved base index");
                Ok(BaseImage::Index(index))
            }
            ParsedBase::Image { media_type, manifest } => {
                tracing::debug!(reference = %reference, digest = %digest, media_type = %media_type, "Resolved base image");
                let config = self.fetch_blob(reference, &manifest.config).await?;
                Ok(BaseImage::Image(Image::from_parts(
                    Some(reference.clone()),
                    &media_type,
                    &raw,
                    config,
                )?))
            }
        }
    }

    async fn fetch_blob(
        &self,
        repository: &ImageReference,
        descriptor: &Descriptor,
    ) -> Result<Vec<u8>> {
        let oci_ref = self.authenticate(repository, RegistryOperation::Pull).await?;
        let oci_desc = OciDescriptor {
            media_type: descriptor.media_type.clone(),
            digest: descriptor.digest.clone(),
            size: descriptor.size,
            urls: descriptor.urls.clone(),
            annotations: None,
        };

        tracing::debug!(digest = %descriptor.digest, size = descriptor.size, "Pulling blob");
        let mut data: Vec<u8> = Vec::new();
        self.client
            .pull_blob(&oci_ref, &oci_desc, &mut data)
            .await
            .map_err(|e| {
                registry_error(
                    repository,
                    format!("Failed to pull blob {}: {}", descriptor.digest, e),
                )
            })?;
        Ok(data)
    }

    async fn write_image(&self, reference: &ImageReference, image: &Image) -> Result<()> {
        self.execute(image_push_plan(reference, image)?).await?;
        tracing::info!(reference = %reference, digest = %image.digest()?, "Pushed image");
        Ok(())
    }

    async fn write_index(&self, reference: &ImageReference, index: &ImageIndex) -> Result<()> {
        self.execute(index_push_plan(reference, index)?).await?;
        tracing::info!(reference = %reference, digest = %index.digest()?, images = index.images.len(), "Pushed index");
        Ok(())
    }
}

fn registry_error(reference: &ImageReference, message: String) -> MkctrError {
    MkctrError::Registry {
        registry: reference.registry.clone(),
        message,
    }
}

fn publish_error(reference: &ImageReference, message: String) -> MkctrError {
    MkctrError::Publish {
        destination: reference.to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::image::tests::base_image;
    use crate::oci::manifest::sha256_digest;
    use crate::oci::media_type::{DOCKER_MANIFEST, DOCKER_MANIFEST_LIST, OCI_CONFIG, OCI_INDEX, OCI_MANIFEST};
    use serde_json::json;

    #[test]
    fn test_auth_to_oci() {
        assert!(matches!(
            RegistryAuth::anonymous().to_oci_auth(),
            OciRegistryAuth::Anonymous
        ));
        assert!(matches!(
            RegistryAuth::basic("u", "p").to_oci_auth(),
            OciRegistryAuth::Basic(ref u, ref p) if u == "u" && p == "p"
        ));
        assert!(RegistryAuth::anonymous().is_anonymous());
        assert!(!RegistryAuth::basic("u", "p").is_anonymous());
    }

    #[tokio::test]
    async fn test_override_auth_applies_everywhere() {
        let registry = OciRegistry::with_auth(RegistryAuth::basic("ci", "token"));
        let reference = ImageReference::parse("ghcr.io/org/app:v1").unwrap();
        assert!(matches!(
            registry.auth_for(&reference).await,
            OciRegistryAuth::Basic(ref u, _) if u == "ci"
        ));
    }

    #[test]
    fn test_plain_http_registries() {
        assert!(is_plain_http_registry("localhost:5000"));
        assert!(is_plain_http_registry("localhost"));
        assert!(is_plain_http_registry("127.0.0.1:5000"));
        assert!(is_plain_http_registry("192.168.1.20:5000"));
        assert!(is_plain_http_registry("[::1]:5000"));
        assert!(is_plain_http_registry("registry.local:5000"));
        assert!(!is_plain_http_registry("ghcr.io"));
        assert!(!is_plain_http_registry("docker.io"));
        assert!(!is_plain_http_registry("8.8.8.8:5000"));
        assert!(!is_plain_http_registry("localhost.example.com"));
    }

    #[test]
    fn test_exceptions_keep_port() {
        let registry = OciRegistry::for_registries(["localhost:5000", "ghcr.io", "localhost:5000", "127.0.0.1"]);
        assert_eq!(registry.plain_http_registries(), ["localhost:5000", "127.0.0.1"]);
        assert!(OciRegistry::new().plain_http_registries().is_empty());
    }

    #[test]
    fn test_for_request_collects_local_registries() {
        use mkctr_core::config::{CompilerFlags, OutputMode, OutputRef};
        use mkctr_core::platform::TargetProfile;
        use std::collections::BTreeMap;

        let request = BuildRequest {
            base_image: "localhost:5000/base:latest".to_string(),
            artifacts: BTreeMap::from([("./cmd/tool".to_string(), "/usr/bin/tool".to_string())]),
            static_files: BTreeMap::new(),
            output_refs: vec![
                OutputRef {
                    repository: "ghcr.io/org/app".to_string(),
                    tag: "v1".to_string(),
                },
                OutputRef {
                    repository: "registry.local:5443/org/app".to_string(),
                    tag: "v1".to_string(),
                },
            ],
            target: TargetProfile::None,
            compiler: CompilerFlags::default(),
            annotations: BTreeMap::new(),
            command: Vec::new(),
            output: OutputMode::Publish,
        };
        let registry = OciRegistry::for_request(&request).unwrap();
        assert_eq!(
            registry.plain_http_registries(),
            ["localhost:5000", "registry.local:5443"]
        );
    }

    fn image_for(architecture: &str) -> Image {
        base_image(
            OCI_MANIFEST,
            json!({"architecture": architecture, "os": "linux", "rootfs": {"type": "layers", "diff_ids": []}}),
        )
    }

    fn kind(step: &PushStep<'_>) -> &'static str {
        match step.upload {
            Upload::Layer(..) => "layer",
            Upload::Config(_) => "config",
            Upload::Manifest { .. } => "manifest",
        }
    }

    #[test]
    fn test_image_push_order() {
        let image = image_for("amd64");
        let reference = ImageReference::parse("ghcr.io/org/app:v1").unwrap();
        let plan = image_push_plan(&reference, &image).unwrap();

        let kinds: Vec<_> = plan.iter().map(kind).collect();
        assert_eq!(kinds, ["layer", "config", "manifest"]);
        assert!(plan.iter().all(|step| step.reference == reference));
        let Upload::Manifest { body, media_type } = &plan[2].upload else {
            panic!("last upload is not the manifest");
        };
        assert_eq!(media_type, OCI_MANIFEST);
        assert_eq!(sha256_digest(body), image.digest().unwrap());
    }

    #[test]
    fn test_index_children_pushed_by_digest_first() {
        let images = vec![image_for("amd64"), image_for("arm64")];
        let mut manifest = IndexManifest::new(OCI_INDEX);
        for image in &images {
            manifest.manifests.push(image.descriptor().unwrap());
        }
        let index = ImageIndex { manifest, images };
        let reference = ImageReference::parse("ghcr.io/org/app:v1").unwrap();
        let plan = index_push_plan(&reference, &index).unwrap();

        assert_eq!(plan.len(), 7);
        let (last, children) = plan.split_last().unwrap();
        assert_eq!(last.reference, reference);
        assert!(matches!(&last.upload, Upload::Manifest { media_type, .. } if media_type == OCI_INDEX));

        for (chunk, image) in children.chunks(3).zip(&index.images) {
            let child = reference.with_digest(&image.digest().unwrap());
            assert_eq!(child.tag, None);
            assert!(chunk.iter().all(|step| step.reference == child));
            let kinds: Vec<_> = chunk.iter().map(kind).collect();
            assert_eq!(kinds, ["layer", "config", "manifest"]);
        }
    }

    #[test]
    fn test_parse_docker_list_as_index() {
        let reference = ImageReference::parse("alpine:3.19").unwrap();
        let raw = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": DOCKER_MANIFEST_LIST,
            "manifests": [{
                "mediaType": DOCKER_MANIFEST,
                "digest": "sha256:aa",
                "size": 10,
                "platform": {"architecture": "arm64", "os": "linux"}
            }]
        }))
        .unwrap();
        let ParsedBase::Index(index) = parse_base_manifest(&reference, &raw).unwrap() else {
            panic!("expected an index");
        };
        assert_eq!(index.media_type(), DOCKER_MANIFEST_LIST);
        assert_eq!(index.reference, reference);
        assert_eq!(
            index.entry_reference(&index.manifest.manifests[0]).to_string(),
            "docker.io/library/alpine@sha256:aa"
        );
    }

    #[test]
    fn test_parse_untyped_documents() {
        let reference = ImageReference::parse("ghcr.io/org/base:latest").unwrap();

        let raw = serde_json::to_vec(&json!({"schemaVersion": 2, "manifests": []})).unwrap();
        assert!(matches!(
            parse_base_manifest(&reference, &raw).unwrap(),
            ParsedBase::Index(ref index) if index.media_type() == OCI_INDEX
        ));

        let raw = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "config": {"mediaType": OCI_CONFIG, "digest": "sha256:cc", "size": 2},
            "layers": []
        }))
        .unwrap();
        let ParsedBase::Image { media_type, manifest } = parse_base_manifest(&reference, &raw).unwrap() else {
            panic!("expected an image");
        };
        assert_eq!(media_type, OCI_MANIFEST);
        assert_eq!(manifest.config.digest, "sha256:cc");
    }

    #[test]
    fn test_parse_rejects_schema1() {
        let reference = ImageReference::parse("ghcr.io/org/base:latest").unwrap();
        let raw = serde_json::to_vec(&json!({
            "schemaVersion": 1,
            "mediaType": "application/vnd.docker.distribution.manifest.v1+prettyjws"
        }))
        .unwrap();
        let err = parse_base_manifest(&reference, &raw).unwrap_err();
        assert!(matches!(err, MkctrError::UnsupportedMediaType(_)));
        assert!(err.to_string().contains("failed to interpret base as index or image"));
    }

    #[test]
    fn test_error_helpers() {
        let reference = ImageReference::parse("ghcr.io/org/app:v1").unwrap();
        assert_eq!(
            publish_error(&reference, "denied".to_string()).to_string(),
            "Publish to ghcr.io/org/app:v1 failed: denied"
        );
        assert!(matches!(
            registry_error(&reference, "x".to_string()),
            MkctrError::Registry { ref registry, .. } if registry == "ghcr.io"
        ));
    }
}
