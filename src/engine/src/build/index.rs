//! Index assembly.
//!
//! Planning runs the platform policy over every entry of a base index
//! before anything is compiled; assembly turns the per-platform results
//! into an [`OutputSet`].

use mkctr_core::config::BuildRequest;
use mkctr_core::error::{MkctrError, Result};
use mkctr_core::platform::{evaluate_on, Decision, HostPlatform, Platform, TargetProfile};

use crate::oci::image::{BaseIndex, Image, ImageIndex};
use crate::oci::manifest::{Descriptor, IndexManifest};

/// An index entry that passed the platform policy.
#[derive(Debug, Clone)]
pub struct PlannedEntry {
    pub platform: Platform,
    pub descriptor: Descriptor,
}

/// One derived image with the metadata of the base entry it came from.
#[derive(Debug, Clone)]
pub struct ImageResult {
    pub platform: Platform,
    pub image: Image,
    /// Base index entry; `None` when the base was a single image.
    pub origin: Option<Descriptor>,
}

/// What a run delivers.
#[derive(Debug, Clone)]
pub enum OutputSet {
    Empty,
    Single(Box<ImageResult>),
    Index(ImageIndex),
}

impl OutputSet {
    pub fn is_empty(&self) -> bool {
        matches!(self, OutputSet::Empty)
    }
}

/// Select the entries of `index` to build, in index order.
///
/// Skipped and rejected platforms are logged and left out. Under the
/// `local-runtime` profile more than one survivor is a configuration error.
pub fn plan_index(
    index: &BaseIndex,
    profile: TargetProfile,
    host: &HostPlatform,
) -> Result<Vec<PlannedEntry>> {
    let mut planned = Vec::new();
    for entry in &index.manifest.manifests {
        let platform = entry.platform.clone().ok_or_else(|| {
            MkctrError::Config(format!("unknown platform for image: {}", index.reference))
        })?;
        match evaluate_on(&platform, profile, host) {
            Decision::Build => {
                tracing::info!(platform = %platform, digest = %entry.digest, "Base digest");
                planned.push(PlannedEntry {
                    platform,
                    descriptor: entry.clone(),
                });
            }
            Decision::Skip(reason) | Decision::Reject(reason) => {
                tracing::info!(platform = %platform, reason = %reason, "Skipping");
            }
        }
    }
    if profile == TargetProfile::LocalRuntime && planned.len() > 1 {
        return Err(MkctrError::Config(
            "cannot build multi-platform images for local target".to_string(),
        ));
    }
    Ok(planned)
}

/// Apply request annotations and the command override to a derived image.
pub fn post_process(image: &mut Image, request: &BuildRequest) -> Result<()> {
    if !request.annotations.is_empty() {
        image.add_annotations(&request.annotations);
    }
    if !request.command.is_empty() {
        image.set_command(&request.command)?;
    }
    Ok(())
}

/// Turn index results into an output set.
///
/// No results is a no-op, one result is delivered as a plain image, and
/// several are listed in a new index of `media_type`. Entries keep their
/// base URLs, platform and annotations; request annotations are merged into
/// each entry and into the index.
pub fn assemble_output(
    media_type: &str,
    results: Vec<ImageResult>,
    request: &BuildRequest,
) -> Result<OutputSet> {
    match results.len() {
        0 => {
            tracing::info!("No images");
            return Ok(OutputSet::Empty);
        }
        1 => {
            let mut results = results;
            let result = results.remove(0);
            tracing::info!(platform = %result.platform, digest = %result.image.digest()?, "Image digest");
            return Ok(OutputSet::Single(Box::new(result)));
        }
        _ => {}
    }

    if request.target == TargetProfile::LocalRuntime {
        return Err(MkctrError::Config(
            "cannot build multi-platform images for local target".to_string(),
        ));
    }

    let mut manifest = IndexManifest::new(media_type);
    let mut images = Vec::with_capacity(results.len());
    for result in results {
        let mut descriptor = result.image.descriptor()?;
        if let Some(origin) = &result.origin {
            descriptor.media_type = origin.media_type.clone();
            descriptor.urls = origin.urls.clone();
            descriptor.annotations = origin.annotations.clone();
        }
        descriptor.platform = Some(result.platform.clone());
        for (key, value) in &request.annotations {
            descriptor.annotations.insert(key.clone(), value.clone());
        }
        manifest.manifests.push(descriptor);
        images.push(result.image);
    }

    let mut index = ImageIndex { manifest, images };
    index.add_annotations(&request.annotations);
    tracing::info!(digest = %index.digest()?, entries = index.images.len(), "Index digest");
    Ok(OutputSet::Index(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::image::tests::base_image;
    use crate::oci::media_type::{DOCKER_MANIFEST, DOCKER_MANIFEST_LIST, OCI_INDEX, OCI_MANIFEST};
    use crate::oci::reference::ImageReference;
    use mkctr_core::config::{CompilerFlags, OutputMode, OutputRef};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn request(target: TargetProfile) -> BuildRequest {
        BuildRequest {
            base_image: "ghcr.io/org/base:latest".to_string(),
            artifacts: BTreeMap::from([("./cmd/tool".to_string(), "/usr/bin/tool".to_string())]),
            static_files: BTreeMap::new(),
            output_refs: vec![OutputRef {
                repository: "ghcr.io/org/app".to_string(),
                tag: "v1".to_string(),
            }],
            target,
            compiler: CompilerFlags::default(),
            annotations: BTreeMap::new(),
            command: Vec::new(),
            output: OutputMode::None,
        }
    }

    fn entry(os: &str, arch: &str, variant: &str) -> Descriptor {
        Descriptor {
            media_type: DOCKER_MANIFEST.to_string(),
            digest: format!("sha256:{}{}{}", os, arch, variant),
            size: 10,
            urls: None,
            annotations: BTreeMap::new(),
            platform: Some(Platform::new(os, arch).with_variant(variant)),
            extra: BTreeMap::new(),
        }
    }

    fn index(entries: Vec<Descriptor>) -> BaseIndex {
        let mut manifest = IndexManifest::new(DOCKER_MANIFEST_LIST);
        manifest.manifests = entries;
        BaseIndex {
            reference: ImageReference::parse("ghcr.io/org/base:latest").unwrap(),
            manifest,
        }
    }

    fn result(arch: &str, origin: Option<Descriptor>) -> ImageResult {
        ImageResult {
            platform: Platform::new("linux", arch),
            image: base_image(OCI_MANIFEST, json!({"os": "linux", "architecture": arch})),
            origin,
        }
    }

    #[test]
    fn test_plan_restricted_keeps_only_amd64() {
        let base = index(vec![
            entry("linux", "amd64", ""),
            entry("linux", "arm64", ""),
            entry("linux", "arm", "v7"),
            entry("windows", "amd64", ""),
        ]);
        let planned = plan_index(
            &base,
            TargetProfile::RestrictedAmd64,
            &HostPlatform::new("linux", "amd64"),
        )
        .unwrap();
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].platform.to_string(), "linux/amd64");
    }

    #[test]
    fn test_plan_keeps_index_order_and_drops_rejects() {
        let base = index(vec![
            entry("linux", "arm64", ""),
            entry("linux", "s390x", ""),
            entry("linux", "amd64", ""),
        ]);
        let planned = plan_index(&base, TargetProfile::None, &HostPlatform::new("linux", "amd64")).unwrap();
        let names: Vec<String> = planned.iter().map(|p| p.platform.to_string()).collect();
        assert_eq!(names, vec!["linux/arm64", "linux/amd64"]);
    }

    #[test]
    fn test_plan_entry_without_platform_errors() {
        let mut e = entry("linux", "amd64", "");
        e.platform = None;
        let err = plan_index(&index(vec![e]), TargetProfile::None, &HostPlatform::new("linux", "amd64"))
            .unwrap_err();
        assert!(matches!(err, MkctrError::Config(_)));
    }

    #[test]
    fn test_plan_local_runtime_multiple_survivors_fails() {
        let base = index(vec![entry("linux", "amd64", ""), entry("linux", "amd64", "v3")]);
        let err = plan_index(
            &base,
            TargetProfile::LocalRuntime,
            &HostPlatform::new("linux", "amd64"),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: cannot build multi-platform images for local target"
        );
    }

    #[test]
    fn test_zero_results_is_empty() {
        let out = assemble_output(OCI_INDEX, Vec::new(), &request(TargetProfile::None)).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_one_result_is_plain_image() {
        let out = assemble_output(
            OCI_INDEX,
            vec![result("amd64", Some(entry("linux", "amd64", "")))],
            &request(TargetProfile::None),
        )
        .unwrap();
        assert!(matches!(out, OutputSet::Single(_)));
    }

    #[test]
    fn test_many_results_build_index_with_base_media_type() {
        let mut amd = entry("linux", "amd64", "");
        amd.urls = Some(vec!["https://mirror.example/x".to_string()]);
        amd.annotations.insert("base".to_string(), "kept".to_string());

        let mut req = request(TargetProfile::None);
        req.annotations.insert("org.opencontainers.image.source".to_string(), "https://x".to_string());

        let out = assemble_output(
            DOCKER_MANIFEST_LIST,
            vec![
                result("amd64", Some(amd)),
                result("arm64", Some(entry("linux", "arm64", ""))),
            ],
            &req,
        )
        .unwrap();
        let OutputSet::Index(index) = out else {
            panic!("expected an index");
        };
        assert_eq!(index.media_type(), DOCKER_MANIFEST_LIST);
        assert_eq!(index.manifest.manifests.len(), 2);

        let first = &index.manifest.manifests[0];
        assert_eq!(first.media_type, DOCKER_MANIFEST);
        assert_eq!(first.urls.as_ref().unwrap()[0], "https://mirror.example/x");
        assert_eq!(first.annotations["base"], "kept");
        assert_eq!(first.annotations["org.opencontainers.image.source"], "https://x");
        assert_eq!(first.digest, index.images[0].digest().unwrap());
        assert_eq!(first.platform.as_ref().unwrap().to_string(), "linux/amd64");
        assert_eq!(index.manifest.annotations["org.opencontainers.image.source"], "https://x");
    }

    #[test]
    fn test_post_process() {
        let mut image = base_image(OCI_MANIFEST, json!({"os": "linux", "architecture": "amd64"}));
        let mut req = request(TargetProfile::None);
        req.annotations.insert("a".to_string(), "b".to_string());
        req.command = vec!["/usr/bin/tool".to_string()];
        post_process(&mut image, &req).unwrap();
        assert_eq!(image.manifest().annotations["a"], "b");
        assert_eq!(image.config()["config"]["Cmd"], json!(["/usr/bin/tool"]));
    }
}
