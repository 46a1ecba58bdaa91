//! On-disk export formats.
//!
//! - OCI image layout for indexes: `oci-layout`, `index.json` and every blob
//!   under `blobs/sha256/`.
//! - `docker save` tarballs for single images.

use std::path::Path;

use mkctr_core::error::{MkctrError, Result};
use serde::Serialize;

use super::image::{Image, ImageIndex};
use super::registry::Registry;

const OCI_LAYOUT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

/// Write an index and all of its images as an OCI image layout.
///
/// `index.json` holds the index manifest itself, so its entries keep their
/// platforms, media types and annotations.
pub async fn write_layout(dir: &Path, index: &ImageIndex, registry: &dyn Registry) -> Result<()> {
    let blobs = dir.join("blobs").join("sha256");
    tokio::fs::create_dir_all(&blobs)
        .await
        .map_err(|e| export_error(dir, format!("Failed to create blobs directory: {}", e)))?;

    for image in &index.images {
        for layer in image.layers() {
            let data = image.layer_data(layer, registry).await?;
            write_blob(&blobs, layer.descriptor.digest_hex(), &data).await?;
        }
        write_blob(&blobs, image.manifest().config.digest_hex(), image.config_raw()).await?;
        let manifest = image.descriptor()?;
        write_blob(&blobs, manifest.digest_hex(), &image.raw_manifest()?).await?;
    }

    tokio::fs::write(dir.join("oci-layout"), OCI_LAYOUT)
        .await
        .map_err(|e| export_error(dir, format!("Failed to write oci-layout: {}", e)))?;
    tokio::fs::write(dir.join("index.json"), index.raw_manifest()?)
        .await
        .map_err(|e| export_error(dir, format!("Failed to write index.json: {}", e)))?;

    tracing::info!(path = %dir.display(), digest = %index.digest()?, "Wrote OCI layout");
    Ok(())
}

async fn write_blob(blobs: &Path, hex: &str, data: &[u8]) -> Result<()> {
    let path = blobs.join(hex);
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Ok(());
    }
    tokio::fs::write(&path, data)
        .await
        .map_err(|e| export_error(&path, format!("Failed to write blob: {}", e)))
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct TarballManifest<'a> {
    config: String,
    repo_tags: Vec<&'a str>,
    layers: Vec<String>,
}

/// Serialize an image in the `docker save` tarball format.
///
/// The archive itself is uncompressed; layers are stored compressed as
/// `<hex>.tar.gz` and the config as its digest.
pub async fn image_tarball(repo_tag: &str, image: &Image, registry: &dyn Registry) -> Result<Vec<u8>> {
    let mut layers = Vec::with_capacity(image.layers().len());
    for layer in image.layers() {
        let data = image.layer_data(layer, registry).await?;
        layers.push((format!("{}.tar.gz", layer.descriptor.digest_hex()), data));
    }
    let config_name = image.manifest().config.digest.clone();
    let manifest = serde_json::to_vec(&[TarballManifest {
        config: config_name.clone(),
        repo_tags: vec![repo_tag],
        layers: layers.iter().map(|(name, _)| name.clone()).collect(),
    }])?;

    let mut builder = tar::Builder::new(Vec::new());
    append_file(&mut builder, &config_name, image.config_raw())?;
    for (name, data) in &layers {
        append_file(&mut builder, name, data)?;
    }
    append_file(&mut builder, "manifest.json", &manifest)?;
    builder
        .into_inner()
        .map_err(|e| MkctrError::Other(format!("Failed to finalize image tarball: {}", e)))
}

fn append_file(builder: &mut tar::Builder<Vec<u8>>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_size(data.len() as u64);
    builder
        .append_data(&mut header, name, data)
        .map_err(|e| MkctrError::Other(format!("Failed to add {} to image tarball: {}", name, e)))
}

/// Create the export directory, refusing paths that exist as files.
pub async fn prepare_directory(dir: &Path) -> Result<()> {
    match tokio::fs::metadata(dir).await {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(MkctrError::Config(format!(
            "output path {} exists and is not a directory",
            dir.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| export_error(dir, format!("Failed to create directory: {}", e))),
        Err(e) => Err(export_error(dir, e.to_string())),
    }
}

fn export_error(path: &Path, message: String) -> MkctrError {
    MkctrError::Publish {
        destination: path.display().to_string(),
        message,
    }
}
