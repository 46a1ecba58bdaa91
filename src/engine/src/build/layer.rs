//! Reproducible filesystem layers.
//!
//! A [`LayerSpec`] maps source paths on disk to destinations inside the
//! image. [`build_layer`] expands it into a sorted set of tar entries with
//! fixed metadata (mode `0555`, zero mtime, root ownership), so the blob
//! depends only on file contents and destination paths.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use flate2::write::GzEncoder;
use flate2::Compression;
use mkctr_core::error::{MkctrError, Result};

use crate::oci::manifest::{sha256_digest, Descriptor};

/// Permission bits for every entry: readable and executable, never writable.
pub const ENTRY_MODE: u32 = 0o555;

/// Source → destination mappings for one layer.
#[derive(Debug, Clone, Default)]
pub struct LayerSpec {
    mappings: Vec<(PathBuf, String)>,
}

impl LayerSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a file or directory on disk to a path inside the image.
    pub fn add(&mut self, source: impl Into<PathBuf>, destination: impl Into<String>) {
        self.mappings.push((source.into(), destination.into()));
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

#[derive(Debug, PartialEq)]
enum Entry {
    Dir,
    File { source: PathBuf, size: u64 },
}

/// Resolved layer contents keyed by archive path (no leading slash).
#[derive(Debug, Default)]
struct Plan {
    entries: BTreeMap<String, Entry>,
}

impl Plan {
    fn add_dir(&mut self, path: &str) -> Result<()> {
        if path.is_empty() {
            return Ok(());
        }
        self.add_ancestors(path)?;
        match self.entries.get(path) {
            Some(Entry::Dir) => Ok(()),
            Some(Entry::File { .. }) => Err(MkctrError::LayerConflict(format!("/{}", path))),
            None => {
                tracing::debug!(path = %path, "Creating directory");
                self.entries.insert(path.to_string(), Entry::Dir);
                Ok(())
            }
        }
    }

    fn add_file(&mut self, path: &str, source: &Path, size: u64) -> Result<()> {
        if path.is_empty() {
            return Err(MkctrError::Config(format!(
                "cannot place file {} at the image root",
                source.display()
            )));
        }
        self.add_ancestors(path)?;
        if self.entries.contains_key(path) {
            return Err(MkctrError::LayerConflict(format!("/{}", path)));
        }
        tracing::debug!(source = %source.display(), destination = %path, "Copying file");
        self.entries.insert(
            path.to_string(),
            Entry::File {
                source: source.to_path_buf(),
                size,
            },
        );
        Ok(())
    }

    fn add_ancestors(&mut self, path: &str) -> Result<()> {
        let mut end = 0;
        while let Some(pos) = path[end..].find('/') {
            let dir = &path[..end + pos];
            match self.entries.get(dir) {
                Some(Entry::Dir) => {}
                Some(Entry::File { .. }) => {
                    return Err(MkctrError::LayerConflict(format!("/{}", dir)))
                }
                None => {
                    tracing::debug!(path = %dir, "Creating directory");
                    self.entries.insert(dir.to_string(), Entry::Dir);
                }
            }
            end += pos + 1;
        }
        Ok(())
    }

    fn add_source(&mut self, source: &Path, destination: &str) -> Result<()> {
        let metadata = std::fs::metadata(source).map_err(|e| layer_io(source, e))?;
        if metadata.is_dir() {
            self.add_dir(destination)?;
            self.walk(source, destination)
        } else {
            self.add_file(destination, source, metadata.len())
        }
    }

    fn walk(&mut self, dir: &Path, destination: &str) -> Result<()> {
        let mut children = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(|e| layer_io(dir, e))? {
            let entry = entry.map_err(|e| layer_io(dir, e))?;
            children.push(entry.path());
        }
        children.sort();

        for child in children {
            let Some(name) = child.file_name().and_then(|n| n.to_str()) else {
                return Err(MkctrError::Config(format!(
                    "non UTF-8 file name under {}",
                    dir.display()
                )));
            };
            let target = join(destination, name);
            self.add_source(&child, &target)?;
        }
        Ok(())
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

fn layer_io(path: &Path, source: io::Error) -> MkctrError {
    MkctrError::LayerIo {
        path: path.display().to_string(),
        source,
    }
}

/// Normalize an image path to archive form: no leading slash, no `.` parts.
pub fn archive_path(destination: &str) -> Result<String> {
    let mut parts = Vec::new();
    for component in Path::new(destination).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part),
                None => {
                    return Err(MkctrError::Config(format!(
                        "destination {:?} is not valid UTF-8",
                        destination
                    )))
                }
            },
            Component::ParentDir | Component::Prefix(_) => {
                return Err(MkctrError::Config(format!(
                    "destination {:?} must not contain '..'",
                    destination
                )))
            }
        }
    }
    Ok(parts.join("/"))
}

/// Reader that fails when the source does not hold exactly `remaining` bytes.
struct SizedReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> Read for SizedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.remaining == 0 {
            let mut peek = [0u8; 1];
            return match self.inner.read(&mut peek)? {
                0 => Ok(0),
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "file grew while being archived",
                )),
            };
        }
        let limit = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..limit])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file shrank while being archived",
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

fn header(entry_type: tar::EntryType, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(ENTRY_MODE);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_size(size);
    header
}

/// Build a layer blob from a spec.
///
/// Fails on unreadable sources, destinations written by more than one
/// source, and files whose size changes while they are archived.
pub fn build_layer(spec: &LayerSpec, media_type: &str) -> Result<LayerBlob> {
    let mut plan = Plan::default();
    for (source, destination) in &spec.mappings {
        let destination = archive_path(destination)?;
        plan.add_source(source, &destination)?;
    }

    let mut builder = tar::Builder::new(Vec::new());
    for (path, entry) in &plan.entries {
        match entry {
            Entry::Dir => {
                let mut h = header(tar::EntryType::Directory, 0);
                builder
                    .append_data(&mut h, path, io::empty())
                    .map_err(|e| layer_io(Path::new(path), e))?;
            }
            Entry::File { source, size } => {
                let file = File::open(source).map_err(|e| layer_io(source, e))?;
                let reader = SizedReader {
                    inner: file,
                    remaining: *size,
                };
                let mut h = header(tar::EntryType::Regular, *size);
                builder
                    .append_data(&mut h, path, reader)
                    .map_err(|e| layer_io(source, e))?;
            }
        }
    }
    let tar = builder
        .into_inner()
        .map_err(|e| MkctrError::Other(format!("Failed to finalize layer: {}", e)))?;

    let blob = LayerBlob::from_tar(media_type, tar);
    tracing::debug!(
        entries = plan.entries.len(),
        diff_id = %blob.diff_id(),
        "Built layer"
    );
    Ok(blob)
}

/// Compressed form of a layer.
#[derive(Debug)]
pub struct CompressedLayer {
    pub data: Vec<u8>,
    pub digest: String,
}

/// An uncompressed layer tarball, compressed lazily and at most once.
#[derive(Debug)]
pub struct LayerBlob {
    media_type: String,
    tar: Vec<u8>,
    diff_id: String,
    compressed: OnceLock<CompressedLayer>,
}

impl LayerBlob {
    pub fn from_tar(media_type: impl Into<String>, tar: Vec<u8>) -> Self {
        let diff_id = sha256_digest(&tar);
        Self {
            media_type: media_type.into(),
            tar,
            diff_id,
            compressed: OnceLock::new(),
        }
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Digest of the uncompressed tarball.
    pub fn diff_id(&self) -> &str {
        &self.diff_id
    }

    pub fn tar_bytes(&self) -> &[u8] {
        &self.tar
    }

    /// Gzip-compressed bytes and their digest, computed on first use.
    pub fn compressed(&self) -> Result<&CompressedLayer> {
        if let Some(compressed) = self.compressed.get() {
            return Ok(compressed);
        }
        let data = gzip(&self.tar)?;
        let digest = sha256_digest(&data);
        Ok(self.compressed.get_or_init(|| CompressedLayer { data, digest }))
    }

    /// Manifest descriptor for the compressed blob.
    pub fn descriptor(&self) -> Result<Descriptor> {
        let compressed = self.compressed()?;
        Ok(Descriptor {
            media_type: self.media_type.clone(),
            digest: compressed.digest.clone(),
            size: compressed.data.len() as i64,
            urls: None,
            annotations: BTreeMap::new(),
            platform: None,
            extra: BTreeMap::new(),
        })
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}
