//! OCI and Docker image model, registry access and export formats.

pub mod credentials;
pub mod image;
pub mod layout;
pub mod manifest;
pub mod media_type;
pub mod reference;
pub mod registry;

pub use image::{BaseImage, BaseIndex, Image, ImageIndex, ImageLayer, LayerContent};
pub use manifest::{Descriptor, ImageManifest, IndexManifest};
pub use media_type::{ImageFormat, ManifestKind};
pub use reference::ImageReference;
pub use registry::{OciRegistry, Registry, RegistryAuth};
