//! mkctr Engine - Multi-Platform Image Assembly
//!
//! Derives one image per supported platform of a base image or index by
//! compiling artifacts, layering them with static files onto the base,
//! and republishing the result as an image or a re-assembled index.
//!
//! - [`oci`]: manifests, images, registry access and export formats
//! - [`build`]: layer builder, compiler invocation, per-platform and index
//!   assembly
//! - [`publish`]: registry push, directory export, local-runtime load
//! - [`engine`]: the top-level run

pub mod build;
pub mod engine;
pub mod oci;
pub mod publish;

pub use build::assembler::PlatformAssembler;
pub use build::compiler::{CompileJob, Compiler, GoCompiler, TargetEnv};
pub use build::index::{ImageResult, OutputSet};
pub use build::layer::{build_layer, LayerBlob, LayerSpec};
pub use engine::Engine;
pub use oci::image::{BaseImage, BaseIndex, Image, ImageIndex};
pub use oci::reference::ImageReference;
pub use oci::registry::{OciRegistry, Registry, RegistryAuth};
pub use publish::{LocalRuntime, Publisher};
