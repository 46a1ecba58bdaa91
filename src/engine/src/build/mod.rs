//! Image building: layers, compilation, per-platform and index assembly.

pub mod assembler;
pub mod compiler;
pub mod index;
pub mod layer;
