//! mkctr CLI - flag surface and logging setup for the image assembler.

pub mod commands;
pub mod logging;
