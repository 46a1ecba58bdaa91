//! mkctr Core - Foundational Types
//!
//! Build requests, platforms, the target-profile policy and the error
//! taxonomy shared by the engine and the CLI.

pub mod config;
pub mod error;
pub mod platform;

// Re-export commonly used types
pub use config::{BuildFile, BuildRequest, CompilerFlags, OutputMode, OutputRef};
pub use error::{MkctrError, Result};
pub use platform::{evaluate, evaluate_on, Decision, HostPlatform, Platform, TargetProfile};

/// mkctr version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
