//! Compiler invocation.
//!
//! The target platform reaches the compiler only through an explicit
//! [`TargetEnv`], never through this process's environment, so concurrent
//! builds for different platforms cannot interfere.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use mkctr_core::config::CompilerFlags;
use mkctr_core::error::{MkctrError, Result};
use mkctr_core::platform::Platform;
use tokio::process::Command;

/// Compiler environment pinned to one target platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEnv {
    pub os: String,
    pub arch: String,
    /// ARM revision digit, set only for `arm`
    pub arm: Option<String>,
}

impl TargetEnv {
    /// Derive the environment for a platform, decoding the ARM variant.
    pub fn for_platform(platform: &Platform) -> Result<Self> {
        let arm = if platform.architecture == "arm" {
            Some(arm_version(platform)?)
        } else {
            None
        };
        Ok(Self {
            os: platform.os.clone(),
            arch: platform.architecture.clone(),
            arm,
        })
    }

    /// Environment variables handed to the compiler process.
    pub fn vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            ("CGO_ENABLED", "0".to_string()),
            ("GOOS", self.os.clone()),
            ("GOARCH", self.arch.clone()),
        ];
        if let Some(arm) = &self.arm {
            vars.push(("GOARM", arm.clone()));
        }
        vars
    }
}

/// Decode an ARM variant (`"v"` followed by one digit) into its digit.
pub fn arm_version(platform: &Platform) -> Result<String> {
    let variant = platform.variant_str();
    let decode_error = || MkctrError::VariantDecode {
        platform: platform.to_string(),
        variant: variant.to_string(),
    };
    match variant.as_bytes() {
        [b'v', digit] if digit.is_ascii_digit() => Ok((*digit as char).to_string()),
        _ => Err(decode_error()),
    }
}

/// One artifact to compile.
#[derive(Debug, Clone)]
pub struct CompileJob {
    /// Build target identifier (package path)
    pub target: String,
    pub platform: Platform,
    pub env: TargetEnv,
    pub flags: CompilerFlags,
    /// Where the binary is written
    pub output: PathBuf,
}

/// External compiler toolchain.
#[async_trait]
pub trait Compiler: Send + Sync {
    /// Compile `job.target`, returning the path of the produced binary.
    async fn compile(&self, job: &CompileJob) -> Result<PathBuf>;
}

/// Go toolchain invocation (`go build -trimpath`).
pub struct GoCompiler {
    program: PathBuf,
}

impl GoCompiler {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("go"),
        }
    }

    /// Use a specific `go` binary.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Default for GoCompiler {
    fn default() -> Self {
        Self::new()
    }
}

/// Arguments for `go`, in invocation order.
pub fn build_args(job: &CompileJob) -> Vec<String> {
    let mut args = vec!["build".to_string(), "-trimpath".to_string()];
    if job.flags.verbose {
        args.push("-v".to_string());
    }
    if !job.flags.tags.is_empty() {
        args.push(format!("--tags={}", job.flags.tags));
    }
    if !job.flags.ldflags.is_empty() {
        args.push(format!("--ldflags={}", job.flags.ldflags));
    }
    args.push(format!("-o={}", job.output.display()));
    args.push(job.target.clone());
    args
}

#[async_trait]
impl Compiler for GoCompiler {
    async fn compile(&self, job: &CompileJob) -> Result<PathBuf> {
        let args = build_args(job);
        tracing::info!(package = %job.target, "Compiling");
        tracing::debug!(program = %self.program.display(), args = ?args, env = ?job.env.vars(), "Running compiler");

        let output = Command::new(&self.program)
            .args(&args)
            .envs(job.env.vars())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| MkctrError::CompileFailed {
                target: job.target.clone(),
                platform: job.platform.to_string(),
                status: format!("failed to start {}: {}", self.program.display(), e),
                output: String::new(),
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            tracing::warn!(package = %job.target, status = %output.status, output = %combined.trim_end(), "Compiler failed");
            return Err(MkctrError::CompileFailed {
                target: job.target.clone(),
                platform: job.platform.to_string(),
                status: output.status.to_string(),
                output: combined,
            });
        }

        if !combined.trim().is_empty() {
            tracing::debug!(package = %job.target, output = %combined.trim_end(), "Compiler output");
        }
        tracing::info!(package = %job.target, output = %job.output.display(), "Compiled");
        Ok(job.output.clone())
    }
}
