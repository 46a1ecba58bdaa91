//! `mkctr build` command.
//!
//! Resolves flags and an optional build file into a [`BuildRequest`], runs
//! the engine, and prints the resulting image or index digest.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use mkctr_core::config::{
    output_refs, parse_annotations, parse_file_map, parse_list, BuildFile, BuildRequest,
    CompilerFlags, OutputMode,
};
use mkctr_core::error::{MkctrError, Result};
use mkctr_core::platform::TargetProfile;
use mkctr_engine::{Engine, GoCompiler, LocalRuntime, OciRegistry, OutputSet};
use tokio_util::sync::CancellationToken;

#[derive(Args, Debug, Default)]
pub struct BuildArgs {
    /// Base image or index (e.g., "alpine:3.19")
    #[arg(long)]
    pub base: Option<String>,

    /// Go packages to compile, as comma-separated src:dst pairs
    #[arg(long)]
    pub gopaths: Option<String>,

    /// Static files to copy, as comma-separated src:dst pairs
    #[arg(long)]
    pub files: Option<String>,

    /// Comma-separated image repositories
    #[arg(long)]
    pub repos: Option<String>,

    /// Comma-separated tags
    #[arg(long)]
    pub tags: Option<String>,

    /// The --ldflags value passed to go
    #[arg(long)]
    pub ldflags: Option<String>,

    /// The --tags value passed to go
    #[arg(long)]
    pub gotags: Option<String>,

    /// Publish the result (loads into the local runtime for --target=local-runtime)
    #[arg(long)]
    pub push: bool,

    /// Write the result to a directory instead
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Deployment target: restricted-amd64 (alias flyio) or local-runtime (alias local)
    #[arg(long)]
    pub target: Option<String>,

    /// OCI annotations as comma-separated key=value pairs
    #[arg(long)]
    pub annotations: Option<String>,

    /// YAML or JSON build file; flags take precedence over its values
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Replacement for the image's default command (after --)
    #[arg(last = true)]
    pub cmd: Vec<String>,
}

impl BuildArgs {
    /// Merge flags over the build file and validate the result.
    pub fn to_request(&self, verbose: bool) -> Result<BuildRequest> {
        if self.push && self.out.is_some() {
            return Err(MkctrError::Config(
                "--push and --out are mutually exclusive".to_string(),
            ));
        }

        let file = match &self.config {
            Some(path) => BuildFile::load(path)?,
            None => BuildFile::default(),
        };

        let artifacts = match &self.gopaths {
            Some(s) => parse_file_map(s)?,
            None => file.gopaths,
        };
        let static_files = match &self.files {
            Some(s) => parse_file_map(s)?,
            None => file.files,
        };
        let repos = self.repos.as_deref().map(parse_list).unwrap_or(file.repos);
        let tags = self.tags.as_deref().map(parse_list).unwrap_or(file.tags);
        let target = match &self.target {
            Some(s) => s.parse::<TargetProfile>()?,
            None => file.target.unwrap_or_default(),
        };
        let annotations = match &self.annotations {
            Some(s) => parse_annotations(s),
            None => file.annotations,
        };
        let command = if self.cmd.is_empty() {
            file.cmd
        } else {
            self.cmd.clone()
        };
        let output = match &self.out {
            Some(dir) => OutputMode::Directory(dir.clone()),
            None if self.push => OutputMode::Publish,
            None => OutputMode::None,
        };

        let request = BuildRequest {
            base_image: self.base.clone().or(file.base).unwrap_or_default(),
            artifacts,
            static_files,
            output_refs: output_refs(&repos, &tags),
            target,
            compiler: CompilerFlags {
                ldflags: self.ldflags.clone().or(file.ldflags).unwrap_or_default(),
                tags: self.gotags.clone().or(file.gotags).unwrap_or_default(),
                verbose,
            },
            annotations,
            command,
            output,
        };
        request.validate()?;
        Ok(request)
    }
}

pub async fn execute(
    args: BuildArgs,
    verbose: bool,
    cancel: CancellationToken,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let request = args.to_request(verbose)?;
    tracing::debug!(base = %request.base_image, target = ?request.target, "Build request");

    let engine = Engine::new(
        Arc::new(OciRegistry::for_request(&request)?),
        Arc::new(GoCompiler::new()),
        LocalRuntime::detect(),
    );
    match engine.run(&request, cancel).await? {
        OutputSet::Empty => {}
        OutputSet::Single(result) => println!("{}", result.image.digest()?),
        OutputSet::Index(index) => println!("{}", index.digest()?),
    }
    Ok(())
}
