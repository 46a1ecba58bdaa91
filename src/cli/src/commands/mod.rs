//! CLI command definitions and dispatch.

mod build;
mod version;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::logging::LogFormat;

pub use build::BuildArgs;

/// mkctr - derive multi-platform container images from a base image.
#[derive(Parser)]
#[command(name = "mkctr", version, about)]
pub struct Cli {
    /// Debug logging and verbose compiler output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Compile artifacts, layer them onto a base image and deliver the result
    Build(BuildArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli, cancel: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Build(args) => build::execute(args, cli.verbose, cancel).await,
        Command::Version(args) => version::execute(args).await,
    }
}
