//! mkctr CLI entry point.

use clap::Parser;
use tokio_util::sync::CancellationToken;

use mkctr_cli::commands::{dispatch, Cli};
use mkctr_cli::logging;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_format);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling build");
            trigger.cancel();
        }
    });

    if let Err(e) = dispatch(cli, cancel).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
