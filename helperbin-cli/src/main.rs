//! Helperbin command line
//!
//! Embeds compressed helper binaries at build time and installs them at runtime.

mod cli;
mod execute;

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (level, ours) = match cli.verbose {
        0 => (Level::INFO, "helperbin=debug"),
        1 => (Level::DEBUG, "helperbin=debug"),
        _ => (Level::TRACE, "helperbin=trace"),
    };
    // Logs go to stderr so command output stays parseable.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(ours.parse()?)
                .add_directive(level.into()),
        )
        .init();

    tracing::debug!("Starting helperbin v{}", helperbin_core::VERSION);

    execute::execute(cli).await
}
