//! TangoFS mount daemon and command runner.

use anyhow::Result;
use clap::Parser;
use tangofs_fuse::cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    tracing::debug!("TangoFS starting...");

    Cli::parse().run().await
}
