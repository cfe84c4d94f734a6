//! Geosource CLI - inspect and query geospatial data sources
//!
//! Sources are named either by a file path (the backend is picked from the
//! extension) or by an entry of the `sources.toml` catalogue.

mod cli;
mod commands;
mod output;
mod output_types;
mod sources;

use anyhow::Result;
use clap::Parser;
use cli::Cli;

fn main() -> Result<()> {
    // Logs go to stderr so `--json` output stays parseable
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(commands::execute(cli))
}
