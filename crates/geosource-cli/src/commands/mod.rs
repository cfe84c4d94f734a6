//! Command implementations

mod config;
mod hit;
mod query;
mod schema;
mod tables;
mod validate;

use crate::cli::{Cli, Commands};
use crate::output::OutputWriter;
use crate::sources;
use anyhow::Result;
use geosource_core::config::{parse_distance_unit, CliConfigOverrides, LayeredConfig};

/// Defaults from the optional config file, then the environment, then flags
fn load_defaults(cli: &Cli) -> Result<LayeredConfig> {
    let mut defaults = LayeredConfig::with_defaults();
    if let Some(path) = &cli.config {
        defaults = defaults.load_from_file(path)?;
    }
    let mut defaults = defaults.load_from_env();
    defaults.update_from_cli(CliConfigOverrides {
        http_timeout_secs: cli.timeout,
        max_concurrent_fetches: cli.max_concurrent,
        default_encoding: cli.encoding.clone(),
        distance_unit: cli.distance_unit.as_deref().map(parse_distance_unit).transpose()?,
    });
    Ok(defaults)
}

/// Execute a CLI command
pub async fn execute(cli: Cli) -> Result<()> {
    let output = OutputWriter::new(cli.json);
    let defaults = load_defaults(&cli)?;

    if let Commands::Config = cli.command {
        return config::execute(&defaults, &output);
    }

    let catalog = sources::load_catalog(cli.sources.as_deref())?;
    let catalog = catalog.as_ref();
    match cli.command {
        Commands::Tables(args) => tables::execute(args, catalog, &defaults, &output).await,
        Commands::Schema(args) => schema::execute(args, catalog, &defaults, &output).await,
        Commands::Query(args) => query::execute(args, catalog, &defaults, &output).await,
        Commands::Validate(args) => validate::execute(args, catalog, &defaults, &output).await,
        Commands::Hit(args) => hit::execute(args, catalog, &defaults, &output).await,
        Commands::Config => config::execute(&defaults, &output),
    }
}
