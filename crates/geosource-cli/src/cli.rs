use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Geosource - one interface over Shapefile, GeoPackage, SpatiaLite,
/// PostGIS, SQL Server, REST, WMS and vector tile sources
#[derive(Parser, Debug)]
#[command(name = "geosource")]
#[command(about = "Inspect and query geospatial data sources", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Output results in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Source catalogue (defaults to ./sources.toml when present)
    #[arg(long, global = true, value_name = "FILE")]
    pub sources: Option<PathBuf>,

    /// Defaults file with timeouts, encoding and buffer sizes
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Timeout for remote requests, in seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Maximum simultaneous tile fetches
    #[arg(long, global = true)]
    pub max_concurrent: Option<usize>,

    /// DBF encoding used when a Shapefile does not name one
    #[arg(long, global = true)]
    pub encoding: Option<String>,

    /// Unit of hit tolerances: crs, meters, kilometers, miles, feet or degrees
    #[arg(long, global = true, value_name = "UNIT")]
    pub distance_unit: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the tables (layers) of a source
    Tables(SourceArgs),

    /// Show the schema of one table, or of every table
    Schema(SchemaArgs),

    /// Query features from a table
    Query(QueryArgs),

    /// Open a source and report problems without failing
    Validate(SourceArgs),

    /// Features under a point, within a tolerance
    Hit(HitArgs),

    /// Show the effective defaults and where each came from
    Config,
}

#[derive(Args, Debug)]
pub struct SourceArgs {
    /// File path, or the name of a catalogue entry
    pub source: String,
}

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// File path, or the name of a catalogue entry
    pub source: String,

    /// Table to describe (all tables when omitted)
    pub table: Option<String>,
}

#[derive(Args, Debug)]
pub struct QueryArgs {
    /// File path, or the name of a catalogue entry
    pub source: String,

    /// Table to query
    pub table: String,

    /// Bounding box: minx,miny,maxx,maxy
    #[arg(long, value_name = "BOX", allow_hyphen_values = true)]
    pub bbox: Option<String>,

    /// Attribute predicate in the backend's own syntax
    #[arg(long = "where", value_name = "PREDICATE")]
    pub predicate: Option<String>,

    /// Named parameter for the predicate (name=value), repeatable
    #[arg(long = "param", value_name = "NAME=VALUE")]
    pub params: Vec<String>,

    /// Maximum number of features
    #[arg(long, default_value = "0")]
    pub limit: usize,

    /// Features to skip
    #[arg(long, default_value = "0")]
    pub offset: usize,

    /// Sort key, repeatable; prefix with '-' for descending
    #[arg(long, value_name = "FIELD", allow_hyphen_values = true)]
    pub sort: Vec<String>,

    /// Comma-separated attribute columns to return
    #[arg(long, value_delimiter = ',')]
    pub columns: Vec<String>,

    /// Leave geometries out of the result
    #[arg(long)]
    pub no_geometry: bool,

    /// Reproject geometries to this SRID
    #[arg(long)]
    pub srid: Option<i32>,
}

#[derive(Args, Debug)]
#[command(allow_negative_numbers = true)]
pub struct HitArgs {
    /// File path, or the name of a catalogue entry
    pub source: String,

    /// Table to search
    pub table: String,

    pub x: f64,

    pub y: f64,

    /// Search radius, in --distance-unit (the layer's own units by default)
    #[arg(long, default_value = "0")]
    pub tolerance: f64,
}
