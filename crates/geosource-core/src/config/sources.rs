//! Data source catalogue (`sources.toml`) and per-backend settings

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GeosourceError, Result};

fn invalid(key: &str, reason: impl Into<String>) -> GeosourceError {
    GeosourceError::ConfigInvalid { key: key.to_string(), reason: reason.into() }
}

/// A named entry of the source catalogue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDefinition {
    pub name: String,
    #[serde(flatten)]
    pub settings: SourceSettings,
}

/// Backend-specific settings, selected by `kind`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSettings {
    Shapefile(FileSourceConfig),
    #[serde(rename = "geopackage")]
    GeoPackage(FileSourceConfig),
    #[serde(rename = "spatialite")]
    SpatiaLite(FileSourceConfig),
    #[serde(rename = "postgis")]
    PostGis(PostGisConfig),
    #[serde(rename = "sqlserver")]
    SqlServer(SqlServerConfig),
    Rest(RestConfig),
    Wms(WmsConfig),
    VectorTile(VectorTileConfig),
    Memory,
}

impl SourceSettings {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceSettings::Shapefile(_) => "shapefile",
            SourceSettings::GeoPackage(_) => "geopackage",
            SourceSettings::SpatiaLite(_) => "spatialite",
            SourceSettings::PostGis(_) => "postgis",
            SourceSettings::SqlServer(_) => "sqlserver",
            SourceSettings::Rest(_) => "rest",
            SourceSettings::Wms(_) => "wms",
            SourceSettings::VectorTile(_) => "vector_tile",
            SourceSettings::Memory => "memory",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            SourceSettings::Shapefile(c) | SourceSettings::GeoPackage(c) | SourceSettings::SpatiaLite(c) => {
                c.validate()
            }
            SourceSettings::PostGis(c) => c.validate(),
            SourceSettings::SqlServer(c) => c.validate(),
            SourceSettings::Rest(c) => c.validate(),
            SourceSettings::Wms(c) => c.validate(),
            SourceSettings::VectorTile(c) => c.validate(),
            SourceSettings::Memory => Ok(()),
        }
    }
}

/// The `sources.toml` file: a list of `[[sources]]` tables
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceCatalog {
    #[serde(default)]
    pub sources: Vec<SourceDefinition>,
}

impl SourceCatalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            invalid("sources", format!("Failed to read {}: {e}", path.as_ref().display()))
        })?;
        Self::parse(&content)
    }

    /// Parse and validate catalogue text
    pub fn parse(content: &str) -> Result<Self> {
        let catalog: SourceCatalog =
            toml::from_str(content).map_err(|e| invalid("sources", format!("Failed to parse TOML: {e}")))?;
        for (i, source) in catalog.sources.iter().enumerate() {
            if source.name.trim().is_empty() {
                return Err(invalid("sources.name", format!("entry {} has an empty name", i + 1)));
            }
            if catalog.sources[..i].iter().any(|s| s.name == source.name) {
                return Err(invalid("sources.name", format!("duplicate source name {}", source.name)));
            }
            source.settings.validate()?;
        }
        Ok(catalog)
    }

    pub fn get(&self, name: &str) -> Option<&SourceDefinition> {
        self.sources.iter().find(|s| s.name == name)
    }
}

/// File-backed sources: Shapefile, GeoPackage, SpatiaLite
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSourceConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
    /// DBF text encoding override (Shapefile only)
    #[serde(default)]
    pub encoding: Option<String>,
}

impl FileSourceConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), read_only: false, encoding: None }
    }

    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(invalid("path", "cannot be empty"));
        }
        if let Some(label) = &self.encoding {
            if encoding_rs::Encoding::for_label(label.as_bytes()).is_none() {
                return Err(invalid("encoding", format!("unknown encoding {label}")));
            }
        }
        Ok(())
    }
}

/// PostGIS connection and behavior configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostGisConfig {
    /// Database connection URL
    pub database_url: String,
    /// Connection pool configuration
    #[serde(default)]
    pub pool: PoolConfig,
    /// Schema searched for tables
    #[serde(default = "default_pg_schema")]
    pub schema: String,
    #[serde(default)]
    pub read_only: bool,
}

fn default_pg_schema() -> String {
    "public".to_string()
}

impl PostGisConfig {
    /// Create a new configuration with the given database URL
    pub fn new(database_url: impl Into<String>) -> Result<Self> {
        let config = Self {
            database_url: database_url.into(),
            pool: PoolConfig::default(),
            schema: default_pg_schema(),
            read_only: false,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    ///
    /// Requires DATABASE_URL environment variable to be set.
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| GeosourceError::ConfigMissing { key: "DATABASE_URL".to_string() })?;
        if database_url.trim().is_empty() {
            return Err(invalid("DATABASE_URL", "cannot be empty"));
        }
        Self::new(database_url)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(invalid("database_url", "cannot be empty"));
        }
        if self.schema.trim().is_empty() {
            return Err(invalid("schema", "cannot be empty"));
        }
        self.pool.validate()
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Minimum number of connections to maintain
    pub min_connections: u32,
    /// Maximum number of connections allowed
    pub max_connections: u32,
    /// Timeout for acquiring a connection from the pool
    pub acquire_timeout_secs: u64,
    /// Timeout for idle connections before they are closed
    pub idle_timeout_secs: u64,
    /// Maximum lifetime of a connection
    pub max_lifetime_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 8,
            acquire_timeout_secs: 30,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }

    /// Validate pool configuration
    pub fn validate(&self) -> Result<()> {
        if self.min_connections > self.max_connections {
            return Err(invalid(
                "pool.min_connections",
                format!(
                    "min_connections ({}) cannot be greater than max_connections ({})",
                    self.min_connections, self.max_connections
                ),
            ));
        }

        if self.max_connections == 0 {
            return Err(invalid("pool.max_connections", "must be greater than 0"));
        }

        Ok(())
    }
}

/// SQL Server connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlServerConfig {
    /// ADO.NET style connection string
    pub connection_string: String,
    /// Accept the server certificate without validation
    #[serde(default)]
    pub trust_cert: bool,
    #[serde(default = "default_mssql_schema")]
    pub schema: String,
    #[serde(default)]
    pub read_only: bool,
}

fn default_mssql_schema() -> String {
    "dbo".to_string()
}

impl SqlServerConfig {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            trust_cert: false,
            schema: default_mssql_schema(),
            read_only: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection_string.trim().is_empty() {
            return Err(invalid("connection_string", "cannot be empty"));
        }
        Ok(())
    }
}

/// Credentials attached to remote requests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    #[default]
    None,
    Bearer { token: String },
    ApiKey { header: String, key: String },
}

/// Transport settings shared by remote sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    /// Maximum simultaneous in-flight requests
    pub max_concurrent: usize,
    pub auth: AuthConfig,
    pub user_agent: Option<String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self { timeout_secs: 30, max_concurrent: 4, auth: AuthConfig::None, user_agent: None }
    }
}

impl HttpSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(invalid("http.timeout_secs", "must be greater than 0"));
        }
        if self.max_concurrent == 0 {
            return Err(invalid("http.max_concurrent", "must be greater than 0"));
        }
        Ok(())
    }
}

/// How geometries are encoded in REST payloads
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GeometryFormat {
    #[default]
    #[serde(rename = "geojson")]
    GeoJson,
    Wkt,
    /// Hex-encoded WKB
    Wkb,
    /// Point geometry assembled from two numeric properties
    Custom { x_property: String, y_property: String },
}

/// Pagination scheme of a REST list endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationStyle {
    #[default]
    None,
    PageNumber,
    Offset,
    Cursor,
}

/// Pagination style and its parameter names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    pub style: PaginationStyle,
    pub page_size: u32,
    pub page_param: String,
    pub first_page: u32,
    pub page_size_param: String,
    pub offset_param: String,
    pub cursor_param: String,
    /// Dotted path of the next cursor in a list response
    pub next_cursor_path: String,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            style: PaginationStyle::None,
            page_size: 100,
            page_param: "page".to_string(),
            first_page: 1,
            page_size_param: "limit".to_string(),
            offset_param: "offset".to_string(),
            cursor_param: "cursor".to_string(),
            next_cursor_path: "next".to_string(),
        }
    }
}

/// Endpoint templates; `{table}` and `{id}` are substituted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestEndpoints {
    /// Lists table names; when absent the configured `tables` are used
    pub tables: Option<String>,
    pub list: String,
    pub single: String,
    pub create: Option<String>,
    pub update: Option<String>,
    pub delete: Option<String>,
    pub spatial_query: Option<String>,
}

impl Default for RestEndpoints {
    fn default() -> Self {
        Self {
            tables: None,
            list: "/{table}".to_string(),
            single: "/{table}/{id}".to_string(),
            create: None,
            update: None,
            delete: None,
            spatial_query: None,
        }
    }
}

/// REST/GeoJSON data source configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestConfig {
    pub base_url: String,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub endpoints: RestEndpoints,
    #[serde(default)]
    pub geometry_format: GeometryFormat,
    /// Dotted path of the feature array in a list response; the body itself when empty
    #[serde(default)]
    pub features_path: String,
    #[serde(default = "default_id_property")]
    pub id_property: String,
    #[serde(default = "default_geometry_property")]
    pub geometry_property: String,
    /// Object holding attributes; the item itself when empty
    #[serde(default = "default_attributes_property")]
    pub attributes_property: String,
    #[serde(default)]
    pub pagination: PaginationConfig,
    /// Query parameter receiving `minx,miny,maxx,maxy`
    #[serde(default)]
    pub bbox_param: Option<String>,
    /// Query parameter receiving the attribute predicate
    #[serde(default)]
    pub filter_param: Option<String>,
    #[serde(default = "default_srid")]
    pub srid: i32,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub read_only: bool,
}

fn default_id_property() -> String {
    "id".to_string()
}

fn default_geometry_property() -> String {
    "geometry".to_string()
}

fn default_attributes_property() -> String {
    "properties".to_string()
}

fn default_srid() -> i32 {
    4326
}

impl RestConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            tables: Vec::new(),
            endpoints: RestEndpoints::default(),
            geometry_format: GeometryFormat::default(),
            features_path: String::new(),
            id_property: default_id_property(),
            geometry_property: default_geometry_property(),
            attributes_property: default_attributes_property(),
            pagination: PaginationConfig::default(),
            bbox_param: None,
            filter_param: None,
            srid: default_srid(),
            http: HttpSettings::default(),
            read_only: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_url("base_url", &self.base_url)?;
        if self.pagination.page_size == 0 && self.pagination.style != PaginationStyle::None {
            return Err(invalid("pagination.page_size", "must be greater than 0"));
        }
        self.http.validate()
    }
}

/// WMS service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WmsConfig {
    pub url: String,
    #[serde(default = "default_wms_version")]
    pub version: String,
    #[serde(default)]
    pub layers: Vec<String>,
    #[serde(default)]
    pub styles: Vec<String>,
    #[serde(default = "default_image_format")]
    pub format: String,
    #[serde(default = "default_srid")]
    pub srid: i32,
    #[serde(default = "default_tile_size")]
    pub tile_size: u32,
    #[serde(default = "default_true")]
    pub transparent: bool,
    #[serde(default)]
    pub http: HttpSettings,
}

fn default_wms_version() -> String {
    "1.3.0".to_string()
}

fn default_image_format() -> String {
    "image/png".to_string()
}

fn default_tile_size() -> u32 {
    256
}

fn default_true() -> bool {
    true
}

impl WmsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            version: default_wms_version(),
            layers: Vec::new(),
            styles: Vec::new(),
            format: default_image_format(),
            srid: default_srid(),
            tile_size: default_tile_size(),
            transparent: true,
            http: HttpSettings::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_url("url", &self.url)?;
        if !matches!(self.version.as_str(), "1.1.1" | "1.3.0") {
            return Err(invalid("version", format!("unsupported WMS version {}", self.version)));
        }
        if self.tile_size == 0 {
            return Err(invalid("tile_size", "must be greater than 0"));
        }
        self.http.validate()
    }
}

/// Vector tile service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorTileConfig {
    /// URL with `{z}`, `{x}` and `{y}` placeholders
    pub url_template: String,
    #[serde(default)]
    pub min_zoom: u8,
    #[serde(default = "default_max_zoom")]
    pub max_zoom: u8,
    /// Restrict to these tile layers; all layers when empty
    #[serde(default)]
    pub layers: Vec<String>,
    #[serde(default)]
    pub http: HttpSettings,
}

fn default_max_zoom() -> u8 {
    14
}

impl VectorTileConfig {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            url_template: url_template.into(),
            min_zoom: 0,
            max_zoom: default_max_zoom(),
            layers: Vec::new(),
            http: HttpSettings::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for placeholder in ["{z}", "{x}", "{y}"] {
            if !self.url_template.contains(placeholder) {
                return Err(invalid("url_template", format!("missing {placeholder} placeholder")));
            }
        }
        if self.min_zoom > self.max_zoom || self.max_zoom > 24 {
            return Err(invalid(
                "max_zoom",
                format!("zoom range {}..={} is invalid", self.min_zoom, self.max_zoom),
            ));
        }
        self.http.validate()
    }
}

fn validate_url(key: &str, value: &str) -> Result<()> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(invalid(key, format!("{value} is not an http(s) URL")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
[[sources]]
name = "roads"
kind = "shapefile"
path = "data/roads.shp"
encoding = "utf-8"

[[sources]]
name = "warehouse"
kind = "postgis"
database_url = "postgresql://localhost/gis"

[sources.pool]
max_connections = 4

[[sources]]
name = "assets"
kind = "rest"
base_url = "https://api.example.com/v1"
bbox_param = "bbox"

[sources.pagination]
style = "offset"
page_size = 50

[sources.http.auth]
type = "bearer"
token = "secret"

[[sources]]
name = "scratch"
kind = "memory"
"#;

    #[test]
    fn test_parse_catalog() {
        let catalog = SourceCatalog::parse(CATALOG).unwrap();
        assert_eq!(catalog.sources.len(), 4);

        let roads = catalog.get("roads").unwrap();
        assert_eq!(roads.settings.kind(), "shapefile");
        match &roads.settings {
            SourceSettings::Shapefile(c) => assert_eq!(c.encoding.as_deref(), Some("utf-8")),
            other => panic!("unexpected {other:?}"),
        }

        match &catalog.get("warehouse").unwrap().settings {
            SourceSettings::PostGis(c) => {
                assert_eq!(c.pool.max_connections, 4);
                assert_eq!(c.pool.min_connections, 1);
                assert_eq!(c.schema, "public");
            }
            other => panic!("unexpected {other:?}"),
        }

        match &catalog.get("assets").unwrap().settings {
            SourceSettings::Rest(c) => {
                assert_eq!(c.pagination.style, PaginationStyle::Offset);
                assert_eq!(c.pagination.page_size, 50);
                assert_eq!(c.http.auth, AuthConfig::Bearer { token: "secret".into() });
                assert_eq!(c.geometry_format, GeometryFormat::GeoJson);
                assert_eq!(c.endpoints.single, "/{table}/{id}");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(catalog.get("scratch").unwrap().settings, SourceSettings::Memory);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let text = r#"
[[sources]]
name = "a"
kind = "memory"

[[sources]]
name = "a"
kind = "memory"
"#;
        assert!(SourceCatalog::parse(text).is_err());
    }

    #[test]
    fn test_pool_config_invalid_min_max() {
        let pool = PoolConfig { min_connections: 20, max_connections: 10, ..Default::default() };
        assert!(pool.validate().is_err());
        let pool = PoolConfig { min_connections: 0, max_connections: 0, ..Default::default() };
        assert!(pool.validate().is_err());
    }

    #[test]
    fn test_postgis_config_empty_url() {
        match PostGisConfig::new("") {
            Err(GeosourceError::ConfigInvalid { key, .. }) => assert_eq!(key, "database_url"),
            other => panic!("Expected ConfigInvalid, got {other:?}"),
        }
    }

    #[test]
    fn test_remote_validation() {
        assert!(VectorTileConfig::new("https://t.example.com/{z}/{x}/{y}.pbf").validate().is_ok());
        assert!(VectorTileConfig::new("https://t.example.com/{z}/{x}.pbf").validate().is_err());
        assert!(WmsConfig::new("ftp://example.com").validate().is_err());

        let mut wms = WmsConfig::new("https://example.com/wms");
        wms.version = "1.0.0".into();
        assert!(wms.validate().is_err());
    }
}
