//! Turning a command-line source argument into an adapter

use anyhow::{bail, Context, Result};
use geosource_core::config::{
    FileSourceConfig, HttpSettings, LayeredConfig, SourceCatalog, SourceDefinition, SourceSettings,
};
use geosource_remote::{RestSource, VectorTileSource, WmsSource};
use geosource_store::{
    DataSource, GeoPackageSource, MemorySource, PostGisSource, ShapefileSource, SpatiaLiteSource, SqlServerSource,
};
use std::path::Path;

/// Catalogue looked up in the working directory when none is named
pub const DEFAULT_CATALOG: &str = "sources.toml";

const KNOWN_EXTENSIONS: &str = ".shp, .gpkg, .sqlite, .db";

/// File-backed settings implied by a path's extension
pub fn detect(path: &Path) -> Option<SourceSettings> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    let config = FileSourceConfig::new(path);
    match extension.as_str() {
        "shp" => Some(SourceSettings::Shapefile(config)),
        "gpkg" => Some(SourceSettings::GeoPackage(config)),
        "sqlite" | "sqlite3" | "db" | "spatialite" => Some(SourceSettings::SpatiaLite(config)),
        _ => None,
    }
}

/// The catalogue named on the command line, or `./sources.toml` when it exists
pub fn load_catalog(explicit: Option<&Path>) -> Result<Option<SourceCatalog>> {
    let path = match explicit {
        Some(path) => path,
        None if Path::new(DEFAULT_CATALOG).is_file() => Path::new(DEFAULT_CATALOG),
        None => return Ok(None),
    };
    let catalog = SourceCatalog::load(path)
        .with_context(|| format!("Failed to load source catalogue {}", path.display()))?;
    tracing::debug!(path = %path.display(), sources = catalog.sources.len(), "loaded source catalogue");
    Ok(Some(catalog))
}

/// A catalogue entry wins over a file path spelled the same way
pub fn resolve(source: &str, catalog: Option<&SourceCatalog>) -> Result<SourceDefinition> {
    if let Some(definition) = catalog.and_then(|c| c.get(source)) {
        return Ok(definition.clone());
    }
    let path = Path::new(source);
    let Some(settings) = detect(path) else {
        if catalog.is_some() {
            bail!("'{source}' is not a catalogue entry and has no known extension ({KNOWN_EXTENSIONS})");
        }
        bail!("'{source}' has no known extension ({KNOWN_EXTENSIONS}) and no source catalogue was found");
    };
    let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or(source).to_string();
    Ok(SourceDefinition { name, settings })
}

/// Fill transport settings left at their built-in values from the layered defaults
fn apply_http_defaults(http: &mut HttpSettings, defaults: &LayeredConfig) {
    let builtin = HttpSettings::default();
    if http.timeout_secs == builtin.timeout_secs {
        http.timeout_secs = defaults.http_timeout_secs.value;
    }
    if http.max_concurrent == builtin.max_concurrent {
        http.max_concurrent = defaults.max_concurrent_fetches.value;
    }
}

/// Construct the adapter for a catalogue definition
pub fn build(definition: &SourceDefinition, defaults: &LayeredConfig) -> Result<Box<dyn DataSource>> {
    let name = definition.name.clone();
    let buffer = defaults.stream_buffer.value;
    let source: Box<dyn DataSource> = match definition.settings.clone() {
        SourceSettings::Shapefile(mut config) => {
            if config.encoding.is_none() {
                config.encoding = Some(defaults.default_encoding.value.clone());
            }
            Box::new(ShapefileSource::from_config(name, &config)?.stream_buffer(buffer))
        }
        SourceSettings::GeoPackage(config) => {
            Box::new(GeoPackageSource::from_config(name, &config)?.stream_buffer(buffer))
        }
        SourceSettings::SpatiaLite(config) => {
            Box::new(SpatiaLiteSource::from_config(name, &config)?.stream_buffer(buffer))
        }
        SourceSettings::PostGis(config) => Box::new(PostGisSource::new(name, config)?.stream_buffer(buffer)),
        SourceSettings::SqlServer(config) => Box::new(SqlServerSource::new(name, config)?.stream_buffer(buffer)),
        SourceSettings::Rest(mut config) => {
            apply_http_defaults(&mut config.http, defaults);
            Box::new(RestSource::new(name, config)?.stream_buffer(buffer))
        }
        SourceSettings::Wms(mut config) => {
            apply_http_defaults(&mut config.http, defaults);
            Box::new(WmsSource::new(name, config)?)
        }
        SourceSettings::VectorTile(mut config) => {
            apply_http_defaults(&mut config.http, defaults);
            Box::new(VectorTileSource::new(name, config)?.stream_buffer(buffer))
        }
        SourceSettings::Memory => Box::new(MemorySource::new(name)),
    };
    tracing::debug!(source = %definition.name, kind = definition.settings.kind(), "built data source");
    Ok(source)
}

/// Resolve, build and open a source; the adapter's last error explains a failed open
pub async fn open(source: &str, catalog: Option<&SourceCatalog>, defaults: &LayeredConfig) -> Result<Box<dyn DataSource>> {
    let definition = resolve(source, catalog)?;
    let adapter = build(&definition, defaults)?;
    if !adapter.open().await {
        let reason = adapter.last_error().unwrap_or_else(|| "unknown error".to_string());
        bail!("Failed to open {} source '{}': {reason}", adapter.backend(), definition.name);
    }
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geosource_core::config::ConfigSource;

    const CATALOG: &str = r#"
[[sources]]
name = "parcels"
kind = "shapefile"
path = "data/parcels.shp"

[[sources]]
name = "trees"
kind = "rest"
base_url = "https://api.example.com/v1"
tables = ["trees"]

[[sources]]
name = "basemap"
kind = "vector_tile"
url_template = "https://tiles.example.com/{z}/{x}/{y}.pbf"

[[sources]]
name = "imagery"
kind = "wms"
url = "https://maps.example.com/wms"
layers = ["ortho"]

[[sources]]
name = "scratch"
kind = "memory"
"#;

    #[test]
    fn test_detect_by_extension() {
        assert!(matches!(detect(Path::new("roads.shp")), Some(SourceSettings::Shapefile(_))));
        assert!(matches!(detect(Path::new("ROADS.SHP")), Some(SourceSettings::Shapefile(_))));
        assert!(matches!(detect(Path::new("city.gpkg")), Some(SourceSettings::GeoPackage(_))));
        assert!(matches!(detect(Path::new("city.sqlite")), Some(SourceSettings::SpatiaLite(_))));
        assert!(matches!(detect(Path::new("city.db")), Some(SourceSettings::SpatiaLite(_))));
        assert!(detect(Path::new("notes.txt")).is_none());
        assert!(detect(Path::new("no_extension")).is_none());
    }

    #[test]
    fn test_resolve_prefers_catalogue() {
        let catalog = SourceCatalog::parse(CATALOG).unwrap();

        let trees = resolve("trees", Some(&catalog)).unwrap();
        assert_eq!(trees.settings.kind(), "rest");

        let file = resolve("/data/roads.shp", Some(&catalog)).unwrap();
        assert_eq!(file.name, "roads");
        assert_eq!(file.settings.kind(), "shapefile");

        let missing = resolve("nowhere", Some(&catalog)).unwrap_err();
        assert!(missing.to_string().contains("not a catalogue entry"));
        let bare = resolve("nowhere", None).unwrap_err();
        assert!(bare.to_string().contains("no source catalogue"));
    }

    #[test]
    fn test_build_every_catalogue_kind() {
        let catalog = SourceCatalog::parse(CATALOG).unwrap();
        let defaults = LayeredConfig::with_defaults();
        let backends: Vec<&str> = catalog
            .sources
            .iter()
            .map(|definition| build(definition, &defaults).unwrap().backend())
            .collect();
        assert_eq!(backends, vec!["shapefile", "rest", "vector_tile", "wms", "memory"]);
    }

    #[test]
    fn test_http_defaults_only_fill_builtin_values() {
        let mut defaults = LayeredConfig::with_defaults();
        defaults.http_timeout_secs.update(90, ConfigSource::Cli);
        defaults.max_concurrent_fetches.update(8, ConfigSource::Cli);

        let mut http = HttpSettings::default();
        apply_http_defaults(&mut http, &defaults);
        assert_eq!((http.timeout_secs, http.max_concurrent), (90, 8));

        let mut http = HttpSettings { timeout_secs: 5, ..HttpSettings::default() };
        apply_http_defaults(&mut http, &defaults);
        assert_eq!((http.timeout_secs, http.max_concurrent), (5, 8));
    }

    #[test]
    fn test_load_catalog_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.toml");
        std::fs::write(&path, CATALOG).unwrap();
        let catalog = load_catalog(Some(&path)).unwrap().unwrap();
        assert_eq!(catalog.sources.len(), 5);

        std::fs::write(&path, "[[sources]]\nname = \"x\"\nkind = \"teleport\"\n").unwrap();
        assert!(load_catalog(Some(&path)).is_err());
    }
}
