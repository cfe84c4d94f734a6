use crate::error::{GeosourceError, Result};
use crate::formats::shapefile::encoding::DEFAULT_ENCODING;
use crate::models::DistanceUnit;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

mod sources;

pub use sources::*;

/// Where a setting came from; later layers win
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    Default,
    File,
    /// `GEOSOURCE_*` variables
    Environment,
    Cli,
}

impl ConfigSource {
    pub fn precedence(&self) -> u8 {
        match self {
            ConfigSource::Default => 0,
            ConfigSource::File => 1,
            ConfigSource::Environment => 2,
            ConfigSource::Cli => 3,
        }
    }
}

/// A setting together with the layer that supplied it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }

    /// Replace the value only when `source` outranks the current one
    pub fn update(&mut self, value: T, source: ConfigSource) {
        if source.precedence() > self.source.precedence() {
            self.value = value;
            self.source = source;
        }
    }
}

/// Process-wide defaults shared by every data source
#[derive(Debug, Clone)]
pub struct LayeredConfig {
    /// Timeout applied to remote requests
    pub http_timeout_secs: ConfigValue<u64>,
    /// Admission gate size for concurrent tile fetches
    pub max_concurrent_fetches: ConfigValue<usize>,
    /// DBF text encoding when neither `.cpg` nor the language driver names one
    pub default_encoding: ConfigValue<String>,
    /// Capacity of the channel between a scan producer and its stream
    pub stream_buffer: ConfigValue<usize>,
    pub distance_unit: ConfigValue<DistanceUnit>,
}

impl LayeredConfig {
    /// Built-in values, before any file, environment or flag
    pub fn with_defaults() -> Self {
        Self {
            http_timeout_secs: ConfigValue::new(30, ConfigSource::Default),
            max_concurrent_fetches: ConfigValue::new(4, ConfigSource::Default),
            default_encoding: ConfigValue::new(DEFAULT_ENCODING.to_string(), ConfigSource::Default),
            stream_buffer: ConfigValue::new(256, ConfigSource::Default),
            distance_unit: ConfigValue::new(DistanceUnit::CrsUnits, ConfigSource::Default),
        }
    }

    /// Overlay the keys present in a TOML defaults file
    pub fn load_from_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        let content =
            fs::read_to_string(path.as_ref()).map_err(|e| GeosourceError::ConfigInvalid {
                key: "file".to_string(),
                reason: format!("cannot read {}: {e}", path.as_ref().display()),
            })?;

        let file_config: FileConfig =
            toml::from_str(&content).map_err(|e| GeosourceError::ConfigInvalid {
                key: "file".to_string(),
                reason: format!("invalid TOML: {e}"),
            })?;

        if let Some(timeout) = file_config.http_timeout_secs {
            self.http_timeout_secs.update(timeout, ConfigSource::File);
        }

        if let Some(max) = file_config.max_concurrent_fetches {
            self.max_concurrent_fetches.update(max, ConfigSource::File);
        }

        if let Some(encoding) = file_config.default_encoding {
            self.default_encoding.update(encoding, ConfigSource::File);
        }

        if let Some(buffer) = file_config.stream_buffer {
            self.stream_buffer.update(buffer, ConfigSource::File);
        }

        if let Some(unit) = file_config.distance_unit {
            self.distance_unit.update(unit, ConfigSource::File);
        }

        Ok(self)
    }

    /// Overlay `GEOSOURCE_*` variables; unparsable values are logged and ignored
    pub fn load_from_env(mut self) -> Self {
        // GEOSOURCE_HTTP_TIMEOUT_SECS
        if let Ok(value) = env::var("GEOSOURCE_HTTP_TIMEOUT_SECS") {
            match value.parse::<u64>() {
                Ok(timeout) => self.http_timeout_secs.update(timeout, ConfigSource::Environment),
                Err(_) => tracing::warn!(
                    "Invalid GEOSOURCE_HTTP_TIMEOUT_SECS value '{}': expected whole seconds",
                    value
                ),
            }
        }

        // GEOSOURCE_MAX_CONCURRENT_FETCHES
        if let Ok(value) = env::var("GEOSOURCE_MAX_CONCURRENT_FETCHES") {
            match value.parse::<usize>() {
                Ok(max) if max > 0 => {
                    self.max_concurrent_fetches.update(max, ConfigSource::Environment)
                }
                _ => tracing::warn!(
                    "Invalid GEOSOURCE_MAX_CONCURRENT_FETCHES value '{}': expected a positive integer",
                    value
                ),
            }
        }

        // GEOSOURCE_DEFAULT_ENCODING
        if let Ok(value) = env::var("GEOSOURCE_DEFAULT_ENCODING") {
            if encoding_rs::Encoding::for_label(value.trim().as_bytes()).is_some() {
                self.default_encoding.update(value.trim().to_string(), ConfigSource::Environment);
            } else {
                tracing::warn!("Invalid GEOSOURCE_DEFAULT_ENCODING value '{}': unknown encoding", value);
            }
        }

        // GEOSOURCE_STREAM_BUFFER
        if let Ok(value) = env::var("GEOSOURCE_STREAM_BUFFER") {
            match value.parse::<usize>() {
                Ok(buffer) if buffer > 0 => self.stream_buffer.update(buffer, ConfigSource::Environment),
                _ => tracing::warn!(
                    "Invalid GEOSOURCE_STREAM_BUFFER value '{}': expected a positive integer",
                    value
                ),
            }
        }

        self
    }

    pub fn update_from_cli(&mut self, overrides: CliConfigOverrides) {
        if let Some(timeout) = overrides.http_timeout_secs {
            self.http_timeout_secs.update(timeout, ConfigSource::Cli);
        }

        if let Some(max) = overrides.max_concurrent_fetches {
            self.max_concurrent_fetches.update(max, ConfigSource::Cli);
        }

        if let Some(encoding) = overrides.default_encoding {
            self.default_encoding.update(encoding, ConfigSource::Cli);
        }

        if let Some(unit) = overrides.distance_unit {
            self.distance_unit.update(unit, ConfigSource::Cli);
        }
    }

    /// Every setting rendered as text, with its origin
    pub fn to_inspection_map(&self) -> HashMap<String, (String, ConfigSource)> {
        let mut map = HashMap::new();

        map.insert(
            "http_timeout_secs".to_string(),
            (self.http_timeout_secs.value.to_string(), self.http_timeout_secs.source),
        );

        map.insert(
            "max_concurrent_fetches".to_string(),
            (self.max_concurrent_fetches.value.to_string(), self.max_concurrent_fetches.source),
        );

        map.insert(
            "default_encoding".to_string(),
            (self.default_encoding.value.clone(), self.default_encoding.source),
        );

        map.insert(
            "stream_buffer".to_string(),
            (self.stream_buffer.value.to_string(), self.stream_buffer.source),
        );

        map.insert(
            "distance_unit".to_string(),
            (format!("{:?}", self.distance_unit.value), self.distance_unit.source),
        );

        map
    }

    /// HTTP settings seeded from the layered defaults
    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            timeout_secs: self.http_timeout_secs.value,
            max_concurrent: self.max_concurrent_fetches.value,
            ..HttpSettings::default()
        }
    }
}

/// On-disk shape of the defaults file
#[derive(Debug, Deserialize, Serialize)]
struct FileConfig {
    http_timeout_secs: Option<u64>,
    max_concurrent_fetches: Option<usize>,
    default_encoding: Option<String>,
    stream_buffer: Option<usize>,
    distance_unit: Option<DistanceUnit>,
}

/// Values given as command-line flags
#[derive(Debug, Default)]
pub struct CliConfigOverrides {
    pub http_timeout_secs: Option<u64>,
    pub max_concurrent_fetches: Option<usize>,
    pub default_encoding: Option<String>,
    pub distance_unit: Option<DistanceUnit>,
}

/// Accepts unit names and their short forms, case-insensitively
pub fn parse_distance_unit(s: &str) -> Result<DistanceUnit> {
    match s.trim().to_ascii_lowercase().as_str() {
        "crs" | "units" => Ok(DistanceUnit::CrsUnits),
        "meters" | "m" => Ok(DistanceUnit::Meters),
        "kilometers" | "km" => Ok(DistanceUnit::Kilometers),
        "miles" | "mi" => Ok(DistanceUnit::Miles),
        "feet" | "ft" => Ok(DistanceUnit::Feet),
        "degrees" | "deg" => Ok(DistanceUnit::Degrees),
        _ => Err(GeosourceError::ConfigInvalid {
            key: "distance_unit".to_string(),
            reason: format!(
                "Invalid distance unit: {}. Use crs, meters, kilometers, miles, feet, or degrees",
                s
            ),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = LayeredConfig::with_defaults();
        assert_eq!(config.http_timeout_secs.value, 30);
        assert_eq!(config.max_concurrent_fetches.value, 4);
        assert_eq!(config.default_encoding.value, "GBK");
        assert_eq!(config.default_encoding.source, ConfigSource::Default);
    }

    #[test]
    fn test_later_layers_win() {
        let mut timeout = ConfigValue::new(30u64, ConfigSource::Default);

        timeout.update(10, ConfigSource::File);
        assert_eq!((timeout.value, timeout.source), (10, ConfigSource::File));

        timeout.update(20, ConfigSource::Environment);
        timeout.update(60, ConfigSource::Cli);
        assert_eq!((timeout.value, timeout.source), (60, ConfigSource::Cli));

        // File ranks below the CLI
        timeout.update(5, ConfigSource::File);
        assert_eq!((timeout.value, timeout.source), (60, ConfigSource::Cli));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
http_timeout_secs = 5
max_concurrent_fetches = 16
default_encoding = "utf-8"
distance_unit = "Meters"
"#
        )
        .unwrap();

        let config = LayeredConfig::with_defaults().load_from_file(file.path()).unwrap();

        assert_eq!(config.http_timeout_secs.value, 5);
        assert_eq!(config.http_timeout_secs.source, ConfigSource::File);
        assert_eq!(config.max_concurrent_fetches.value, 16);
        assert_eq!(config.default_encoding.value, "utf-8");
        assert_eq!(config.distance_unit.value, DistanceUnit::Meters);
        assert_eq!(config.stream_buffer.source, ConfigSource::Default);
    }

    #[test]
    fn test_bad_file_is_config_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "http_timeout_secs = \"soon\"").unwrap();
        let err = LayeredConfig::with_defaults().load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, GeosourceError::ConfigInvalid { .. }));
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = LayeredConfig::with_defaults();
        config.update_from_cli(CliConfigOverrides {
            http_timeout_secs: Some(90),
            ..Default::default()
        });

        assert_eq!(config.http_timeout_secs.value, 90);
        assert_eq!(config.http_timeout_secs.source, ConfigSource::Cli);
        assert_eq!(config.max_concurrent_fetches.source, ConfigSource::Default);
        assert_eq!(config.http_settings().timeout_secs, 90);
    }

    #[test]
    fn test_parse_distance_unit() {
        assert_eq!(parse_distance_unit("m").unwrap(), DistanceUnit::Meters);
        assert_eq!(parse_distance_unit("KILOMETERS").unwrap(), DistanceUnit::Kilometers);
        assert_eq!(parse_distance_unit("deg").unwrap(), DistanceUnit::Degrees);
        assert!(parse_distance_unit("invalid").is_err());
    }

    #[test]
    fn test_inspection_map() {
        let map = LayeredConfig::with_defaults().to_inspection_map();
        assert_eq!(map.len(), 5);
        let (encoding, source) = &map["default_encoding"];
        assert_eq!(encoding, "GBK");
        assert_eq!(*source, ConfigSource::Default);
    }
}
