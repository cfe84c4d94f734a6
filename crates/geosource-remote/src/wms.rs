//! WMS client and adapter.
//!
//! Layers advertised by `GetCapabilities` become tables. Features come from
//! `GetFeatureInfo` at the centre of a spatial filter; map images are
//! available through [`WmsSource::get_map`] and the tiled [`WmsSource::get_tiles`].

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use geosource_core::codec::geojson as geojson_codec;
use geosource_core::config::WmsConfig;
use geosource_core::error::{GeosourceError, Result};
use geosource_core::models::{is_geographic_srid, Envelope, Feature, FeatureId, QueryFilter, TableSchema};
use geosource_store::residual::{without_paging, Residual};
use geosource_store::source::{validate_table_name, DataSource, FeatureStream, SourceCore, SourceState};
use geosource_store::stream;
use parking_lot::RwLock;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use url::Url;

use crate::http::{parse_url, HttpClient};
use crate::tile::{tiles_covering, zoom_for_envelope, TileId};

/// Info format requested from `GetFeatureInfo`
pub const FEATURE_INFO_FORMAT: &str = "application/json";

/// One named layer from a capabilities document
#[derive(Debug, Clone, PartialEq)]
pub struct WmsLayer {
    pub name: String,
    pub title: Option<String>,
    /// CRS (1.3.0) or SRS (1.1.1) identifiers, including inherited ones
    pub crs: Vec<String>,
    /// Bounds in longitude/latitude
    pub geographic_bbox: Option<Envelope>,
    pub queryable: bool,
}

impl WmsLayer {
    pub fn supports_srid(&self, srid: i32) -> bool {
        let code = format!("EPSG:{srid}");
        self.crs.iter().any(|c| c.eq_ignore_ascii_case(&code))
            || (srid == 4326 && self.crs.iter().any(|c| c.eq_ignore_ascii_case("CRS:84")))
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct WmsCapabilities {
    pub version: String,
    pub title: Option<String>,
    pub layers: Vec<WmsLayer>,
}

impl WmsCapabilities {
    pub fn layer(&self, name: &str) -> Option<&WmsLayer> {
        self.layers.iter().find(|l| l.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Default)]
struct LayerBuilder {
    name: Option<String>,
    title: Option<String>,
    crs: Vec<String>,
    bbox: Option<Envelope>,
    queryable: bool,
}

fn capabilities_error(message: impl Into<String>) -> GeosourceError {
    GeosourceError::format("WMS capabilities", message)
}

fn attribute(element: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn lat_lon_box(element: &BytesStart<'_>) -> Option<Envelope> {
    let coordinate = |name: &[u8]| attribute(element, name).and_then(|v| v.trim().parse::<f64>().ok());
    Some(Envelope::new(
        coordinate(b"minx")?,
        coordinate(b"miny")?,
        coordinate(b"maxx")?,
        coordinate(b"maxy")?,
    ))
}

/// Parse a `GetCapabilities` response of either supported version
pub fn parse_capabilities(xml: &str) -> Result<WmsCapabilities> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut capabilities = WmsCapabilities::default();
    let mut path: Vec<String> = Vec::new();
    let mut stack: Vec<LayerBuilder> = Vec::new();
    // west, east, south, north
    let mut geographic: [Option<f64>; 4] = [None; 4];
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match name.as_str() {
                    "WMS_Capabilities" | "WMT_MS_Capabilities" => {
                        capabilities.version = attribute(e, b"version").unwrap_or_default();
                    }
                    "Layer" => {
                        let parent = stack.last().cloned().unwrap_or_default();
                        let queryable = attribute(e, b"queryable")
                            .map(|q| q == "1" || q.eq_ignore_ascii_case("true"))
                            .unwrap_or(parent.queryable);
                        stack.push(LayerBuilder { name: None, title: None, queryable, ..parent });
                    }
                    "EX_GeographicBoundingBox" => geographic = [None; 4],
                    "LatLonBoundingBox" => {
                        if let (Some(layer), Some(bbox)) = (stack.last_mut(), lat_lon_box(e)) {
                            layer.bbox = Some(bbox);
                        }
                    }
                    _ => {}
                }
                path.push(name);
                text.clear();
            }
            Ok(Event::Empty(ref e)) => {
                if e.local_name().as_ref() == b"LatLonBoundingBox" {
                    if let (Some(layer), Some(bbox)) = (stack.last_mut(), lat_lon_box(e)) {
                        layer.bbox = Some(bbox);
                    }
                }
            }
            Ok(Event::Text(ref e)) => {
                let unescaped = e.unescape().map_err(|e| capabilities_error(e.to_string()))?;
                text.push_str(&unescaped);
            }
            Ok(Event::End(_)) => {
                let Some(element) = path.pop() else {
                    return Err(capabilities_error("unbalanced end tag"));
                };
                let parent = path.last().map(String::as_str).unwrap_or("");
                let value = std::mem::take(&mut text).trim().to_string();
                match (element.as_str(), parent) {
                    ("Layer", _) => {
                        if let Some(layer) = stack.pop() {
                            if let Some(name) = layer.name.filter(|n| !n.is_empty()) {
                                capabilities.layers.push(WmsLayer {
                                    name,
                                    title: layer.title,
                                    crs: layer.crs,
                                    geographic_bbox: layer.bbox,
                                    queryable: layer.queryable,
                                });
                            }
                        }
                    }
                    ("Name", "Layer") => {
                        if let Some(layer) = stack.last_mut() {
                            layer.name = Some(value);
                        }
                    }
                    ("Title", "Layer") => {
                        if let Some(layer) = stack.last_mut() {
                            layer.title = Some(value);
                        }
                    }
                    ("Title", "Service") => capabilities.title = Some(value),
                    ("CRS" | "SRS", "Layer") => {
                        if let Some(layer) = stack.last_mut() {
                            for code in value.split_whitespace() {
                                if !layer.crs.iter().any(|c| c.eq_ignore_ascii_case(code)) {
                                    layer.crs.push(code.to_string());
                                }
                            }
                        }
                    }
                    (bound, "EX_GeographicBoundingBox") => {
                        let slot = match bound {
                            "westBoundLongitude" => Some(0),
                            "eastBoundLongitude" => Some(1),
                            "southBoundLatitude" => Some(2),
                            "northBoundLatitude" => Some(3),
                            _ => None,
                        };
                        if let Some(slot) = slot {
                            geographic[slot] = value.parse().ok();
                        }
                    }
                    ("EX_GeographicBoundingBox", "Layer") => {
                        if let ([Some(w), Some(e), Some(s), Some(n)], Some(layer)) = (geographic, stack.last_mut()) {
                            layer.bbox = Some(Envelope::new(w, s, e, n));
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(capabilities_error(e.to_string())),
            _ => {}
        }
    }

    if capabilities.version.is_empty() {
        return Err(capabilities_error("not a WMS capabilities document"));
    }
    Ok(capabilities)
}

/// Whether a request in this version and CRS lists latitude before longitude
pub fn flips_axes(version: &str, srid: i32) -> bool {
    version == "1.3.0" && is_geographic_srid(srid)
}

/// Builds the query-string requests of one WMS endpoint
#[derive(Debug, Clone)]
pub struct WmsRequests {
    base: Url,
    config: WmsConfig,
}

impl WmsRequests {
    pub fn new(config: WmsConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { base: parse_url(&config.url)?, config })
    }

    fn with_common(&self, request: &str) -> Url {
        let mut url = self.base.clone();
        url.query_pairs_mut()
            .append_pair("SERVICE", "WMS")
            .append_pair("VERSION", &self.config.version)
            .append_pair("REQUEST", request);
        url
    }

    fn bbox(&self, envelope: &Envelope) -> String {
        let Envelope { min_x, min_y, max_x, max_y } = *envelope;
        if flips_axes(&self.config.version, self.config.srid) {
            format!("{min_y},{min_x},{max_y},{max_x}")
        } else {
            format!("{min_x},{min_y},{max_x},{max_y}")
        }
    }

    fn crs_key(&self) -> &'static str {
        if self.config.version == "1.3.0" {
            "CRS"
        } else {
            "SRS"
        }
    }

    pub fn capabilities(&self) -> Url {
        self.with_common("GetCapabilities")
    }

    /// `GetMap` for an envelope in the configured CRS
    pub fn get_map(&self, layers: &[String], envelope: &Envelope, width: u32, height: u32) -> Url {
        let mut url = self.with_common("GetMap");
        let styles = if self.config.styles.len() == layers.len() { self.config.styles.join(",") } else { String::new() };
        url.query_pairs_mut()
            .append_pair("LAYERS", &layers.join(","))
            .append_pair("STYLES", &styles)
            .append_pair(self.crs_key(), &format!("EPSG:{}", self.config.srid))
            .append_pair("BBOX", &self.bbox(envelope))
            .append_pair("WIDTH", &width.to_string())
            .append_pair("HEIGHT", &height.to_string())
            .append_pair("FORMAT", &self.config.format)
            .append_pair("TRANSPARENT", if self.config.transparent { "TRUE" } else { "FALSE" });
        url
    }

    /// `GetFeatureInfo` at pixel (`i`, `j`) of a `width` x `height` map over `envelope`
    pub fn get_feature_info(
        &self,
        layers: &[String],
        envelope: &Envelope,
        size: (u32, u32),
        pixel: (u32, u32),
        feature_count: usize,
    ) -> Url {
        let mut url = self.get_map(layers, envelope, size.0, size.1);
        let (i_key, j_key) = if self.config.version == "1.3.0" { ("I", "J") } else { ("X", "Y") };
        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != "REQUEST")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        pairs.insert(2, ("REQUEST".to_string(), "GetFeatureInfo".to_string()));
        url.set_query(None);
        {
            let mut query = url.query_pairs_mut();
            query.extend_pairs(pairs);
            query
                .append_pair("QUERY_LAYERS", &layers.join(","))
                .append_pair("INFO_FORMAT", FEATURE_INFO_FORMAT)
                .append_pair("FEATURE_COUNT", &feature_count.max(1).to_string())
                .append_pair(i_key, &pixel.0.to_string())
                .append_pair(j_key, &pixel.1.to_string());
        }
        url
    }
}

/// WMS data source
pub struct WmsSource {
    core: SourceCore,
    requests: WmsRequests,
    client: RwLock<Option<HttpClient>>,
    capabilities: RwLock<Option<WmsCapabilities>>,
}

impl WmsSource {
    pub fn new(name: impl Into<String>, config: WmsConfig) -> Result<Self> {
        Ok(Self {
            core: SourceCore::new(name, "wms", true),
            requests: WmsRequests::new(config)?,
            client: RwLock::new(None),
            capabilities: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &WmsConfig {
        &self.requests.config
    }

    pub fn requests(&self) -> &WmsRequests {
        &self.requests
    }

    /// Capabilities read at open time
    pub fn capabilities(&self) -> Option<WmsCapabilities> {
        self.capabilities.read().clone()
    }

    fn client(&self) -> Result<HttpClient> {
        self.core.ensure_open()?;
        self.client.read().clone().ok_or(GeosourceError::NotOpen)
    }

    fn layer(&self, table: &str) -> Result<WmsLayer> {
        self.core.ensure_open()?;
        validate_table_name(table)?;
        self.capabilities
            .read()
            .as_ref()
            .and_then(|c| c.layer(table).cloned())
            .ok_or_else(|| GeosourceError::TableNotFound { table: table.to_string() })
    }

    fn layer_names(&self) -> Vec<String> {
        let configured = &self.requests.config.layers;
        let guard = self.capabilities.read();
        let advertised = guard.iter().flat_map(|c| c.layers.iter());
        advertised
            .filter(|l| configured.is_empty() || configured.iter().any(|c| c.eq_ignore_ascii_case(&l.name)))
            .map(|l| l.name.clone())
            .collect()
    }

    /// Map image over an envelope in the configured CRS. Transport failures
    /// yield `None`; the reason is kept as the last error.
    pub async fn get_map(&self, envelope: &Envelope, width: u32, height: u32) -> Option<Bytes> {
        let client = self.client().map_err(|e| self.core.record_error(e)).ok()?;
        let url = self.requests.get_map(&self.layer_names(), envelope, width, height);
        match client.get_bytes(&url).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!(source = %self.core.name(), error = %e, "GetMap failed");
                self.core.record_error(e);
                None
            }
        }
    }

    /// Map tiles covering a geographic envelope at a zoom picked from its size.
    ///
    /// Fetches run concurrently up to the configured maximum; failed tiles
    /// are left out.
    pub async fn get_tiles(&self, envelope: &Envelope, max_zoom: u8) -> Vec<(TileId, Bytes)> {
        let Ok(client) = self.client().map_err(|e| self.core.record_error(e)) else {
            return Vec::new();
        };
        let srid = self.requests.config.srid;
        let size = self.requests.config.tile_size;
        let layers = self.layer_names();
        let zoom = zoom_for_envelope(envelope, 0, max_zoom);
        let tiles = tiles_covering(envelope, zoom);
        tracing::debug!(source = %self.core.name(), zoom, tiles = tiles.len(), "fetching WMS tiles");

        let fetches = tiles.into_iter().map(|tile| {
            let client = client.clone();
            let layers = &layers;
            async move {
                let bounds = geosource_geo::reproject_envelope(&tile.envelope(), 4326, srid)?;
                let url = self.requests.get_map(layers, &bounds, size, size);
                client.get_bytes(&url).await.map(|bytes| (tile, bytes))
            }
        });
        let results: Vec<Result<(TileId, Bytes)>> =
            futures::stream::iter(fetches).buffer_unordered(client.max_concurrent()).collect().await;

        let mut fetched = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(tile) => fetched.push(tile),
                Err(e) => {
                    tracing::warn!(source = %self.core.name(), error = %e, "WMS tile fetch failed");
                    self.core.record_error(e);
                }
            }
        }
        fetched.sort_by_key(|(tile, _)| *tile);
        fetched
    }

    async fn feature_info(&self, table: &str, envelope: &Envelope, limit: usize) -> Result<Vec<Feature>> {
        let client = self.client()?;
        let size = self.requests.config.tile_size;
        let url = self.requests.get_feature_info(
            &[table.to_string()],
            envelope,
            (size, size),
            (size / 2, size / 2),
            limit,
        );
        let body = client.get_json(&url).await?;
        let collection: geojson::FeatureCollection =
            serde_json::from_value(body).map_err(|e| GeosourceError::format("GeoJSON", e.to_string()))?;
        let mut features = Vec::with_capacity(collection.features.len());
        for (index, feature) in collection.features.iter().enumerate() {
            match geojson_codec::feature_from_geojson(feature, index as i64 + 1) {
                Ok(feature) => features.push(feature),
                Err(e) => tracing::warn!(table, error = %e, "skipping undecodable feature info"),
            }
        }
        Ok(features)
    }
}

#[async_trait]
impl DataSource for WmsSource {
    fn backend(&self) -> &'static str {
        self.core.backend()
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn state(&self) -> SourceState {
        self.core.state()
    }

    fn is_read_only(&self) -> bool {
        self.core.is_read_only()
    }

    fn last_error(&self) -> Option<String> {
        self.core.last_error()
    }

    async fn open(&self) -> bool {
        self.core
            .open_with(|| async {
                let client = HttpClient::new(&self.requests.config.http)?;
                let xml = client.get_text(&self.requests.capabilities()).await?;
                let capabilities = parse_capabilities(&xml)?;
                tracing::debug!(
                    source = %self.core.name(),
                    version = %capabilities.version,
                    layers = capabilities.layers.len(),
                    "read WMS capabilities"
                );
                *self.capabilities.write() = Some(capabilities);
                *self.client.write() = Some(client);
                Ok(())
            })
            .await
    }

    async fn close(&self) {
        self.core.close();
        *self.client.write() = None;
        *self.capabilities.write() = None;
    }

    async fn table_names(&self) -> Result<Vec<String>> {
        self.core.ensure_open()?;
        Ok(self.layer_names())
    }

    async fn schema(&self, table: &str) -> Result<TableSchema> {
        let layer = self.layer(table)?;
        let srid = self.requests.config.srid;
        self.core
            .schema_or_load(table, || async move {
                let mut schema = TableSchema::new(&layer.name);
                schema.srid = srid;
                if !layer.supports_srid(srid) {
                    tracing::debug!(layer = %layer.name, srid, "layer does not advertise the configured CRS");
                }
                if let Some(bbox) = layer.geographic_bbox {
                    schema.extent = geosource_geo::reproject_envelope(&bbox, 4326, srid).unwrap_or_default();
                }
                Ok(schema)
            })
            .await
    }

    async fn feature_count(&self, table: &str, filter: Option<&QueryFilter>) -> Result<u64> {
        let filter = filter.map(without_paging).unwrap_or_default();
        let scan = self.query_features(table, Some(&filter)).await?;
        Ok(stream::count(scan).await)
    }

    async fn extent(&self, table: &str) -> Result<Envelope> {
        Ok(self.schema(table).await?.extent)
    }

    /// Features under the centre of the filter's search envelope; without a
    /// spatial filter there is nothing to ask the service about.
    async fn query_features(&self, table: &str, filter: Option<&QueryFilter>) -> Result<FeatureStream> {
        let schema = self.schema(table).await?;
        let filter = filter.cloned().unwrap_or_default();
        let residual = Residual::in_process(&filter, &schema)?;
        let Some(envelope) = filter.spatial.as_ref().and_then(|s| s.search_envelope(schema.is_geographic())) else {
            return Ok(stream::from_vec(Vec::new()));
        };
        let limit = if filter.max_features > 0 { filter.max_features + filter.offset } else { 50 };
        let features = match self.feature_info(&schema.table_name, &envelope, limit).await {
            Ok(features) => features,
            Err(e) => {
                tracing::warn!(source = %self.core.name(), table, error = %e, "GetFeatureInfo failed");
                self.core.record_error(e);
                Vec::new()
            }
        };
        Ok(residual.apply(stream::from_vec(features)))
    }

    /// WMS has no lookup by id
    async fn get_feature(&self, table: &str, _id: &FeatureId) -> Result<Option<Feature>> {
        self.layer(table)?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPABILITIES_130: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<WMS_Capabilities version="1.3.0" xmlns="http://www.opengis.net/wms">
  <Service><Name>WMS</Name><Title>City &amp; Region</Title></Service>
  <Capability>
    <Layer>
      <Title>Root</Title>
      <CRS>EPSG:4326</CRS>
      <CRS>EPSG:3857</CRS>
      <Layer queryable="1">
        <Name>roads</Name>
        <Title>Roads</Title>
        <EX_GeographicBoundingBox>
          <westBoundLongitude>5.5</westBoundLongitude>
          <eastBoundLongitude>15.0</eastBoundLongitude>
          <southBoundLatitude>47.0</southBoundLatitude>
          <northBoundLatitude>55.0</northBoundLatitude>
        </EX_GeographicBoundingBox>
      </Layer>
      <Layer>
        <Name>parcels</Name>
        <CRS>EPSG:25832</CRS>
      </Layer>
    </Layer>
  </Capability>
</WMS_Capabilities>"#;

    const CAPABILITIES_111: &str = r#"<?xml version="1.0"?>
<WMT_MS_Capabilities version="1.1.1">
  <Service><Title>Legacy</Title></Service>
  <Capability>
    <Layer>
      <SRS>EPSG:4326 EPSG:900913</SRS>
      <Layer queryable="0">
        <Name>rivers</Name>
        <LatLonBoundingBox minx="-10" miny="35" maxx="30" maxy="60"/>
      </Layer>
    </Layer>
  </Capability>
</WMT_MS_Capabilities>"#;

    #[test]
    fn test_capabilities_130() {
        let caps = parse_capabilities(CAPABILITIES_130).unwrap();
        assert_eq!(caps.version, "1.3.0");
        assert_eq!(caps.title.as_deref(), Some("City & Region"));
        assert_eq!(caps.layers.len(), 2);

        let roads = caps.layer("ROADS").unwrap();
        assert_eq!(roads.title.as_deref(), Some("Roads"));
        assert!(roads.queryable);
        assert_eq!(roads.geographic_bbox, Some(Envelope::new(5.5, 47.0, 15.0, 55.0)));
        assert!(roads.supports_srid(3857));

        // Inherited CRS list plus its own
        let parcels = caps.layer("parcels").unwrap();
        assert_eq!(parcels.crs, vec!["EPSG:4326", "EPSG:3857", "EPSG:25832"]);
        assert!(!parcels.queryable);
        assert!(parcels.geographic_bbox.is_none());
    }

    #[test]
    fn test_capabilities_111() {
        let caps = parse_capabilities(CAPABILITIES_111).unwrap();
        assert_eq!(caps.version, "1.1.1");
        let rivers = caps.layer("rivers").unwrap();
        assert_eq!(rivers.geographic_bbox, Some(Envelope::new(-10.0, 35.0, 30.0, 60.0)));
        assert!(rivers.supports_srid(900913));
        assert!(!rivers.queryable);
    }

    #[test]
    fn test_not_capabilities() {
        assert!(parse_capabilities("<html><body>error</body></html>").is_err());
        assert!(parse_capabilities("<WMS_Capabilities version=\"1.3.0\"><Layer></WMS_Capabilities>").is_err());
    }

    fn query(url: &Url) -> Vec<(String, String)> {
        url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect()
    }

    fn value<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
        pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_axis_order_flip() {
        assert!(flips_axes("1.3.0", 4326));
        assert!(!flips_axes("1.1.1", 4326));
        assert!(!flips_axes("1.3.0", 3857));

        let mut config = WmsConfig::new("https://maps.example.com/wms?map=city");
        let envelope = Envelope::new(5.0, 47.0, 15.0, 55.0);
        let layers = vec!["roads".to_string()];

        let url = WmsRequests::new(config.clone()).unwrap().get_map(&layers, &envelope, 256, 256);
        let pairs = query(&url);
        assert_eq!(value(&pairs, "map"), Some("city"));
        assert_eq!(value(&pairs, "CRS"), Some("EPSG:4326"));
        assert_eq!(value(&pairs, "BBOX"), Some("47,5,55,15"));
        assert_eq!(value(&pairs, "TRANSPARENT"), Some("TRUE"));

        config.version = "1.1.1".into();
        let url = WmsRequests::new(config).unwrap().get_map(&layers, &envelope, 256, 256);
        let pairs = query(&url);
        assert_eq!(value(&pairs, "SRS"), Some("EPSG:4326"));
        assert_eq!(value(&pairs, "BBOX"), Some("5,47,15,55"));
    }

    #[test]
    fn test_feature_info_request() {
        let requests = WmsRequests::new(WmsConfig::new("https://maps.example.com/wms")).unwrap();
        let url = requests.get_feature_info(
            &["roads".to_string()],
            &Envelope::new(0.0, 0.0, 1.0, 1.0),
            (256, 256),
            (128, 128),
            5,
        );
        let pairs = query(&url);
        assert_eq!(value(&pairs, "REQUEST"), Some("GetFeatureInfo"));
        assert_eq!(pairs.iter().filter(|(k, _)| k == "REQUEST").count(), 1);
        assert_eq!(value(&pairs, "QUERY_LAYERS"), Some("roads"));
        assert_eq!(value(&pairs, "INFO_FORMAT"), Some(FEATURE_INFO_FORMAT));
        assert_eq!(value(&pairs, "I"), Some("128"));
        assert_eq!(value(&pairs, "FEATURE_COUNT"), Some("5"));
    }

    #[tokio::test]
    async fn test_source_is_read_only() {
        let source = WmsSource::new("city", WmsConfig::new("https://maps.example.com/wms")).unwrap();
        assert!(source.is_read_only());
        let feature = Feature::new(1i64, None);
        assert!(source.insert_feature("roads", &feature).await.unwrap_err().is_unsupported());
        assert!(source.get_map(&Envelope::new(0.0, 0.0, 1.0, 1.0), 10, 10).await.is_none());
        assert!(source.last_error().is_some());
    }
}
