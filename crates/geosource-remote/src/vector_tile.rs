//! Vector tile adapter.
//!
//! Tile layers become tables. A query picks a zoom level from the size of
//! its search envelope, fetches the covering tiles with bounded
//! concurrency and remaps tile-local coordinates to longitude/latitude.

use async_trait::async_trait;
use futures::StreamExt;
use geosource_core::config::VectorTileConfig;
use geosource_core::error::{GeosourceError, Result};
use geosource_core::models::{
    ColumnInfo, Envelope, Feature, FeatureId, FieldType, GeometryType, QueryFilter, TableSchema,
};
use geosource_store::residual::{without_paging, Residual};
use geosource_store::source::{validate_table_name, DataSource, FeatureStream, SourceCore, SourceState};
use geosource_store::stream::{self, spawn_scan, DEFAULT_BUFFER};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

use crate::http::{parse_url, HttpClient};
use crate::mvt::{self, GeomType, Tile};
use crate::tile::{tiles_covering, world_envelope, zoom_for_envelope, TileId};

const WEB_MERCATOR_TILES_SRID: i32 = 4326;

/// Expand the `{z}/{x}/{y}` template for one tile
pub fn tile_url(template: &str, tile: TileId) -> Result<Url> {
    let url = template
        .replace("{z}", &tile.z.to_string())
        .replace("{x}", &tile.x.to_string())
        .replace("{y}", &tile.y.to_string());
    parse_url(&url)
}

/// Fetch and decode one tile; a missing tile is an empty one
async fn fetch_tile(client: &HttpClient, template: &str, tile: TileId) -> Result<Tile> {
    let url = tile_url(template, tile)?;
    match client.get_optional(&url).await? {
        Some(body) if !body.is_empty() => mvt::decode_tile(&body),
        _ => Ok(Tile::default()),
    }
}

fn geometry_type(kind: GeomType) -> Option<GeometryType> {
    match kind {
        GeomType::Point => Some(GeometryType::Point),
        GeomType::Linestring => Some(GeometryType::LineString),
        GeomType::Polygon => Some(GeometryType::Polygon),
        GeomType::Unknown => None,
    }
}

/// Schemas of every layer in a probe tile: attribute keys, value types and geometry kind
pub fn layer_schemas(tile: &Tile) -> Vec<TableSchema> {
    tile.layers
        .iter()
        .map(|layer| {
            let mut schema = TableSchema::new(&layer.name);
            schema.srid = WEB_MERCATOR_TILES_SRID;
            schema.geometry_column = Some("geometry".to_string());
            schema.extent = world_envelope();
            schema.feature_count = layer.features.len() as u64;

            let mut types: HashMap<&str, FieldType> = HashMap::new();
            for feature in &layer.features {
                for pair in feature.tags.chunks_exact(2) {
                    let (Some(key), Some(value)) =
                        (layer.keys.get(pair[0] as usize), layer.values.get(pair[1] as usize))
                    else {
                        continue;
                    };
                    if let Some(found) = value.to_attribute().field_type() {
                        let entry = types.entry(key.as_str()).or_insert(found);
                        if *entry != found {
                            *entry = match (*entry, found) {
                                (FieldType::Integer, FieldType::Float) | (FieldType::Float, FieldType::Integer) => {
                                    FieldType::Float
                                }
                                _ => FieldType::Text,
                            };
                        }
                    }
                }
                let kind = geometry_type(feature.geom_type());
                schema.geometry_type = match (schema.geometry_type, kind) {
                    (None, kind) => kind,
                    (Some(existing), Some(kind)) if existing != kind => Some(GeometryType::Geometry),
                    (existing, _) => existing,
                };
            }
            // Key table order keeps columns stable between runs
            schema.columns = layer
                .keys
                .iter()
                .filter_map(|key| types.get(key.as_str()).map(|t| ColumnInfo::new(key.clone(), *t)))
                .collect();
            schema
        })
        .collect()
}

/// Decode the features of one layer of one tile into geographic coordinates
fn layer_features(tile: &Tile, tile_id: TileId, layer_name: &str, next_id: &mut i64) -> Vec<Feature> {
    let Some(layer) = tile.layers.iter().find(|l| l.name.eq_ignore_ascii_case(layer_name)) else {
        return Vec::new();
    };
    let extent = layer.effective_extent();
    let mut features = Vec::with_capacity(layer.features.len());
    for raw in &layer.features {
        let id = match raw.id {
            Some(id) => i64::try_from(id).map(FeatureId::Integer).unwrap_or_else(|_| FeatureId::Text(id.to_string())),
            None => {
                *next_id += 1;
                FeatureId::Text(format!("{tile_id}/{}", *next_id))
            }
        };
        let decoded = mvt::decode_geometry(raw.geom_type(), &raw.geometry)
            .and_then(|geometry| layer.attributes(raw).map(|attributes| (geometry, attributes)));
        match decoded {
            Ok((mut geometry, attributes)) => {
                mvt::to_geographic(&mut geometry, tile_id, extent);
                features.push(Feature { id, geometry: Some(geometry), attributes });
            }
            Err(e) => tracing::warn!(tile = %tile_id, layer = layer_name, error = %e, "skipping undecodable tile feature"),
        }
    }
    features
}

/// Vector tile data source
pub struct VectorTileSource {
    core: SourceCore,
    config: Arc<VectorTileConfig>,
    client: RwLock<Option<HttpClient>>,
    tables: RwLock<Vec<String>>,
    buffer: usize,
}

impl VectorTileSource {
    pub fn new(name: impl Into<String>, config: VectorTileConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            core: SourceCore::new(name, "vector_tile", true),
            config: Arc::new(config),
            client: RwLock::new(None),
            tables: RwLock::new(Vec::new()),
            buffer: DEFAULT_BUFFER,
        })
    }

    pub fn stream_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn config(&self) -> &VectorTileConfig {
        &self.config
    }

    fn client(&self) -> Result<HttpClient> {
        self.core.ensure_open()?;
        self.client.read().clone().ok_or(GeosourceError::NotOpen)
    }

    fn probe_tile(&self) -> TileId {
        TileId::containing(0.0, 0.0, self.config.min_zoom)
    }

    fn wanted(&self, layer: &str) -> bool {
        self.config.layers.is_empty() || self.config.layers.iter().any(|l| l.eq_ignore_ascii_case(layer))
    }

    fn check_table(&self, table: &str) -> Result<()> {
        self.core.ensure_open()?;
        validate_table_name(table)?;
        if self.tables.read().iter().any(|t| t.eq_ignore_ascii_case(table)) {
            Ok(())
        } else {
            Err(GeosourceError::TableNotFound { table: table.to_string() })
        }
    }

    /// Fetch the probe tile and cache a schema for every wanted layer
    async fn probe(&self, client: &HttpClient) -> Result<Vec<String>> {
        let tile = self.probe_tile();
        let probe = fetch_tile(client, &self.config.url_template, tile).await?;
        let mut names = Vec::new();
        for schema in layer_schemas(&probe).into_iter().filter(|s| self.wanted(&s.table_name)) {
            names.push(schema.table_name.clone());
            self.core.cache_schema(schema);
        }
        // Configured layers absent from the probe tile still exist at higher zooms
        for layer in &self.config.layers {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(layer)) {
                names.push(layer.clone());
            }
        }
        tracing::debug!(source = %self.core.name(), %tile, layers = names.len(), "probed vector tiles");
        Ok(names)
    }

    /// Tiles a query over `envelope` fans out to
    pub fn plan_tiles(&self, envelope: &Envelope) -> Vec<TileId> {
        let world = world_envelope();
        let bounds = envelope.intersection(&world);
        if bounds.is_null() {
            return Vec::new();
        }
        let zoom = zoom_for_envelope(&bounds, self.config.min_zoom, self.config.max_zoom);
        tiles_covering(&bounds, zoom)
    }
}

/// Stream every feature of `layer` in `tiles`, dropping repeats of an id
/// already seen in a neighbouring tile
async fn scan_tiles(
    client: HttpClient,
    config: Arc<VectorTileConfig>,
    layer: String,
    tiles: Vec<TileId>,
    errors: geosource_store::source::ErrorSlot,
    tx: mpsc::Sender<Feature>,
) -> Result<()> {
    let concurrency = client.max_concurrent();
    let fetches = tiles.into_iter().map(|tile| {
        let client = client.clone();
        let template = config.url_template.clone();
        async move { (tile, fetch_tile(&client, &template, tile).await) }
    });
    let mut results = futures::stream::iter(fetches).buffered(concurrency);

    let mut seen: HashSet<FeatureId> = HashSet::new();
    let mut next_id = 0i64;
    while let Some((tile_id, result)) = results.next().await {
        let tile = match result {
            Ok(tile) => tile,
            Err(e) => {
                tracing::warn!(tile = %tile_id, error = %e, "vector tile fetch failed");
                *errors.write() = Some(e.to_string());
                continue;
            }
        };
        for feature in layer_features(&tile, tile_id, &layer, &mut next_id) {
            if matches!(feature.id, FeatureId::Integer(_)) && !seen.insert(feature.id.clone()) {
                continue;
            }
            if tx.send(feature).await.is_err() {
                return Ok(());
            }
        }
    }
    Ok(())
}

#[async_trait]
impl DataSource for VectorTileSource {
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
                let client = HttpClient::new(&self.config.http)?;
                let tables = self.probe(&client).await?;
                *self.tables.write() = tables;
                *self.client.write() = Some(client);
                Ok(())
            })
            .await
    }

    async fn close(&self) {
        self.core.close();
        *self.client.write() = None;
    }

    async fn table_names(&self) -> Result<Vec<String>> {
        self.core.ensure_open()?;
        Ok(self.tables.read().clone())
    }

    async fn schema(&self, table: &str) -> Result<TableSchema> {
        self.check_table(table)?;
        let client = self.client()?;
        self.core
            .schema_or_load(table, || async move {
                let probe = fetch_tile(&client, &self.config.url_template, self.probe_tile()).await?;
                let found = layer_schemas(&probe).into_iter().find(|s| s.table_name.eq_ignore_ascii_case(table));
                Ok(found.unwrap_or_else(|| {
                    let mut schema = TableSchema::new(table);
                    schema.srid = WEB_MERCATOR_TILES_SRID;
                    schema.geometry_column = Some("geometry".to_string());
                    schema.extent = world_envelope();
                    schema
                }))
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

    async fn query_features(&self, table: &str, filter: Option<&QueryFilter>) -> Result<FeatureStream> {
        let schema = self.schema(table).await?;
        let filter = filter.cloned().unwrap_or_default();
        let residual = Residual::in_process(&filter, &schema)?;
        let envelope = filter
            .spatial
            .as_ref()
            .and_then(|s| s.search_envelope(true))
            .unwrap_or_else(world_envelope);
        let tiles = self.plan_tiles(&envelope);
        tracing::debug!(source = %self.core.name(), table, tiles = tiles.len(), "querying vector tiles");

        let client = self.client()?;
        let config = Arc::clone(&self.config);
        let layer = schema.table_name.clone();
        let errors = self.core.error_slot();
        let scan = spawn_scan(self.buffer, self.core.error_slot(), move |tx| {
            scan_tiles(client, config, layer, tiles, errors, tx)
        });
        Ok(residual.apply(scan))
    }

    /// Linear search over the tiles of the minimum zoom
    async fn get_feature(&self, table: &str, id: &FeatureId) -> Result<Option<Feature>> {
        let mut scan = self.query_features(table, None).await?;
        while let Some(feature) = scan.next().await {
            if &feature.id == id {
                return Ok(Some(feature));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mvt::{Feature as MvtFeature, Layer, Value as MvtValue};
    use geosource_core::models::Geometry;

    pub(crate) fn sample_tile() -> Tile {
        Tile {
            layers: vec![
                Layer {
                    version: 2,
                    name: "poi".into(),
                    features: vec![
                        MvtFeature {
                            id: Some(1),
                            tags: vec![0, 0, 1, 1],
                            r#type: Some(GeomType::Point as i32),
                            geometry: vec![9, 4096, 4096],
                        },
                        MvtFeature {
                            id: Some(2),
                            tags: vec![0, 2, 1, 3],
                            r#type: Some(GeomType::Point as i32),
                            geometry: vec![9, 2048, 2048],
                        },
                    ],
                    keys: vec!["name".into(), "rank".into()],
                    values: vec![
                        MvtValue { string_value: Some("Cafe".into()), ..Default::default() },
                        MvtValue { int_value: Some(1), ..Default::default() },
                        MvtValue { string_value: Some("Museum".into()), ..Default::default() },
                        MvtValue { double_value: Some(2.5), ..Default::default() },
                    ],
                    extent: Some(4096),
                },
                Layer {
                    version: 2,
                    name: "water".into(),
                    features: Vec::new(),
                    keys: Vec::new(),
                    values: Vec::new(),
                    extent: None,
                },
            ],
        }
    }

    #[test]
    fn test_tile_url_template() {
        let url = tile_url("https://tiles.example.com/{z}/{x}/{y}.pbf?key=k", TileId::new(3, 4, 2)).unwrap();
        assert_eq!(url.as_str(), "https://tiles.example.com/3/4/2.pbf?key=k");
    }

    #[test]
    fn test_layer_schemas() {
        let schemas = layer_schemas(&sample_tile());
        assert_eq!(schemas.len(), 2);
        let poi = &schemas[0];
        assert_eq!(poi.table_name, "poi");
        assert_eq!(poi.geometry_type, Some(GeometryType::Point));
        assert_eq!(poi.feature_count, 2);
        assert_eq!(poi.column("name").unwrap().field_type, FieldType::Text);
        assert_eq!(poi.column("rank").unwrap().field_type, FieldType::Float);
        assert!(schemas[1].columns.is_empty());
        assert_eq!(schemas[1].geometry_type, None);
    }

    #[test]
    fn test_features_are_geographic() {
        let mut next_id = 0;
        let features = layer_features(&sample_tile(), TileId::new(0, 0, 0), "POI", &mut next_id);
        assert_eq!(features.len(), 2);
        // Tile centre of the world tile
        match &features[0].geometry {
            Some(Geometry::Point(c)) => assert!(c.x.abs() < 1e-9 && c.y.abs() < 1e-9),
            other => panic!("expected a point, got {other:?}"),
        }
        // Quarter of the way in: west of Greenwich, north of the equator
        match &features[1].geometry {
            Some(Geometry::Point(c)) => assert!((c.x + 90.0).abs() < 1e-9 && c.y > 0.0),
            other => panic!("expected a point, got {other:?}"),
        }
        assert_eq!(features[1].attribute("name"), Some(&geosource_core::models::Value::from("Museum")));
        assert!(layer_features(&sample_tile(), TileId::new(0, 0, 0), "missing", &mut next_id).is_empty());
    }

    #[test]
    fn test_plan_tiles_respects_zoom_range() {
        let mut config = VectorTileConfig::new("https://tiles.example.com/{z}/{x}/{y}.pbf");
        config.min_zoom = 2;
        config.max_zoom = 10;
        let source = VectorTileSource::new("tiles", config).unwrap();

        let world = source.plan_tiles(&world_envelope());
        assert_eq!(world.len(), 16);
        assert!(world.iter().all(|t| t.z == 2));

        let city = source.plan_tiles(&Envelope::new(13.3, 52.4, 13.5, 52.6));
        assert!(city.iter().all(|t| t.z <= 10 && t.z >= 2));
        assert!(!city.is_empty());
        assert!(source.plan_tiles(&Envelope::new(0.0, 86.0, 1.0, 89.0)).is_empty());
    }
}
