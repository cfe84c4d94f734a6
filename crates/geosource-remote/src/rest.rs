//! REST/GeoJSON adapter.
//!
//! Feature lists are fetched page by page into a lazy stream. A service-side
//! bbox parameter narrows the fetch when configured; the exact spatial test,
//! attribute predicates, sort and paging then run in-process.

use async_trait::async_trait;
use geosource_core::codec::{geojson as geojson_codec, wkb, wkt};
use geosource_core::config::{GeometryFormat, PaginationStyle, RestConfig};
use geosource_core::error::{GeosourceError, Result};
use geosource_core::models::{
    AttributeTable, ColumnInfo, Envelope, Feature, FeatureId, FieldType, Geometry, GeometryType,
    QueryFilter, TableSchema, Value,
};
use geosource_store::residual::{without_paging, Pushdown, Residual};
use geosource_store::source::{DataSource, FeatureStream, SourceCore, SourceState};
use geosource_store::stream::{self, spawn_scan, DEFAULT_BUFFER};
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::Method;
use serde_json::{Map, Value as Json};
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

use crate::http::{join_path, parse_url, HttpClient};

/// Value at a dotted path; numeric segments index arrays. The empty path is the value itself.
pub fn value_at<'a>(value: &'a Json, path: &str) -> Option<&'a Json> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Json::Object(map) => map.get(segment),
        Json::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Store `value` at a dotted path, creating intermediate objects
fn set_at(target: &mut Map<String, Json>, path: &str, value: Json) {
    match path.split_once('.') {
        None => {
            target.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = target.entry(head.to_string()).or_insert_with(|| Json::Object(Map::new()));
            if !child.is_object() {
                *child = Json::Object(Map::new());
            }
            if let Json::Object(map) = child {
                set_at(map, rest, value);
            }
        }
    }
}

fn top_level(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

fn rest_error(message: impl Into<String>) -> GeosourceError {
    GeosourceError::format("REST", message)
}

fn id_from_json(value: &Json) -> Option<FeatureId> {
    match value {
        Json::Number(n) => n.as_i64().map(FeatureId::Integer),
        Json::String(s) if !s.is_empty() => Some(FeatureId::Text(s.clone())),
        _ => None,
    }
}

/// Items of a feature-list response
pub fn feature_items<'a>(body: &'a Json, config: &RestConfig) -> Result<&'a [Json]> {
    let list = if config.features_path.is_empty() {
        match body {
            Json::Object(map) => map.get("features").unwrap_or(body),
            other => other,
        }
    } else {
        value_at(body, &config.features_path)
            .ok_or_else(|| rest_error(format!("response has no '{}'", config.features_path)))?
    };
    list.as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| rest_error("response is not a feature list"))
}

fn decode_geometry(item: &Json, attributes: &AttributeTable, config: &RestConfig) -> Result<Option<Geometry>> {
    if let GeometryFormat::Custom { x_property, y_property } = &config.geometry_format {
        let x = attributes.get(x_property).and_then(Value::as_f64);
        let y = attributes.get(y_property).and_then(Value::as_f64);
        return Ok(x.zip(y).map(|(x, y)| Geometry::point(x, y)));
    }
    let Some(raw) = value_at(item, &config.geometry_property).filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let geometry = match &config.geometry_format {
        GeometryFormat::GeoJson => geojson_codec::geometry_from_json(raw)?,
        GeometryFormat::Wkt => {
            let text = raw.as_str().ok_or_else(|| rest_error("WKT geometry is not a string"))?;
            wkt::parse_with_srid(text)?.0
        }
        GeometryFormat::Wkb => {
            let text = raw.as_str().ok_or_else(|| rest_error("WKB geometry is not a hex string"))?;
            wkb::decode_hex(text)?
        }
        GeometryFormat::Custom { .. } => return Ok(None),
    };
    Ok(Some(geometry))
}

/// Decode one list item into a feature; `fallback_id` is used when it carries no id
pub fn decode_item(item: &Json, config: &RestConfig, fallback_id: i64) -> Result<Feature> {
    if !item.is_object() {
        return Err(rest_error("feature item is not an object"));
    }
    let id = value_at(item, &config.id_property)
        .and_then(id_from_json)
        .unwrap_or(FeatureId::Integer(fallback_id));

    let attributes: AttributeTable = if config.attributes_property.is_empty() {
        let skip = [top_level(&config.id_property), top_level(&config.geometry_property)];
        item.as_object()
            .into_iter()
            .flatten()
            .filter(|(k, _)| !skip.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), Value::from_json(v)))
            .collect()
    } else {
        match value_at(item, &config.attributes_property) {
            Some(Json::Object(map)) => map.iter().map(|(k, v)| (k.clone(), Value::from_json(v))).collect(),
            _ => AttributeTable::new(),
        }
    };

    let geometry = decode_geometry(item, &attributes, config)?;
    Ok(Feature { id, geometry, attributes })
}

/// Request body for a create or update, in the configured layout
pub fn encode_feature(feature: &Feature, config: &RestConfig, include_id: bool) -> Json {
    let mut body = Map::new();
    if include_id {
        set_at(&mut body, &config.id_property, serde_json::to_value(&feature.id).unwrap_or(Json::Null));
    }
    let mut attributes = feature.attributes.clone();
    match (&config.geometry_format, &feature.geometry) {
        (_, None) => {}
        (GeometryFormat::GeoJson, Some(g)) => {
            set_at(&mut body, &config.geometry_property, geojson_codec::geometry_to_json(g))
        }
        (GeometryFormat::Wkt, Some(g)) => set_at(&mut body, &config.geometry_property, Json::String(wkt::write(g))),
        (GeometryFormat::Wkb, Some(g)) => {
            set_at(&mut body, &config.geometry_property, Json::String(wkb::to_hex(&wkb::encode(g))))
        }
        (GeometryFormat::Custom { x_property, y_property }, Some(Geometry::Point(c))) => {
            attributes.set(x_property.clone(), c.x);
            attributes.set(y_property.clone(), c.y);
        }
        (GeometryFormat::Custom { .. }, Some(other)) => {
            tracing::warn!(geometry_type = ?other.geometry_type(), "only points have a coordinate-property form");
        }
    }
    if config.attributes_property.is_empty() {
        for (name, value) in attributes.iter() {
            body.insert(name.to_string(), value.to_json());
        }
    } else {
        set_at(&mut body, &config.attributes_property, attributes.to_json());
    }
    Json::Object(body)
}

/// Canonical type of a JSON-derived value, widening integer/float mixes
fn merge_type(current: Option<FieldType>, value: &Value) -> Option<FieldType> {
    match (current, value.field_type()) {
        (current, None) => current,
        (None, Some(t)) => Some(t),
        (Some(a), Some(b)) if a == b => Some(a),
        (Some(FieldType::Integer), Some(FieldType::Float)) | (Some(FieldType::Float), Some(FieldType::Integer)) => {
            Some(FieldType::Float)
        }
        _ => Some(FieldType::Text),
    }
}

/// Schema inferred from a complete scan of a table
fn infer_schema(table: &str, config: &RestConfig, features: &[Feature]) -> TableSchema {
    let mut schema = TableSchema::new(table);
    schema.srid = config.srid;
    schema.primary_key = Some(config.id_property.clone());
    schema.geometry_column = Some(match &config.geometry_format {
        GeometryFormat::Custom { x_property, y_property } => format!("{x_property},{y_property}"),
        _ => config.geometry_property.clone(),
    });

    let mut types: Vec<(String, Option<FieldType>)> = Vec::new();
    for feature in features {
        for (name, value) in feature.attributes.iter() {
            match types.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
                Some((_, t)) => *t = merge_type(*t, value),
                None => types.push((name.to_string(), merge_type(None, value))),
            }
        }
        if let Some(geometry) = &feature.geometry {
            schema.extent.expand_to_include(&geometry.envelope());
            let kind = geometry.geometry_type();
            schema.geometry_type = match schema.geometry_type {
                None => Some(kind),
                Some(existing) if existing == kind => Some(existing),
                Some(_) => Some(GeometryType::Geometry),
            };
        }
    }
    schema.columns = types
        .into_iter()
        .map(|(name, t)| ColumnInfo::new(name, t.unwrap_or_default()))
        .collect();
    schema.feature_count = features.len() as u64;
    schema
}

/// Fetch every page of a list URL into `tx`
async fn scan_pages(client: HttpClient, config: Arc<RestConfig>, url: Url, tx: mpsc::Sender<Feature>) -> Result<()> {
    let paging = &config.pagination;
    let page_size = paging.page_size.max(1);
    let mut page_number = paging.first_page;
    let mut offset: u64 = 0;
    let mut cursor: Option<String> = None;
    let mut fallback_id: i64 = 1;

    loop {
        let mut page_url = url.clone();
        if paging.style != PaginationStyle::None {
            let mut query = page_url.query_pairs_mut();
            query.append_pair(&paging.page_size_param, &page_size.to_string());
            match paging.style {
                PaginationStyle::PageNumber => {
                    query.append_pair(&paging.page_param, &page_number.to_string());
                }
                PaginationStyle::Offset => {
                    query.append_pair(&paging.offset_param, &offset.to_string());
                }
                PaginationStyle::Cursor => {
                    if let Some(cursor) = &cursor {
                        query.append_pair(&paging.cursor_param, cursor);
                    }
                }
                PaginationStyle::None => {}
            }
        }

        let body = client.get_json(&page_url).await?;
        let items = feature_items(&body, &config)?;
        for item in items {
            match decode_item(item, &config, fallback_id) {
                Ok(feature) => {
                    if tx.send(feature).await.is_err() {
                        return Ok(());
                    }
                }
                Err(e) => tracing::warn!(url = %page_url, error = %e, "skipping undecodable REST feature"),
            }
            fallback_id += 1;
        }

        let received = items.len();
        let full_page = received >= page_size as usize;
        match paging.style {
            PaginationStyle::None => break,
            PaginationStyle::PageNumber if full_page => page_number += 1,
            PaginationStyle::Offset if full_page => offset += received as u64,
            PaginationStyle::Cursor if received > 0 => {
                let next = value_at(&body, &paging.next_cursor_path).and_then(|v| match v {
                    Json::String(s) if !s.is_empty() => Some(s.clone()),
                    Json::Number(n) => Some(n.to_string()),
                    _ => None,
                });
                match next {
                    Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                    _ => break,
                }
            }
            _ => break,
        }
    }
    Ok(())
}

/// REST/GeoJSON data source
pub struct RestSource {
    core: SourceCore,
    config: Arc<RestConfig>,
    base: Url,
    client: RwLock<Option<HttpClient>>,
    tables: RwLock<Vec<String>>,
    buffer: usize,
}

impl RestSource {
    pub fn new(name: impl Into<String>, config: RestConfig) -> Result<Self> {
        config.validate()?;
        let base = parse_url(&config.base_url)?;
        Ok(Self {
            core: SourceCore::new(name, "rest", config.read_only),
            config: Arc::new(config),
            base,
            client: RwLock::new(None),
            tables: RwLock::new(Vec::new()),
            buffer: DEFAULT_BUFFER,
        })
    }

    pub fn stream_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn config(&self) -> &RestConfig {
        &self.config
    }

    fn client(&self) -> Result<HttpClient> {
        self.core.ensure_open()?;
        self.client.read().clone().ok_or(GeosourceError::NotOpen)
    }

    /// Expand an endpoint template for a table and optional feature id
    fn endpoint(&self, template: &str, table: &str, id: Option<&FeatureId>) -> Result<Url> {
        let mut path = template.replace("{table}", table);
        if let Some(id) = id {
            path = path.replace("{id}", &id.to_string());
        }
        join_path(&self.base, &path)
    }

    fn check_table(&self, table: &str) -> Result<()> {
        self.core.ensure_open()?;
        geosource_store::source::validate_table_name(table)?;
        if self.tables.read().iter().any(|t| t.eq_ignore_ascii_case(table)) {
            Ok(())
        } else {
            Err(GeosourceError::TableNotFound { table: table.to_string() })
        }
    }

    async fn fetch_tables(&self, client: &HttpClient) -> Result<Vec<String>> {
        let Some(template) = &self.config.endpoints.tables else {
            if self.config.tables.is_empty() {
                return Err(GeosourceError::ConfigMissing { key: "tables".to_string() });
            }
            return Ok(self.config.tables.clone());
        };
        let body = client.get_json(&join_path(&self.base, template)?).await?;
        let list = match &body {
            Json::Object(map) => map.get("tables").unwrap_or(&body),
            other => other,
        };
        let names: Vec<String> = list
            .as_array()
            .ok_or_else(|| rest_error("table list is not an array"))?
            .iter()
            .filter_map(|entry| match entry {
                Json::String(s) => Some(s.clone()),
                Json::Object(map) => map.get("name").and_then(Json::as_str).map(str::to_string),
                _ => None,
            })
            .collect();
        Ok(names)
    }

    /// List URL for a filter, and what the service evaluates for it
    fn list_url(&self, table: &str, filter: &QueryFilter, geographic: bool) -> Result<(Url, Pushdown)> {
        let mut pushdown = Pushdown::none();
        let envelope = filter.spatial.as_ref().and_then(|s| s.search_envelope(geographic));
        let template = match (&self.config.endpoints.spatial_query, envelope) {
            (Some(spatial), Some(_)) => spatial.as_str(),
            _ => self.config.endpoints.list.as_str(),
        };
        let mut url = self.endpoint(template, table, None)?;

        let bbox = envelope.and_then(|e| e.to_array()).zip(self.config.bbox_param.as_ref());
        let attribute = filter.attribute.as_ref().zip(self.config.filter_param.as_ref());
        if bbox.is_some() || attribute.is_some() {
            let mut query = url.query_pairs_mut();
            if let Some(([min_x, min_y, max_x, max_y], param)) = bbox {
                query.append_pair(param, &format!("{min_x},{min_y},{max_x},{max_y}"));
            }
            if let Some((attribute, param)) = attribute {
                query.append_pair(param, &attribute.predicate);
                for (name, value) in &attribute.parameters {
                    let text = match value {
                        Value::Text(s) => s.clone(),
                        other => other.to_json().to_string(),
                    };
                    query.append_pair(name.trim_start_matches([':', '@']), &text);
                }
                pushdown.attribute = true;
            }
        }
        Ok((url, pushdown))
    }

    /// Raw scan of a table, before any in-process filtering
    fn scan(&self, client: HttpClient, url: Url) -> FeatureStream {
        let config = Arc::clone(&self.config);
        spawn_scan(self.buffer, self.core.error_slot(), move |tx| scan_pages(client, config, url, tx))
    }

    async fn load_schema(&self, table: &str) -> Result<TableSchema> {
        let client = self.client()?;
        let url = self.endpoint(&self.config.endpoints.list, table, None)?;
        let features: Vec<Feature> = self.scan(client, url).collect().await;
        let schema = infer_schema(table, &self.config, &features);
        tracing::debug!(table, features = schema.feature_count, columns = schema.columns.len(), "inferred REST schema");
        Ok(schema)
    }

    fn id_from_response(&self, response: Option<&Json>) -> Option<FeatureId> {
        let response = response?;
        value_at(response, &self.config.id_property).and_then(id_from_json).or_else(|| {
            feature_items(response, &self.config)
                .ok()
                .and_then(|items| items.first())
                .and_then(|item| value_at(item, &self.config.id_property))
                .and_then(id_from_json)
        })
    }
}

#[async_trait]
impl DataSource for RestSource {
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
                let tables = self.fetch_tables(&client).await?;
                tracing::debug!(source = %self.core.name(), tables = tables.len(), "REST tables resolved");
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
        self.core.schema_or_load(table, || self.load_schema(table)).await
    }

    async fn feature_count(&self, table: &str, filter: Option<&QueryFilter>) -> Result<u64> {
        match filter {
            Some(filter) => {
                let scan = self.query_features(table, Some(&without_paging(filter))).await?;
                Ok(stream::count(scan).await)
            }
            None => Ok(self.schema(table).await?.feature_count),
        }
    }

    async fn extent(&self, table: &str) -> Result<Envelope> {
        Ok(self.schema(table).await?.extent)
    }

    async fn query_features(&self, table: &str, filter: Option<&QueryFilter>) -> Result<FeatureStream> {
        let schema = self.schema(table).await?;
        let filter = filter.cloned().unwrap_or_default();
        let (url, pushdown) = self.list_url(table, &filter, schema.is_geographic())?;
        let residual = Residual::plan(&filter, &schema, pushdown)?;
        tracing::debug!(source = %self.core.name(), table, %url, "querying REST features");
        Ok(residual.apply(self.scan(self.client()?, url)))
    }

    async fn get_feature(&self, table: &str, id: &FeatureId) -> Result<Option<Feature>> {
        self.check_table(table)?;
        let client = self.client()?;
        let url = self.endpoint(&self.config.endpoints.single, table, Some(id))?;
        let Some(body) = client.get_optional(&url).await.map_err(|e| self.core.record_error(e))? else {
            return Ok(None);
        };
        let body = crate::http::parse_json(&body)?;
        let item = match feature_items(&body, &self.config) {
            Ok(items) => match items.first() {
                Some(item) => item,
                None => return Ok(None),
            },
            Err(_) => &body,
        };
        let mut feature = decode_item(item, &self.config, 0)?;
        if value_at(item, &self.config.id_property).and_then(id_from_json).is_none() {
            feature.id = id.clone();
        }
        Ok(Some(feature))
    }

    async fn insert_feature(&self, table: &str, feature: &Feature) -> Result<FeatureId> {
        self.core.ensure_writable(table)?;
        let Some(template) = &self.config.endpoints.create else {
            return Err(self.write_refusal("insert_feature"));
        };
        let url = self.endpoint(template, table, None)?;
        let body = encode_feature(feature, &self.config, false);
        let response = self
            .client()?
            .send_json(Method::POST, &url, &body)
            .await
            .map_err(|e| self.core.record_error(e))?;
        self.core.invalidate_schema(table);
        self.id_from_response(response.as_ref())
            .ok_or_else(|| rest_error("create response carries no feature id"))
    }

    async fn update_feature(&self, table: &str, feature: &Feature) -> Result<()> {
        self.core.ensure_writable(table)?;
        let Some(template) = &self.config.endpoints.update else {
            return Err(self.write_refusal("update_feature"));
        };
        let url = self.endpoint(template, table, Some(&feature.id))?;
        let body = encode_feature(feature, &self.config, true);
        self.client()?
            .send_json(Method::PUT, &url, &body)
            .await
            .map_err(|e| self.core.record_error(e))?;
        self.core.invalidate_schema(table);
        Ok(())
    }

    async fn delete_feature(&self, table: &str, id: &FeatureId) -> Result<bool> {
        self.core.ensure_writable(table)?;
        let Some(template) = &self.config.endpoints.delete else {
            return Err(self.write_refusal("delete_feature"));
        };
        let url = self.endpoint(template, table, Some(id))?;
        let deleted = self.client()?.delete(&url).await.map_err(|e| self.core.record_error(e))?;
        self.core.invalidate_schema(table);
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geosource_core::config::PaginationConfig;
    use serde_json::json;

    #[test]
    fn test_value_at_paths() {
        let body = json!({"data": {"items": [{"id": 1}, {"id": 2}]}});
        assert_eq!(value_at(&body, "data.items.1.id"), Some(&json!(2)));
        assert_eq!(value_at(&body, ""), Some(&body));
        assert!(value_at(&body, "data.missing").is_none());
    }

    #[test]
    fn test_feature_collection_items() {
        let config = RestConfig::new("https://example.com");
        let body = json!({
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "id": 7, "geometry": {"type": "Point", "coordinates": [1.0, 2.0]},
                 "properties": {"name": "A"}},
                {"type": "Feature", "geometry": null, "properties": {"name": "B"}}
            ]
        });
        let items = feature_items(&body, &config).unwrap();
        let first = decode_item(&items[0], &config, 1).unwrap();
        assert_eq!(first.id, FeatureId::Integer(7));
        assert_eq!(first.geometry, Some(Geometry::point(1.0, 2.0)));
        assert_eq!(first.attribute("name"), Some(&Value::from("A")));

        let second = decode_item(&items[1], &config, 2).unwrap();
        assert_eq!(second.id, FeatureId::Integer(2));
        assert!(second.geometry.is_none());
    }

    #[test]
    fn test_flat_items_with_wkt() {
        let mut config = RestConfig::new("https://example.com");
        config.features_path = "results".into();
        config.id_property = "uuid".into();
        config.geometry_property = "shape".into();
        config.attributes_property = String::new();
        config.geometry_format = GeometryFormat::Wkt;

        let body = json!({"results": [{"uuid": "a-1", "shape": "POINT (3 4)", "kind": "tree", "height": 12.5}]});
        let items = feature_items(&body, &config).unwrap();
        let feature = decode_item(&items[0], &config, 1).unwrap();
        assert_eq!(feature.id, FeatureId::from("a-1"));
        assert_eq!(feature.geometry, Some(Geometry::point(3.0, 4.0)));
        assert_eq!(feature.attributes.len(), 2);
        assert_eq!(feature.attribute("kind"), Some(&Value::from("tree")));
        assert_eq!(feature.attribute("height"), Some(&Value::Float(12.5)));
        assert!(!feature.attributes.contains("uuid"));
    }

    #[test]
    fn test_custom_and_hex_wkb_geometry() {
        let mut config = RestConfig::new("https://example.com");
        config.geometry_format = GeometryFormat::Custom { x_property: "lon".into(), y_property: "lat".into() };
        let item = json!({"id": 3, "properties": {"lon": 10.5, "lat": -3}});
        assert_eq!(decode_item(&item, &config, 1).unwrap().geometry, Some(Geometry::point(10.5, -3.0)));

        config.geometry_format = GeometryFormat::Wkb;
        let hex = wkb::to_hex(&wkb::encode(&Geometry::point(1.0, 1.0)));
        let item = json!({"id": 4, "geometry": hex, "properties": {}});
        assert_eq!(decode_item(&item, &config, 1).unwrap().geometry, Some(Geometry::point(1.0, 1.0)));

        let broken = json!({"id": 5, "geometry": "zz", "properties": {}});
        assert!(decode_item(&broken, &config, 1).is_err());
    }

    #[test]
    fn test_encode_feature_layouts() {
        let feature = Feature::new(9i64, Some(Geometry::point(1.0, 2.0))).with_attribute("name", "A");

        let config = RestConfig::new("https://example.com");
        let body = encode_feature(&feature, &config, true);
        assert_eq!(body["id"], json!(9));
        assert_eq!(body["geometry"]["type"], json!("Point"));
        assert_eq!(body["properties"]["name"], json!("A"));

        let mut flat = RestConfig::new("https://example.com");
        flat.attributes_property = String::new();
        flat.geometry_format = GeometryFormat::Custom { x_property: "x".into(), y_property: "y".into() };
        let body = encode_feature(&feature, &flat, false);
        assert!(body.get("id").is_none());
        assert_eq!(body["x"], json!(1.0));
        assert_eq!(body["name"], json!("A"));

        let mut nested = RestConfig::new("https://example.com");
        nested.geometry_property = "location.shape".into();
        nested.geometry_format = GeometryFormat::Wkt;
        let body = encode_feature(&feature, &nested, false);
        assert_eq!(body["location"]["shape"], json!("POINT (1 2)"));
    }

    #[test]
    fn test_schema_inference_widens_types() {
        let config = RestConfig::new("https://example.com");
        let features = vec![
            Feature::new(1i64, Some(Geometry::point(0.0, 0.0))).with_attribute("n", 1i64).with_attribute("tag", "x"),
            Feature::new(2i64, Some(Geometry::point(5.0, 5.0))).with_attribute("n", 2.5).with_attribute("tag", 3i64),
        ];
        let schema = infer_schema("trees", &config, &features);
        assert_eq!(schema.column("n").unwrap().field_type, FieldType::Float);
        assert_eq!(schema.column("tag").unwrap().field_type, FieldType::Text);
        assert_eq!(schema.extent, Envelope::new(0.0, 0.0, 5.0, 5.0));
        assert_eq!(schema.feature_count, 2);
        assert_eq!(schema.srid, 4326);
    }

    #[test]
    fn test_list_url_pushes_bbox_and_filter() {
        let mut config = RestConfig::new("https://example.com/api");
        config.tables = vec!["trees".into()];
        config.bbox_param = Some("bbox".into());
        config.filter_param = Some("where".into());
        config.pagination = PaginationConfig { style: PaginationStyle::Offset, ..PaginationConfig::default() };
        let source = RestSource::new("trees", config).unwrap();

        let filter = QueryFilter::new()
            .bbox(&Envelope::new(1.0, 2.0, 3.0, 4.0))
            .attribute(geosource_core::models::AttributeFilter::new("kind = :kind").param("kind", "oak"));
        let (url, pushdown) = source.list_url("trees", &filter, true).unwrap();
        assert!(pushdown.attribute);
        assert!(!pushdown.spatial_exact);
        assert_eq!(url.path(), "/api/trees");
        let pairs: Vec<(String, String)> = url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect();
        assert_eq!(
            pairs,
            vec![
                ("bbox".to_string(), "1,2,3,4".to_string()),
                ("where".to_string(), "kind = :kind".to_string()),
                ("kind".to_string(), "oak".to_string()),
            ]
        );

        let (plain, pushdown) = source.list_url("trees", &QueryFilter::new(), true).unwrap();
        assert!(plain.query().is_none());
        assert!(!pushdown.attribute);
    }

    #[tokio::test]
    async fn test_unopened_source_refuses_work() {
        let mut config = RestConfig::new("https://example.com");
        config.tables = vec!["trees".into()];
        let source = RestSource::new("trees", config).unwrap();
        assert_eq!(source.state(), SourceState::Closed);
        assert!(matches!(source.table_names().await, Err(GeosourceError::NotOpen)));
        assert!(RestSource::new("bad", RestConfig::new("ftp://example.com")).is_err());
    }
}
