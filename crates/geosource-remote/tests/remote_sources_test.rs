//! Remote adapters against in-process stub services

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::StreamExt;
use geosource_core::config::{PaginationStyle, RestConfig, VectorTileConfig, WmsConfig};
use geosource_core::models::{AttributeFilter, Envelope, Feature, FeatureId, Geometry, QueryFilter, Value};
use geosource_remote::mvt::{Feature as MvtFeature, GeomType, Layer, Tile, Value as MvtValue};
use geosource_remote::{RestSource, VectorTileSource, WmsSource};
use geosource_store::DataSource;
use prost::Message;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

// ---------------------------------------------------------------------------
// REST
// ---------------------------------------------------------------------------

type Trees = Arc<Mutex<Vec<JsonValue>>>;

fn tree(id: i64, name: &str, height: f64, x: f64, y: f64) -> JsonValue {
    json!({
        "type": "Feature",
        "id": id,
        "geometry": {"type": "Point", "coordinates": [x, y]},
        "properties": {"name": name, "height": height}
    })
}

fn item_id(item: &JsonValue) -> Option<i64> {
    item.get("id").and_then(JsonValue::as_i64)
}

async fn list_trees(State(trees): State<Trees>, Query(params): Query<HashMap<String, String>>) -> Json<JsonValue> {
    let trees = trees.lock().unwrap();
    let limit: usize = params.get("limit").and_then(|v| v.parse().ok()).unwrap_or(trees.len());
    let page: usize = params.get("page").and_then(|v| v.parse().ok()).unwrap_or(1);
    let items: Vec<JsonValue> = trees.iter().skip((page - 1) * limit).take(limit).cloned().collect();
    Json(json!({"type": "FeatureCollection", "features": items}))
}

async fn get_tree(State(trees): State<Trees>, Path(id): Path<i64>) -> impl IntoResponse {
    let trees = trees.lock().unwrap();
    match trees.iter().find(|t| item_id(t) == Some(id)) {
        Some(item) => Json(item.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn create_tree(State(trees): State<Trees>, Json(mut body): Json<JsonValue>) -> Json<JsonValue> {
    let mut trees = trees.lock().unwrap();
    let id = trees.iter().filter_map(item_id).max().unwrap_or(0) + 1;
    body["id"] = json!(id);
    trees.push(body);
    Json(json!({"id": id}))
}

async fn update_tree(State(trees): State<Trees>, Path(id): Path<i64>, Json(body): Json<JsonValue>) -> StatusCode {
    let mut trees = trees.lock().unwrap();
    match trees.iter_mut().find(|t| item_id(t) == Some(id)) {
        Some(item) => {
            *item = body;
            StatusCode::NO_CONTENT
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn delete_tree(State(trees): State<Trees>, Path(id): Path<i64>) -> StatusCode {
    let mut trees = trees.lock().unwrap();
    let before = trees.len();
    trees.retain(|t| item_id(t) != Some(id));
    if trees.len() < before {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn rest_source() -> RestSource {
    let trees: Trees = Arc::new(Mutex::new(vec![
        tree(1, "Oak", 12.0, 1.0, 1.0),
        tree(2, "Pine", 8.0, 2.0, 2.0),
        tree(3, "Birch", 15.0, 3.0, 3.0),
        tree(4, "Elm", 4.0, 4.0, 4.0),
        tree(5, "Ash", 20.0, 5.0, 5.0),
    ]));
    let router = Router::new()
        .route("/api/trees", get(list_trees).post(create_tree))
        .route("/api/trees/{id}", get(get_tree).put(update_tree).delete(delete_tree))
        .with_state(trees);
    let addr = serve(router).await;

    let mut config = RestConfig::new(format!("http://{addr}/api"));
    config.tables = vec!["trees".to_string()];
    config.endpoints.create = Some("/{table}".to_string());
    config.endpoints.update = Some("/{table}/{id}".to_string());
    config.endpoints.delete = Some("/{table}/{id}".to_string());
    config.pagination.style = PaginationStyle::PageNumber;
    config.pagination.page_size = 2;
    RestSource::new("trees-api", config).unwrap()
}

#[tokio::test]
async fn test_rest_paginated_reads() {
    let source = rest_source().await;
    assert!(source.open().await, "{:?}", source.last_error());
    assert_eq!(source.table_names().await.unwrap(), vec!["trees".to_string()]);

    let schema = source.schema("trees").await.unwrap();
    assert_eq!(schema.feature_count, 5);
    assert!(schema.has_column("name"));
    assert!(schema.has_column("height"));
    assert_eq!(source.feature_count("trees", None).await.unwrap(), 5);

    let all: Vec<Feature> = source.query_features("trees", None).await.unwrap().collect().await;
    let ids: Vec<FeatureId> = all.iter().map(|f| f.id.clone()).collect();
    assert_eq!(ids, (1..=5).map(FeatureId::Integer).collect::<Vec<_>>());

    let tall = QueryFilter::new().attribute(AttributeFilter::new("height > 10"));
    assert_eq!(source.feature_count("trees", Some(&tall)).await.unwrap(), 3);

    let boxed = QueryFilter::new().bbox(&Envelope::new(1.5, 1.5, 3.5, 3.5));
    let names: Vec<Value> = source
        .query_features("trees", Some(&boxed))
        .await
        .unwrap()
        .filter_map(|f| async move { f.attribute("name").cloned() })
        .collect()
        .await;
    assert_eq!(names, vec![Value::from("Pine"), Value::from("Birch")]);

    let mut limited = QueryFilter::new();
    limited.max_features = 2;
    limited.offset = 1;
    let page: Vec<Feature> = source.query_features("trees", Some(&limited)).await.unwrap().collect().await;
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].id, FeatureId::Integer(2));

    let birch = source.get_feature("trees", &FeatureId::Integer(3)).await.unwrap().unwrap();
    assert_eq!(birch.attribute("name"), Some(&Value::from("Birch")));
    assert_eq!(birch.geometry, Some(Geometry::point(3.0, 3.0)));
    assert!(source.get_feature("trees", &FeatureId::Integer(42)).await.unwrap().is_none());
    assert!(source.schema("shrubs").await.is_err());
}

#[tokio::test]
async fn test_rest_writes() {
    let source = rest_source().await;
    assert!(source.open().await);
    assert_eq!(source.feature_count("trees", None).await.unwrap(), 5);

    let maple = Feature::new(0i64, Some(Geometry::point(6.0, 6.0))).with_attribute("name", "Maple");
    let id = source.insert_feature("trees", &maple).await.unwrap();
    assert_eq!(id, FeatureId::Integer(6));
    assert_eq!(source.feature_count("trees", None).await.unwrap(), 6);

    let renamed = Feature::new(6i64, Some(Geometry::point(6.0, 6.0))).with_attribute("name", "Sugar maple");
    source.update_feature("trees", &renamed).await.unwrap();
    let stored = source.get_feature("trees", &id).await.unwrap().unwrap();
    assert_eq!(stored.attribute("name"), Some(&Value::from("Sugar maple")));

    assert!(source.delete_feature("trees", &id).await.unwrap());
    assert!(!source.delete_feature("trees", &id).await.unwrap());
    assert_eq!(source.feature_count("trees", None).await.unwrap(), 5);
}

// ---------------------------------------------------------------------------
// WMS
// ---------------------------------------------------------------------------

const CAPABILITIES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<WMS_Capabilities version="1.3.0">
  <Service><Title>Stub</Title></Service>
  <Capability>
    <Layer>
      <Title>Root</Title>
      <CRS>EPSG:4326</CRS>
      <Layer queryable="1">
        <Name>parcels</Name>
        <Title>Parcels</Title>
        <EX_GeographicBoundingBox>
          <westBoundLongitude>10</westBoundLongitude>
          <eastBoundLongitude>11</eastBoundLongitude>
          <southBoundLatitude>50</southBoundLatitude>
          <northBoundLatitude>51</northBoundLatitude>
        </EX_GeographicBoundingBox>
      </Layer>
    </Layer>
  </Capability>
</WMS_Capabilities>"#;

async fn wms_endpoint(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    match params.get("REQUEST").map(String::as_str) {
        Some("GetCapabilities") => CAPABILITIES.into_response(),
        Some("GetFeatureInfo") => Json(json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "id": 17,
                "geometry": {"type": "Point", "coordinates": [10.5, 50.5]},
                "properties": {"owner": "city", "query_layers": params.get("QUERY_LAYERS")}
            }]
        }))
        .into_response(),
        Some("GetMap") => b"PNG".to_vec().into_response(),
        _ => StatusCode::BAD_REQUEST.into_response(),
    }
}

#[tokio::test]
async fn test_wms_source() {
    let addr = serve(Router::new().route("/wms", get(wms_endpoint))).await;
    let source = WmsSource::new("basemap", WmsConfig::new(format!("http://{addr}/wms"))).unwrap();
    assert!(source.is_read_only());
    assert!(source.open().await, "{:?}", source.last_error());
    assert_eq!(source.table_names().await.unwrap(), vec!["parcels".to_string()]);

    let extent = source.extent("parcels").await.unwrap();
    assert_eq!(extent.to_array(), Some([10.0, 50.0, 11.0, 51.0]));

    // Nothing to ask the service about without a location
    assert_eq!(source.feature_count("parcels", None).await.unwrap(), 0);

    let filter = QueryFilter::new().bbox(&Envelope::new(10.0, 50.0, 11.0, 51.0));
    let features: Vec<Feature> = source.query_features("parcels", Some(&filter)).await.unwrap().collect().await;
    assert_eq!(features.len(), 1);
    assert_eq!(features[0].id, FeatureId::Integer(17));
    assert_eq!(features[0].attribute("query_layers"), Some(&Value::from("parcels")));

    let image = source.get_map(&Envelope::new(10.0, 50.0, 11.0, 51.0), 256, 256).await;
    assert_eq!(image.as_deref(), Some(&b"PNG"[..]));

    let feature = Feature::new(1i64, None);
    assert!(source.insert_feature("parcels", &feature).await.is_err());
}

// ---------------------------------------------------------------------------
// Vector tiles
// ---------------------------------------------------------------------------

fn point_feature(id: u64, kind_index: u32) -> MvtFeature {
    // MoveTo(1) to the tile centre, zigzag encoded
    MvtFeature { id: Some(id), tags: vec![0, kind_index], r#type: Some(GeomType::Point as i32), geometry: vec![9, 4096, 4096] }
}

fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

async fn tile_endpoint(Path((z, x, y)): Path<(u8, u32, String)>) -> impl IntoResponse {
    let y: u32 = match y.trim_end_matches(".pbf").parse() {
        Ok(y) => y,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    if z != 1 {
        return StatusCode::NOT_FOUND.into_response();
    }
    // Feature 1 crosses every tile; the other id is unique to its tile
    let tile = Tile {
        layers: vec![Layer {
            version: 2,
            name: "poi".into(),
            features: vec![point_feature(1, 0), point_feature(100 + u64::from(x) + 2 * u64::from(y), 1)],
            keys: vec!["kind".into()],
            values: vec![
                MvtValue { string_value: Some("border".into()), ..Default::default() },
                MvtValue { string_value: Some("local".into()), ..Default::default() },
            ],
            extent: Some(4096),
        }],
    };
    gzip(&tile.encode_to_vec()).into_response()
}

#[tokio::test]
async fn test_vector_tile_source() {
    let addr = serve(Router::new().route("/tiles/{z}/{x}/{y}", get(tile_endpoint))).await;
    let mut config = VectorTileConfig::new(format!("http://{addr}/tiles/{{z}}/{{x}}/{{y}}.pbf"));
    config.min_zoom = 1;
    config.max_zoom = 1;
    let source = VectorTileSource::new("tiles", config).unwrap();

    assert!(source.open().await, "{:?}", source.last_error());
    assert_eq!(source.table_names().await.unwrap(), vec!["poi".to_string()]);
    let schema = source.schema("poi").await.unwrap();
    assert_eq!(schema.srid, 4326);
    assert!(schema.has_column("kind"));

    let features: Vec<Feature> = source.query_features("poi", None).await.unwrap().collect().await;
    assert_eq!(features.len(), 5);
    let shared = features.iter().filter(|f| f.id == FeatureId::Integer(1)).count();
    assert_eq!(shared, 1);

    // Tile centres of zoom 1 lie at +/-90 degrees longitude
    for feature in &features {
        match &feature.geometry {
            Some(Geometry::Point(c)) => assert!((c.x.abs() - 90.0).abs() < 1e-9),
            other => panic!("expected a point, got {other:?}"),
        }
    }

    let local = QueryFilter::new().attribute(AttributeFilter::new("kind = 'local'"));
    assert_eq!(source.feature_count("poi", Some(&local)).await.unwrap(), 4);
    assert!(source
        .get_feature("poi", &FeatureId::Integer(103))
        .await
        .unwrap()
        .is_some());
}
