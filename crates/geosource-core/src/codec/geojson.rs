//! Conversion between `Geometry` / `Feature` and the `geojson` crate types.

use geojson::{feature::Id, JsonObject, Value as GeoJsonValue};

use crate::error::{GeosourceError, Result};
use crate::models::{AttributeTable, Coord, Feature, FeatureId, Geometry, Value};

fn geojson_error(message: impl Into<String>) -> GeosourceError {
    GeosourceError::format("GeoJSON", message)
}

fn position(c: &Coord) -> Vec<f64> {
    match c.z {
        Some(z) => vec![c.x, c.y, z],
        None => vec![c.x, c.y],
    }
}

fn positions(coords: &[Coord]) -> Vec<Vec<f64>> {
    coords.iter().map(position).collect()
}

fn rings(rings: &[Vec<Coord>]) -> Vec<Vec<Vec<f64>>> {
    rings.iter().map(|r| positions(r)).collect()
}

/// Convert to a GeoJSON geometry. M values have no GeoJSON form and are dropped.
pub fn to_geojson(geometry: &Geometry) -> geojson::Geometry {
    let value = match geometry {
        Geometry::Point(c) => GeoJsonValue::Point(position(c)),
        Geometry::LineString(cs) => GeoJsonValue::LineString(positions(cs)),
        Geometry::Polygon(rs) => GeoJsonValue::Polygon(rings(rs)),
        Geometry::MultiPoint(cs) => GeoJsonValue::MultiPoint(positions(cs)),
        Geometry::MultiLineString(ls) => GeoJsonValue::MultiLineString(rings(ls)),
        Geometry::MultiPolygon(ps) => {
            GeoJsonValue::MultiPolygon(ps.iter().map(|p| rings(p)).collect())
        }
        Geometry::GeometryCollection(items) => {
            GeoJsonValue::GeometryCollection(items.iter().map(to_geojson).collect())
        }
    };
    geojson::Geometry::new(value)
}

fn coord(position: &[f64]) -> Result<Coord> {
    match position {
        [x, y] => Ok(Coord::xy(*x, *y)),
        [x, y, z, ..] => Ok(Coord::xyz(*x, *y, *z)),
        _ => Err(geojson_error(format!("position has {} ordinates", position.len()))),
    }
}

fn coords(positions: &[Vec<f64>]) -> Result<Vec<Coord>> {
    positions.iter().map(|p| coord(p)).collect()
}

fn coord_rings(rings: &[Vec<Vec<f64>>]) -> Result<Vec<Vec<Coord>>> {
    rings.iter().map(|r| coords(r)).collect()
}

/// Convert from a GeoJSON geometry
pub fn from_geojson(geometry: &geojson::Geometry) -> Result<Geometry> {
    Ok(match &geometry.value {
        GeoJsonValue::Point(p) => Geometry::Point(coord(p)?),
        GeoJsonValue::LineString(ps) => Geometry::LineString(coords(ps)?),
        GeoJsonValue::Polygon(rs) => Geometry::Polygon(coord_rings(rs)?),
        GeoJsonValue::MultiPoint(ps) => Geometry::MultiPoint(coords(ps)?),
        GeoJsonValue::MultiLineString(ls) => Geometry::MultiLineString(coord_rings(ls)?),
        GeoJsonValue::MultiPolygon(ps) => Geometry::MultiPolygon(
            ps.iter().map(|p| coord_rings(p)).collect::<Result<_>>()?,
        ),
        GeoJsonValue::GeometryCollection(items) => Geometry::GeometryCollection(
            items.iter().map(from_geojson).collect::<Result<_>>()?,
        ),
    })
}

/// Parse a GeoJSON geometry from a JSON value
pub fn geometry_from_json(value: &serde_json::Value) -> Result<Geometry> {
    let geometry = geojson::Geometry::from_json_value(value.clone())
        .map_err(|e| geojson_error(format!("invalid geometry: {e}")))?;
    from_geojson(&geometry)
}

/// Render a geometry as a JSON value
pub fn geometry_to_json(geometry: &Geometry) -> serde_json::Value {
    serde_json::Value::Object(JsonObject::from(&to_geojson(geometry)))
}

/// Convert a feature to a GeoJSON feature
pub fn feature_to_geojson(feature: &Feature) -> geojson::Feature {
    let id = match &feature.id {
        FeatureId::Integer(i) => Id::Number((*i).into()),
        FeatureId::Text(s) => Id::String(s.clone()),
    };
    let properties = match feature.attributes.to_json() {
        serde_json::Value::Object(map) => map,
        _ => JsonObject::new(),
    };
    geojson::Feature {
        bbox: None,
        geometry: feature.geometry.as_ref().map(to_geojson),
        id: Some(id),
        properties: Some(properties),
        foreign_members: None,
    }
}

/// Convert a GeoJSON feature, using `fallback_id` when it carries no id
pub fn feature_from_geojson(feature: &geojson::Feature, fallback_id: i64) -> Result<Feature> {
    let id = match &feature.id {
        Some(Id::String(s)) => FeatureId::Text(s.clone()),
        Some(Id::Number(n)) => match n.as_i64() {
            Some(i) => FeatureId::Integer(i),
            None => FeatureId::Text(n.to_string()),
        },
        None => FeatureId::Integer(fallback_id),
    };
    let geometry = feature.geometry.as_ref().map(from_geojson).transpose()?;
    let attributes: AttributeTable = feature
        .properties
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), Value::from_json(v)))
        .collect();
    Ok(Feature { id, geometry, attributes })
}

/// GeoJSON FeatureCollection for a set of features
pub fn feature_collection(features: &[Feature]) -> geojson::FeatureCollection {
    geojson::FeatureCollection {
        bbox: None,
        features: features.iter().map(feature_to_geojson).collect(),
        foreign_members: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polygon_roundtrip() {
        let polygon = Geometry::polygon(vec![vec![
            [0.0, 0.0],
            [1.0, 0.0],
            [1.0, 1.0],
            [0.0, 0.0],
        ]]);
        let json = geometry_to_json(&polygon);
        assert_eq!(json["type"], "Polygon");
        assert_eq!(geometry_from_json(&json).unwrap(), polygon);
    }

    #[test]
    fn test_feature_conversion() {
        let feature = Feature::new(7i64, Some(Geometry::point(1.0, 2.0))).with_attribute("name", "A");
        let gj = feature_to_geojson(&feature);
        assert_eq!(gj.id, Some(Id::Number(7.into())));
        let back = feature_from_geojson(&gj, 0).unwrap();
        assert_eq!(back, feature);
    }

    #[test]
    fn test_missing_id_uses_fallback() {
        let text = r#"{"type":"Feature","geometry":null,"properties":{"pop":12}}"#;
        let gj = match text.parse::<geojson::GeoJson>().unwrap() {
            geojson::GeoJson::Feature(f) => f,
            other => panic!("expected a feature, got {other:?}"),
        };
        let feature = feature_from_geojson(&gj, 42).unwrap();
        assert_eq!(feature.id, FeatureId::Integer(42));
        assert!(feature.geometry.is_none());
        assert_eq!(feature.attribute("pop"), Some(&Value::Integer(12)));
    }

    #[test]
    fn test_short_position_is_rejected() {
        let json = serde_json::json!({"type": "Point", "coordinates": [1.0]});
        assert!(geometry_from_json(&json).is_err());
    }
}
