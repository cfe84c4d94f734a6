//! Query filter model: spatial filter, attribute filter, sort, paging and projection.

use serde::{Deserialize, Serialize};

use super::envelope::Envelope;
use super::geometry::Geometry;
use super::value::Value;
use crate::error::{GeosourceError, Result};

/// Approximate length of one degree of latitude, in meters
pub const METERS_PER_DEGREE: f64 = 111_320.0;

/// Distance units for spatial operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DistanceUnit {
    /// Native units of the layer's reference system
    #[default]
    CrsUnits,
    Meters,
    Kilometers,
    Miles,
    Feet,
    Degrees,
}

impl DistanceUnit {
    /// Convert a distance value to meters; `None` for units with no fixed length
    pub fn to_meters(&self, value: f64) -> Option<f64> {
        match self {
            DistanceUnit::Meters => Some(value),
            DistanceUnit::Kilometers => Some(value * 1000.0),
            DistanceUnit::Miles => Some(value * 1609.34),
            DistanceUnit::Feet => Some(value * 0.3048),
            DistanceUnit::Degrees => Some(value * METERS_PER_DEGREE),
            DistanceUnit::CrsUnits => None,
        }
    }

    /// Convert a distance value into the units of a reference system.
    ///
    /// Geographic systems use degrees, everything else is assumed metric.
    pub fn to_crs_units(&self, value: f64, geographic: bool) -> f64 {
        match (self, geographic) {
            (DistanceUnit::CrsUnits, _) => value,
            (DistanceUnit::Degrees, true) => value,
            (unit, true) => unit.to_meters(value).unwrap_or(value) / METERS_PER_DEGREE,
            (unit, false) => unit.to_meters(value).unwrap_or(value),
        }
    }
}

/// Spatial relationship tested between a feature geometry and the filter geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SpatialRelationship {
    #[default]
    Intersects,
    /// Feature geometry contains the filter geometry
    Contains,
    /// Feature geometry is within the filter geometry
    Within,
    Overlaps,
    Touches,
    Disjoint,
    /// Feature geometry lies within `distance` of the filter geometry
    Distance,
    Equals,
}

/// Spatial part of a query filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialFilter {
    pub geometry: Geometry,
    pub relationship: SpatialRelationship,
    pub distance: f64,
    pub distance_unit: DistanceUnit,
}

impl SpatialFilter {
    pub fn new(geometry: Geometry, relationship: SpatialRelationship) -> Self {
        Self { geometry, relationship, distance: 0.0, distance_unit: DistanceUnit::default() }
    }

    /// Intersects filter over an envelope
    pub fn envelope(envelope: &Envelope) -> Self {
        Self::new(Geometry::from_envelope(envelope), SpatialRelationship::Intersects)
    }

    /// Proximity filter
    pub fn within_distance(geometry: Geometry, distance: f64, unit: DistanceUnit) -> Self {
        Self { geometry, relationship: SpatialRelationship::Distance, distance, distance_unit: unit }
    }

    /// Distance in layer units
    pub fn distance_in_crs_units(&self, geographic: bool) -> f64 {
        self.distance_unit.to_crs_units(self.distance, geographic)
    }

    /// Envelope a candidate must intersect to possibly satisfy the filter.
    ///
    /// `None` means no envelope bound applies (disjoint).
    pub fn search_envelope(&self, geographic: bool) -> Option<Envelope> {
        match self.relationship {
            SpatialRelationship::Disjoint => None,
            SpatialRelationship::Distance => {
                Some(self.geometry.envelope().expanded_by(self.distance_in_crs_units(geographic)))
            }
            _ => Some(self.geometry.envelope()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.relationship == SpatialRelationship::Distance && !(self.distance > 0.0) {
            return Err(GeosourceError::InvalidFilter {
                reason: "Distance relationship requires distance > 0".to_string(),
            });
        }
        if self.geometry.is_empty() {
            return Err(GeosourceError::InvalidFilter {
                reason: "spatial filter geometry is empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Backend-native predicate fragment with named parameters.
///
/// The fragment is opaque to the core: it is passed through to the backend,
/// with `:name` / `@name` placeholders bound from `parameters`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AttributeFilter {
    pub predicate: String,
    pub parameters: Vec<(String, Value)>,
}

impl AttributeFilter {
    pub fn new(predicate: impl Into<String>) -> Self {
        Self { predicate: predicate.into(), parameters: Vec::new() }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.push((name.into(), value.into()));
        self
    }

    /// Case-insensitive parameter lookup (leading `:`/`@` ignored)
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        let name = name.trim_start_matches([':', '@']);
        self.parameters
            .iter()
            .find(|(k, _)| k.trim_start_matches([':', '@']).eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    pub direction: SortDirection,
}

impl SortField {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self { field: field.into(), direction: SortDirection::Ascending }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self { field: field.into(), direction: SortDirection::Descending }
    }
}

/// Complete query description. Cloning yields an independent copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub spatial: Option<SpatialFilter>,
    pub attribute: Option<AttributeFilter>,
    /// Attribute columns to return; empty means all
    pub columns: Vec<String>,
    pub sort: Vec<SortField>,
    /// Maximum number of features, 0 = unbounded
    pub max_features: usize,
    pub offset: usize,
    pub include_geometry: bool,
    pub distinct: bool,
    /// Target SRID for reprojection, 0 = none
    pub target_srid: i32,
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            spatial: None,
            attribute: None,
            columns: Vec::new(),
            sort: Vec::new(),
            max_features: 0,
            offset: 0,
            include_geometry: true,
            distinct: false,
            target_srid: 0,
        }
    }
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the spatial filter
    pub fn spatial(mut self, spatial: SpatialFilter) -> Self {
        self.spatial = Some(spatial);
        self
    }

    /// Intersects filter over an envelope
    pub fn bbox(self, envelope: &Envelope) -> Self {
        self.spatial(SpatialFilter::envelope(envelope))
    }

    /// Set the attribute filter
    pub fn attribute(mut self, attribute: AttributeFilter) -> Self {
        self.attribute = Some(attribute);
        self
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn sort_by(mut self, field: SortField) -> Self {
        self.sort.push(field);
        self
    }

    pub fn limit(mut self, max_features: usize) -> Self {
        self.max_features = max_features;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn without_geometry(mut self) -> Self {
        self.include_geometry = false;
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn reproject_to(mut self, srid: i32) -> Self {
        self.target_srid = srid;
        self
    }

    /// Whether any paging applies
    pub fn is_paged(&self) -> bool {
        self.max_features > 0 || self.offset > 0
    }

    /// Check the filter's internal consistency
    pub fn validate(&self) -> Result<()> {
        if let Some(spatial) = &self.spatial {
            spatial.validate()?;
        }
        if let Some(attribute) = &self.attribute {
            if attribute.predicate.trim().is_empty() {
                return Err(GeosourceError::InvalidFilter {
                    reason: "attribute predicate is empty".to_string(),
                });
            }
        }
        if self.target_srid < 0 {
            return Err(GeosourceError::InvalidFilter {
                reason: format!("target SRID {} is negative", self.target_srid),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_requires_positive_value() {
        let filter = QueryFilter::new().spatial(SpatialFilter::within_distance(
            Geometry::point(0.0, 0.0),
            0.0,
            DistanceUnit::Meters,
        ));
        assert!(matches!(filter.validate(), Err(GeosourceError::InvalidFilter { .. })));

        let filter = QueryFilter::new().spatial(SpatialFilter::within_distance(
            Geometry::point(0.0, 0.0),
            5.0,
            DistanceUnit::Meters,
        ));
        assert!(filter.validate().is_ok());
    }

    #[test]
    fn test_clone_is_independent() {
        let original = QueryFilter::new().limit(10).columns(["name"]);
        let mut copy = original.clone();
        copy.max_features = 99;
        copy.columns.push("pop".to_string());
        assert_eq!(original.max_features, 10);
        assert_eq!(original.columns, vec!["name".to_string()]);
    }

    #[test]
    fn test_distance_unit_conversion() {
        assert!((DistanceUnit::Kilometers.to_crs_units(5.0, false) - 5000.0).abs() < 1e-9);
        let degrees = DistanceUnit::Meters.to_crs_units(METERS_PER_DEGREE, true);
        assert!((degrees - 1.0).abs() < 1e-9);
        assert_eq!(DistanceUnit::CrsUnits.to_crs_units(3.0, true), 3.0);
    }

    #[test]
    fn test_search_envelope_expands_for_distance() {
        let filter =
            SpatialFilter::within_distance(Geometry::point(10.0, 10.0), 2.0, DistanceUnit::CrsUnits);
        let env = filter.search_envelope(false).unwrap();
        assert_eq!(env, Envelope::new(8.0, 8.0, 12.0, 12.0));
    }

    #[test]
    fn test_parameter_lookup_ignores_prefix() {
        let attr = AttributeFilter::new("name = :name").param(":Name", "A");
        assert_eq!(attr.parameter("name"), Some(&Value::from("A")));
        assert_eq!(attr.parameter("@NAME"), Some(&Value::from("A")));
    }
}
