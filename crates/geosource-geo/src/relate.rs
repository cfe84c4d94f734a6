//! Exact spatial relationship tests
//!
//! Envelope probes are a conservative superset; these functions decide the
//! actual relationship after decoding.

use geo::{Distance, Euclidean, Relate};
use geosource_core::{Geometry, SpatialFilter, SpatialRelationship};

use crate::convert::to_geo;

/// Whether `candidate <relationship> other` holds.
///
/// `Distance` is evaluated against `max_distance`, expressed in CRS units.
pub fn relationship_holds(
    candidate: &Geometry,
    relationship: SpatialRelationship,
    other: &Geometry,
    max_distance: f64,
) -> bool {
    if candidate.is_empty() || other.is_empty() {
        return relationship == SpatialRelationship::Disjoint;
    }
    let a = to_geo(candidate);
    let b = to_geo(other);
    match relationship {
        SpatialRelationship::Distance => Euclidean.distance(&a, &b) <= max_distance,
        SpatialRelationship::Intersects => a.relate(&b).is_intersects(),
        SpatialRelationship::Contains => a.relate(&b).is_contains(),
        SpatialRelationship::Within => a.relate(&b).is_within(),
        SpatialRelationship::Overlaps => a.relate(&b).is_overlaps(),
        SpatialRelationship::Touches => a.relate(&b).is_touches(),
        SpatialRelationship::Disjoint => a.relate(&b).is_disjoint(),
        SpatialRelationship::Equals => {
            let matrix = a.relate(&b);
            matrix.is_within() && matrix.is_contains()
        }
    }
}

/// Exact test of a feature geometry against a spatial filter.
///
/// `geographic` selects degree conversion for metric distance units.
pub fn matches_filter(candidate: &Geometry, filter: &SpatialFilter, geographic: bool) -> bool {
    relationship_holds(
        candidate,
        filter.relationship,
        &filter.geometry,
        filter.distance_in_crs_units(geographic),
    )
}

/// Euclidean distance in CRS units; `None` when either geometry is empty
pub fn distance(a: &Geometry, b: &Geometry) -> Option<f64> {
    if a.is_empty() || b.is_empty() {
        return None;
    }
    Some(Euclidean.distance(&to_geo(a), &to_geo(b)))
}

/// Whether a click at (`x`, `y`) selects `geometry`: the point lies inside a
/// polygon or within `tolerance` of any part of the geometry
pub fn hit_test(geometry: &Geometry, x: f64, y: f64, tolerance: f64) -> bool {
    distance(geometry, &Geometry::point(x, y)).is_some_and(|d| d <= tolerance)
}
