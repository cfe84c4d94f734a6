//! Geometry codecs
//!
//! Binary and text encodings shared by the storage backends: WKT, WKB
//! (with EWKB tolerance), the GeoPackage geometry blob, the SpatiaLite blob
//! and a bridge to GeoJSON geometries.

pub mod geojson;
pub mod gpkg;
pub mod spatialite;
pub mod wkb;
pub mod wkt;

#[cfg(test)]
pub(crate) mod test_support {
    use crate::models::{Coord, Dimension, Geometry};
    use proptest::prelude::*;

    fn arb_coord(dim: Dimension) -> impl Strategy<Value = Coord> {
        (-1e6..1e6f64, -1e6..1e6f64, -1e4..1e4f64, 0.0..1e4f64).prop_map(move |(x, y, z, m)| {
            Coord {
                x,
                y,
                z: dim.has_z().then_some(z),
                m: dim.has_m().then_some(m),
            }
        })
    }

    fn arb_ring(dim: Dimension) -> impl Strategy<Value = Vec<Coord>> {
        prop::collection::vec(arb_coord(dim), 3..8).prop_map(|mut ring| {
            ring.push(ring[0]);
            ring
        })
    }

    fn arb_dimension() -> impl Strategy<Value = Dimension> {
        prop_oneof![
            Just(Dimension::Xy),
            Just(Dimension::Xyz),
            Just(Dimension::Xym),
            Just(Dimension::Xyzm),
        ]
    }

    fn arb_simple(dim: Dimension) -> impl Strategy<Value = Geometry> {
        prop_oneof![
            arb_coord(dim).prop_map(Geometry::Point),
            prop::collection::vec(arb_coord(dim), 2..6).prop_map(Geometry::LineString),
            prop::collection::vec(arb_ring(dim), 1..3).prop_map(Geometry::Polygon),
            prop::collection::vec(arb_coord(dim), 1..5).prop_map(Geometry::MultiPoint),
            prop::collection::vec(prop::collection::vec(arb_coord(dim), 2..5), 1..3)
                .prop_map(Geometry::MultiLineString),
            prop::collection::vec(prop::collection::vec(arb_ring(dim), 1..3), 1..3)
                .prop_map(Geometry::MultiPolygon),
        ]
    }

    /// Geometries with a uniform coordinate dimension
    pub(crate) fn arb_geometry() -> impl Strategy<Value = Geometry> {
        arb_dimension().prop_flat_map(|dim| {
            prop_oneof![
                4 => arb_simple(dim),
                1 => prop::collection::vec(arb_simple(dim), 1..3)
                    .prop_map(Geometry::GeometryCollection),
            ]
        })
    }
}
