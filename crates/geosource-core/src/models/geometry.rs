//! Canonical geometry types used across all geosource crates.
//!
//! Every variant owns its coordinate data. Coordinates carry optional Z and M
//! ordinates so that the codecs can round-trip 3D and measured geometries
//! without loss.

use serde::{Deserialize, Serialize};

use super::envelope::Envelope;

/// A single (x, y[, z][, m]) position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m: Option<f64>,
}

impl Coord {
    /// Create a 2D coordinate
    pub fn xy(x: f64, y: f64) -> Self {
        Self { x, y, z: None, m: None }
    }

    /// Create a 3D coordinate
    pub fn xyz(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z: Some(z), m: None }
    }

    /// Create a measured 2D coordinate
    pub fn xym(x: f64, y: f64, m: f64) -> Self {
        Self { x, y, z: None, m: Some(m) }
    }

    /// Create a measured 3D coordinate
    pub fn xyzm(x: f64, y: f64, z: f64, m: f64) -> Self {
        Self { x, y, z: Some(z), m: Some(m) }
    }

    /// Coordinate dimension implied by the present ordinates
    pub fn dimension(&self) -> Dimension {
        match (self.z.is_some(), self.m.is_some()) {
            (false, false) => Dimension::Xy,
            (true, false) => Dimension::Xyz,
            (false, true) => Dimension::Xym,
            (true, true) => Dimension::Xyzm,
        }
    }

    /// Return a copy shaped to the given dimension (missing ordinates become 0)
    pub fn with_dimension(&self, dimension: Dimension) -> Self {
        Self {
            x: self.x,
            y: self.y,
            z: dimension.has_z().then(|| self.z.unwrap_or(0.0)),
            m: dimension.has_m().then(|| self.m.unwrap_or(0.0)),
        }
    }
}

impl From<(f64, f64)> for Coord {
    fn from((x, y): (f64, f64)) -> Self {
        Self::xy(x, y)
    }
}

impl From<[f64; 2]> for Coord {
    fn from(c: [f64; 2]) -> Self {
        Self::xy(c[0], c[1])
    }
}

/// Coordinate dimension of a geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Dimension {
    #[default]
    Xy,
    Xyz,
    Xym,
    Xyzm,
}

impl Dimension {
    pub fn has_z(&self) -> bool {
        matches!(self, Dimension::Xyz | Dimension::Xyzm)
    }

    pub fn has_m(&self) -> bool {
        matches!(self, Dimension::Xym | Dimension::Xyzm)
    }

    /// Number of ordinates per coordinate
    pub fn ordinates(&self) -> usize {
        2 + usize::from(self.has_z()) + usize::from(self.has_m())
    }

    pub fn from_flags(has_z: bool, has_m: bool) -> Self {
        match (has_z, has_m) {
            (false, false) => Dimension::Xy,
            (true, false) => Dimension::Xyz,
            (false, true) => Dimension::Xym,
            (true, true) => Dimension::Xyzm,
        }
    }
}

/// Geometry type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum GeometryType {
    #[default]
    Geometry,
    Point,
    LineString,
    Polygon,
    MultiPoint,
    MultiLineString,
    MultiPolygon,
    GeometryCollection,
}

impl GeometryType {
    /// OGC name as used by WKT and by database metadata tables
    pub fn ogc_name(&self) -> &'static str {
        match self {
            GeometryType::Geometry => "GEOMETRY",
            GeometryType::Point => "POINT",
            GeometryType::LineString => "LINESTRING",
            GeometryType::Polygon => "POLYGON",
            GeometryType::MultiPoint => "MULTIPOINT",
            GeometryType::MultiLineString => "MULTILINESTRING",
            GeometryType::MultiPolygon => "MULTIPOLYGON",
            GeometryType::GeometryCollection => "GEOMETRYCOLLECTION",
        }
    }

    /// Parse an OGC type name, tolerating Z/M/ZM suffixes and the `ST_` prefix
    pub fn from_ogc_name(name: &str) -> Option<Self> {
        let upper = name.trim().to_ascii_uppercase();
        let upper = upper.strip_prefix("ST_").unwrap_or(&upper);
        let base = upper
            .strip_suffix("ZM")
            .or_else(|| upper.strip_suffix('Z'))
            .or_else(|| upper.strip_suffix('M'))
            .unwrap_or(upper)
            .trim();
        let parsed = match base {
            "GEOMETRY" => GeometryType::Geometry,
            "POINT" => GeometryType::Point,
            "LINESTRING" => GeometryType::LineString,
            "POLYGON" => GeometryType::Polygon,
            "MULTIPOINT" => GeometryType::MultiPoint,
            "MULTILINESTRING" => GeometryType::MultiLineString,
            "MULTIPOLYGON" => GeometryType::MultiPolygon,
            "GEOMETRYCOLLECTION" | "GEOMCOLLECTION" => GeometryType::GeometryCollection,
            _ => return None,
        };
        Some(parsed)
    }

    /// Base OGC type code (1..=7, 0 for the generic geometry type)
    pub fn code(&self) -> u32 {
        match self {
            GeometryType::Geometry => 0,
            GeometryType::Point => 1,
            GeometryType::LineString => 2,
            GeometryType::Polygon => 3,
            GeometryType::MultiPoint => 4,
            GeometryType::MultiLineString => 5,
            GeometryType::MultiPolygon => 6,
            GeometryType::GeometryCollection => 7,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        let parsed = match code {
            0 => GeometryType::Geometry,
            1 => GeometryType::Point,
            2 => GeometryType::LineString,
            3 => GeometryType::Polygon,
            4 => GeometryType::MultiPoint,
            5 => GeometryType::MultiLineString,
            6 => GeometryType::MultiPolygon,
            7 => GeometryType::GeometryCollection,
            _ => return None,
        };
        Some(parsed)
    }
}

/// Geometry value: a tagged union over the OGC simple feature types.
///
/// Polygon rings are stored closed (first coordinate equals last).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Point(Coord),
    LineString(Vec<Coord>),
    Polygon(Vec<Vec<Coord>>),
    MultiPoint(Vec<Coord>),
    MultiLineString(Vec<Vec<Coord>>),
    MultiPolygon(Vec<Vec<Vec<Coord>>>),
    GeometryCollection(Vec<Geometry>),
}

impl Geometry {
    /// Create a 2D Point geometry
    pub fn point(x: f64, y: f64) -> Self {
        Geometry::Point(Coord::xy(x, y))
    }

    /// Create a LineString geometry from 2D positions
    pub fn line_string(coords: Vec<[f64; 2]>) -> Self {
        Geometry::LineString(coords.into_iter().map(Coord::from).collect())
    }

    /// Create a Polygon geometry from 2D rings
    pub fn polygon(rings: Vec<Vec<[f64; 2]>>) -> Self {
        Geometry::Polygon(
            rings
                .into_iter()
                .map(|ring| ring.into_iter().map(Coord::from).collect())
                .collect(),
        )
    }

    /// Axis-aligned rectangle polygon covering an envelope
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let (x0, y0, x1, y1) = (envelope.min_x, envelope.min_y, envelope.max_x, envelope.max_y);
        Geometry::polygon(vec![vec![[x0, y0], [x1, y0], [x1, y1], [x0, y1], [x0, y0]]])
    }

    /// Get the geometry type
    pub fn geometry_type(&self) -> GeometryType {
        match self {
            Geometry::Point(_) => GeometryType::Point,
            Geometry::LineString(_) => GeometryType::LineString,
            Geometry::Polygon(_) => GeometryType::Polygon,
            Geometry::MultiPoint(_) => GeometryType::MultiPoint,
            Geometry::MultiLineString(_) => GeometryType::MultiLineString,
            Geometry::MultiPolygon(_) => GeometryType::MultiPolygon,
            Geometry::GeometryCollection(_) => GeometryType::GeometryCollection,
        }
    }

    /// Visit every coordinate in storage order
    pub fn for_each_coord<F: FnMut(&Coord)>(&self, f: &mut F) {
        match self {
            Geometry::Point(c) => f(c),
            Geometry::LineString(cs) | Geometry::MultiPoint(cs) => cs.iter().for_each(f),
            Geometry::Polygon(rings) | Geometry::MultiLineString(rings) => {
                rings.iter().flatten().for_each(f)
            }
            Geometry::MultiPolygon(polys) => polys.iter().flatten().flatten().for_each(f),
            Geometry::GeometryCollection(items) => {
                for item in items {
                    item.for_each_coord(f);
                }
            }
        }
    }

    /// Apply a transformation to every coordinate in place
    pub fn map_coords_in_place<F: FnMut(&mut Coord)>(&mut self, f: &mut F) {
        match self {
            Geometry::Point(c) => f(c),
            Geometry::LineString(cs) | Geometry::MultiPoint(cs) => cs.iter_mut().for_each(f),
            Geometry::Polygon(rings) | Geometry::MultiLineString(rings) => {
                rings.iter_mut().flatten().for_each(f)
            }
            Geometry::MultiPolygon(polys) => {
                polys.iter_mut().flatten().flatten().for_each(f)
            }
            Geometry::GeometryCollection(items) => {
                for item in items {
                    item.map_coords_in_place(f);
                }
            }
        }
    }

    /// Total number of coordinates
    pub fn coord_count(&self) -> usize {
        let mut count = 0;
        self.for_each_coord(&mut |_| count += 1);
        count
    }

    /// Minimum bounding envelope, computed in one pass over the coordinates
    pub fn envelope(&self) -> Envelope {
        let mut envelope = Envelope::null();
        self.for_each_coord(&mut |c| envelope.expand_to_include_xy(c.x, c.y));
        envelope
    }

    /// Whether the geometry holds no coordinates at all
    pub fn is_empty(&self) -> bool {
        match self {
            Geometry::Point(_) => false,
            Geometry::LineString(cs) | Geometry::MultiPoint(cs) => cs.is_empty(),
            Geometry::Polygon(rings) | Geometry::MultiLineString(rings) => {
                rings.iter().all(|r| r.is_empty())
            }
            Geometry::MultiPolygon(polys) => polys.iter().flatten().all(|r| r.is_empty()),
            Geometry::GeometryCollection(items) => items.iter().all(|g| g.is_empty()),
        }
    }

    /// Coordinate dimension, taken from the first coordinate
    pub fn dimension(&self) -> Dimension {
        let mut dimension = None;
        self.for_each_coord(&mut |c| {
            if dimension.is_none() {
                dimension = Some(c.dimension());
            }
        });
        dimension.unwrap_or_default()
    }

    /// Structural validity: polygon rings must be closed and hold at least 4 coordinates,
    /// line strings at least 2, and all ordinates must be finite.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let mut non_finite = false;
        self.for_each_coord(&mut |c| {
            if !c.x.is_finite() || !c.y.is_finite() {
                non_finite = true;
            }
        });
        if non_finite {
            return Err("coordinates must be finite".to_string());
        }

        match self {
            Geometry::Point(_) | Geometry::MultiPoint(_) => Ok(()),
            Geometry::LineString(cs) => validate_line(cs),
            Geometry::MultiLineString(lines) => lines.iter().try_for_each(|l| validate_line(l)),
            Geometry::Polygon(rings) => rings.iter().try_for_each(|r| validate_ring(r)),
            Geometry::MultiPolygon(polys) => {
                polys.iter().flatten().try_for_each(|r| validate_ring(r))
            }
            Geometry::GeometryCollection(items) => items.iter().try_for_each(|g| g.validate()),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

fn validate_line(coords: &[Coord]) -> std::result::Result<(), String> {
    if !coords.is_empty() && coords.len() < 2 {
        return Err(format!("LineString must have at least 2 points, found {}", coords.len()));
    }
    Ok(())
}

fn validate_ring(ring: &[Coord]) -> std::result::Result<(), String> {
    if ring.len() < 4 {
        return Err(format!("Polygon ring must have at least 4 coordinates, found {}", ring.len()));
    }
    let (first, last) = (ring[0], ring[ring.len() - 1]);
    if first.x != last.x || first.y != last.y {
        return Err("Polygon ring is not closed".to_string());
    }
    Ok(())
}

/// Close a ring in place if its last coordinate differs from its first
pub fn close_ring(ring: &mut Vec<Coord>) {
    if let (Some(first), Some(last)) = (ring.first().copied(), ring.last().copied()) {
        if first.x != last.x || first.y != last.y {
            ring.push(first);
        }
    }
}

/// Signed area of a ring (shoelace formula); positive for counter-clockwise rings
/// in a y-up coordinate system.
pub fn ring_signed_area(ring: &[Coord]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for pair in ring.windows(2) {
        sum += pair[0].x * pair[1].y - pair[1].x * pair[0].y;
    }
    let (first, last) = (ring[0], ring[ring.len() - 1]);
    if first.x != last.x || first.y != last.y {
        sum += last.x * first.y - first.x * last.y;
    }
    sum / 2.0
}
