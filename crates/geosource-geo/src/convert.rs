//! Conversion between geosource geometries and `geo` types (2D only)

use geo::{
    Geometry as GeoGeometry, GeometryCollection, LineString, MultiLineString, MultiPoint,
    MultiPolygon, Point, Polygon,
};
use geosource_core::{Coord, Geometry};

fn to_coord(c: &Coord) -> geo::Coord<f64> {
    geo::Coord { x: c.x, y: c.y }
}

fn to_line(coords: &[Coord]) -> LineString<f64> {
    LineString::new(coords.iter().map(to_coord).collect())
}

fn to_polygon(rings: &[Vec<Coord>]) -> Polygon<f64> {
    match rings.split_first() {
        Some((exterior, interiors)) => {
            Polygon::new(to_line(exterior), interiors.iter().map(|r| to_line(r)).collect())
        }
        None => Polygon::new(LineString::new(Vec::new()), Vec::new()),
    }
}

/// Convert to a `geo` geometry; Z and M ordinates are dropped
pub fn to_geo(geometry: &Geometry) -> GeoGeometry<f64> {
    match geometry {
        Geometry::Point(c) => GeoGeometry::Point(Point(to_coord(c))),
        Geometry::LineString(cs) => GeoGeometry::LineString(to_line(cs)),
        Geometry::Polygon(rings) => GeoGeometry::Polygon(to_polygon(rings)),
        Geometry::MultiPoint(cs) => {
            GeoGeometry::MultiPoint(MultiPoint(cs.iter().map(|c| Point(to_coord(c))).collect()))
        }
        Geometry::MultiLineString(lines) => {
            GeoGeometry::MultiLineString(MultiLineString(lines.iter().map(|l| to_line(l)).collect()))
        }
        Geometry::MultiPolygon(polygons) => {
            GeoGeometry::MultiPolygon(MultiPolygon(polygons.iter().map(|p| to_polygon(p)).collect()))
        }
        Geometry::GeometryCollection(items) => {
            GeoGeometry::GeometryCollection(GeometryCollection(items.iter().map(to_geo).collect()))
        }
    }
}

fn from_line(line: &LineString<f64>) -> Vec<Coord> {
    line.0.iter().map(|c| Coord::xy(c.x, c.y)).collect()
}

fn from_polygon(polygon: &Polygon<f64>) -> Vec<Vec<Coord>> {
    if polygon.exterior().0.is_empty() {
        return Vec::new();
    }
    std::iter::once(polygon.exterior())
        .chain(polygon.interiors())
        .map(from_line)
        .collect()
}

/// Convert from a `geo` geometry. Lines, rectangles and triangles become
/// line strings and polygons.
pub fn from_geo(geometry: &GeoGeometry<f64>) -> Geometry {
    match geometry {
        GeoGeometry::Point(p) => Geometry::Point(Coord::xy(p.x(), p.y())),
        GeoGeometry::Line(l) => Geometry::LineString(vec![
            Coord::xy(l.start.x, l.start.y),
            Coord::xy(l.end.x, l.end.y),
        ]),
        GeoGeometry::LineString(l) => Geometry::LineString(from_line(l)),
        GeoGeometry::Polygon(p) => Geometry::Polygon(from_polygon(p)),
        GeoGeometry::MultiPoint(mp) => {
            Geometry::MultiPoint(mp.0.iter().map(|p| Coord::xy(p.x(), p.y())).collect())
        }
        GeoGeometry::MultiLineString(ml) => Geometry::MultiLineString(ml.0.iter().map(from_line).collect()),
        GeoGeometry::MultiPolygon(mp) => Geometry::MultiPolygon(mp.0.iter().map(from_polygon).collect()),
        GeoGeometry::GeometryCollection(gc) => {
            Geometry::GeometryCollection(gc.0.iter().map(from_geo).collect())
        }
        GeoGeometry::Rect(r) => Geometry::Polygon(from_polygon(&r.to_polygon())),
        GeoGeometry::Triangle(t) => Geometry::Polygon(from_polygon(&t.to_polygon())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polygon_with_hole() {
        let polygon = Geometry::polygon(vec![
            vec![[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0], [0.0, 0.0]],
            vec![[2.0, 2.0], [4.0, 2.0], [4.0, 4.0], [2.0, 4.0], [2.0, 2.0]],
        ]);
        let geo = to_geo(&polygon);
        match &geo {
            GeoGeometry::Polygon(p) => assert_eq!(p.interiors().len(), 1),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(from_geo(&geo), polygon);
    }

    #[test]
    fn test_z_is_dropped() {
        let point = Geometry::Point(Coord::xyz(1.0, 2.0, 3.0));
        assert_eq!(from_geo(&to_geo(&point)), Geometry::point(1.0, 2.0));
    }

    #[test]
    fn test_collection() {
        let collection = Geometry::GeometryCollection(vec![
            Geometry::point(1.0, 1.0),
            Geometry::line_string(vec![[0.0, 0.0], [1.0, 1.0]]),
        ]);
        assert_eq!(from_geo(&to_geo(&collection)), collection);
    }
}
