//! Reprojection between WGS 84 geographic coordinates and Web Mercator

use geosource_core::{Envelope, Geometry, GeosourceError, Result};

/// WGS 84 semi-major axis, the Web Mercator sphere radius
pub const EARTH_RADIUS: f64 = 6_378_137.0;
/// Latitude limit of the square Web Mercator world
pub const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

const WGS84: i32 = 4326;

/// EPSG:3857 and its historical aliases
pub fn is_web_mercator(srid: i32) -> bool {
    matches!(srid, 3857 | 900913 | 3785 | 102100 | 102113)
}

fn is_wgs84(srid: i32) -> bool {
    srid == WGS84
}

/// Whether `reproject` handles this pair
pub fn can_reproject(from: i32, to: i32) -> bool {
    from == to
        || (is_wgs84(from) && is_web_mercator(to))
        || (is_web_mercator(from) && is_wgs84(to))
        || (is_web_mercator(from) && is_web_mercator(to))
}

fn lonlat_to_mercator(lon: f64, lat: f64) -> (f64, f64) {
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    let x = EARTH_RADIUS * lon.to_radians();
    let y = EARTH_RADIUS * (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln();
    (x, y)
}

fn mercator_to_lonlat(x: f64, y: f64) -> (f64, f64) {
    let lon = (x / EARTH_RADIUS).to_degrees();
    let lat = (2.0 * (y / EARTH_RADIUS).exp().atan() - std::f64::consts::FRAC_PI_2).to_degrees();
    (lon, lat)
}

fn point_transform(from: i32, to: i32) -> Result<Option<fn(f64, f64) -> (f64, f64)>> {
    if from == to || (is_web_mercator(from) && is_web_mercator(to)) {
        return Ok(None);
    }
    if is_wgs84(from) && is_web_mercator(to) {
        return Ok(Some(lonlat_to_mercator));
    }
    if is_web_mercator(from) && is_wgs84(to) {
        return Ok(Some(mercator_to_lonlat));
    }
    tracing::debug!(from, to, "no in-process transform between reference systems");
    Err(GeosourceError::unsupported(format!("reproject EPSG:{from} to EPSG:{to}"), "in-process"))
}

/// Reproject a geometry in place. Z and M ordinates are untouched.
pub fn reproject(geometry: &mut Geometry, from: i32, to: i32) -> Result<()> {
    if let Some(transform) = point_transform(from, to)? {
        geometry.map_coords_in_place(&mut |c| {
            let (x, y) = transform(c.x, c.y);
            c.x = x;
            c.y = y;
        });
    }
    Ok(())
}

/// Reproject an envelope by transforming its corners
pub fn reproject_envelope(envelope: &Envelope, from: i32, to: i32) -> Result<Envelope> {
    if envelope.is_null() {
        return Ok(*envelope);
    }
    match point_transform(from, to)? {
        None => Ok(*envelope),
        Some(transform) => {
            let (x0, y0) = transform(envelope.min_x, envelope.min_y);
            let (x1, y1) = transform(envelope.max_x, envelope.max_y);
            Ok(Envelope::new(x0, y0, x1, y1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64, tolerance: f64) {
        assert!((a - b).abs() <= tolerance, "{a} != {b}");
    }

    #[test]
    fn test_known_point() {
        let mut point = Geometry::point(180.0, 0.0);
        reproject(&mut point, 4326, 3857).unwrap();
        match point {
            Geometry::Point(c) => {
                assert_close(c.x, 20_037_508.342_789_244, 1e-6);
                assert_close(c.y, 0.0, 1e-6);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_roundtrip() {
        let original = Geometry::line_string(vec![[106.8, -6.2], [-73.9, 40.7]]);
        let mut geometry = original.clone();
        reproject(&mut geometry, 4326, 900913).unwrap();
        reproject(&mut geometry, 3857, 4326).unwrap();
        let (Geometry::LineString(a), Geometry::LineString(b)) = (&original, &geometry) else {
            panic!("type changed");
        };
        for (p, q) in a.iter().zip(b) {
            assert_close(p.x, q.x, 1e-9);
            assert_close(p.y, q.y, 1e-9);
        }
    }

    #[test]
    fn test_unsupported_pair() {
        let mut point = Geometry::point(0.0, 0.0);
        assert!(reproject(&mut point, 4326, 32633).unwrap_err().is_unsupported());
        assert!(reproject(&mut point, 2154, 2154).is_ok());
        assert!(!can_reproject(0, 4326));
    }

    #[test]
    fn test_envelope() {
        let world = reproject_envelope(&Envelope::new(-180.0, -90.0, 180.0, 90.0), 4326, 3857).unwrap();
        assert_close(world.max_x, 20_037_508.342_789_244, 1e-6);
        assert_close(world.max_y, 20_037_508.342_789_244, 1e-3);
    }

    proptest::proptest! {
        #[test]
        fn prop_mercator_roundtrip(lon in -180.0f64..180.0, lat in -85.0f64..85.0) {
            let mut point = Geometry::point(lon, lat);
            reproject(&mut point, 4326, 3857).unwrap();
            reproject(&mut point, 3857, 4326).unwrap();
            let Geometry::Point(c) = point else { panic!("type changed") };
            proptest::prop_assert!((c.x - lon).abs() < 1e-7);
            proptest::prop_assert!((c.y - lat).abs() < 1e-7);
        }
    }
}
