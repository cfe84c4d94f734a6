//! Slippy-map tile math on the Web Mercator grid

use geosource_core::models::Envelope;
use std::f64::consts::PI;
use std::fmt;

/// Latitude limit of the square Web Mercator world
pub const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

/// Tile-local coordinate range used by vector tiles
pub const DEFAULT_EXTENT: u32 = 4096;

/// Upper bound on the number of tiles one request fans out to
pub const MAX_TILES_PER_REQUEST: usize = 64;

/// Address of one tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

fn tiles_per_side(z: u8) -> f64 {
    f64::from(1u32 << z.min(31))
}

/// Fractional tile column of a longitude
pub fn lon_to_tile_x(lon: f64, z: u8) -> f64 {
    (lon + 180.0) / 360.0 * tiles_per_side(z)
}

/// Fractional tile row of a latitude; rows grow southwards
pub fn lat_to_tile_y(lat: f64, z: u8) -> f64 {
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
    (1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / PI) / 2.0 * tiles_per_side(z)
}

pub fn tile_x_to_lon(x: f64, z: u8) -> f64 {
    x / tiles_per_side(z) * 360.0 - 180.0
}

pub fn tile_y_to_lat(y: f64, z: u8) -> f64 {
    let n = PI * (1.0 - 2.0 * y / tiles_per_side(z));
    n.sinh().atan().to_degrees()
}

impl TileId {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// Tile containing a geographic position, clamped to the grid
    pub fn containing(lon: f64, lat: f64, z: u8) -> Self {
        let max = (1u64 << z.min(31)) - 1;
        let clamp = |v: f64| (v.floor().max(0.0) as u64).min(max) as u32;
        Self { z, x: clamp(lon_to_tile_x(lon, z)), y: clamp(lat_to_tile_y(lat, z)) }
    }

    /// Geographic bounds of the tile
    pub fn envelope(&self) -> Envelope {
        let (x, y) = (f64::from(self.x), f64::from(self.y));
        Envelope::new(
            tile_x_to_lon(x, self.z),
            tile_y_to_lat(y + 1.0, self.z),
            tile_x_to_lon(x + 1.0, self.z),
            tile_y_to_lat(y, self.z),
        )
    }

    /// Map a tile-local coordinate (origin top-left, y down) to longitude/latitude
    pub fn to_geographic(&self, px: f64, py: f64, extent: u32) -> (f64, f64) {
        let extent = f64::from(extent.max(1));
        let lon = tile_x_to_lon(f64::from(self.x) + px / extent, self.z);
        let lat = tile_y_to_lat(f64::from(self.y) + py / extent, self.z);
        (lon, lat)
    }
}

/// Tiles at zoom `z` whose bounds intersect `envelope`, row by row
pub fn tiles_covering(envelope: &Envelope, z: u8) -> Vec<TileId> {
    let Some([min_x, min_y, max_x, max_y]) = envelope.to_array() else {
        return Vec::new();
    };
    let top_left = TileId::containing(min_x, max_y, z);
    let bottom_right = TileId::containing(max_x, min_y, z);
    let mut tiles = Vec::new();
    for y in top_left.y..=bottom_right.y {
        for x in top_left.x..=bottom_right.x {
            tiles.push(TileId::new(z, x, y));
        }
    }
    tiles
}

fn tile_count(envelope: &Envelope, z: u8) -> usize {
    match envelope.to_array() {
        Some([min_x, min_y, max_x, max_y]) => {
            let a = TileId::containing(min_x, max_y, z);
            let b = TileId::containing(max_x, min_y, z);
            ((b.x - a.x + 1) as usize) * ((b.y - a.y + 1) as usize)
        }
        None => 0,
    }
}

/// Pick a zoom level for a geographic envelope.
///
/// Starts from the level at which the envelope spans roughly one tile,
/// clamps to the allowed range, then backs off while the request would
/// cover more than [`MAX_TILES_PER_REQUEST`] tiles.
pub fn zoom_for_envelope(envelope: &Envelope, min_zoom: u8, max_zoom: u8) -> u8 {
    let span = envelope.width().max(envelope.height() * 2.0);
    let ideal = if span > 0.0 && span.is_finite() {
        (360.0 / span).log2().floor().max(0.0) as u32
    } else {
        u32::from(max_zoom)
    };
    let mut zoom = (ideal.min(u32::from(max_zoom)) as u8).max(min_zoom);
    while zoom > min_zoom && tile_count(envelope, zoom) > MAX_TILES_PER_REQUEST {
        zoom -= 1;
    }
    zoom
}

/// Whole Web Mercator world in geographic coordinates
pub fn world_envelope() -> Envelope {
    Envelope::new(-180.0, -MAX_LATITUDE, 180.0, MAX_LATITUDE)
}
