//! Mapbox Vector Tile messages and geometry command decoding

use geosource_core::error::{GeosourceError, Result};
use geosource_core::models::{ring_signed_area, AttributeTable, Coord, Geometry, Value as AttributeValue};
use prost::Message;

use crate::tile::{TileId, DEFAULT_EXTENT};

#[derive(Clone, PartialEq, Message)]
pub struct Tile {
    #[prost(message, repeated, tag = "3")]
    pub layers: Vec<Layer>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Layer {
    #[prost(uint32, required, tag = "15")]
    pub version: u32,
    #[prost(string, required, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub features: Vec<Feature>,
    #[prost(string, repeated, tag = "3")]
    pub keys: Vec<String>,
    #[prost(message, repeated, tag = "4")]
    pub values: Vec<Value>,
    #[prost(uint32, optional, tag = "5")]
    pub extent: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Feature {
    #[prost(uint64, optional, tag = "1")]
    pub id: Option<u64>,
    /// Alternating key and value indices into the layer tables
    #[prost(uint32, repeated, packed = "true", tag = "2")]
    pub tags: Vec<u32>,
    #[prost(enumeration = "GeomType", optional, tag = "3")]
    pub r#type: Option<i32>,
    #[prost(uint32, repeated, packed = "true", tag = "4")]
    pub geometry: Vec<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Value {
    #[prost(string, optional, tag = "1")]
    pub string_value: Option<String>,
    #[prost(float, optional, tag = "2")]
    pub float_value: Option<f32>,
    #[prost(double, optional, tag = "3")]
    pub double_value: Option<f64>,
    #[prost(int64, optional, tag = "4")]
    pub int_value: Option<i64>,
    #[prost(uint64, optional, tag = "5")]
    pub uint_value: Option<u64>,
    #[prost(sint64, optional, tag = "6")]
    pub sint_value: Option<i64>,
    #[prost(bool, optional, tag = "7")]
    pub bool_value: Option<bool>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum GeomType {
    Unknown = 0,
    Point = 1,
    Linestring = 2,
    Polygon = 3,
}

const MOVE_TO: u32 = 1;
const LINE_TO: u32 = 2;
const CLOSE_PATH: u32 = 7;

fn mvt_error(message: impl Into<String>) -> GeosourceError {
    GeosourceError::format("MVT", message)
}

/// Decode a tile body (already decompressed)
pub fn decode_tile(bytes: &[u8]) -> Result<Tile> {
    Tile::decode(bytes).map_err(|e| mvt_error(e.to_string()))
}

impl Value {
    /// Attribute form of a tile value; exactly one field is set in a valid tile
    pub fn to_attribute(&self) -> AttributeValue {
        if let Some(s) = &self.string_value {
            AttributeValue::Text(s.clone())
        } else if let Some(f) = self.float_value {
            AttributeValue::Float(f64::from(f))
        } else if let Some(d) = self.double_value {
            AttributeValue::Float(d)
        } else if let Some(i) = self.int_value.or(self.sint_value) {
            AttributeValue::Integer(i)
        } else if let Some(u) = self.uint_value {
            i64::try_from(u).map(AttributeValue::Integer).unwrap_or(AttributeValue::Float(u as f64))
        } else if let Some(b) = self.bool_value {
            AttributeValue::Boolean(b)
        } else {
            AttributeValue::Null
        }
    }
}

impl Layer {
    pub fn effective_extent(&self) -> u32 {
        self.extent.filter(|e| *e > 0).unwrap_or(DEFAULT_EXTENT)
    }

    /// Resolve a feature's tag pairs against the key and value tables
    pub fn attributes(&self, feature: &Feature) -> Result<AttributeTable> {
        if feature.tags.len() % 2 != 0 {
            return Err(mvt_error("odd number of feature tags"));
        }
        let mut attributes = AttributeTable::with_capacity(feature.tags.len() / 2);
        for pair in feature.tags.chunks_exact(2) {
            let key = self
                .keys
                .get(pair[0] as usize)
                .ok_or_else(|| mvt_error(format!("key index {} out of range", pair[0])))?;
            let value = self
                .values
                .get(pair[1] as usize)
                .ok_or_else(|| mvt_error(format!("value index {} out of range", pair[1])))?;
            attributes.set(key.clone(), value.to_attribute());
        }
        Ok(attributes)
    }
}

impl Feature {
    pub fn geom_type(&self) -> GeomType {
        self.r#type.and_then(|t| GeomType::try_from(t).ok()).unwrap_or(GeomType::Unknown)
    }
}

fn zigzag(n: u32) -> i64 {
    i64::from(n >> 1) ^ -i64::from(n & 1)
}

/// Paths described by a command stream, in tile-local integer space.
///
/// Each MoveTo opens a new path; ClosePath marks the current path closed.
fn paths(commands: &[u32]) -> Result<Vec<(Vec<Coord>, bool)>> {
    let mut paths: Vec<(Vec<Coord>, bool)> = Vec::new();
    let (mut x, mut y) = (0i64, 0i64);
    let mut i = 0;
    while i < commands.len() {
        let command = commands[i] & 0x7;
        let count = (commands[i] >> 3) as usize;
        i += 1;
        match command {
            MOVE_TO | LINE_TO => {
                if i + count * 2 > commands.len() {
                    return Err(mvt_error("geometry command runs past the end"));
                }
                for _ in 0..count {
                    x += zigzag(commands[i]);
                    y += zigzag(commands[i + 1]);
                    i += 2;
                    let coord = Coord::xy(x as f64, y as f64);
                    if command == MOVE_TO {
                        paths.push((vec![coord], false));
                    } else if let Some((path, _)) = paths.last_mut() {
                        path.push(coord);
                    } else {
                        return Err(mvt_error("LineTo before MoveTo"));
                    }
                }
            }
            CLOSE_PATH => match paths.last_mut() {
                Some((_, closed)) => *closed = true,
                None => return Err(mvt_error("ClosePath before MoveTo")),
            },
            other => return Err(mvt_error(format!("unknown geometry command {other}"))),
        }
    }
    Ok(paths)
}

/// Geometry in tile-local coordinates (origin top-left, y down)
pub fn decode_geometry(kind: GeomType, commands: &[u32]) -> Result<Geometry> {
    let paths = paths(commands)?;
    match kind {
        GeomType::Point => {
            let mut points: Vec<Coord> = paths.into_iter().flat_map(|(p, _)| p).collect();
            match points.len() {
                0 => Err(mvt_error("point feature without coordinates")),
                1 => Ok(Geometry::Point(points.remove(0))),
                _ => Ok(Geometry::MultiPoint(points)),
            }
        }
        GeomType::Linestring => {
            let mut lines: Vec<Vec<Coord>> =
                paths.into_iter().map(|(p, _)| p).filter(|p| p.len() >= 2).collect();
            match lines.len() {
                0 => Err(mvt_error("line feature without a valid path")),
                1 => Ok(Geometry::LineString(lines.remove(0))),
                _ => Ok(Geometry::MultiLineString(lines)),
            }
        }
        GeomType::Polygon => {
            // Exterior rings have positive area in y-down tile space; each
            // following negative ring is a hole of the preceding exterior
            let mut polygons: Vec<Vec<Vec<Coord>>> = Vec::new();
            for (mut ring, _) in paths {
                let area = ring_signed_area(&ring);
                if area == 0.0 || ring.len() < 3 {
                    continue;
                }
                if ring.first() != ring.last() {
                    ring.push(ring[0]);
                }
                if area > 0.0 {
                    polygons.push(vec![ring]);
                } else if let Some(polygon) = polygons.last_mut() {
                    polygon.push(ring);
                } else {
                    tracing::debug!("hole ring without an exterior skipped");
                }
            }
            match polygons.len() {
                0 => Err(mvt_error("polygon feature without an exterior ring")),
                1 => Ok(Geometry::Polygon(polygons.remove(0))),
                _ => Ok(Geometry::MultiPolygon(polygons)),
            }
        }
        GeomType::Unknown => Err(mvt_error("feature has unknown geometry type")),
    }
}

/// Move a tile-local geometry into longitude/latitude
pub fn to_geographic(geometry: &mut Geometry, tile: TileId, extent: u32) {
    geometry.map_coords_in_place(&mut |c: &mut Coord| {
        let (lon, lat) = tile.to_geographic(c.x, c.y, extent);
        c.x = lon;
        c.y = lat;
    });
}
