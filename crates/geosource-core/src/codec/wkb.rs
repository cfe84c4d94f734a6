//! Well-Known Binary reader and writer.
//!
//! Writes ISO WKB (type code + 1000/2000/3000 for Z/M/ZM). Reads ISO WKB and
//! also accepts the PostGIS EWKB flag bits, returning the embedded SRID.
//! Every read is bounds-checked; malformed input fails with a format error.

use bytes::{Buf, BufMut};

use crate::error::{GeosourceError, Result};
use crate::models::{Coord, Dimension, Geometry, GeometryType};

const EWKB_Z: u32 = 0x8000_0000;
const EWKB_M: u32 = 0x4000_0000;
const EWKB_SRID: u32 = 0x2000_0000;

/// Nesting limit for geometry collections
const MAX_DEPTH: usize = 32;

/// Byte order of a WKB stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    BigEndian,
    #[default]
    LittleEndian,
}

impl ByteOrder {
    /// WKB byte-order marker (0 = big endian, 1 = little endian)
    pub fn marker(&self) -> u8 {
        match self {
            ByteOrder::BigEndian => 0,
            ByteOrder::LittleEndian => 1,
        }
    }

    pub fn from_marker(marker: u8) -> Result<Self> {
        match marker {
            0 => Ok(ByteOrder::BigEndian),
            1 => Ok(ByteOrder::LittleEndian),
            other => Err(wkb_error(format!("invalid byte order marker {other:#04x}"))),
        }
    }
}

fn wkb_error(message: impl Into<String>) -> GeosourceError {
    GeosourceError::format("WKB", message)
}

/// Bounds-checked cursor over a byte slice
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    start_len: usize,
    format: &'static str,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self::for_format(buf, "WKB")
    }

    /// Reader whose truncation errors name another format
    pub(crate) fn for_format(buf: &'a [u8], format: &'static str) -> Self {
        Self { buf, start_len: buf.len(), format }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub(crate) fn consumed(&self) -> usize {
        self.start_len - self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(GeosourceError::format(self.format, format!(
                "truncated input: need {n} bytes at offset {}, {} available",
                self.consumed(),
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn u32(&mut self, order: ByteOrder) -> Result<u32> {
        self.need(4)?;
        Ok(match order {
            ByteOrder::BigEndian => self.buf.get_u32(),
            ByteOrder::LittleEndian => self.buf.get_u32_le(),
        })
    }

    pub(crate) fn i32(&mut self, order: ByteOrder) -> Result<i32> {
        self.need(4)?;
        Ok(match order {
            ByteOrder::BigEndian => self.buf.get_i32(),
            ByteOrder::LittleEndian => self.buf.get_i32_le(),
        })
    }

    pub(crate) fn f64(&mut self, order: ByteOrder) -> Result<f64> {
        self.need(8)?;
        Ok(match order {
            ByteOrder::BigEndian => self.buf.get_f64(),
            ByteOrder::LittleEndian => self.buf.get_f64_le(),
        })
    }

    pub(crate) fn skip(&mut self, n: usize) -> Result<()> {
        self.need(n)?;
        self.buf.advance(n);
        Ok(())
    }

    pub(crate) fn rest(&self) -> &'a [u8] {
        self.buf
    }

    /// Read an element count, rejecting counts the remaining input cannot hold
    fn count(&mut self, order: ByteOrder, min_element_size: usize) -> Result<usize> {
        let count = self.u32(order)? as usize;
        if count.saturating_mul(min_element_size) > self.remaining() {
            return Err(wkb_error(format!(
                "element count {count} exceeds remaining {} bytes",
                self.remaining()
            )));
        }
        Ok(count)
    }
}

/// Decoded WKB type word
struct TypeWord {
    geometry_type: GeometryType,
    dimension: Dimension,
    has_srid: bool,
}

fn parse_type_word(raw: u32) -> Result<TypeWord> {
    let ewkb_z = raw & EWKB_Z != 0;
    let ewkb_m = raw & EWKB_M != 0;
    let has_srid = raw & EWKB_SRID != 0;
    let code = raw & 0x0FFF_FFFF;

    let (base, iso_z, iso_m) = match code / 1000 {
        0 => (code, false, false),
        1 => (code - 1000, true, false),
        2 => (code - 2000, false, true),
        3 => (code - 3000, true, true),
        _ => return Err(wkb_error(format!("unknown geometry type code {raw}"))),
    };
    let geometry_type = match GeometryType::from_code(base) {
        Some(GeometryType::Geometry) | None => {
            return Err(wkb_error(format!("unknown geometry type code {raw}")))
        }
        Some(t) => t,
    };
    Ok(TypeWord {
        geometry_type,
        dimension: Dimension::from_flags(ewkb_z || iso_z, ewkb_m || iso_m),
        has_srid,
    })
}

/// Decode a WKB geometry, ignoring any embedded SRID
pub fn decode(bytes: &[u8]) -> Result<Geometry> {
    decode_with_srid(bytes).map(|(geometry, _)| geometry)
}

/// Decode a WKB or EWKB geometry, returning the EWKB SRID when present
pub fn decode_with_srid(bytes: &[u8]) -> Result<(Geometry, Option<i32>)> {
    let mut reader = Reader::new(bytes);
    let decoded = read_geometry(&mut reader, 0)?;
    if reader.remaining() > 0 {
        tracing::debug!(trailing = reader.remaining(), "ignoring trailing bytes after WKB geometry");
    }
    Ok(decoded)
}

/// Decode one geometry from the front of `bytes`, returning how many bytes it used
pub(crate) fn decode_prefix(bytes: &[u8]) -> Result<(Geometry, Option<i32>, usize)> {
    let mut reader = Reader::new(bytes);
    let (geometry, srid) = read_geometry(&mut reader, 0)?;
    Ok((geometry, srid, reader.consumed()))
}

fn read_geometry(reader: &mut Reader<'_>, depth: usize) -> Result<(Geometry, Option<i32>)> {
    if depth > MAX_DEPTH {
        return Err(wkb_error("geometry collection nesting too deep"));
    }
    let order = ByteOrder::from_marker(reader.u8()?)?;
    let word = parse_type_word(reader.u32(order)?)?;
    let srid = if word.has_srid { Some(reader.i32(order)?) } else { None };
    let dim = word.dimension;
    let coord_size = 8 * dim.ordinates();

    let geometry = match word.geometry_type {
        GeometryType::Point => Geometry::Point(read_coord(reader, order, dim)?),
        GeometryType::LineString => Geometry::LineString(read_coords(reader, order, dim)?),
        GeometryType::Polygon => Geometry::Polygon(read_rings(reader, order, dim)?),
        GeometryType::MultiPoint => {
            let n = reader.count(order, 5 + coord_size)?;
            let mut points = Vec::with_capacity(n);
            for _ in 0..n {
                match read_geometry(reader, depth + 1)?.0 {
                    Geometry::Point(c) => points.push(c),
                    other => return Err(unexpected_member("MultiPoint", &other)),
                }
            }
            Geometry::MultiPoint(points)
        }
        GeometryType::MultiLineString => {
            let n = reader.count(order, 9)?;
            let mut lines = Vec::with_capacity(n);
            for _ in 0..n {
                match read_geometry(reader, depth + 1)?.0 {
                    Geometry::LineString(cs) => lines.push(cs),
                    other => return Err(unexpected_member("MultiLineString", &other)),
                }
            }
            Geometry::MultiLineString(lines)
        }
        GeometryType::MultiPolygon => {
            let n = reader.count(order, 9)?;
            let mut polygons = Vec::with_capacity(n);
            for _ in 0..n {
                match read_geometry(reader, depth + 1)?.0 {
                    Geometry::Polygon(rings) => polygons.push(rings),
                    other => return Err(unexpected_member("MultiPolygon", &other)),
                }
            }
            Geometry::MultiPolygon(polygons)
        }
        GeometryType::GeometryCollection => {
            let n = reader.count(order, 9)?;
            let mut items = Vec::with_capacity(n);
            for _ in 0..n {
                items.push(read_geometry(reader, depth + 1)?.0);
            }
            Geometry::GeometryCollection(items)
        }
        GeometryType::Geometry => return Err(wkb_error("generic geometry type has no body")),
    };
    Ok((geometry, srid))
}

fn unexpected_member(container: &str, member: &Geometry) -> GeosourceError {
    wkb_error(format!(
        "{container} contains a {} member",
        member.geometry_type().ogc_name()
    ))
}

fn read_coord(reader: &mut Reader<'_>, order: ByteOrder, dim: Dimension) -> Result<Coord> {
    let x = reader.f64(order)?;
    let y = reader.f64(order)?;
    let z = if dim.has_z() { Some(reader.f64(order)?) } else { None };
    let m = if dim.has_m() { Some(reader.f64(order)?) } else { None };
    Ok(Coord { x, y, z, m })
}

fn read_coords(reader: &mut Reader<'_>, order: ByteOrder, dim: Dimension) -> Result<Vec<Coord>> {
    let n = reader.count(order, 8 * dim.ordinates())?;
    (0..n).map(|_| read_coord(reader, order, dim)).collect()
}

fn read_rings(
    reader: &mut Reader<'_>,
    order: ByteOrder,
    dim: Dimension,
) -> Result<Vec<Vec<Coord>>> {
    let n = reader.count(order, 4)?;
    (0..n).map(|_| read_coords(reader, order, dim)).collect()
}

/// Encode as little-endian ISO WKB
pub fn encode(geometry: &Geometry) -> Vec<u8> {
    encode_with(geometry, ByteOrder::LittleEndian)
}

/// Encode as ISO WKB in the given byte order
pub fn encode_with(geometry: &Geometry, order: ByteOrder) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + geometry.coord_count() * 16);
    write_geometry(&mut out, geometry, order, geometry.dimension());
    out
}

/// Encode as EWKB with an embedded SRID (little endian)
pub fn encode_ewkb(geometry: &Geometry, srid: i32) -> Vec<u8> {
    let dim = geometry.dimension();
    let mut out = Vec::with_capacity(13 + geometry.coord_count() * 16);
    out.put_u8(ByteOrder::LittleEndian.marker());
    let mut word = geometry.geometry_type().code() | EWKB_SRID;
    if dim.has_z() {
        word |= EWKB_Z;
    }
    if dim.has_m() {
        word |= EWKB_M;
    }
    out.put_u32_le(word);
    out.put_i32_le(srid);
    write_body(&mut out, geometry, ByteOrder::LittleEndian, dim);
    out
}

fn iso_type_code(geometry_type: GeometryType, dim: Dimension) -> u32 {
    let offset = match dim {
        Dimension::Xy => 0,
        Dimension::Xyz => 1000,
        Dimension::Xym => 2000,
        Dimension::Xyzm => 3000,
    };
    geometry_type.code() + offset
}

fn put_u32(out: &mut Vec<u8>, value: u32, order: ByteOrder) {
    match order {
        ByteOrder::BigEndian => out.put_u32(value),
        ByteOrder::LittleEndian => out.put_u32_le(value),
    }
}

fn put_f64(out: &mut Vec<u8>, value: f64, order: ByteOrder) {
    match order {
        ByteOrder::BigEndian => out.put_f64(value),
        ByteOrder::LittleEndian => out.put_f64_le(value),
    }
}

fn put_len(out: &mut Vec<u8>, len: usize, order: ByteOrder) {
    put_u32(out, len as u32, order);
}

fn write_geometry(out: &mut Vec<u8>, geometry: &Geometry, order: ByteOrder, dim: Dimension) {
    out.put_u8(order.marker());
    put_u32(out, iso_type_code(geometry.geometry_type(), dim), order);
    write_body(out, geometry, order, dim);
}

fn write_body(out: &mut Vec<u8>, geometry: &Geometry, order: ByteOrder, dim: Dimension) {
    match geometry {
        Geometry::Point(c) => write_coord(out, c, order, dim),
        Geometry::LineString(cs) => write_coords(out, cs, order, dim),
        Geometry::Polygon(rings) => write_rings(out, rings, order, dim),
        Geometry::MultiPoint(points) => {
            put_len(out, points.len(), order);
            for p in points {
                write_geometry(out, &Geometry::Point(*p), order, dim);
            }
        }
        Geometry::MultiLineString(lines) => {
            put_len(out, lines.len(), order);
            for line in lines {
                out.put_u8(order.marker());
                put_u32(out, iso_type_code(GeometryType::LineString, dim), order);
                write_coords(out, line, order, dim);
            }
        }
        Geometry::MultiPolygon(polygons) => {
            put_len(out, polygons.len(), order);
            for rings in polygons {
                out.put_u8(order.marker());
                put_u32(out, iso_type_code(GeometryType::Polygon, dim), order);
                write_rings(out, rings, order, dim);
            }
        }
        Geometry::GeometryCollection(items) => {
            put_len(out, items.len(), order);
            for item in items {
                write_geometry(out, item, order, dim);
            }
        }
    }
}

fn write_coord(out: &mut Vec<u8>, c: &Coord, order: ByteOrder, dim: Dimension) {
    put_f64(out, c.x, order);
    put_f64(out, c.y, order);
    if dim.has_z() {
        put_f64(out, c.z.unwrap_or(0.0), order);
    }
    if dim.has_m() {
        put_f64(out, c.m.unwrap_or(0.0), order);
    }
}

fn write_coords(out: &mut Vec<u8>, coords: &[Coord], order: ByteOrder, dim: Dimension) {
    put_len(out, coords.len(), order);
    for c in coords {
        write_coord(out, c, order, dim);
    }
}

fn write_rings(out: &mut Vec<u8>, rings: &[Vec<Coord>], order: ByteOrder, dim: Dimension) {
    put_len(out, rings.len(), order);
    for ring in rings {
        write_coords(out, ring, order, dim);
    }
}

/// Lowercase hexadecimal rendering of a byte sequence
pub fn to_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push(DIGITS[(b >> 4) as usize] as char);
        s.push(DIGITS[(b & 0x0F) as usize] as char);
    }
    s
}

/// Parse hexadecimal text (either case) into bytes
pub fn from_hex(text: &str) -> Result<Vec<u8>> {
    let text = text.trim();
    if text.len() % 2 != 0 {
        return Err(wkb_error("hex string has odd length"));
    }
    fn nibble(c: u8) -> Result<u8> {
        match c {
            b'0'..=b'9' => Ok(c - b'0'),
            b'a'..=b'f' => Ok(c - b'a' + 10),
            b'A'..=b'F' => Ok(c - b'A' + 10),
            _ => Err(wkb_error(format!("invalid hex digit '{}'", c as char))),
        }
    }
    text.as_bytes()
        .chunks_exact(2)
        .map(|pair| Ok((nibble(pair[0])? << 4) | nibble(pair[1])?))
        .collect()
}

/// Decode hex-encoded WKB or EWKB
pub fn decode_hex(text: &str) -> Result<Geometry> {
    decode(&from_hex(text)?)
}
