//! `.shp` main file: header and shape records

use bytes::BufMut;

use crate::codec::wkb::{ByteOrder, Reader};
use crate::error::{GeosourceError, Result};
use crate::models::{close_ring, ring_signed_area, Coord, Envelope, Geometry, GeometryType};

pub const FILE_CODE: i32 = 9994;
pub const VERSION: i32 = 1000;
pub const HEADER_LEN: usize = 100;

/// Measures below this value mean "no data"
const NO_DATA: f64 = -1e38;

pub(crate) fn shp_error(message: impl Into<String>) -> GeosourceError {
    GeosourceError::format("Shapefile", message)
}

/// Shape type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapeType {
    Null,
    Point,
    PolyLine,
    Polygon,
    MultiPoint,
    PointZ,
    PolyLineZ,
    PolygonZ,
    MultiPointZ,
    PointM,
    PolyLineM,
    PolygonM,
    MultiPointM,
    MultiPatch,
}

impl ShapeType {
    pub fn code(&self) -> i32 {
        match self {
            ShapeType::Null => 0,
            ShapeType::Point => 1,
            ShapeType::PolyLine => 3,
            ShapeType::Polygon => 5,
            ShapeType::MultiPoint => 8,
            ShapeType::PointZ => 11,
            ShapeType::PolyLineZ => 13,
            ShapeType::PolygonZ => 15,
            ShapeType::MultiPointZ => 18,
            ShapeType::PointM => 21,
            ShapeType::PolyLineM => 23,
            ShapeType::PolygonM => 25,
            ShapeType::MultiPointM => 28,
            ShapeType::MultiPatch => 31,
        }
    }

    pub fn from_code(code: i32) -> Result<Self> {
        Ok(match code {
            0 => ShapeType::Null,
            1 => ShapeType::Point,
            3 => ShapeType::PolyLine,
            5 => ShapeType::Polygon,
            8 => ShapeType::MultiPoint,
            11 => ShapeType::PointZ,
            13 => ShapeType::PolyLineZ,
            15 => ShapeType::PolygonZ,
            18 => ShapeType::MultiPointZ,
            21 => ShapeType::PointM,
            23 => ShapeType::PolyLineM,
            25 => ShapeType::PolygonM,
            28 => ShapeType::MultiPointM,
            31 => ShapeType::MultiPatch,
            other => return Err(shp_error(format!("unknown shape type {other}"))),
        })
    }

    pub fn has_z(&self) -> bool {
        matches!(
            self,
            ShapeType::PointZ
                | ShapeType::PolyLineZ
                | ShapeType::PolygonZ
                | ShapeType::MultiPointZ
                | ShapeType::MultiPatch
        )
    }

    /// Whether records may carry measures (optional for Z types)
    pub fn has_m(&self) -> bool {
        self.has_z()
            || matches!(
                self,
                ShapeType::PointM | ShapeType::PolyLineM | ShapeType::PolygonM | ShapeType::MultiPointM
            )
    }

    /// Geometry type a layer of this shape type reports
    pub fn geometry_type(&self) -> Option<GeometryType> {
        match self {
            ShapeType::Null => None,
            ShapeType::Point | ShapeType::PointZ | ShapeType::PointM => Some(GeometryType::Point),
            ShapeType::PolyLine | ShapeType::PolyLineZ | ShapeType::PolyLineM => {
                Some(GeometryType::MultiLineString)
            }
            ShapeType::Polygon | ShapeType::PolygonZ | ShapeType::PolygonM => {
                Some(GeometryType::MultiPolygon)
            }
            ShapeType::MultiPoint | ShapeType::MultiPointZ | ShapeType::MultiPointM => {
                Some(GeometryType::MultiPoint)
            }
            ShapeType::MultiPatch => Some(GeometryType::Geometry),
        }
    }

    /// Shape type able to hold a geometry of the given type and dimension
    pub fn for_geometry(geometry_type: GeometryType, has_z: bool, has_m: bool) -> Result<Self> {
        let (plain, z, m) = match geometry_type {
            GeometryType::Point => (ShapeType::Point, ShapeType::PointZ, ShapeType::PointM),
            GeometryType::LineString | GeometryType::MultiLineString => {
                (ShapeType::PolyLine, ShapeType::PolyLineZ, ShapeType::PolyLineM)
            }
            GeometryType::Polygon | GeometryType::MultiPolygon => {
                (ShapeType::Polygon, ShapeType::PolygonZ, ShapeType::PolygonM)
            }
            GeometryType::MultiPoint => {
                (ShapeType::MultiPoint, ShapeType::MultiPointZ, ShapeType::MultiPointM)
            }
            other => {
                return Err(GeosourceError::unsupported(
                    format!("store {} geometry", other.ogc_name()),
                    "shapefile",
                ))
            }
        };
        Ok(if has_z {
            z
        } else if has_m {
            m
        } else {
            plain
        })
    }
}

/// The 100-byte file header shared by `.shp` and `.shx`
#[derive(Debug, Clone, PartialEq)]
pub struct ShpHeader {
    /// File length in bytes
    pub file_length: u64,
    pub shape_type: ShapeType,
    pub bbox: Envelope,
    pub z_range: (f64, f64),
    pub m_range: (f64, f64),
}

impl ShpHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::for_format(bytes, "Shapefile");
        let file_code = reader.i32(ByteOrder::BigEndian)?;
        if file_code != FILE_CODE {
            return Err(shp_error(format!("bad file code {file_code}, expected {FILE_CODE}")));
        }
        reader.skip(20)?;
        let length_words = reader.i32(ByteOrder::BigEndian)?;
        let version = reader.i32(ByteOrder::LittleEndian)?;
        if version != VERSION {
            return Err(shp_error(format!("bad version {version}, expected {VERSION}")));
        }
        let shape_type = ShapeType::from_code(reader.i32(ByteOrder::LittleEndian)?)?;
        let le = ByteOrder::LittleEndian;
        let (min_x, min_y, max_x, max_y) = (reader.f64(le)?, reader.f64(le)?, reader.f64(le)?, reader.f64(le)?);
        let z_range = (reader.f64(le)?, reader.f64(le)?);
        let m_range = (reader.f64(le)?, reader.f64(le)?);
        let bbox = if min_x > max_x || min_y > max_y {
            Envelope::null()
        } else {
            Envelope::new(min_x, min_y, max_x, max_y)
        };
        Ok(Self {
            file_length: u64::from(length_words.max(0) as u32) * 2,
            shape_type,
            bbox,
            z_range,
            m_range,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.put_i32(FILE_CODE);
        out.put_bytes(0, 20);
        out.put_i32((self.file_length / 2) as i32);
        out.put_i32_le(VERSION);
        out.put_i32_le(self.shape_type.code());
        let (min_x, min_y, max_x, max_y) = if self.bbox.is_null() {
            (0.0, 0.0, 0.0, 0.0)
        } else {
            (self.bbox.min_x, self.bbox.min_y, self.bbox.max_x, self.bbox.max_y)
        };
        for v in [min_x, min_y, max_x, max_y, self.z_range.0, self.z_range.1, self.m_range.0, self.m_range.1] {
            out.put_f64_le(v);
        }
    }
}

fn read_m(reader: &mut Reader<'_>) -> Result<Option<f64>> {
    let m = reader.f64(ByteOrder::LittleEndian)?;
    Ok((m > NO_DATA).then_some(m))
}

/// Decode one record's content (after the 8-byte record header).
///
/// Null shapes decode to `None`. Z and M ordinates are kept; a missing
/// optional M block is tolerated.
pub fn decode_record(content: &[u8]) -> Result<Option<Geometry>> {
    let le = ByteOrder::LittleEndian;
    let mut reader = Reader::for_format(content, "Shapefile");
    let shape_type = ShapeType::from_code(reader.i32(le)?)?;

    match shape_type {
        ShapeType::Null => Ok(None),
        ShapeType::Point | ShapeType::PointZ | ShapeType::PointM => {
            let x = reader.f64(le)?;
            let y = reader.f64(le)?;
            let z = if shape_type.has_z() { Some(reader.f64(le)?) } else { None };
            let m = if shape_type.has_m() && reader.remaining() >= 8 { read_m(&mut reader)? } else { None };
            Ok(Some(Geometry::Point(Coord { x, y, z, m })))
        }
        ShapeType::MultiPoint | ShapeType::MultiPointZ | ShapeType::MultiPointM => {
            reader.skip(32)?;
            let n = count(&mut reader, 16)?;
            let mut points = read_xy(&mut reader, n)?;
            read_extra_ordinates(&mut reader, shape_type, &mut points)?;
            Ok(Some(Geometry::MultiPoint(points)))
        }
        ShapeType::PolyLine
        | ShapeType::PolyLineZ
        | ShapeType::PolyLineM
        | ShapeType::Polygon
        | ShapeType::PolygonZ
        | ShapeType::PolygonM => {
            reader.skip(32)?;
            let num_parts = count(&mut reader, 4)?;
            let num_points = count(&mut reader, 0)?;
            let mut parts = Vec::with_capacity(num_parts);
            for _ in 0..num_parts {
                let start = reader.i32(le)?;
                if start < 0 || start as usize > num_points {
                    return Err(shp_error(format!("part index {start} out of range")));
                }
                parts.push(start as usize);
            }
            if reader.remaining() < num_points.saturating_mul(16) {
                return Err(shp_error(format!("record too short for {num_points} points")));
            }
            let mut points = read_xy(&mut reader, num_points)?;
            read_extra_ordinates(&mut reader, shape_type, &mut points)?;

            let mut sequences = Vec::with_capacity(num_parts);
            for (i, &start) in parts.iter().enumerate() {
                let end = parts.get(i + 1).copied().unwrap_or(num_points);
                if end < start {
                    return Err(shp_error("part indices are not ascending"));
                }
                sequences.push(points[start..end].to_vec());
            }

            let is_polygon = matches!(
                shape_type,
                ShapeType::Polygon | ShapeType::PolygonZ | ShapeType::PolygonM
            );
            if is_polygon {
                Ok(Some(assemble_polygons(sequences)))
            } else if sequences.len() == 1 {
                Ok(sequences.pop().map(Geometry::LineString))
            } else {
                Ok(Some(Geometry::MultiLineString(sequences)))
            }
        }
        ShapeType::MultiPatch => Err(GeosourceError::unsupported("decode MultiPatch", "shapefile")),
    }
}

fn count(reader: &mut Reader<'_>, element_size: usize) -> Result<usize> {
    let n = reader.i32(ByteOrder::LittleEndian)?;
    if n < 0 {
        return Err(shp_error(format!("negative count {n}")));
    }
    let n = n as usize;
    if n.saturating_mul(element_size) > reader.remaining() {
        return Err(shp_error(format!("count {n} exceeds record length")));
    }
    Ok(n)
}

fn read_xy(reader: &mut Reader<'_>, n: usize) -> Result<Vec<Coord>> {
    let le = ByteOrder::LittleEndian;
    (0..n).map(|_| Ok(Coord::xy(reader.f64(le)?, reader.f64(le)?))).collect()
}

/// Z block (range + values) for Z types, then an optional M block
fn read_extra_ordinates(
    reader: &mut Reader<'_>,
    shape_type: ShapeType,
    points: &mut [Coord],
) -> Result<()> {
    let le = ByteOrder::LittleEndian;
    if shape_type.has_z() {
        reader.skip(16)?;
        for p in points.iter_mut() {
            p.z = Some(reader.f64(le)?);
        }
    }
    if shape_type.has_m() && reader.remaining() >= 16 + 8 * points.len() {
        reader.skip(16)?;
        for p in points.iter_mut() {
            p.m = read_m(reader)?;
        }
    }
    Ok(())
}

/// Group rings into polygons: clockwise rings are shells, counter-clockwise
/// rings are holes of the shell that contains them.
fn assemble_polygons(rings: Vec<Vec<Coord>>) -> Geometry {
    let mut polygons: Vec<Vec<Vec<Coord>>> = Vec::new();
    let mut orphan_holes = Vec::new();

    for mut ring in rings {
        if ring.is_empty() {
            continue;
        }
        close_ring(&mut ring);
        if ring_signed_area(&ring) <= 0.0 {
            polygons.push(vec![ring]);
        } else {
            orphan_holes.push(ring);
        }
    }

    for hole in orphan_holes {
        let probe = hole[0];
        let owner = polygons
            .iter()
            .rposition(|p| point_in_ring(&probe, &p[0]))
            .or_else(|| (!polygons.is_empty()).then(|| polygons.len() - 1));
        match owner {
            Some(idx) => polygons[idx].push(hole),
            // Counter-clockwise ring with no shell: treat it as a shell
            None => polygons.push(vec![hole]),
        }
    }

    if polygons.len() == 1 {
        Geometry::Polygon(polygons.remove(0))
    } else {
        Geometry::MultiPolygon(polygons)
    }
}

/// Even-odd point-in-ring test
fn point_in_ring(point: &Coord, ring: &[Coord]) -> bool {
    let mut inside = false;
    let mut j = ring.len().saturating_sub(1);
    for i in 0..ring.len() {
        let (a, b) = (ring[i], ring[j]);
        if (a.y > point.y) != (b.y > point.y)
            && point.x < (b.x - a.x) * (point.y - a.y) / (b.y - a.y) + a.x
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Encode a geometry as record content for a layer of `shape_type`
pub fn encode_record(geometry: Option<&Geometry>, shape_type: ShapeType) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let Some(geometry) = geometry else {
        out.put_i32_le(ShapeType::Null.code());
        return Ok(out);
    };
    let expected = ShapeType::for_geometry(
        geometry.geometry_type(),
        shape_type.has_z(),
        shape_type.has_m() && !shape_type.has_z(),
    )?;
    if expected != shape_type {
        return Err(shp_error(format!(
            "{} geometry does not fit a {:?} layer",
            geometry.geometry_type().ogc_name(),
            shape_type
        )));
    }
    out.put_i32_le(shape_type.code());

    let parts: Vec<Vec<Coord>> = match geometry {
        Geometry::Point(c) => {
            out.put_f64_le(c.x);
            out.put_f64_le(c.y);
            if shape_type.has_z() {
                out.put_f64_le(c.z.unwrap_or(0.0));
            }
            if shape_type.has_m() {
                out.put_f64_le(c.m.unwrap_or(0.0));
            }
            return Ok(out);
        }
        Geometry::MultiPoint(points) => vec![points.clone()],
        Geometry::LineString(cs) => vec![cs.clone()],
        Geometry::MultiLineString(lines) => lines.clone(),
        Geometry::Polygon(rings) => oriented_rings(rings),
        Geometry::MultiPolygon(polygons) => polygons.iter().flat_map(|p| oriented_rings(p)).collect(),
        Geometry::GeometryCollection(_) => {
            return Err(GeosourceError::unsupported("store GeometryCollection", "shapefile"))
        }
    };

    let envelope = geometry.envelope();
    for v in [envelope.min_x, envelope.min_y, envelope.max_x, envelope.max_y] {
        out.put_f64_le(v);
    }
    let points: Vec<Coord> = parts.iter().flatten().copied().collect();
    if !matches!(geometry, Geometry::MultiPoint(_)) {
        out.put_i32_le(parts.len() as i32);
    }
    out.put_i32_le(points.len() as i32);
    if !matches!(geometry, Geometry::MultiPoint(_)) {
        let mut start = 0;
        for part in &parts {
            out.put_i32_le(start);
            start += part.len() as i32;
        }
    }
    for p in &points {
        out.put_f64_le(p.x);
        out.put_f64_le(p.y);
    }
    if shape_type.has_z() {
        put_range(&mut out, &points, |c| c.z);
    }
    if shape_type.has_m() {
        put_range(&mut out, &points, |c| c.m);
    }
    Ok(out)
}

fn put_range(out: &mut Vec<u8>, points: &[Coord], get: impl Fn(&Coord) -> Option<f64>) {
    let values: Vec<f64> = points.iter().map(|c| get(c).unwrap_or(0.0)).collect();
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if values.is_empty() {
        out.put_f64_le(0.0);
        out.put_f64_le(0.0);
    } else {
        out.put_f64_le(min);
        out.put_f64_le(max);
    }
    for v in values {
        out.put_f64_le(v);
    }
}

/// Shell clockwise, holes counter-clockwise, all rings closed
fn oriented_rings(rings: &[Vec<Coord>]) -> Vec<Vec<Coord>> {
    rings
        .iter()
        .enumerate()
        .map(|(i, ring)| {
            let mut ring = ring.clone();
            close_ring(&mut ring);
            let area = ring_signed_area(&ring);
            let want_clockwise = i == 0;
            if (want_clockwise && area > 0.0) || (!want_clockwise && area < 0.0) {
                ring.reverse();
            }
            ring
        })
        .collect()
}
