//! Well-Known Text reader and writer.
//!
//! The writer is canonical: `TYPE [Z|M|ZM] (...)`, one space between
//! ordinates, `", "` between coordinates, polygon rings closed. The reader
//! accepts that form plus the usual variations (no space before the
//! parenthesis, `POINTZ`, bare multipoint coordinates, an `SRID=n;` prefix).

use std::fmt::Write as _;

use crate::error::{GeosourceError, Result};
use crate::models::{close_ring, Coord, Dimension, Geometry, GeometryType};

const MAX_DEPTH: usize = 32;

fn wkt_error(message: impl Into<String>) -> GeosourceError {
    GeosourceError::format("WKT", message)
}

/// Render a geometry as canonical WKT
pub fn write(geometry: &Geometry) -> String {
    let mut out = String::new();
    write_geometry(&mut out, geometry, geometry.dimension());
    out
}

/// Render as EWKT with an `SRID=n;` prefix
pub fn write_with_srid(geometry: &Geometry, srid: i32) -> String {
    format!("SRID={srid};{}", write(geometry))
}

fn dimension_tag(dim: Dimension) -> &'static str {
    match dim {
        Dimension::Xy => "",
        Dimension::Xyz => " Z",
        Dimension::Xym => " M",
        Dimension::Xyzm => " ZM",
    }
}

fn write_geometry(out: &mut String, geometry: &Geometry, dim: Dimension) {
    out.push_str(geometry.geometry_type().ogc_name());
    out.push_str(dimension_tag(dim));
    if geometry.is_empty() && !matches!(geometry, Geometry::GeometryCollection(items) if !items.is_empty())
    {
        out.push_str(" EMPTY");
        return;
    }
    out.push(' ');
    match geometry {
        Geometry::Point(c) => {
            out.push('(');
            write_coord(out, c, dim);
            out.push(')');
        }
        Geometry::LineString(cs) => write_coord_list(out, cs, dim),
        Geometry::Polygon(rings) => write_rings(out, rings, dim),
        Geometry::MultiPoint(points) => {
            out.push('(');
            for (i, p) in points.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push('(');
                write_coord(out, p, dim);
                out.push(')');
            }
            out.push(')');
        }
        Geometry::MultiLineString(lines) => {
            out.push('(');
            for (i, line) in lines.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_coord_list(out, line, dim);
            }
            out.push(')');
        }
        Geometry::MultiPolygon(polygons) => {
            out.push('(');
            for (i, rings) in polygons.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_rings(out, rings, dim);
            }
            out.push(')');
        }
        Geometry::GeometryCollection(items) => {
            out.push('(');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_geometry(out, item, dim);
            }
            out.push(')');
        }
    }
}

fn write_coord(out: &mut String, c: &Coord, dim: Dimension) {
    let _ = write!(out, "{} {}", c.x, c.y);
    if dim.has_z() {
        let _ = write!(out, " {}", c.z.unwrap_or(0.0));
    }
    if dim.has_m() {
        let _ = write!(out, " {}", c.m.unwrap_or(0.0));
    }
}

fn write_coord_list(out: &mut String, coords: &[Coord], dim: Dimension) {
    out.push('(');
    for (i, c) in coords.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_coord(out, c, dim);
    }
    out.push(')');
}

fn write_rings(out: &mut String, rings: &[Vec<Coord>], dim: Dimension) {
    out.push('(');
    for (i, ring) in rings.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let mut ring = ring.clone();
        close_ring(&mut ring);
        write_coord_list(out, &ring, dim);
    }
    out.push(')');
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Number(f64),
    Open,
    Close,
    Comma,
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some(&(start, ch)) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            c if c.is_ascii_alphabetic() => {
                let mut end = start;
                while let Some(&(i, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        end = i + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let word = &text[start..end];
                match word.to_ascii_lowercase().as_str() {
                    "nan" => tokens.push(Token::Number(f64::NAN)),
                    "inf" | "infinity" => tokens.push(Token::Number(f64::INFINITY)),
                    _ => tokens.push(Token::Word(word.to_ascii_uppercase())),
                }
            }
            sign @ ('-' | '+') if text[start + 1..].starts_with(|n: char| n.is_ascii_alphabetic()) => {
                chars.next();
                let mut end = start + 1;
                while let Some(&(i, c)) = chars.peek() {
                    if c.is_ascii_alphabetic() {
                        end = i + 1;
                        chars.next();
                    } else {
                        break;
                    }
                }
                let magnitude = match text[start + 1..end].to_ascii_lowercase().as_str() {
                    "inf" | "infinity" => f64::INFINITY,
                    "nan" => f64::NAN,
                    _ => return Err(wkt_error(format!("invalid number '{}'", &text[start..end]))),
                };
                tokens.push(Token::Number(if sign == '-' { -magnitude } else { magnitude }));
            }
            c if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => {
                let mut end = start;
                let mut prev = ' ';
                while let Some(&(i, c)) = chars.peek() {
                    let accept = c.is_ascii_digit()
                        || c == '.'
                        || c == 'e'
                        || c == 'E'
                        || ((c == '-' || c == '+') && (i == start || prev == 'e' || prev == 'E'));
                    if !accept {
                        break;
                    }
                    prev = c;
                    end = i + c.len_utf8();
                    chars.next();
                }
                let literal = &text[start..end];
                let value: f64 = literal
                    .parse()
                    .map_err(|_| wkt_error(format!("invalid number '{literal}'")))?;
                tokens.push(Token::Number(value));
            }
            other => {
                return Err(wkt_error(format!("unexpected character '{other}' at {start}")));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(ref t) if *t == expected => Ok(()),
            Some(t) => Err(wkt_error(format!("expected {expected:?}, found {t:?}"))),
            None => Err(wkt_error(format!("expected {expected:?}, found end of input"))),
        }
    }

    fn is_word(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w == word)
    }

    fn geometry(&mut self, depth: usize, inherited: Option<Dimension>) -> Result<Geometry> {
        if depth > MAX_DEPTH {
            return Err(wkt_error("geometry collection nesting too deep"));
        }
        let name = match self.next() {
            Some(Token::Word(w)) => w,
            other => return Err(wkt_error(format!("expected geometry type, found {other:?}"))),
        };
        let geometry_type = GeometryType::from_ogc_name(&name)
            .filter(|t| *t != GeometryType::Geometry)
            .ok_or_else(|| wkt_error(format!("unknown geometry type '{name}'")))?;

        // Dimension from a glued suffix (POINTZ) or a separate tag (POINT Z)
        let base_len = geometry_type.ogc_name().len();
        let glued = if name.len() > base_len && name != "GEOMCOLLECTION" {
            Some(&name[base_len..])
        } else {
            None
        };
        let tag = match glued {
            Some(s) => Some(s.to_string()),
            None => match self.peek() {
                Some(Token::Word(w)) if matches!(w.as_str(), "Z" | "M" | "ZM") => {
                    let w = w.clone();
                    self.pos += 1;
                    Some(w)
                }
                _ => None,
            },
        };
        let declared = match tag.as_deref() {
            Some("Z") => Some(Dimension::Xyz),
            Some("M") => Some(Dimension::Xym),
            Some("ZM") => Some(Dimension::Xyzm),
            Some(other) => return Err(wkt_error(format!("invalid dimension tag '{other}'"))),
            None => inherited,
        };

        if self.is_word("EMPTY") {
            self.pos += 1;
            return match geometry_type {
                GeometryType::Point => Err(wkt_error("POINT EMPTY is not representable")),
                GeometryType::LineString => Ok(Geometry::LineString(Vec::new())),
                GeometryType::Polygon => Ok(Geometry::Polygon(Vec::new())),
                GeometryType::MultiPoint => Ok(Geometry::MultiPoint(Vec::new())),
                GeometryType::MultiLineString => Ok(Geometry::MultiLineString(Vec::new())),
                GeometryType::MultiPolygon => Ok(Geometry::MultiPolygon(Vec::new())),
                _ => Ok(Geometry::GeometryCollection(Vec::new())),
            };
        }

        let geometry = match geometry_type {
            GeometryType::Point => {
                self.expect(Token::Open)?;
                let c = self.coord(declared)?;
                self.expect(Token::Close)?;
                Geometry::Point(c)
            }
            GeometryType::LineString => Geometry::LineString(self.coord_list(declared)?),
            GeometryType::Polygon => Geometry::Polygon(self.rings(declared)?),
            GeometryType::MultiPoint => {
                self.expect(Token::Open)?;
                let mut points = Vec::new();
                loop {
                    if self.peek() == Some(&Token::Open) {
                        self.pos += 1;
                        points.push(self.coord(declared)?);
                        self.expect(Token::Close)?;
                    } else {
                        points.push(self.coord(declared)?);
                    }
                    if !self.comma_or_close()? {
                        break;
                    }
                }
                Geometry::MultiPoint(points)
            }
            GeometryType::MultiLineString => {
                self.expect(Token::Open)?;
                let mut lines = Vec::new();
                loop {
                    lines.push(self.coord_list(declared)?);
                    if !self.comma_or_close()? {
                        break;
                    }
                }
                Geometry::MultiLineString(lines)
            }
            GeometryType::MultiPolygon => {
                self.expect(Token::Open)?;
                let mut polygons = Vec::new();
                loop {
                    polygons.push(self.rings(declared)?);
                    if !self.comma_or_close()? {
                        break;
                    }
                }
                Geometry::MultiPolygon(polygons)
            }
            _ => {
                self.expect(Token::Open)?;
                let mut items = Vec::new();
                loop {
                    items.push(self.geometry(depth + 1, declared)?);
                    if !self.comma_or_close()? {
                        break;
                    }
                }
                Geometry::GeometryCollection(items)
            }
        };
        Ok(geometry)
    }

    /// Consume a separator; `true` when more items follow
    fn comma_or_close(&mut self) -> Result<bool> {
        match self.next() {
            Some(Token::Comma) => Ok(true),
            Some(Token::Close) => Ok(false),
            other => Err(wkt_error(format!("expected ',' or ')', found {other:?}"))),
        }
    }

    fn coord(&mut self, declared: Option<Dimension>) -> Result<Coord> {
        let mut ordinates = Vec::with_capacity(4);
        while let Some(Token::Number(v)) = self.peek() {
            ordinates.push(*v);
            self.pos += 1;
        }
        let dim = match declared {
            Some(dim) => dim,
            None => match ordinates.len() {
                2 => Dimension::Xy,
                3 => Dimension::Xyz,
                4 => Dimension::Xyzm,
                n => return Err(wkt_error(format!("coordinate has {n} ordinates"))),
            },
        };
        if ordinates.len() != dim.ordinates() {
            return Err(wkt_error(format!(
                "expected {} ordinates, found {}",
                dim.ordinates(),
                ordinates.len()
            )));
        }
        let mut it = ordinates.into_iter();
        let x = it.next().unwrap_or_default();
        let y = it.next().unwrap_or_default();
        let z = if dim.has_z() { it.next() } else { None };
        let m = if dim.has_m() { it.next() } else { None };
        Ok(Coord { x, y, z, m })
    }

    fn coord_list(&mut self, declared: Option<Dimension>) -> Result<Vec<Coord>> {
        if self.is_word("EMPTY") {
            self.pos += 1;
            return Ok(Vec::new());
        }
        self.expect(Token::Open)?;
        let mut coords = Vec::new();
        loop {
            coords.push(self.coord(declared)?);
            if !self.comma_or_close()? {
                break;
            }
        }
        Ok(coords)
    }

    fn rings(&mut self, declared: Option<Dimension>) -> Result<Vec<Vec<Coord>>> {
        if self.is_word("EMPTY") {
            self.pos += 1;
            return Ok(Vec::new());
        }
        self.expect(Token::Open)?;
        let mut rings = Vec::new();
        loop {
            let mut ring = self.coord_list(declared)?;
            close_ring(&mut ring);
            rings.push(ring);
            if !self.comma_or_close()? {
                break;
            }
        }
        Ok(rings)
    }
}

/// Parse WKT (or EWKT) into a geometry
pub fn parse(text: &str) -> Result<Geometry> {
    parse_with_srid(text).map(|(geometry, _)| geometry)
}

/// Parse WKT, returning the SRID from an `SRID=n;` prefix when present
pub fn parse_with_srid(text: &str) -> Result<(Geometry, Option<i32>)> {
    let text = text.trim();
    let (srid, body) = match text.split_once(';') {
        Some((prefix, body)) if prefix.trim().to_ascii_uppercase().starts_with("SRID=") => {
            let value = prefix.trim()[5..].trim();
            let srid = value
                .parse::<i32>()
                .map_err(|_| wkt_error(format!("invalid SRID '{value}'")))?;
            (Some(srid), body)
        }
        _ => (None, text),
    };
    let mut parser = Parser { tokens: tokenize(body)?, pos: 0 };
    let geometry = parser.geometry(0, None)?;
    if parser.pos < parser.tokens.len() {
        return Err(wkt_error("unexpected trailing input"));
    }
    Ok((geometry, srid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_canonical_point() {
        assert_eq!(write(&Geometry::point(100.0, 200.5)), "POINT (100 200.5)");
        assert_eq!(parse("POINT(100 200.5)").unwrap(), Geometry::point(100.0, 200.5));
    }

    #[test]
    fn test_polygon_rings_are_closed_on_write() {
        let open = Geometry::polygon(vec![vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]]]);
        assert_eq!(write(&open), "POLYGON ((0 0, 1 0, 1 1, 0 0))");
    }

    #[test]
    fn test_parse_variants() {
        let z = parse("POINTZ(1 2 3)").unwrap();
        assert_eq!(z, Geometry::Point(Coord::xyz(1.0, 2.0, 3.0)));
        let inferred = parse("LINESTRING (0 0 1, 1 1 2)").unwrap();
        assert_eq!(inferred.dimension(), Dimension::Xyz);
        let bare = parse("MULTIPOINT (1 2, 3 4)").unwrap();
        assert_eq!(bare, parse("MULTIPOINT ((1 2), (3 4))").unwrap());
        let m = parse("POINT M (1 2 9)").unwrap();
        assert_eq!(m, Geometry::Point(Coord::xym(1.0, 2.0, 9.0)));
    }

    #[test]
    fn test_ewkt_prefix() {
        let (geometry, srid) = parse_with_srid("SRID=4326;POINT(1 2)").unwrap();
        assert_eq!(geometry, Geometry::point(1.0, 2.0));
        assert_eq!(srid, Some(4326));
        assert_eq!(write_with_srid(&geometry, 3857), "SRID=3857;POINT (1 2)");
    }

    #[test]
    fn test_collection_and_empty() {
        let text = "GEOMETRYCOLLECTION (POINT (1 2), LINESTRING (0 0, 1 1))";
        assert_eq!(write(&parse(text).unwrap()), text);
        assert_eq!(write(&parse("MULTIPOLYGON EMPTY").unwrap()), "MULTIPOLYGON EMPTY");
    }

    #[test]
    fn test_malformed_input() {
        for bad in ["", "POINT", "POINT (1)", "POINT (1 2", "CIRCLE (1 2)", "POINT (1 2) x", "POINT (a b)"] {
            assert!(parse(bad).unwrap_err().is_format_error(), "{bad}");
        }
    }

    #[test]
    fn test_scientific_notation() {
        assert_eq!(parse("POINT (1e3 -2.5E-1)").unwrap(), Geometry::point(1000.0, -0.25));
    }

    #[test]
    fn test_signed_non_finite_ordinates() {
        let point = Geometry::point(f64::NEG_INFINITY, f64::INFINITY);
        let text = write(&point);
        assert_eq!(text, "POINT (-inf inf)");
        assert_eq!(parse(&text).unwrap(), point);
        assert_eq!(parse("POINT (+Infinity -INF)").unwrap(), Geometry::point(f64::INFINITY, f64::NEG_INFINITY));
        assert!(parse("POINT (-north 1)").unwrap_err().is_format_error());
    }

    proptest! {
        #[test]
        fn wkt_roundtrip_is_stable(geometry in crate::codec::test_support::arb_geometry()) {
            let text = write(&geometry);
            let reparsed = parse(&text).unwrap();
            prop_assert_eq!(write(&reparsed), text);
        }
    }
}
