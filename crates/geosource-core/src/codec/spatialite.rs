//! SpatiaLite geometry blob.
//!
//! Layout: `0x00`, endian byte, SRID, MBR (minx, miny, maxx, maxy),
//! `0x7C`, WKB payload, `0xFE`. A blob that does not start with `0x00`
//! is decoded as bare WKB.

use bytes::BufMut;

use super::wkb::{self, ByteOrder, Reader};
use crate::error::{GeosourceError, Result};
use crate::models::{Envelope, Geometry};

const START: u8 = 0x00;
const MBR_END: u8 = 0x7C;
const END: u8 = 0xFE;

/// Decoded blob
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialiteGeometry {
    pub geometry: Geometry,
    pub srid: Option<i32>,
    pub mbr: Option<Envelope>,
}

fn spatialite_error(message: impl Into<String>) -> GeosourceError {
    GeosourceError::format("SpatiaLite", message)
}

fn decode_framed(blob: &[u8]) -> Result<SpatialiteGeometry> {
    let mut reader = Reader::new(blob);
    reader.skip(1)?;
    let order = ByteOrder::from_marker(reader.u8()?)?;
    let srid = reader.i32(order)?;
    let min_x = reader.f64(order)?;
    let min_y = reader.f64(order)?;
    let max_x = reader.f64(order)?;
    let max_y = reader.f64(order)?;
    let marker = reader.u8()?;
    if marker != MBR_END {
        return Err(spatialite_error(format!(
            "expected MBR end marker 0x7C, found {marker:#04x}"
        )));
    }
    let (geometry, _, used) = wkb::decode_prefix(reader.rest())?;
    match reader.rest().get(used) {
        Some(&END) | None => {}
        Some(other) => {
            tracing::debug!(byte = *other, "unexpected byte after SpatiaLite payload");
        }
    }
    Ok(SpatialiteGeometry {
        geometry,
        srid: Some(srid),
        mbr: Some(Envelope::new(min_x, min_y, max_x, max_y)),
    })
}

/// Decode a SpatiaLite blob, falling back to bare WKB for non-SpatiaLite input
pub fn decode(blob: &[u8]) -> Result<SpatialiteGeometry> {
    if blob.first() != Some(&START) {
        let (geometry, srid) = wkb::decode_with_srid(blob)?;
        return Ok(SpatialiteGeometry { geometry, srid, mbr: None });
    }
    match decode_framed(blob) {
        Ok(decoded) => Ok(decoded),
        // Big-endian bare WKB also starts with 0x00
        Err(framed_err) => match wkb::decode_with_srid(blob) {
            Ok((geometry, srid)) => Ok(SpatialiteGeometry { geometry, srid, mbr: None }),
            Err(_) => Err(framed_err),
        },
    }
}

pub fn decode_geometry(blob: &[u8]) -> Result<Geometry> {
    decode(blob).map(|g| g.geometry)
}

/// MBR of a blob, read from the header when framed, else computed
pub fn blob_envelope(blob: &[u8]) -> Result<Option<Envelope>> {
    let decoded = decode(blob)?;
    let envelope = match decoded.mbr {
        Some(mbr) if !decoded.geometry.is_empty() => mbr,
        _ => decoded.geometry.envelope(),
    };
    Ok((!envelope.is_null()).then_some(envelope))
}

/// Encode as a little-endian SpatiaLite blob
pub fn encode(geometry: &Geometry, srid: i32) -> Vec<u8> {
    let envelope = geometry.envelope();
    let (min_x, min_y, max_x, max_y) = if envelope.is_null() {
        (0.0, 0.0, 0.0, 0.0)
    } else {
        (envelope.min_x, envelope.min_y, envelope.max_x, envelope.max_y)
    };
    let payload = wkb::encode(geometry);
    let mut out = Vec::with_capacity(39 + payload.len() + 1);
    out.put_u8(START);
    out.put_u8(ByteOrder::LittleEndian.marker());
    out.put_i32_le(srid);
    out.put_f64_le(min_x);
    out.put_f64_le(min_y);
    out.put_f64_le(max_x);
    out.put_f64_le(max_y);
    out.put_u8(MBR_END);
    out.put_slice(&payload);
    out.put_u8(END);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_layout() {
        let blob = encode(&Geometry::line_string(vec![[0.0, 0.0], [2.0, 3.0]]), 4326);
        assert_eq!(blob[0], 0x00);
        assert_eq!(blob[1], 0x01);
        assert_eq!(i32::from_le_bytes([blob[2], blob[3], blob[4], blob[5]]), 4326);
        assert_eq!(blob[38], 0x7C);
        assert_eq!(*blob.last().unwrap(), 0xFE);

        let decoded = decode(&blob).unwrap();
        assert_eq!(decoded.srid, Some(4326));
        assert_eq!(decoded.mbr, Some(Envelope::new(0.0, 0.0, 2.0, 3.0)));
    }

    #[test]
    fn test_missing_marker_is_format_error() {
        let mut blob = encode(&Geometry::point(1.0, 1.0), 0);
        blob[38] = 0x00;
        assert!(decode(&blob).unwrap_err().is_format_error());
    }

    #[test]
    fn test_bare_wkb_fallback() {
        let little = wkb::encode(&Geometry::point(7.0, 8.0));
        assert_eq!(decode_geometry(&little).unwrap(), Geometry::point(7.0, 8.0));

        let big = wkb::encode_with(&Geometry::point(7.0, 8.0), ByteOrder::BigEndian);
        assert_eq!(decode_geometry(&big).unwrap(), Geometry::point(7.0, 8.0));
    }

    #[test]
    fn test_big_endian_framing() {
        let mut blob = vec![0x00, 0x00];
        blob.extend_from_slice(&32633i32.to_be_bytes());
        for v in [1.0f64, 2.0, 1.0, 2.0] {
            blob.extend_from_slice(&v.to_be_bytes());
        }
        blob.push(0x7C);
        blob.extend_from_slice(&wkb::encode_with(&Geometry::point(1.0, 2.0), ByteOrder::BigEndian));
        blob.push(0xFE);
        let decoded = decode(&blob).unwrap();
        assert_eq!(decoded.srid, Some(32633));
        assert_eq!(decoded.geometry, Geometry::point(1.0, 2.0));
    }

    proptest! {
        #[test]
        fn spatialite_encode_is_idempotent(
            geometry in crate::codec::test_support::arb_geometry(),
            srid in 0..100_000i32,
        ) {
            let first = encode(&geometry, srid);
            let decoded = decode(&first).unwrap();
            prop_assert_eq!(encode(&decoded.geometry, srid), first);
        }
    }
}
