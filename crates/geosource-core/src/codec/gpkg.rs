//! GeoPackage geometry blob (`GP` header + WKB payload).
//!
//! Header layout: magic `G` `P`, version byte, flag byte, SRID, optional
//! envelope. Flag bit 0 gives the header byte order (0 = big endian), bits
//! 1-3 the envelope kind, bit 4 marks an empty geometry. Blobs without the
//! magic are treated as bare WKB.

use bytes::BufMut;

use super::wkb::{self, ByteOrder, Reader};
use crate::error::{GeosourceError, Result};
use crate::models::{Envelope, Geometry};

pub const MAGIC: [u8; 2] = *b"GP";

const FLAG_LITTLE_ENDIAN: u8 = 0x01;
const FLAG_EMPTY: u8 = 0x10;

/// Decoded blob: geometry plus header metadata
#[derive(Debug, Clone, PartialEq)]
pub struct GpkgGeometry {
    pub geometry: Geometry,
    pub srid: Option<i32>,
    /// Envelope stored in the header, if any
    pub envelope: Option<Envelope>,
}

fn gpkg_error(message: impl Into<String>) -> GeosourceError {
    GeosourceError::format("GeoPackage", message)
}

/// Envelope size in bytes for the flag's envelope indicator
fn envelope_size(indicator: u8) -> Result<usize> {
    match indicator {
        0 => Ok(0),
        1 => Ok(32),
        2 | 3 => Ok(48),
        4 => Ok(64),
        other => Err(gpkg_error(format!("invalid envelope indicator {other}"))),
    }
}

/// Whether a blob carries the GeoPackage header magic
pub fn has_header(blob: &[u8]) -> bool {
    blob.len() >= 2 && blob[..2] == MAGIC
}

struct Header {
    srid: i32,
    envelope: Option<Envelope>,
    empty: bool,
    payload_offset: usize,
}

fn read_header(blob: &[u8]) -> Result<Header> {
    let mut reader = Reader::new(blob);
    reader.skip(2)?;
    let version = reader.u8()?;
    if version != 0 {
        tracing::debug!(version, "unexpected GeoPackage blob version");
    }
    let flags = reader.u8()?;
    let order = if flags & FLAG_LITTLE_ENDIAN != 0 {
        ByteOrder::LittleEndian
    } else {
        ByteOrder::BigEndian
    };
    let indicator = (flags >> 1) & 0x07;
    let size = envelope_size(indicator)?;
    let srid = reader.i32(order)?;
    let envelope = if size > 0 {
        // minx, maxx, miny, maxy [, minz, maxz] [, minm, maxm]
        let min_x = reader.f64(order)?;
        let max_x = reader.f64(order)?;
        let min_y = reader.f64(order)?;
        let max_y = reader.f64(order)?;
        reader.skip(size - 32)?;
        Some(Envelope::new(min_x, min_y, max_x, max_y))
    } else {
        None
    };
    Ok(Header { srid, envelope, empty: flags & FLAG_EMPTY != 0, payload_offset: reader.consumed() })
}

/// Decode a GeoPackage blob, falling back to bare WKB when the magic is absent
pub fn decode(blob: &[u8]) -> Result<GpkgGeometry> {
    if !has_header(blob) {
        let (geometry, srid) = wkb::decode_with_srid(blob)?;
        return Ok(GpkgGeometry { geometry, srid, envelope: None });
    }
    let header = read_header(blob).map_err(|e| gpkg_error(format!("bad header: {e}")))?;
    let geometry = wkb::decode(&blob[header.payload_offset..])?;
    if header.empty && !geometry.is_empty() {
        tracing::debug!("GeoPackage blob flagged empty but carries coordinates");
    }
    Ok(GpkgGeometry { geometry, srid: Some(header.srid), envelope: header.envelope })
}

/// Decode only the geometry
pub fn decode_geometry(blob: &[u8]) -> Result<Geometry> {
    decode(blob).map(|g| g.geometry)
}

/// Envelope of a blob: the header envelope when present, else computed from the payload.
///
/// Returns `None` for empty geometries.
pub fn blob_envelope(blob: &[u8]) -> Result<Option<Envelope>> {
    if has_header(blob) {
        let header = read_header(blob)?;
        if header.empty {
            return Ok(None);
        }
        if let Some(envelope) = header.envelope {
            return Ok(Some(envelope));
        }
    }
    let envelope = decode_geometry(blob)?.envelope();
    Ok((!envelope.is_null()).then_some(envelope))
}

/// Encode with a big-endian header, an XY envelope and a little-endian WKB payload
pub fn encode(geometry: &Geometry, srid: i32) -> Vec<u8> {
    let envelope = geometry.envelope();
    let empty = envelope.is_null();
    let payload = wkb::encode(geometry);
    let mut out = Vec::with_capacity(8 + 32 + payload.len());
    out.put_slice(&MAGIC);
    out.put_u8(0);
    let flags = if empty { FLAG_EMPTY } else { 1 << 1 };
    out.put_u8(flags);
    out.put_i32(srid);
    if !empty {
        out.put_f64(envelope.min_x);
        out.put_f64(envelope.max_x);
        out.put_f64(envelope.min_y);
        out.put_f64(envelope.max_y);
    }
    out.put_slice(&payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_layout() {
        let blob = encode(&Geometry::point(1.0, 2.0), 4326);
        assert_eq!(&blob[..2], b"GP");
        assert_eq!(blob[2], 0);
        assert_eq!(blob[3], 0x02);
        assert_eq!(i32::from_be_bytes([blob[4], blob[5], blob[6], blob[7]]), 4326);
        assert_eq!(blob.len(), 8 + 32 + 21);

        let decoded = decode(&blob).unwrap();
        assert_eq!(decoded.geometry, Geometry::point(1.0, 2.0));
        assert_eq!(decoded.srid, Some(4326));
        assert_eq!(decoded.envelope, Some(Envelope::from_point(1.0, 2.0)));
    }

    #[test]
    fn test_bare_wkb_fallback() {
        let wkb_bytes = wkb::encode(&Geometry::point(3.0, 4.0));
        let decoded = decode(&wkb_bytes).unwrap();
        assert_eq!(decoded.geometry, Geometry::point(3.0, 4.0));
        assert_eq!(decoded.srid, None);
    }

    #[test]
    fn test_little_endian_header_without_envelope() {
        let mut blob = vec![b'G', b'P', 0, FLAG_LITTLE_ENDIAN];
        blob.extend_from_slice(&3857i32.to_le_bytes());
        blob.extend_from_slice(&wkb::encode(&Geometry::point(5.0, 6.0)));
        let decoded = decode(&blob).unwrap();
        assert_eq!(decoded.srid, Some(3857));
        assert_eq!(decoded.envelope, None);
        assert_eq!(blob_envelope(&blob).unwrap(), Some(Envelope::from_point(5.0, 6.0)));
    }

    #[test]
    fn test_xyz_envelope_is_skipped() {
        let mut blob = vec![b'G', b'P', 0, 2 << 1];
        blob.extend_from_slice(&0i32.to_be_bytes());
        for v in [0.0f64, 1.0, 0.0, 1.0, -5.0, 5.0] {
            blob.extend_from_slice(&v.to_be_bytes());
        }
        blob.extend_from_slice(&wkb::encode(&Geometry::point(0.5, 0.5)));
        assert_eq!(decode_geometry(&blob).unwrap(), Geometry::point(0.5, 0.5));
    }

    #[test]
    fn test_truncated_header() {
        assert!(decode(b"GP\0\x02\0\0").unwrap_err().is_format_error());
        assert!(decode(b"GP\0\x0e\0\0\0\0").unwrap_err().is_format_error());
    }

    proptest! {
        #[test]
        fn gpkg_encode_is_idempotent(
            geometry in crate::codec::test_support::arb_geometry(),
            srid in 0..100_000i32,
        ) {
            let first = encode(&geometry, srid);
            let decoded = decode(&first).unwrap();
            prop_assert_eq!(decoded.srid, Some(srid));
            prop_assert_eq!(encode(&decoded.geometry, srid), first);
        }
    }
}
