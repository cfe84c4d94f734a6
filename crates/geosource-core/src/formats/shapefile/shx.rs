//! `.shx` index file: record number to (offset, length)

use bytes::BufMut;

use super::shp::{shp_error, ShpHeader, HEADER_LEN};
use crate::codec::wkb::{ByteOrder, Reader};
use crate::error::Result;

/// Location of one record in the `.shp` file, in bytes.
///
/// `offset` points at the 8-byte record header; `length` is the content length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    pub offset: u64,
    pub length: u64,
}

/// Parse a whole `.shx` file
pub fn parse(bytes: &[u8]) -> Result<(ShpHeader, Vec<RecordLocation>)> {
    if bytes.len() < HEADER_LEN {
        return Err(shp_error(format!(".shx file is only {} bytes", bytes.len())));
    }
    let header = ShpHeader::parse(&bytes[..HEADER_LEN])?;
    let body = &bytes[HEADER_LEN..];
    if body.len() % 8 != 0 {
        tracing::warn!(trailing = body.len() % 8, "ignoring partial .shx entry");
    }
    let mut reader = Reader::for_format(body, "Shapefile");
    let mut locations = Vec::with_capacity(body.len() / 8);
    while reader.remaining() >= 8 {
        // Both values are counted in 16-bit words
        let offset_words = reader.i32(ByteOrder::BigEndian)?;
        let length_words = reader.i32(ByteOrder::BigEndian)?;
        if offset_words < 0 || length_words < 0 {
            return Err(shp_error(format!(
                "negative .shx entry ({offset_words}, {length_words}) at record {}",
                locations.len() + 1
            )));
        }
        locations.push(RecordLocation {
            offset: offset_words as u64 * 2,
            length: length_words as u64 * 2,
        });
    }
    Ok((header, locations))
}

/// Serialize an index for the given record locations
pub fn write(header: &ShpHeader, locations: &[RecordLocation]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + locations.len() * 8);
    let header = ShpHeader { file_length: (HEADER_LEN + locations.len() * 8) as u64, ..header.clone() };
    header.write(&mut out);
    for location in locations {
        out.put_i32((location.offset / 2) as i32);
        out.put_i32((location.length / 2) as i32);
    }
    out
}
