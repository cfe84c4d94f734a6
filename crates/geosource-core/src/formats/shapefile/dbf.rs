//! dBase (`.dbf`) attribute table: header, field descriptors, fixed-width records

use bytes::BufMut;
use chrono::{Datelike, NaiveDate};
use encoding_rs::Encoding;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::encoding;
use crate::error::{GeosourceError, Result};
use crate::models::{AttributeTable, ColumnInfo, FieldType, Value};

/// Deletion flag of a record marked deleted
pub const DELETED: u8 = 0x2A;
/// Deletion flag of a live record
pub const ACTIVE: u8 = 0x20;
const HEADER_TERMINATOR: u8 = 0x0D;
const EOF_MARKER: u8 = 0x1A;
const FIELD_DESCRIPTOR_LEN: usize = 32;
const MAX_NAME_LEN: usize = 11;

fn dbf_error(message: impl Into<String>) -> GeosourceError {
    GeosourceError::format("DBF", message)
}

/// One-letter dBase field type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbfFieldType {
    Character,
    Numeric,
    Float,
    Date,
    Logical,
    Memo,
    Other(u8),
}

impl DbfFieldType {
    pub fn code(&self) -> u8 {
        match self {
            DbfFieldType::Character => b'C',
            DbfFieldType::Numeric => b'N',
            DbfFieldType::Float => b'F',
            DbfFieldType::Date => b'D',
            DbfFieldType::Logical => b'L',
            DbfFieldType::Memo => b'M',
            DbfFieldType::Other(code) => *code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code.to_ascii_uppercase() {
            b'C' => DbfFieldType::Character,
            b'N' => DbfFieldType::Numeric,
            b'F' => DbfFieldType::Float,
            b'D' => DbfFieldType::Date,
            b'L' => DbfFieldType::Logical,
            b'M' => DbfFieldType::Memo,
            _ => DbfFieldType::Other(code),
        }
    }
}

/// Field descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbfField {
    pub name: String,
    pub field_type: DbfFieldType,
    pub length: u8,
    pub decimals: u8,
}

impl DbfField {
    pub fn character(name: impl Into<String>, length: u8) -> Self {
        Self { name: name.into(), field_type: DbfFieldType::Character, length, decimals: 0 }
    }

    pub fn numeric(name: impl Into<String>, length: u8, decimals: u8) -> Self {
        Self { name: name.into(), field_type: DbfFieldType::Numeric, length, decimals }
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self { name: name.into(), field_type: DbfFieldType::Date, length: 8, decimals: 0 }
    }

    pub fn logical(name: impl Into<String>) -> Self {
        Self { name: name.into(), field_type: DbfFieldType::Logical, length: 1, decimals: 0 }
    }

    /// Canonical attribute type of this field
    pub fn canonical_type(&self) -> FieldType {
        match self.field_type {
            DbfFieldType::Numeric if self.decimals == 0 && self.length <= 18 => FieldType::Integer,
            DbfFieldType::Numeric | DbfFieldType::Float => FieldType::Float,
            DbfFieldType::Date => FieldType::DateTime,
            DbfFieldType::Logical => FieldType::Boolean,
            DbfFieldType::Character | DbfFieldType::Memo | DbfFieldType::Other(_) => FieldType::Text,
        }
    }

    pub fn to_column_info(&self) -> ColumnInfo {
        let column = ColumnInfo::new(self.name.clone(), self.canonical_type());
        match self.field_type {
            DbfFieldType::Character => column.max_length(usize::from(self.length)),
            _ => column,
        }
    }

    /// Field descriptor able to store a canonical column
    pub fn from_column(column: &ColumnInfo) -> Result<Self> {
        if column.name.is_empty() || column.name.len() > MAX_NAME_LEN {
            return Err(GeosourceError::InvalidIdentifier {
                identifier: column.name.clone(),
                reason: format!("DBF field names are 1 to {MAX_NAME_LEN} bytes"),
            });
        }
        let name = column.name.clone();
        Ok(match column.field_type {
            FieldType::Text => {
                let length = column.max_length.unwrap_or(254).clamp(1, 254) as u8;
                DbfField::character(name, length)
            }
            FieldType::Integer => DbfField::numeric(name, 18, 0),
            FieldType::Float => DbfField::numeric(name, 24, 15),
            FieldType::Boolean => DbfField::logical(name),
            FieldType::DateTime => DbfField::date(name),
            FieldType::Bytes | FieldType::Geometry => {
                return Err(GeosourceError::unsupported(
                    format!("store {} fields", column.field_type),
                    "shapefile",
                ))
            }
        })
    }
}

/// File header plus field descriptors
#[derive(Debug, Clone, PartialEq)]
pub struct DbfHeader {
    pub version: u8,
    /// Last update as (years since 1900, month, day)
    pub last_update: (u8, u8, u8),
    pub record_count: u32,
    pub header_length: u16,
    pub record_length: u16,
    pub language_driver: u8,
    pub fields: Vec<DbfField>,
}

impl DbfHeader {
    /// Header for a fresh file with the given fields
    pub fn new(fields: Vec<DbfField>, record_count: u32, language_driver: u8) -> Self {
        let today = chrono::Local::now().date_naive();
        let header_length = (32 + fields.len() * FIELD_DESCRIPTOR_LEN + 1) as u16;
        let record_length = 1 + fields.iter().map(|f| u16::from(f.length)).sum::<u16>();
        Self {
            version: 0x03,
            last_update: ((today.year() - 1900).clamp(0, 255) as u8, today.month() as u8, today.day() as u8),
            record_count,
            header_length,
            record_length,
            language_driver,
            fields,
        }
    }

    /// Parse the header; `bytes` must hold at least `header_length` bytes
    pub fn parse(bytes: &[u8], encoding: Option<&'static Encoding>) -> Result<Self> {
        if bytes.len() < 32 {
            return Err(dbf_error(format!("header is only {} bytes", bytes.len())));
        }
        let version = bytes[0];
        let last_update = (bytes[1], bytes[2], bytes[3]);
        let record_count = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let header_length = u16::from_le_bytes([bytes[8], bytes[9]]);
        let record_length = u16::from_le_bytes([bytes[10], bytes[11]]);
        let language_driver = bytes[29];

        if usize::from(header_length) > bytes.len() || header_length < 33 {
            return Err(dbf_error(format!("invalid header length {header_length}")));
        }
        if record_length == 0 {
            return Err(dbf_error("record length is zero"));
        }

        let name_encoding = encoding
            .or_else(|| encoding::encoding_for_ldid(language_driver))
            .unwrap_or(encoding_rs::WINDOWS_1252);
        let mut fields = Vec::new();
        let mut pos = 32;
        while pos + FIELD_DESCRIPTOR_LEN <= usize::from(header_length)
            && bytes[pos] != HEADER_TERMINATOR
        {
            let descriptor = &bytes[pos..pos + FIELD_DESCRIPTOR_LEN];
            let raw_name = &descriptor[..MAX_NAME_LEN];
            let name_end = raw_name.iter().position(|&b| b == 0).unwrap_or(MAX_NAME_LEN);
            let name = encoding::decode(name_encoding, &raw_name[..name_end]).trim().to_string();
            fields.push(DbfField {
                name,
                field_type: DbfFieldType::from_code(descriptor[11]),
                length: descriptor[16],
                decimals: descriptor[17],
            });
            pos += FIELD_DESCRIPTOR_LEN;
        }

        let field_total = 1 + fields.iter().map(|f| usize::from(f.length)).sum::<usize>();
        if field_total > usize::from(record_length) {
            return Err(dbf_error(format!(
                "fields need {field_total} bytes but records are {record_length} bytes"
            )));
        }
        if field_total != usize::from(record_length) {
            tracing::debug!(field_total, record_length, "DBF record has padding after the last field");
        }

        Ok(Self { version, last_update, record_count, header_length, record_length, language_driver, fields })
    }

    pub fn write(&self, out: &mut Vec<u8>, encoding: &'static Encoding) {
        out.put_u8(self.version);
        out.put_u8(self.last_update.0);
        out.put_u8(self.last_update.1);
        out.put_u8(self.last_update.2);
        out.put_u32_le(self.record_count);
        out.put_u16_le(self.header_length);
        out.put_u16_le(self.record_length);
        let mut reserved = [0u8; 20];
        reserved[17] = self.language_driver;
        out.put_slice(&reserved);
        for field in &self.fields {
            let mut name = encoding::encode(encoding, &field.name);
            name.truncate(MAX_NAME_LEN);
            name.resize(MAX_NAME_LEN, 0);
            out.put_slice(&name);
            out.put_u8(field.field_type.code());
            out.put_bytes(0, 4);
            out.put_u8(field.length);
            out.put_u8(field.decimals);
            out.put_bytes(0, 14);
        }
        out.put_u8(HEADER_TERMINATOR);
        let written = 32 + self.fields.len() * FIELD_DESCRIPTOR_LEN + 1;
        if usize::from(self.header_length) > written {
            out.put_bytes(0, usize::from(self.header_length) - written);
        }
    }

    /// Byte offset of a 0-based record
    pub fn record_offset(&self, index: u32) -> u64 {
        u64::from(self.header_length) + u64::from(index) * u64::from(self.record_length)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name.eq_ignore_ascii_case(name))
    }
}

/// Decode a raw record (flag byte included) into attributes
pub fn decode_record(header: &DbfHeader, encoding: &'static Encoding, raw: &[u8]) -> AttributeTable {
    let mut attributes = AttributeTable::with_capacity(header.fields.len());
    let mut pos = 1;
    for field in &header.fields {
        let end = (pos + usize::from(field.length)).min(raw.len());
        let bytes = raw.get(pos..end).unwrap_or(&[]);
        attributes.set(field.name.clone(), decode_value(field, encoding, bytes));
        pos = end;
    }
    attributes
}

fn decode_value(field: &DbfField, encoding: &'static Encoding, bytes: &[u8]) -> Value {
    match field.field_type {
        DbfFieldType::Character | DbfFieldType::Memo | DbfFieldType::Other(_) => {
            let text = encoding::decode(encoding, bytes);
            Value::Text(text.trim_end_matches([' ', '\0']).to_string())
        }
        DbfFieldType::Numeric | DbfFieldType::Float => {
            let text = String::from_utf8_lossy(bytes);
            let text = text.trim_matches([' ', '\0']);
            if text.is_empty() || text.chars().all(|c| c == '*') {
                return Value::Null;
            }
            if field.canonical_type() == FieldType::Integer {
                if let Ok(i) = text.parse::<i64>() {
                    return Value::Integer(i);
                }
            }
            match text.parse::<f64>() {
                Ok(f) => Value::Float(f),
                Err(_) => {
                    tracing::debug!(field = %field.name, value = %text, "unparseable numeric field");
                    Value::Null
                }
            }
        }
        DbfFieldType::Date => {
            let text = String::from_utf8_lossy(bytes);
            let text = text.trim();
            NaiveDate::parse_from_str(text, "%Y%m%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(Value::DateTime)
                .unwrap_or(Value::Null)
        }
        DbfFieldType::Logical => match bytes.first() {
            Some(b'T' | b't' | b'Y' | b'y') => Value::Boolean(true),
            Some(b'F' | b'f' | b'N' | b'n') => Value::Boolean(false),
            _ => Value::Null,
        },
    }
}

/// Encode one record, deletion flag first
pub fn encode_record(
    header: &DbfHeader,
    encoding: &'static Encoding,
    attributes: &AttributeTable,
    deleted: bool,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(usize::from(header.record_length));
    out.put_u8(if deleted { DELETED } else { ACTIVE });
    for field in &header.fields {
        let value = attributes.get(&field.name).unwrap_or(&Value::Null);
        out.extend_from_slice(&encode_value(field, encoding, value)?);
    }
    out.resize(usize::from(header.record_length), b' ');
    Ok(out)
}

fn encode_value(field: &DbfField, encoding: &'static Encoding, value: &Value) -> Result<Vec<u8>> {
    let width = usize::from(field.length);
    let mut bytes = match (field.field_type, value) {
        (_, Value::Null) if field.field_type == DbfFieldType::Logical => vec![b'?'],
        (_, Value::Null) => Vec::new(),
        (DbfFieldType::Numeric | DbfFieldType::Float, v) => {
            let text = match v {
                Value::Integer(i) if field.decimals == 0 => i.to_string(),
                other => {
                    let number = other.as_f64().ok_or_else(|| {
                        dbf_error(format!("field {} expects a number, got {other}", field.name))
                    })?;
                    format!("{:.*}", usize::from(field.decimals), number)
                }
            };
            if text.len() > width {
                return Err(dbf_error(format!(
                    "value {text} does not fit field {} of width {width}",
                    field.name
                )));
            }
            // Numbers are right-aligned
            let mut padded = vec![b' '; width - text.len()];
            padded.extend_from_slice(text.as_bytes());
            padded
        }
        (DbfFieldType::Date, Value::DateTime(dt)) => dt.format("%Y%m%d").to_string().into_bytes(),
        (DbfFieldType::Date, Value::Text(s)) if s.len() == 8 => s.clone().into_bytes(),
        (DbfFieldType::Date, other) => {
            return Err(dbf_error(format!("field {} expects a date, got {other}", field.name)))
        }
        (DbfFieldType::Logical, v) => match v {
            Value::Boolean(true) => vec![b'T'],
            Value::Boolean(false) => vec![b'F'],
            other => match other.as_i64() {
                Some(0) => vec![b'F'],
                Some(_) => vec![b'T'],
                None => vec![b'?'],
            },
        },
        (_, Value::Text(s)) => encoding::encode(encoding, s),
        (_, other) => encoding::encode(encoding, &other.to_string()),
    };
    bytes.truncate(width);
    bytes.resize(width, b' ');
    Ok(bytes)
}

/// Random-access reader over a `.dbf` file
pub struct DbfReader {
    file: BufReader<File>,
    position: u64,
    header: DbfHeader,
    encoding: &'static Encoding,
}

impl DbfReader {
    /// Open a DBF, resolving the text encoding from `cpg_path`, the language
    /// driver byte, then `default_encoding`
    pub fn open(path: &Path, cpg_path: Option<&Path>, default_encoding: &str) -> Result<Self> {
        let mut file = BufReader::new(File::open(path)?);
        let mut prefix = [0u8; 32];
        file.read_exact(&mut prefix)
            .map_err(|e| dbf_error(format!("cannot read header of {}: {e}", path.display())))?;
        let header_length = usize::from(u16::from_le_bytes([prefix[8], prefix[9]]));
        let mut header_bytes = prefix.to_vec();
        if header_length > 32 {
            header_bytes.resize(header_length, 0);
            file.read_exact(&mut header_bytes[32..])
                .map_err(|e| dbf_error(format!("truncated header in {}: {e}", path.display())))?;
        }
        let encoding = encoding::resolve(cpg_path, prefix[29], default_encoding);
        let header = DbfHeader::parse(&header_bytes, Some(encoding))?;
        Ok(Self { file, position: header_bytes.len() as u64, header, encoding })
    }

    pub fn header(&self) -> &DbfHeader {
        &self.header
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    pub fn record_count(&self) -> u32 {
        self.header.record_count
    }

    /// Raw record bytes, deletion flag included
    pub fn read_raw(&mut self, index: u32) -> Result<Vec<u8>> {
        if index >= self.header.record_count {
            return Err(GeosourceError::NotFound { what: format!("DBF record {}", index + 1) });
        }
        let offset = self.header.record_offset(index);
        if offset != self.position {
            self.file.seek(SeekFrom::Start(offset))?;
        }
        let mut raw = vec![0u8; usize::from(self.header.record_length)];
        self.file
            .read_exact(&mut raw)
            .map_err(|e| dbf_error(format!("record {} is truncated: {e}", index + 1)))?;
        self.position = offset + raw.len() as u64;
        Ok(raw)
    }

    /// Attributes of a 0-based record; `None` when the record is flagged deleted
    pub fn read_record(&mut self, index: u32) -> Result<Option<AttributeTable>> {
        let raw = self.read_raw(index)?;
        if raw[0] == DELETED {
            return Ok(None);
        }
        Ok(Some(decode_record(&self.header, self.encoding, &raw)))
    }

    /// Every record in file order, deleted ones included
    pub fn read_all(&mut self) -> Result<Vec<DbfRecord>> {
        (0..self.header.record_count)
            .map(|i| {
                let raw = self.read_raw(i)?;
                Ok(DbfRecord {
                    deleted: raw[0] == DELETED,
                    attributes: decode_record(&self.header, self.encoding, &raw),
                })
            })
            .collect()
    }
}

/// One record as used by a full-table rewrite
#[derive(Debug, Clone, PartialEq)]
pub struct DbfRecord {
    pub deleted: bool,
    pub attributes: AttributeTable,
}

/// Set the deletion flag of a 0-based record in place
pub fn mark_deleted(path: &Path, header: &DbfHeader, index: u32) -> Result<()> {
    if index >= header.record_count {
        return Err(GeosourceError::NotFound { what: format!("DBF record {}", index + 1) });
    }
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(header.record_offset(index)))?;
    file.write_all(&[DELETED])?;
    file.sync_data()?;
    Ok(())
}

/// Serialize a complete DBF file
pub fn encode_file(
    fields: Vec<DbfField>,
    records: &[DbfRecord],
    encoding: &'static Encoding,
) -> Result<Vec<u8>> {
    let header = DbfHeader::new(fields, records.len() as u32, encoding::ldid_for_encoding(encoding));
    let mut out = Vec::with_capacity(
        usize::from(header.header_length) + records.len() * usize::from(header.record_length) + 1,
    );
    header.write(&mut out, encoding);
    for record in records {
        out.extend_from_slice(&encode_record(&header, encoding, &record.attributes, record.deleted)?);
    }
    out.put_u8(EOF_MARKER);
    Ok(out)
}

/// Write a fresh DBF next to `path` and atomically move it over `path`
pub fn rewrite(
    path: &Path,
    fields: Vec<DbfField>,
    records: &[DbfRecord],
    encoding: &'static Encoding,
) -> Result<()> {
    let bytes = encode_file(fields, records, encoding)?;
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(&bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| GeosourceError::Io(e.error))?;
    tracing::debug!(path = %path.display(), records = records.len(), "rewrote DBF");
    Ok(())
}
