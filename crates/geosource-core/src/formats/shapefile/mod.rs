//! ESRI Shapefile triplet (`.shp` + `.shx` + `.dbf`, optional `.prj` / `.cpg`)

pub mod dbf;
pub mod encoding;
pub mod prj;
pub mod shp;
pub mod shx;

use encoding_rs::Encoding;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{GeosourceError, Result};
use crate::models::{AttributeTable, Envelope, Feature, FeatureId, Geometry, TableSchema};
use crate::report::{ValidationReport, ValidationWarning};
use dbf::{DbfField, DbfReader, DbfRecord};
use shp::{shp_error, ShapeType, ShpHeader, HEADER_LEN};
use shx::RecordLocation;

/// Paths of the companion files of one shapefile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapefilePaths {
    pub shp: PathBuf,
    pub shx: PathBuf,
    pub dbf: PathBuf,
    pub prj: PathBuf,
    pub cpg: PathBuf,
}

impl ShapefilePaths {
    /// Companion paths for a shapefile given by any of its files or its base name
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let is_companion = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| ["shp", "shx", "dbf", "prj", "cpg"].contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        let base = if is_companion { path.with_extension("") } else { path.to_path_buf() };
        // Append rather than replace so dotted stems like "roads.v2" survive
        let companion = |ext: &str| {
            let mut name = base.clone().into_os_string();
            name.push(".");
            name.push(ext);
            PathBuf::from(name)
        };
        Self {
            shp: companion("shp"),
            shx: companion("shx"),
            dbf: companion("dbf"),
            prj: companion("prj"),
            cpg: companion("cpg"),
        }
    }

    /// Layer name: the file stem
    pub fn table_name(&self) -> String {
        self.shp
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Required `.shp`/`.shx`/`.dbf`, optional `.prj`/`.cpg`
    pub fn validate(&self) -> ValidationReport {
        ValidationReport::component_files(&self.shp, &["shp", "shx", "dbf"], &["prj", "cpg"])
    }

    fn require(&self) -> Result<()> {
        for path in [&self.shp, &self.shx, &self.dbf] {
            if !path.exists() {
                return Err(GeosourceError::MissingFile { path: path.clone() });
            }
        }
        Ok(())
    }
}

/// Random-access reader over a shapefile triplet
pub struct ShapefileReader {
    paths: ShapefilePaths,
    header: ShpHeader,
    index: Vec<RecordLocation>,
    shp: BufReader<File>,
    shp_len: u64,
    dbf: DbfReader,
    srid: i32,
    record_count: u32,
}

impl ShapefileReader {
    /// Open the triplet. `.shx` and `.dbf` must exist next to the `.shp`.
    pub fn open(path: impl AsRef<Path>, default_encoding: &str) -> Result<Self> {
        let paths = ShapefilePaths::new(path);
        paths.require()?;

        let shp_file = File::open(&paths.shp)?;
        let shp_len = shp_file.metadata()?.len();
        let mut shp = BufReader::new(shp_file);
        let mut header_bytes = [0u8; HEADER_LEN];
        shp.read_exact(&mut header_bytes)
            .map_err(|e| shp_error(format!("cannot read header of {}: {e}", paths.shp.display())))?;
        let header = ShpHeader::parse(&header_bytes)?;

        let (_, index) = shx::parse(&std::fs::read(&paths.shx)?)?;
        let cpg = paths.cpg.exists().then_some(paths.cpg.as_path());
        let dbf = DbfReader::open(&paths.dbf, cpg, default_encoding)?;

        let record_count = if index.len() as u64 != u64::from(dbf.record_count()) {
            tracing::warn!(
                shx_records = index.len(),
                dbf_records = dbf.record_count(),
                path = %paths.shp.display(),
                "record counts differ between .shx and .dbf"
            );
            (index.len() as u32).min(dbf.record_count())
        } else {
            dbf.record_count()
        };
        let srid = prj::read_srid(&paths.prj);

        tracing::debug!(
            path = %paths.shp.display(),
            shape_type = ?header.shape_type,
            records = record_count,
            srid,
            encoding = dbf.encoding().name(),
            "opened shapefile"
        );
        Ok(Self { paths, header, index, shp, shp_len, dbf, srid, record_count })
    }

    pub fn paths(&self) -> &ShapefilePaths {
        &self.paths
    }

    pub fn shape_type(&self) -> ShapeType {
        self.header.shape_type
    }

    /// Extent recorded in the `.shp` header
    pub fn extent(&self) -> Envelope {
        self.header.bbox
    }

    /// SRID from the `.prj`, 0 when absent or unrecognised
    pub fn srid(&self) -> i32 {
        self.srid
    }

    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    pub fn fields(&self) -> &[DbfField] {
        &self.dbf.header().fields
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.dbf.encoding()
    }

    /// Schema of the layer; feature count includes deleted records
    pub fn schema(&self, table_name: &str) -> TableSchema {
        let mut schema = TableSchema::new(table_name);
        schema.geometry_column = Some("SHAPE".to_string());
        schema.geometry_type = self.header.shape_type.geometry_type();
        schema.srid = self.srid;
        schema.columns = self.fields().iter().map(DbfField::to_column_info).collect();
        schema.feature_count = u64::from(self.record_count);
        schema.extent = self.header.bbox;
        schema
    }

    /// Geometry of a 0-based record
    pub fn read_geometry(&mut self, index: u32) -> Result<Option<Geometry>> {
        let location = *self
            .index
            .get(index as usize)
            .ok_or_else(|| GeosourceError::NotFound { what: format!("shape record {}", index + 1) })?;
        let end = location.offset.saturating_add(8).saturating_add(location.length);
        if end > self.shp_len {
            return Err(shp_error(format!(
                "record {} claims bytes {}..{end} but the .shp file is {} bytes",
                index + 1,
                location.offset,
                self.shp_len
            )));
        }
        self.shp.seek(SeekFrom::Start(location.offset))?;
        let mut record_header = [0u8; 8];
        self.shp
            .read_exact(&mut record_header)
            .map_err(|e| shp_error(format!("record {} header is truncated: {e}", index + 1)))?;
        let mut content = vec![0u8; location.length as usize];
        self.shp
            .read_exact(&mut content)
            .map_err(|e| shp_error(format!("record {} is truncated: {e}", index + 1)))?;
        shp::decode_record(&content)
    }

    /// Attributes of a 0-based record; `None` when the record is deleted
    pub fn read_attributes(&mut self, index: u32) -> Result<Option<AttributeTable>> {
        self.dbf.read_record(index)
    }

    /// Feature for a 0-based record, identified by `index + 1`; `None` when deleted
    pub fn read_feature(&mut self, index: u32) -> Result<Option<Feature>> {
        if index >= self.record_count {
            return Err(GeosourceError::NotFound { what: format!("shape record {}", index + 1) });
        }
        let Some(attributes) = self.read_attributes(index)? else {
            return Ok(None);
        };
        let geometry = self.read_geometry(index)?;
        Ok(Some(Feature { id: FeatureId::Integer(i64::from(index) + 1), geometry, attributes }))
    }

    /// Every raw DBF record, for full-table rewrites
    pub fn read_dbf_records(&mut self) -> Result<Vec<DbfRecord>> {
        self.dbf.read_all()
    }

    /// Lazy scan over live features, skipping deleted and corrupt records
    pub fn features(self) -> ShapefileFeatures {
        self.features_in(None)
    }

    /// Lazy scan that only decodes attributes for shapes whose envelope
    /// intersects `envelope`
    pub fn features_in(self, envelope: Option<Envelope>) -> ShapefileFeatures {
        ShapefileFeatures { reader: self, next: 0, envelope }
    }
}

/// Iterator returned by [`ShapefileReader::features`]
pub struct ShapefileFeatures {
    reader: ShapefileReader,
    next: u32,
    envelope: Option<Envelope>,
}

impl ShapefileFeatures {
    fn read_next(&mut self, index: u32) -> Result<Option<Feature>> {
        let geometry = self.reader.read_geometry(index)?;
        if let Some(envelope) = &self.envelope {
            match &geometry {
                Some(g) if g.envelope().intersects(envelope) => {}
                _ => return Ok(None),
            }
        }
        let Some(attributes) = self.reader.read_attributes(index)? else {
            return Ok(None);
        };
        Ok(Some(Feature { id: FeatureId::Integer(i64::from(index) + 1), geometry, attributes }))
    }
}

impl Iterator for ShapefileFeatures {
    type Item = Feature;

    fn next(&mut self) -> Option<Feature> {
        while self.next < self.reader.record_count {
            let index = self.next;
            self.next += 1;
            match self.read_next(index) {
                Ok(Some(feature)) => return Some(feature),
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(record = index + 1, error = %e, "skipping corrupt shapefile record");
                }
            }
        }
        None
    }
}

/// One record to write: geometry plus attributes
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeRecord {
    pub geometry: Option<Geometry>,
    pub attributes: AttributeTable,
    pub deleted: bool,
}

impl ShapeRecord {
    pub fn new(geometry: Option<Geometry>, attributes: AttributeTable) -> Self {
        Self { geometry, attributes, deleted: false }
    }
}

/// Writes a complete shapefile triplet plus `.cpg` and, for known SRIDs, `.prj`
#[derive(Debug, Clone)]
pub struct ShapefileWriter {
    shape_type: ShapeType,
    fields: Vec<DbfField>,
    encoding: &'static Encoding,
    srid: i32,
}

impl ShapefileWriter {
    pub fn new(shape_type: ShapeType) -> Self {
        Self { shape_type, fields: Vec::new(), encoding: encoding_rs::UTF_8, srid: 0 }
    }

    pub fn field(mut self, field: DbfField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn encoding(mut self, encoding: &'static Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn srid(mut self, srid: i32) -> Self {
        self.srid = srid;
        self
    }

    pub fn write(&self, path: impl AsRef<Path>, records: &[ShapeRecord]) -> Result<ShapefilePaths> {
        let paths = ShapefilePaths::new(path);

        let mut contents = Vec::with_capacity(records.len());
        let mut bbox = Envelope::null();
        let mut z_range = (f64::INFINITY, f64::NEG_INFINITY);
        let mut m_range = (f64::INFINITY, f64::NEG_INFINITY);
        for record in records {
            contents.push(shp::encode_record(record.geometry.as_ref(), self.shape_type)?);
            if let Some(geometry) = &record.geometry {
                bbox.expand_to_include(&geometry.envelope());
                geometry.for_each_coord(&mut |c| {
                    if let Some(z) = c.z {
                        z_range = (z_range.0.min(z), z_range.1.max(z));
                    }
                    if let Some(m) = c.m {
                        m_range = (m_range.0.min(m), m_range.1.max(m));
                    }
                });
            }
        }
        let finite = |r: (f64, f64)| if r.0 <= r.1 { r } else { (0.0, 0.0) };

        let mut locations = Vec::with_capacity(contents.len());
        let mut offset = HEADER_LEN as u64;
        for content in &contents {
            locations.push(RecordLocation { offset, length: content.len() as u64 });
            offset += 8 + content.len() as u64;
        }
        let header = ShpHeader {
            file_length: offset,
            shape_type: self.shape_type,
            bbox,
            z_range: finite(z_range),
            m_range: finite(m_range),
        };

        let mut shp_bytes = Vec::with_capacity(offset as usize);
        header.write(&mut shp_bytes);
        for (number, content) in contents.iter().enumerate() {
            shp_bytes.extend_from_slice(&(number as i32 + 1).to_be_bytes());
            shp_bytes.extend_from_slice(&((content.len() / 2) as i32).to_be_bytes());
            shp_bytes.extend_from_slice(content);
        }
        std::fs::write(&paths.shp, shp_bytes)?;
        std::fs::write(&paths.shx, shx::write(&header, &locations))?;

        let dbf_records: Vec<DbfRecord> = records
            .iter()
            .map(|r| DbfRecord { deleted: r.deleted, attributes: r.attributes.clone() })
            .collect();
        std::fs::write(&paths.dbf, dbf::encode_file(self.fields.clone(), &dbf_records, self.encoding)?)?;
        std::fs::write(&paths.cpg, self.encoding.name())?;
        if let Some(wkt) = prj::wkt_for_srid(self.srid) {
            std::fs::write(&paths.prj, wkt)?;
        }
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Coord, Value};

    fn point_layer(dir: &Path, records: &[ShapeRecord]) -> PathBuf {
        let path = dir.join("places.shp");
        ShapefileWriter::new(ShapeType::Point)
            .field(DbfField::character("NAME", 16))
            .srid(4326)
            .write(&path, records)
            .unwrap();
        path
    }

    #[test]
    fn test_single_point_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = point_layer(
            dir.path(),
            &[ShapeRecord::new(Some(Geometry::point(100.0, 200.0)), AttributeTable::new().with("NAME", "A"))],
        );

        let reader = ShapefileReader::open(&path, encoding::DEFAULT_ENCODING).unwrap();
        assert_eq!(reader.record_count(), 1);
        assert_eq!(reader.srid(), 4326);
        assert_eq!(reader.extent(), Envelope::new(100.0, 200.0, 100.0, 200.0));

        let features: Vec<_> = reader.features().collect();
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].id, FeatureId::Integer(1));
        assert_eq!(features[0].geometry, Some(Geometry::point(100.0, 200.0)));
        assert_eq!(features[0].attribute("NAME"), Some(&Value::from("A")));
    }

    #[test]
    fn test_deleted_record_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut records: Vec<_> = (0..3)
            .map(|i| {
                ShapeRecord::new(
                    Some(Geometry::point(f64::from(i), 0.0)),
                    AttributeTable::new().with("NAME", format!("p{i}")),
                )
            })
            .collect();
        records[1].deleted = true;
        let path = point_layer(dir.path(), &records);

        let raw = std::fs::read(path.with_extension("dbf")).unwrap();
        let header = dbf::DbfHeader::parse(&raw, None).unwrap();
        assert_eq!(raw[header.record_offset(1) as usize], 0x2A);

        let mut reader = ShapefileReader::open(&path, "utf-8").unwrap();
        assert!(reader.read_feature(1).unwrap().is_none());
        let ids: Vec<_> = reader.features().map(|f| f.id).collect();
        assert_eq!(ids, vec![FeatureId::Integer(1), FeatureId::Integer(3)]);
    }

    #[test]
    fn test_envelope_prefilter() {
        let dir = tempfile::tempdir().unwrap();
        let records: Vec<_> = [(0.0, 0.0), (50.0, 50.0), (5.0, 5.0)]
            .iter()
            .map(|&(x, y)| ShapeRecord::new(Some(Geometry::point(x, y)), AttributeTable::new().with("NAME", "x")))
            .collect();
        let path = point_layer(dir.path(), &records);

        let reader = ShapefileReader::open(&path, "utf-8").unwrap();
        let hits: Vec<_> = reader.features_in(Some(Envelope::new(-1.0, -1.0, 10.0, 10.0))).map(|f| f.id).collect();
        assert_eq!(hits, vec![FeatureId::Integer(1), FeatureId::Integer(3)]);
    }

    #[test]
    fn test_polygon_z_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parcels.shp");
        let ring = vec![
            Coord::xyz(0.0, 0.0, 1.0),
            Coord::xyz(0.0, 10.0, 2.0),
            Coord::xyz(10.0, 10.0, 3.0),
            Coord::xyz(10.0, 0.0, 4.0),
            Coord::xyz(0.0, 0.0, 1.0),
        ];
        let polygon = Geometry::Polygon(vec![ring]);
        ShapefileWriter::new(ShapeType::PolygonZ)
            .field(DbfField::numeric("ID", 5, 0))
            .write(&path, &[ShapeRecord::new(Some(polygon.clone()), AttributeTable::new().with("ID", 7i64))])
            .unwrap();

        let mut reader = ShapefileReader::open(&path, "utf-8").unwrap();
        let feature = reader.read_feature(0).unwrap().unwrap();
        let geometry = feature.geometry.unwrap();
        assert_eq!(geometry.envelope(), polygon.envelope());
        let mut zs = Vec::new();
        geometry.for_each_coord(&mut |c| zs.push(c.z));
        assert!(zs.iter().all(Option::is_some));
        assert_eq!(feature.attributes.get("ID"), Some(&Value::Integer(7)));
        assert_eq!(reader.srid(), 0);
    }

    #[test]
    fn test_missing_companion_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = point_layer(dir.path(), &[]);
        std::fs::remove_file(path.with_extension("shx")).unwrap();

        let err = ShapefileReader::open(&path, "utf-8").err().unwrap();
        assert!(matches!(err, GeosourceError::MissingFile { .. }));
        assert!(!ShapefilePaths::new(&path).validate().is_valid());
    }

    #[test]
    fn test_corrupt_record_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let records: Vec<_> = (0..2)
            .map(|i| {
                ShapeRecord::new(Some(Geometry::point(f64::from(i), 1.0)), AttributeTable::new().with("NAME", "n"))
            })
            .collect();
        let path = point_layer(dir.path(), &records);

        // Overwrite the first record's shape type with an unknown code
        let mut shp_bytes = std::fs::read(&path).unwrap();
        shp_bytes[HEADER_LEN + 8..HEADER_LEN + 12].copy_from_slice(&77i32.to_le_bytes());
        std::fs::write(&path, shp_bytes).unwrap();

        let reader = ShapefileReader::open(&path, "utf-8").unwrap();
        let ids: Vec<_> = reader.features().map(|f| f.id).collect();
        assert_eq!(ids, vec![FeatureId::Integer(2)]);
    }

    #[test]
    fn test_oversized_index_entry_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let records: Vec<_> = (0..2)
            .map(|i| {
                ShapeRecord::new(Some(Geometry::point(f64::from(i), 1.0)), AttributeTable::new().with("NAME", "n"))
            })
            .collect();
        let path = point_layer(dir.path(), &records);

        // First .shx entry claims a content length of about 4 GB
        let shx_path = path.with_extension("shx");
        let mut shx_bytes = std::fs::read(&shx_path).unwrap();
        shx_bytes[HEADER_LEN + 4..HEADER_LEN + 8].copy_from_slice(&i32::MAX.to_be_bytes());
        std::fs::write(&shx_path, shx_bytes).unwrap();

        let mut reader = ShapefileReader::open(&path, "utf-8").unwrap();
        assert!(reader.read_geometry(0).unwrap_err().is_format_error());
        assert!(reader.read_geometry(1).unwrap().is_some());
        let ids: Vec<_> = reader.features().map(|f| f.id).collect();
        assert_eq!(ids, vec![FeatureId::Integer(2)]);
    }

    #[test]
    fn test_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = point_layer(dir.path(), &[]);
        let reader = ShapefileReader::open(&path, "utf-8").unwrap();
        let schema = reader.schema("places");
        assert_eq!(schema.srid, 4326);
        assert_eq!(schema.geometry_type, Some(crate::models::GeometryType::Point));
        assert_eq!(schema.columns.len(), 1);
        assert_eq!(schema.columns[0].max_length, Some(16));
        assert_eq!(reader.paths().table_name(), "places");
    }
}
