//! Shapefile triplet adapter
//!
//! Reads scan the `.shp` sequentially on the blocking pool, decoding
//! attributes only for shapes whose envelope passes the search box.
//! Writes are limited to the `.dbf`: deletion flags are set in place and
//! attribute or field changes rewrite the table and swap it in atomically.

use async_trait::async_trait;
use geosource_core::config::FileSourceConfig;
use geosource_core::error::{GeosourceError, Result};
use geosource_core::formats::shapefile::dbf::{self, DbfField, DbfReader, DELETED};
use geosource_core::formats::shapefile::encoding::DEFAULT_ENCODING;
use geosource_core::formats::shapefile::{ShapefilePaths, ShapefileReader};
use geosource_core::models::{ColumnInfo, Envelope, Feature, FeatureId, QueryFilter, TableSchema};
use geosource_core::report::ValidationReport;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;

use crate::residual::{without_paging, Residual};
use crate::source::{DataSource, FeatureStream, SourceCore, SourceState};
use crate::stream::{self, run_blocking, spawn_blocking_scan, DEFAULT_BUFFER};

/// One shapefile exposed as a single-table source named after its file stem
#[derive(Debug)]
pub struct ShapefileSource {
    core: SourceCore,
    paths: ShapefilePaths,
    table: String,
    default_encoding: String,
    buffer: usize,
    /// Serializes DBF rewrites and flag updates
    write_lock: Arc<Mutex<()>>,
}

impl ShapefileSource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let paths = ShapefilePaths::new(path.into());
        let table = paths.table_name();
        Self {
            core: SourceCore::new(name, "shapefile", false),
            paths,
            table,
            default_encoding: DEFAULT_ENCODING.to_string(),
            buffer: DEFAULT_BUFFER,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &FileSourceConfig) -> Result<Self> {
        config.validate()?;
        let mut source = Self::new(name, config.path.clone()).read_only(config.read_only);
        if let Some(label) = &config.encoding {
            source = source.encoding(label.clone());
        }
        Ok(source)
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.core = SourceCore::new(self.core.name().to_string(), "shapefile", read_only);
        self
    }

    /// Encoding used when neither a `.cpg` nor the language driver byte names one
    pub fn encoding(mut self, label: impl Into<String>) -> Self {
        self.default_encoding = label.into();
        self
    }

    pub fn stream_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn paths(&self) -> &ShapefilePaths {
        &self.paths
    }

    fn check_table(&self, table: &str) -> Result<()> {
        if table.eq_ignore_ascii_case(&self.table) {
            Ok(())
        } else {
            Err(GeosourceError::TableNotFound { table: table.to_string() })
        }
    }

    fn open_reader(&self) -> impl FnOnce() -> Result<ShapefileReader> + Send + 'static {
        let shp = self.paths.shp.clone();
        let encoding = self.default_encoding.clone();
        move || ShapefileReader::open(&shp, &encoding)
    }

    fn cpg(&self) -> Option<PathBuf> {
        self.paths.cpg.exists().then(|| self.paths.cpg.clone())
    }

    /// 0-based record index for a feature id, if it can name a record at all
    fn record_index(id: &FeatureId) -> Option<u32> {
        id.as_i64().filter(|n| *n >= 1).and_then(|n| u32::try_from(n - 1).ok())
    }

    async fn live_record_count(&self) -> Result<u64> {
        let open = self.open_reader();
        run_blocking(move || {
            let mut reader = open()?;
            Ok(reader.read_dbf_records()?.iter().filter(|r| !r.deleted).count() as u64)
        })
        .await
    }

    /// Rewrite the DBF after `edit` changes its fields and records
    async fn rewrite_dbf<F>(&self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<DbfField>, &mut Vec<dbf::DbfRecord>) -> Result<()> + Send + 'static,
    {
        let open = self.open_reader();
        let path = self.paths.dbf.clone();
        let lock = Arc::clone(&self.write_lock);
        run_blocking(move || {
            let _guard = lock.lock();
            let mut reader = open()?;
            let mut fields = reader.fields().to_vec();
            let encoding = reader.encoding();
            let mut records = reader.read_dbf_records()?;
            drop(reader);
            edit(&mut fields, &mut records)?;
            dbf::rewrite(&path, fields, &records, encoding)
        })
        .await
        .map_err(|e| self.core.record_error(e))
    }
}

#[async_trait]
impl DataSource for ShapefileSource {
    fn backend(&self) -> &'static str {
        self.core.backend()
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn state(&self) -> SourceState {
        self.core.state()
    }

    fn is_read_only(&self) -> bool {
        self.core.is_read_only()
    }

    fn last_error(&self) -> Option<String> {
        self.core.last_error()
    }

    async fn open(&self) -> bool {
        let open = self.open_reader();
        let table = self.table.clone();
        self.core
            .open_with(|| async move {
                let schema = run_blocking(move || Ok(open()?.schema(&table))).await?;
                self.core.cache_schema(schema);
                Ok(())
            })
            .await
    }

    async fn close(&self) {
        self.core.close();
    }

    async fn table_names(&self) -> Result<Vec<String>> {
        self.core.ensure_open()?;
        Ok(vec![self.table.clone()])
    }

    async fn schema(&self, table: &str) -> Result<TableSchema> {
        self.check_table(table)?;
        let open = self.open_reader();
        let name = self.table.clone();
        self.core
            .schema_or_load(table, || async move { run_blocking(move || Ok(open()?.schema(&name))).await })
            .await
    }

    async fn feature_count(&self, table: &str, filter: Option<&QueryFilter>) -> Result<u64> {
        self.check_table(table)?;
        self.core.ensure_open()?;
        match filter {
            Some(filter) if filter.spatial.is_some() || filter.attribute.is_some() || filter.distinct => {
                let scan = self.query_features(table, Some(&without_paging(filter))).await?;
                Ok(stream::count(scan).await)
            }
            _ => self.live_record_count().await.map_err(|e| self.core.record_error(e)),
        }
    }

    async fn extent(&self, table: &str) -> Result<Envelope> {
        Ok(self.schema(table).await?.extent)
    }

    async fn query_features(&self, table: &str, filter: Option<&QueryFilter>) -> Result<FeatureStream> {
        let schema = self.schema(table).await?;
        let filter = filter.cloned().unwrap_or_default();
        let residual = Residual::in_process(&filter, &schema)?;
        let envelope = filter.spatial.as_ref().and_then(|s| s.search_envelope(schema.is_geographic()));

        tracing::debug!(source = %self.core.name(), table, ?envelope, "scanning shapefile");
        let open = self.open_reader();
        let scan = spawn_blocking_scan(self.buffer, self.core.error_slot(), move |sink| {
            for feature in open()?.features_in(envelope) {
                if !sink.send(feature) {
                    break;
                }
            }
            Ok(())
        });
        Ok(residual.apply(scan))
    }

    async fn get_feature(&self, table: &str, id: &FeatureId) -> Result<Option<Feature>> {
        self.check_table(table)?;
        self.core.ensure_open()?;
        let Some(index) = Self::record_index(id) else {
            return Ok(None);
        };
        let open = self.open_reader();
        run_blocking(move || {
            let mut reader = open()?;
            if index >= reader.record_count() {
                return Ok(None);
            }
            reader.read_feature(index)
        })
        .await
        .map_err(|e| self.core.record_error(e))
    }

    /// Attribute-only update; the stored geometry cannot change
    async fn update_feature(&self, table: &str, feature: &Feature) -> Result<()> {
        self.core.ensure_writable(table)?;
        self.check_table(table)?;
        let index = Self::record_index(&feature.id)
            .ok_or_else(|| GeosourceError::NotFound { what: format!("feature {}", feature.id) })?;

        if let Some(geometry) = &feature.geometry {
            let current = self.get_feature(table, &feature.id).await?;
            if current.and_then(|f| f.geometry).as_ref() != Some(geometry) {
                return Err(GeosourceError::unsupported("update geometry", "shapefile"));
            }
        }

        let id = feature.id.clone();
        let table_name = self.table.clone();
        let attributes = feature.attributes.clone();
        self.rewrite_dbf(move |fields, records| {
            let record = records
                .get_mut(index as usize)
                .filter(|r| !r.deleted)
                .ok_or_else(|| GeosourceError::NotFound { what: format!("feature {id}") })?;
            for (name, value) in attributes.iter() {
                if !fields.iter().any(|f| f.name.eq_ignore_ascii_case(name)) {
                    return Err(GeosourceError::ColumnNotFound {
                        table: table_name.clone(),
                        column: name.to_string(),
                    });
                }
                record.attributes.set(name, value.clone());
            }
            Ok(())
        })
        .await?;
        tracing::debug!(source = %self.core.name(), id = %feature.id, "updated shapefile record");
        Ok(())
    }

    async fn delete_feature(&self, table: &str, id: &FeatureId) -> Result<bool> {
        self.core.ensure_writable(table)?;
        self.check_table(table)?;
        let Some(index) = Self::record_index(id) else {
            return Ok(false);
        };
        let path = self.paths.dbf.clone();
        let cpg = self.cpg();
        let encoding = self.default_encoding.clone();
        let lock = Arc::clone(&self.write_lock);
        let deleted = run_blocking(move || {
            let _guard = lock.lock();
            let mut reader = DbfReader::open(&path, cpg.as_deref(), &encoding)?;
            if index >= reader.record_count() || reader.read_raw(index)?[0] == DELETED {
                return Ok(false);
            }
            let header = reader.header().clone();
            drop(reader);
            dbf::mark_deleted(&path, &header, index)?;
            Ok(true)
        })
        .await
        .map_err(|e| self.core.record_error(e))?;
        if deleted {
            tracing::debug!(source = %self.core.name(), %id, "flagged shapefile record deleted");
        }
        Ok(deleted)
    }

    async fn add_field(&self, table: &str, column: &ColumnInfo) -> Result<()> {
        self.core.ensure_writable(table)?;
        self.check_table(table)?;
        let field = DbfField::from_column(column)?;
        self.rewrite_dbf(move |fields, _| {
            if fields.iter().any(|f| f.name.eq_ignore_ascii_case(&field.name)) {
                return Err(GeosourceError::InvalidIdentifier {
                    identifier: field.name.clone(),
                    reason: "field already exists".to_string(),
                });
            }
            fields.push(field);
            Ok(())
        })
        .await?;
        self.core.invalidate_schema(table);
        Ok(())
    }

    async fn remove_field(&self, table: &str, name: &str) -> Result<()> {
        self.core.ensure_writable(table)?;
        self.check_table(table)?;
        let name = name.to_string();
        let table_name = self.table.clone();
        self.rewrite_dbf(move |fields, records| {
            let position = fields
                .iter()
                .position(|f| f.name.eq_ignore_ascii_case(&name))
                .ok_or_else(|| GeosourceError::ColumnNotFound { table: table_name, column: name.clone() })?;
            let removed = fields.remove(position);
            for record in records.iter_mut() {
                record.attributes.remove(&removed.name);
            }
            Ok(())
        })
        .await?;
        self.core.invalidate_schema(table);
        Ok(())
    }

    async fn validate(&self) -> ValidationReport {
        let mut report = self.paths.validate();
        if !report.is_valid() {
            return report;
        }
        if !self.open().await {
            report.error(self.last_error().unwrap_or_else(|| "Failed to open shapefile".to_string()));
            return report;
        }
        match self.schema(&self.table).await {
            Ok(mut schema) => {
                if let Ok(live) = self.live_record_count().await {
                    schema.feature_count = live;
                }
                report.merge(crate::source::schema_warnings(&schema));
            }
            Err(e) => report.error(format!("Failed to read schema of {}: {e}", self.table)),
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use geosource_core::formats::shapefile::dbf::DbfField;
    use geosource_core::formats::shapefile::shp::ShapeType;
    use geosource_core::formats::shapefile::{ShapeRecord, ShapefileWriter};
    use geosource_core::models::{AttributeFilter, AttributeTable, FieldType, Geometry, Value};
    use std::path::Path;

    fn write_points(dir: &Path, names: &[&str]) -> PathBuf {
        let path = dir.join("places.shp");
        let records: Vec<_> = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let x = 100.0 + i as f64;
                ShapeRecord::new(Some(Geometry::point(x, 200.0)), AttributeTable::new().with("NAME", *name))
            })
            .collect();
        ShapefileWriter::new(ShapeType::Point)
            .field(DbfField::character("NAME", 20))
            .write(&path, &records)
            .unwrap();
        path
    }

    async fn opened(path: &Path, read_only: bool) -> ShapefileSource {
        let source = ShapefileSource::new("test", path).read_only(read_only).encoding("UTF-8");
        assert!(source.open().await, "{:?}", source.last_error());
        source
    }

    #[tokio::test]
    async fn test_single_point_layer() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_points(dir.path(), &["A"]);
        let source = opened(&path, false).await;

        assert_eq!(source.table_names().await.unwrap(), vec!["places".to_string()]);
        let features: Vec<_> = source.query_features("places", None).await.unwrap().collect().await;
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].geometry, Some(Geometry::point(100.0, 200.0)));
        assert_eq!(features[0].attribute("NAME"), Some(&Value::from("A")));
        assert_eq!(features[0].id, FeatureId::Integer(1));
    }

    #[tokio::test]
    async fn test_deleted_record_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_points(dir.path(), &["A", "B", "C"]);
        let source = opened(&path, false).await;

        assert!(source.delete_feature("places", &FeatureId::Integer(2)).await.unwrap());
        assert!(!source.delete_feature("places", &FeatureId::Integer(2)).await.unwrap());

        let raw = std::fs::read(&source.paths().dbf).unwrap();
        let header = dbf::DbfHeader::parse(&raw, None).unwrap();
        assert_eq!(raw[header.record_offset(1) as usize], 0x2A);

        let features: Vec<_> = source.query_features("places", None).await.unwrap().collect().await;
        let names: Vec<_> = features.iter().filter_map(|f| f.attribute("NAME").cloned()).collect();
        assert_eq!(names, vec![Value::from("A"), Value::from("C")]);
        assert_eq!(source.feature_count("places", None).await.unwrap(), 2);
        assert!(source.get_feature("places", &FeatureId::Integer(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_only_leaves_files_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_points(dir.path(), &["A", "B"]);
        let before = std::fs::read(dir.path().join("places.dbf")).unwrap();
        let source = opened(&path, true).await;

        let delete = source.delete_feature("places", &FeatureId::Integer(1)).await;
        assert!(matches!(delete, Err(GeosourceError::ReadOnly { .. })));
        let feature = Feature::new(1i64, None).with_attribute("NAME", "Z");
        let update = source.update_feature("places", &feature).await;
        assert!(matches!(update, Err(GeosourceError::ReadOnly { .. })));
        let insert = source.insert_feature("places", &feature).await;
        assert!(matches!(insert, Err(GeosourceError::ReadOnly { .. })));

        assert_eq!(std::fs::read(dir.path().join("places.dbf")).unwrap(), before);
    }

    #[tokio::test]
    async fn test_bbox_and_predicate() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_points(dir.path(), &["A", "B", "C", "D"]);
        let source = opened(&path, false).await;

        let filter = QueryFilter::new()
            .bbox(&Envelope::new(100.5, 199.0, 103.5, 201.0))
            .attribute(AttributeFilter::new("NAME <> :skip").param("skip", "C"));
        let features: Vec<_> = source.query_features("places", Some(&filter)).await.unwrap().collect().await;
        let ids: Vec<_> = features.iter().map(|f| f.id.clone()).collect();
        assert_eq!(ids, vec![FeatureId::Integer(2), FeatureId::Integer(4)]);
        assert_eq!(source.feature_count("places", Some(&filter)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_attribute_update_and_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_points(dir.path(), &["A", "B"]);
        let source = opened(&path, false).await;

        source
            .add_field("places", &ColumnInfo::new("POP", FieldType::Integer))
            .await
            .unwrap();
        assert!(source.schema("places").await.unwrap().has_column("POP"));

        let update = Feature::new(2i64, None).with_attribute("NAME", "Bee").with_attribute("POP", 42i64);
        source.update_feature("places", &update).await.unwrap();
        let feature = source.get_feature("places", &FeatureId::Integer(2)).await.unwrap().unwrap();
        assert_eq!(feature.attribute("NAME"), Some(&Value::from("Bee")));
        assert_eq!(feature.attribute("POP").and_then(Value::as_i64), Some(42));
        assert_eq!(feature.geometry, Some(Geometry::point(101.0, 200.0)));

        let moved = Feature::new(2i64, Some(Geometry::point(0.0, 0.0)));
        assert!(source.update_feature("places", &moved).await.unwrap_err().is_unsupported());

        source.remove_field("places", "POP").await.unwrap();
        assert!(!source.schema("places").await.unwrap().has_column("POP"));
        assert!(source.remove_field("places", "POP").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_missing_companion_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_points(dir.path(), &["A"]);
        std::fs::remove_file(dir.path().join("places.shx")).unwrap();

        let source = ShapefileSource::new("broken", &path);
        assert!(!source.open().await);
        assert!(source.last_error().unwrap().contains("places.shx"));
        let report = source.validate().await;
        assert!(!report.is_valid());
    }
}
