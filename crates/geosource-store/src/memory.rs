//! In-memory data source for tests, caches and scratch layers

use async_trait::async_trait;
use geosource_core::error::{GeosourceError, Result};
use geosource_core::models::{
    ColumnInfo, Envelope, Feature, FeatureId, QueryFilter, TableSchema, Value,
};
use geosource_geo::{hit_test, IndexStats, SpatialIndex};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::residual::{without_paging, Residual};
use crate::source::{validate_table_name, DataSource, FeatureStream, SourceCore, SourceState};
use crate::stream;

#[derive(Debug)]
struct MemoryTable {
    schema: TableSchema,
    features: BTreeMap<FeatureId, Feature>,
    index: SpatialIndex<FeatureId>,
    next_id: i64,
}

impl MemoryTable {
    fn new(schema: TableSchema) -> Self {
        Self { schema, features: BTreeMap::new(), index: SpatialIndex::new(), next_id: 1 }
    }

    /// Geometry validity always; attribute names only when columns are declared
    fn check_feature(&self, feature: &Feature) -> Result<()> {
        if let Some(geometry) = &feature.geometry {
            geometry.validate().map_err(|reason| GeosourceError::InvalidGeometry { reason })?;
        }
        if self.schema.columns.is_empty() {
            return Ok(());
        }
        for name in feature.attributes.names() {
            if !self.schema.has_column(name) {
                return Err(GeosourceError::ColumnNotFound {
                    table: self.schema.table_name.clone(),
                    column: name.to_string(),
                });
            }
        }
        Ok(())
    }

    fn put(&mut self, feature: Feature) {
        if let Some(geometry) = &feature.geometry {
            self.index.insert_geometry(geometry, feature.id.clone());
        }
        if let Some(old) = self.features.insert(feature.id.clone(), feature) {
            self.unindex(&old);
        }
    }

    fn unindex(&mut self, feature: &Feature) {
        if let Some(geometry) = &feature.geometry {
            self.index.remove(&geometry.envelope(), &feature.id);
        }
    }

    /// Candidates for an optional search envelope, in id order
    fn candidates(&self, envelope: Option<&Envelope>) -> Vec<Feature> {
        match envelope {
            Some(envelope) => {
                let mut ids: Vec<&FeatureId> = self.index.query(envelope);
                ids.sort();
                ids.into_iter().filter_map(|id| self.features.get(id).cloned()).collect()
            }
            None => self.features.values().cloned().collect(),
        }
    }

    fn snapshot_schema(&self) -> TableSchema {
        let mut schema = self.schema.clone();
        schema.feature_count = self.features.len() as u64;
        schema.extent = self.index.extent();
        schema
    }
}

/// Features held in process, indexed by an R-Tree per table
#[derive(Debug)]
pub struct MemorySource {
    core: SourceCore,
    tables: RwLock<HashMap<String, Arc<RwLock<MemoryTable>>>>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_access(name, false)
    }

    pub fn with_access(name: impl Into<String>, read_only: bool) -> Self {
        Self { core: SourceCore::new(name, "memory", read_only), tables: RwLock::new(HashMap::new()) }
    }

    /// Register a table; replaces any table with the same name
    pub fn create_table(&self, schema: TableSchema) -> Result<()> {
        validate_table_name(&schema.table_name)?;
        let key = schema.table_name.to_lowercase();
        self.tables.write().insert(key, Arc::new(RwLock::new(MemoryTable::new(schema))));
        Ok(())
    }

    pub fn drop_table(&self, table: &str) -> bool {
        self.tables.write().remove(&table.to_lowercase()).is_some()
    }

    /// Bulk load features, assigning fresh ids; returns the number loaded.
    /// A batch with any rejected feature leaves the table untouched.
    pub fn load(&self, table: &str, features: Vec<Feature>) -> Result<usize> {
        let handle = self.table(table)?;
        let mut guard = handle.write();
        features.iter().try_for_each(|feature| guard.check_feature(feature))?;
        let mut entries = Vec::with_capacity(features.len());
        let mut loaded = 0;
        for mut feature in features {
            feature.id = FeatureId::Integer(guard.next_id);
            guard.next_id += 1;
            if let Some(geometry) = &feature.geometry {
                entries.push((geometry.envelope(), feature.id.clone()));
            }
            guard.features.insert(feature.id.clone(), feature);
            loaded += 1;
        }
        if guard.index.is_empty() {
            guard.index = SpatialIndex::bulk_load(entries);
        } else {
            for (envelope, id) in entries {
                guard.index.insert(&envelope, id);
            }
        }
        Ok(loaded)
    }

    fn table(&self, table: &str) -> Result<Arc<RwLock<MemoryTable>>> {
        validate_table_name(table)?;
        self.tables
            .read()
            .get(&table.to_lowercase())
            .cloned()
            .ok_or_else(|| GeosourceError::TableNotFound { table: table.to_string() })
    }

    /// Features selected by a click: R-Tree candidates, then an exact distance test
    pub fn hit_test(&self, table: &str, x: f64, y: f64, tolerance: f64) -> Result<Vec<Feature>> {
        self.core.ensure_open()?;
        let handle = self.table(table)?;
        let guard = handle.read();
        let mut ids: Vec<&FeatureId> = guard.index.query_point(x, y, tolerance);
        ids.sort();
        Ok(ids
            .into_iter()
            .filter_map(|id| guard.features.get(id))
            .filter(|f| f.geometry.as_ref().is_some_and(|g| hit_test(g, x, y, tolerance)))
            .cloned()
            .collect())
    }

    /// Features whose geometry intersects a selection box
    pub fn features_in_box(&self, table: &str, envelope: &Envelope) -> Result<Vec<Feature>> {
        self.core.ensure_open()?;
        let handle = self.table(table)?;
        let guard = handle.read();
        let filter = geosource_core::models::SpatialFilter::envelope(envelope);
        let geographic = guard.schema.is_geographic();
        Ok(guard
            .candidates(Some(envelope))
            .into_iter()
            .filter(|f| {
                f.geometry
                    .as_ref()
                    .is_some_and(|g| geosource_geo::matches_filter(g, &filter, geographic))
            })
            .collect())
    }

    pub fn index_stats(&self, table: &str) -> Result<IndexStats> {
        Ok(self.table(table)?.read().index.stats())
    }

    fn select(&self, table: &str, filter: Option<&QueryFilter>) -> Result<(Vec<Feature>, Residual)> {
        self.core.ensure_open()?;
        let handle = self.table(table)?;
        let guard = handle.read();
        let filter = filter.cloned().unwrap_or_default();
        let residual = Residual::in_process(&filter, &guard.schema)?;
        let geographic = guard.schema.is_geographic();
        let envelope = filter.spatial.as_ref().and_then(|s| s.search_envelope(geographic));
        Ok((guard.candidates(envelope.as_ref()), residual))
    }
}

#[async_trait]
impl DataSource for MemorySource {
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
        self.core.open_with(|| async { Ok(()) }).await
    }

    async fn close(&self) {
        self.core.close();
    }

    async fn table_names(&self) -> Result<Vec<String>> {
        self.core.ensure_open()?;
        let mut names: Vec<String> =
            self.tables.read().values().map(|t| t.read().schema.table_name.clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn schema(&self, table: &str) -> Result<TableSchema> {
        self.core.ensure_open()?;
        Ok(self.table(table)?.read().snapshot_schema())
    }

    async fn feature_count(&self, table: &str, filter: Option<&QueryFilter>) -> Result<u64> {
        match filter {
            None => {
                self.core.ensure_open()?;
                Ok(self.table(table)?.read().features.len() as u64)
            }
            Some(filter) => {
                let filter = without_paging(filter);
                let (candidates, residual) = self.select(table, Some(&filter))?;
                Ok(candidates.iter().filter(|f| residual.keep(f)).count() as u64)
            }
        }
    }

    async fn extent(&self, table: &str) -> Result<Envelope> {
        self.core.ensure_open()?;
        Ok(self.table(table)?.read().index.extent())
    }

    async fn query_features(&self, table: &str, filter: Option<&QueryFilter>) -> Result<FeatureStream> {
        let (candidates, residual) = self.select(table, filter)?;
        Ok(residual.apply(stream::from_vec(candidates)))
    }

    async fn get_feature(&self, table: &str, id: &FeatureId) -> Result<Option<Feature>> {
        self.core.ensure_open()?;
        Ok(self.table(table)?.read().features.get(id).cloned())
    }

    async fn insert_feature(&self, table: &str, feature: &Feature) -> Result<FeatureId> {
        self.core.ensure_writable(table)?;
        let handle = self.table(table)?;
        let mut guard = handle.write();
        guard.check_feature(feature)?;
        let id = FeatureId::Integer(guard.next_id);
        guard.next_id += 1;
        let mut stored = feature.clone();
        stored.id = id.clone();
        guard.put(stored);
        Ok(id)
    }

    async fn update_feature(&self, table: &str, feature: &Feature) -> Result<()> {
        self.core.ensure_writable(table)?;
        let handle = self.table(table)?;
        let mut guard = handle.write();
        if !guard.features.contains_key(&feature.id) {
            return Err(GeosourceError::NotFound { what: format!("feature {} in {table}", feature.id) });
        }
        guard.check_feature(feature)?;
        guard.put(feature.clone());
        Ok(())
    }

    async fn delete_feature(&self, table: &str, id: &FeatureId) -> Result<bool> {
        self.core.ensure_writable(table)?;
        let handle = self.table(table)?;
        let mut guard = handle.write();
        match guard.features.remove(id) {
            Some(old) => {
                guard.unindex(&old);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn add_field(&self, table: &str, column: &ColumnInfo) -> Result<()> {
        self.core.ensure_writable(table)?;
        let handle = self.table(table)?;
        let mut guard = handle.write();
        if guard.schema.has_column(&column.name) {
            return Err(GeosourceError::InvalidIdentifier {
                identifier: column.name.clone(),
                reason: "column already exists".to_string(),
            });
        }
        guard.schema.columns.push(column.clone());
        for feature in guard.features.values_mut() {
            feature.attributes.set(column.name.clone(), Value::Null);
        }
        self.core.invalidate_schema(table);
        Ok(())
    }

    async fn remove_field(&self, table: &str, name: &str) -> Result<()> {
        self.core.ensure_writable(table)?;
        let handle = self.table(table)?;
        let mut guard = handle.write();
        let before = guard.schema.columns.len();
        guard.schema.columns.retain(|c| !c.name.eq_ignore_ascii_case(name));
        if guard.schema.columns.len() == before {
            return Err(GeosourceError::ColumnNotFound { table: table.to_string(), column: name.to_string() });
        }
        for feature in guard.features.values_mut() {
            feature.attributes.remove(name);
        }
        self.core.invalidate_schema(table);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use geosource_core::models::{AttributeFilter, FieldType, Geometry, SortField};

    fn schema() -> TableSchema {
        let mut schema = TableSchema::new("cities");
        schema.geometry_column = Some("geom".into());
        schema.srid = 4326;
        schema.columns = vec![
            ColumnInfo::new("name", FieldType::Text),
            ColumnInfo::new("pop", FieldType::Integer),
        ];
        schema
    }

    async fn source() -> MemorySource {
        let source = MemorySource::new("scratch");
        assert!(source.open().await);
        source.create_table(schema()).unwrap();
        let features = (0..10)
            .map(|i| {
                Feature::new(0i64, Some(Geometry::point(f64::from(i), f64::from(i))))
                    .with_attribute("name", format!("c{i}"))
                    .with_attribute("pop", i64::from(i) * 100)
            })
            .collect();
        assert_eq!(source.load("cities", features).unwrap(), 10);
        source
    }

    #[tokio::test]
    async fn test_query_with_bbox_and_predicate() {
        let source = source().await;
        let filter = QueryFilter::new()
            .bbox(&Envelope::new(2.0, 2.0, 6.0, 6.0))
            .attribute(AttributeFilter::new("pop >= :min").param("min", 400i64));
        let names: Vec<_> = source
            .query_features("cities", Some(&filter))
            .await
            .unwrap()
            .map(|f| f.attribute("name").cloned().unwrap())
            .collect()
            .await;
        assert_eq!(names, vec![Value::from("c4"), Value::from("c5"), Value::from("c6")]);
        assert_eq!(source.feature_count("cities", Some(&filter)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_paging_law() {
        let source = source().await;
        let mut seen = Vec::new();
        for page in 0..4 {
            let filter = QueryFilter::new()
                .sort_by(SortField::descending("pop"))
                .offset(page * 3)
                .limit(3);
            let ids: Vec<_> = source
                .query_features("cities", Some(&filter))
                .await
                .unwrap()
                .map(|f| f.id)
                .collect()
                .await;
            assert_eq!(ids.len(), 3.min(10 - page * 3));
            seen.extend(ids);
        }
        let expected: Vec<FeatureId> = (1..=10).rev().map(FeatureId::Integer).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_crud_and_index() {
        let source = source().await;
        let id = source
            .insert_feature("cities", &Feature::new(0i64, Some(Geometry::point(50.0, 50.0))).with_attribute("name", "far"))
            .await
            .unwrap();
        assert_eq!(id, FeatureId::Integer(11));
        assert_eq!(source.extent("cities").await.unwrap(), Envelope::new(0.0, 0.0, 50.0, 50.0));

        let mut moved = source.get_feature("cities", &id).await.unwrap().unwrap();
        moved.geometry = Some(Geometry::point(-5.0, -5.0));
        source.update_feature("cities", &moved).await.unwrap();
        assert_eq!(source.hit_test("cities", -5.0, -5.0, 0.1).unwrap().len(), 1);
        assert!(source.hit_test("cities", 50.0, 50.0, 0.1).unwrap().is_empty());

        assert!(source.delete_feature("cities", &id).await.unwrap());
        assert!(!source.delete_feature("cities", &id).await.unwrap());
        assert_eq!(source.feature_count("cities", None).await.unwrap(), 10);

        let batch = source
            .delete_features("cities", &[FeatureId::Integer(1), FeatureId::Integer(99)])
            .await;
        assert_eq!((batch.succeeded, batch.failed), (1, 1));
    }

    #[tokio::test]
    async fn test_features_in_box_and_stats() {
        let source = source().await;
        let hits = source.features_in_box("cities", &Envelope::new(-1.0, -1.0, 1.5, 1.5)).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(source.index_stats("cities").unwrap().entries, 10);
    }

    #[tokio::test]
    async fn test_schema_editing() {
        let source = source().await;
        source.add_field("cities", &ColumnInfo::new("code", FieldType::Text)).await.unwrap();
        let feature = source.get_feature("cities", &FeatureId::Integer(1)).await.unwrap().unwrap();
        assert_eq!(feature.attribute("code"), Some(&Value::Null));

        source.remove_field("cities", "POP").await.unwrap();
        let schema = source.schema("cities").await.unwrap();
        assert!(!schema.has_column("pop"));
        assert_eq!(schema.feature_count, 10);
        assert!(source.remove_field("cities", "pop").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_read_only_enforcement() {
        let source = MemorySource::with_access("archive", true);
        source.create_table(schema()).unwrap();
        source.load("cities", vec![Feature::new(0i64, None).with_attribute("name", "a")]).unwrap();
        assert!(source.open().await);

        let feature = source.get_feature("cities", &FeatureId::Integer(1)).await.unwrap().unwrap();
        let mut changed = feature.clone();
        changed.attributes.set("name", "b");
        let err = source.update_feature("cities", &changed).await.unwrap_err();
        assert!(matches!(err, GeosourceError::ReadOnly { .. }));
        assert!(source.delete_feature("cities", &feature.id).await.unwrap_err().is_unsupported());
        assert_eq!(source.get_feature("cities", &feature.id).await.unwrap(), Some(feature));
    }

    #[tokio::test]
    async fn test_rejected_batch_leaves_table_untouched() {
        let source = MemorySource::new("scratch");
        assert!(source.open().await);
        let mut places = TableSchema::new("places");
        places.columns = vec![ColumnInfo::new("name", FieldType::Text)];
        source.create_table(places).unwrap();

        let batch = vec![
            Feature::new(0i64, Some(Geometry::point(5.0, 5.0))).with_attribute("name", "kept"),
            Feature::new(0i64, Some(Geometry::point(6.0, 6.0))).with_attribute("bogus", 1i64),
        ];
        assert!(source.load("places", batch).is_err());
        assert_eq!(source.feature_count("places", None).await.unwrap(), 0);
        assert_eq!(source.index_stats("places").unwrap().entries, 0);

        let point = Feature::new(0i64, Some(Geometry::point(5.0, 5.0))).with_attribute("name", "kept");
        assert_eq!(source.load("places", vec![point]).unwrap(), 1);
        assert_eq!(source.feature_count("places", None).await.unwrap(), 1);
        assert_eq!(source.features_in_box("places", &Envelope::new(4.0, 4.0, 6.0, 6.0)).unwrap().len(), 1);
        assert_eq!(source.hit_test("places", 5.0, 5.0, 0.1).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_ring_rejected_without_columns() {
        let source = MemorySource::new("scratch");
        assert!(source.open().await);
        source.create_table(TableSchema::new("parcels")).unwrap();

        let open_ring = Geometry::polygon(vec![vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]]]);
        let err = source.insert_feature("parcels", &Feature::new(0i64, Some(open_ring))).await.unwrap_err();
        assert!(matches!(err, GeosourceError::InvalidGeometry { .. }));

        let unclosed = Geometry::polygon(vec![vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]]]);
        assert!(source.load("parcels", vec![Feature::new(0i64, Some(unclosed))]).is_err());
        assert_eq!(source.feature_count("parcels", None).await.unwrap(), 0);

        let square = Geometry::polygon(vec![vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]]);
        assert!(source.insert_feature("parcels", &Feature::new(0i64, Some(square))).await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_source() {
        let source = MemorySource::new("closed");
        source.create_table(schema()).unwrap();
        assert!(matches!(source.table_names().await, Err(GeosourceError::NotOpen)));
        let report = source.validate().await;
        assert!(report.is_valid());
        assert!(report.has_warnings());
    }
}
