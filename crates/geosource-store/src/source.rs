//! The data source contract and the state shared by every adapter

use async_trait::async_trait;
use futures::stream::BoxStream;
use geosource_core::error::{GeosourceError, Result};
use geosource_core::models::{ColumnInfo, Envelope, Feature, FeatureId, QueryFilter, TableSchema};
use geosource_core::report::{ValidationReport, ValidationWarning};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Lazy, finite sequence of features. Dropping it stops the producer.
pub type FeatureStream = BoxStream<'static, Feature>;

/// Outcome of a batch write: no all-or-nothing semantics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchResult {
    pub fn record<T>(&mut self, outcome: &Result<T>) {
        match outcome {
            Ok(_) => self.succeeded += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SourceState {
    Closed,
    Opening,
    Open,
}

/// Port for reading (and selectively writing) features from one backend
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Backend tag, e.g. "shapefile" or "postgis"
    fn backend(&self) -> &'static str;

    /// Name given to this source
    fn name(&self) -> &str;

    fn state(&self) -> SourceState;

    fn is_open(&self) -> bool {
        self.state() == SourceState::Open
    }

    fn is_read_only(&self) -> bool;

    /// Text of the most recent failure
    fn last_error(&self) -> Option<String>;

    /// Open the source. Failures are reported as `false`, with the reason
    /// available from [`DataSource::last_error`]. Opening an open source is a no-op.
    async fn open(&self) -> bool;

    /// Close the source; idempotent
    async fn close(&self);

    async fn table_names(&self) -> Result<Vec<String>>;

    async fn schema(&self, table: &str) -> Result<TableSchema>;

    async fn feature_count(&self, table: &str, filter: Option<&QueryFilter>) -> Result<u64>;

    async fn extent(&self, table: &str) -> Result<Envelope>;

    /// Start a new scan; each call issues a fresh query
    async fn query_features(&self, table: &str, filter: Option<&QueryFilter>) -> Result<FeatureStream>;

    async fn get_feature(&self, table: &str, id: &FeatureId) -> Result<Option<Feature>>;

    async fn insert_feature(&self, _table: &str, _feature: &Feature) -> Result<FeatureId> {
        Err(self.write_refusal("insert_feature"))
    }

    /// Replace the attributes (and geometry, where supported) of an existing feature
    async fn update_feature(&self, _table: &str, _feature: &Feature) -> Result<()> {
        Err(self.write_refusal("update_feature"))
    }

    /// Returns false when no feature has this id
    async fn delete_feature(&self, _table: &str, _id: &FeatureId) -> Result<bool> {
        Err(self.write_refusal("delete_feature"))
    }

    async fn insert_features(&self, table: &str, features: &[Feature]) -> BatchResult {
        let mut result = BatchResult::default();
        for feature in features {
            let outcome = self.insert_feature(table, feature).await;
            if let Err(e) = &outcome {
                tracing::warn!(table, id = %feature.id, error = %e, "insert failed");
            }
            result.record(&outcome);
        }
        result
    }

    async fn update_features(&self, table: &str, features: &[Feature]) -> BatchResult {
        let mut result = BatchResult::default();
        for feature in features {
            let outcome = self.update_feature(table, feature).await;
            if let Err(e) = &outcome {
                tracing::warn!(table, id = %feature.id, error = %e, "update failed");
            }
            result.record(&outcome);
        }
        result
    }

    async fn delete_features(&self, table: &str, ids: &[FeatureId]) -> BatchResult {
        let mut result = BatchResult::default();
        for id in ids {
            match self.delete_feature(table, id).await {
                Ok(true) => result.succeeded += 1,
                Ok(false) => result.failed += 1,
                Err(e) => {
                    tracing::warn!(table, %id, error = %e, "delete failed");
                    result.failed += 1;
                }
            }
        }
        result
    }

    /// Add an attribute column; a structural change that invalidates cached schemas
    async fn add_field(&self, _table: &str, _column: &ColumnInfo) -> Result<()> {
        Err(self.write_refusal("add_field"))
    }

    async fn remove_field(&self, _table: &str, _name: &str) -> Result<()> {
        Err(self.write_refusal("remove_field"))
    }

    /// Open the source, enumerate tables and collect schema warnings without failing
    async fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::new();
        if !self.open().await {
            report.error(
                self.last_error().unwrap_or_else(|| format!("Failed to open {}", self.name())),
            );
            return report;
        }
        let tables = match self.table_names().await {
            Ok(tables) => tables,
            Err(e) => {
                report.error(format!("Failed to list tables: {e}"));
                return report;
            }
        };
        for table in tables {
            match self.schema(&table).await {
                Ok(schema) => report.merge(schema_warnings(&schema)),
                Err(e) => report.error(format!("Failed to read schema of {table}: {e}")),
            }
        }
        report
    }

    /// Error for a write this source does not perform
    fn write_refusal(&self, operation: &str) -> GeosourceError {
        if self.is_read_only() {
            GeosourceError::ReadOnly { source_name: self.name().to_string() }
        } else {
            GeosourceError::unsupported(operation, self.backend())
        }
    }
}

/// Non-fatal findings for one table schema
pub fn schema_warnings(schema: &TableSchema) -> ValidationReport {
    let mut report = ValidationReport::new();
    let table = schema.table_name.clone();
    if schema.geometry_column.is_none() {
        report.warn(ValidationWarning::MissingGeometryColumn { table: table.clone() });
    }
    if schema.srid <= 0 {
        report.warn(ValidationWarning::InvalidSrid { table: table.clone(), srid: schema.srid });
    }
    if schema.feature_count == 0 {
        report.warn(ValidationWarning::EmptyTable { table });
    }
    report
}

/// Reject table names that could break out of a dynamically built statement
pub fn validate_table_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| GeosourceError::InvalidIdentifier {
        identifier: name.to_string(),
        reason: reason.to_string(),
    };
    if name.trim().is_empty() {
        return Err(invalid("table name is empty"));
    }
    for sequence in [";", "--", "/*", "*/", "\0"] {
        if name.contains(sequence) {
            return Err(invalid("contains a statement terminator or comment sequence"));
        }
    }
    Ok(())
}

/// Shared error slot; producers running on other tasks write into it
pub type ErrorSlot = Arc<RwLock<Option<String>>>;

/// Lifecycle, error capture and schema cache shared by every adapter
#[derive(Debug)]
pub struct SourceCore {
    name: String,
    backend: &'static str,
    read_only: bool,
    state: RwLock<SourceState>,
    last_error: ErrorSlot,
    schemas: RwLock<HashMap<String, TableSchema>>,
}

impl SourceCore {
    pub fn new(name: impl Into<String>, backend: &'static str, read_only: bool) -> Self {
        Self {
            name: name.into(),
            backend,
            read_only,
            state: RwLock::new(SourceState::Closed),
            last_error: Arc::new(RwLock::new(None)),
            schemas: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn state(&self) -> SourceState {
        *self.state.read()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn error_slot(&self) -> ErrorSlot {
        Arc::clone(&self.last_error)
    }

    /// Remember a failure and hand the error back
    pub fn record_error(&self, error: GeosourceError) -> GeosourceError {
        *self.last_error.write() = Some(error.to_string());
        error
    }

    /// Run the Closed -> Opening -> Open transition around `connect`
    pub async fn open_with<F, Fut>(&self, connect: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        {
            let mut state = self.state.write();
            match *state {
                SourceState::Open => return true,
                SourceState::Opening => {
                    tracing::debug!(source = %self.name, "open already in progress");
                    return false;
                }
                SourceState::Closed => *state = SourceState::Opening,
            }
        }
        match connect().await {
            Ok(()) => {
                *self.state.write() = SourceState::Open;
                *self.last_error.write() = None;
                tracing::info!(source = %self.name, backend = self.backend, "opened data source");
                true
            }
            Err(e) => {
                *self.state.write() = SourceState::Closed;
                tracing::warn!(source = %self.name, backend = self.backend, error = %e, "failed to open data source");
                *self.last_error.write() = Some(e.to_string());
                false
            }
        }
    }

    /// Mark the source closed and drop cached schemas
    pub fn close(&self) {
        let mut state = self.state.write();
        if *state != SourceState::Closed {
            *state = SourceState::Closed;
            tracing::info!(source = %self.name, backend = self.backend, "closed data source");
        }
        self.schemas.write().clear();
    }

    pub fn ensure_open(&self) -> Result<()> {
        if self.state() == SourceState::Open {
            Ok(())
        } else {
            Err(GeosourceError::NotOpen)
        }
    }

    /// Check the source is open, writable, and the table name is safe
    pub fn ensure_writable(&self, table: &str) -> Result<()> {
        self.ensure_open()?;
        if self.read_only {
            return Err(GeosourceError::ReadOnly { source_name: self.name.clone() });
        }
        validate_table_name(table)
    }

    pub fn cached_schema(&self, table: &str) -> Option<TableSchema> {
        self.schemas.read().get(&table.to_lowercase()).cloned()
    }

    pub fn cache_schema(&self, schema: TableSchema) -> TableSchema {
        self.schemas.write().insert(schema.table_name.to_lowercase(), schema.clone());
        schema
    }

    /// Drop the cached schema of one table after a structural change
    pub fn invalidate_schema(&self, table: &str) {
        if self.schemas.write().remove(&table.to_lowercase()).is_some() {
            tracing::debug!(source = %self.name, table, "schema cache invalidated");
        }
    }

    /// Cached schema, or the result of `load` stored in the cache
    pub async fn schema_or_load<F, Fut>(&self, table: &str, load: F) -> Result<TableSchema>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TableSchema>>,
    {
        self.ensure_open()?;
        validate_table_name(table)?;
        if let Some(schema) = self.cached_schema(table) {
            return Ok(schema);
        }
        let schema = load().await.map_err(|e| self.record_error(e))?;
        Ok(self.cache_schema(schema))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_validation() {
        assert!(validate_table_name("roads").is_ok());
        assert!(validate_table_name("public.roads").is_ok());
        assert!(validate_table_name("roads; DROP TABLE x").is_err());
        assert!(validate_table_name("roads--").is_err());
        assert!(validate_table_name("roads/* c */").is_err());
        assert!(validate_table_name("  ").is_err());
    }

    #[tokio::test]
    async fn test_state_machine() {
        let core = SourceCore::new("test", "memory", false);
        assert_eq!(core.state(), SourceState::Closed);
        assert!(core.ensure_open().is_err());

        let failed = core
            .open_with(|| async { Err(GeosourceError::Connection { message: "refused".into() }) })
            .await;
        assert!(!failed);
        assert_eq!(core.state(), SourceState::Closed);
        assert!(core.last_error().unwrap().contains("refused"));

        assert!(core.open_with(|| async { Ok(()) }).await);
        assert_eq!(core.state(), SourceState::Open);
        assert!(core.last_error().is_none());

        // Open again is a no-op; a reconnect would fail here
        assert!(core.open_with(|| async { Err(GeosourceError::NotOpen) }).await);

        core.close();
        core.close();
        assert_eq!(core.state(), SourceState::Closed);
    }

    #[tokio::test]
    async fn test_schema_cache() {
        let core = SourceCore::new("test", "memory", false);
        assert!(core.open_with(|| async { Ok(()) }).await);

        let schema = core.schema_or_load("Roads", || async { Ok(TableSchema::new("Roads")) }).await.unwrap();
        assert_eq!(schema.table_name, "Roads");
        assert!(core.cached_schema("roads").is_some());

        core.invalidate_schema("ROADS");
        assert!(core.cached_schema("roads").is_none());
    }

    #[test]
    fn test_read_only() {
        let core = SourceCore::new("archive", "shapefile", true);
        *core.state.write() = SourceState::Open;
        assert!(matches!(core.ensure_writable("t"), Err(GeosourceError::ReadOnly { .. })));
    }

    #[test]
    fn test_schema_warnings() {
        let schema = TableSchema::new("empty");
        let report = schema_warnings(&schema);
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 3);
    }
}
