//! Shared plumbing for SQLite-hosted formats.
//!
//! A [`SqliteSource`] opens a fresh connection for every operation on the
//! blocking pool, so a long scan never holds a handle another call needs.
//! Format differences (metadata tables, blob encoding, index naming) live in
//! a [`SqliteFlavor`].

use async_trait::async_trait;
use futures::StreamExt;
use geosource_core::error::{GeosourceError, Result};
use geosource_core::models::{
    ColumnInfo, Envelope, Feature, FeatureId, FieldType, Geometry, QueryFilter, SpatialFilter,
    TableSchema, Value,
};
use parking_lot::RwLock;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::predicate::parse_datetime;
use crate::sql::{self, CountPlan, SelectQuery, SpatialClause, SpatialTable, SqlDialect, SqlQuery};
use crate::source::{DataSource, FeatureStream, SourceCore, SourceState};
use crate::stream::{self, run_blocking, spawn_blocking_scan, DEFAULT_BUFFER};

pub(crate) fn db_error(error: rusqlite::Error) -> GeosourceError {
    GeosourceError::Database(error.to_string())
}

/// Table description read from format metadata
#[derive(Debug, Clone)]
pub struct SqliteTable {
    pub schema: TableSchema,
    /// An R-Tree virtual table covers the geometry column
    pub has_spatial_index: bool,
}

/// Format-specific behaviour of a SQLite-hosted source
pub trait SqliteFlavor: SqlDialect + Copy + Default + std::fmt::Debug + 'static {
    const BACKEND: &'static str;

    /// Whether features can be written without a loadable extension
    const WRITABLE: bool;

    /// Register the scalar functions spatial predicates and triggers call
    fn register_functions(conn: &Connection) -> Result<()>;

    /// Confirm the file is of this format
    fn verify(conn: &Connection) -> Result<()>;

    fn table_names(conn: &Connection) -> Result<Vec<String>>;

    fn describe(conn: &Connection, table: &str) -> Result<SqliteTable>;

    fn decode_geometry(blob: &[u8]) -> Result<Geometry>;
}

/// Open `path` and register the flavor's functions
pub fn connect<F: SqliteFlavor>(path: &Path, read_only: bool) -> Result<Connection> {
    if !path.exists() {
        return Err(GeosourceError::MissingFile { path: path.to_path_buf() });
    }
    let access = if read_only { OpenFlags::SQLITE_OPEN_READ_ONLY } else { OpenFlags::SQLITE_OPEN_READ_WRITE };
    let conn = Connection::open_with_flags(path, access | OpenFlags::SQLITE_OPEN_NO_MUTEX)
        .map_err(|e| GeosourceError::Connection { message: format!("{}: {e}", path.display()) })?;
    F::register_functions(&conn)?;
    Ok(conn)
}

/// Register `<min_x>`, `<min_y>`, `<max_x>`, `<max_y>` and an emptiness test over geometry blobs
pub fn register_envelope_functions(
    conn: &Connection,
    names: [&'static str; 4],
    is_empty: &'static str,
    envelope_of: fn(&[u8]) -> Result<Option<Envelope>>,
) -> Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;
    for (axis, name) in names.into_iter().enumerate() {
        conn.create_scalar_function(name, 1, flags, move |ctx| {
            let ValueRef::Blob(blob) = ctx.get_raw(0) else {
                return Ok(None);
            };
            Ok(envelope_of(blob).ok().flatten().map(|e| match axis {
                0 => e.min_x,
                1 => e.min_y,
                2 => e.max_x,
                _ => e.max_y,
            }))
        })
        .map_err(db_error)?;
    }
    conn.create_scalar_function(is_empty, 1, flags, move |ctx| match ctx.get_raw(0) {
        ValueRef::Blob(blob) => Ok(Some(envelope_of(blob).map(|e| e.is_none()).unwrap_or(true))),
        _ => Ok(None),
    })
    .map_err(db_error)
}

pub fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Boolean(b) => SqlValue::Integer(i64::from(*b)),
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::DateTime(dt) => SqlValue::Text(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        Value::Bytes(b) => SqlValue::Blob(b.clone()),
    }
}

/// Storage value read back into the canonical type of its column
pub fn from_sql_value(value: ValueRef<'_>, field_type: FieldType) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => match field_type {
            FieldType::Boolean => Value::Boolean(i != 0),
            FieldType::Float => Value::Float(i as f64),
            _ => Value::Integer(i),
        },
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            match field_type {
                FieldType::DateTime => parse_datetime(&text).map(Value::DateTime).unwrap_or(Value::Text(text)),
                _ => Value::Text(text),
            }
        }
        ValueRef::Blob(bytes) => Value::Bytes(bytes.to_vec()),
    }
}

/// Columns of `table` from `pragma_table_info`, plus the primary key
pub fn table_columns(conn: &Connection, table: &str) -> Result<(Vec<ColumnInfo>, Option<String>)> {
    let mut stmt = conn
        .prepare("SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid")
        .map_err(db_error)?;
    let mut rows = stmt.query([table]).map_err(db_error)?;
    let mut columns = Vec::new();
    let mut primary_key = None;
    while let Some(row) = rows.next().map_err(db_error)? {
        let name: String = row.get(0).map_err(db_error)?;
        let declared: String = row.get::<_, Option<String>>(1).map_err(db_error)?.unwrap_or_default();
        let not_null: bool = row.get(2).map_err(db_error)?;
        let pk: i64 = row.get(3).map_err(db_error)?;
        if pk == 1 {
            primary_key = Some(name.clone());
        }
        let mut column = ColumnInfo::new(name, FieldType::from_sql_type(&declared));
        if not_null {
            column = column.not_null();
        }
        columns.push(column);
    }
    if columns.is_empty() {
        return Err(GeosourceError::TableNotFound { table: table.to_string() });
    }
    Ok((columns, primary_key))
}

pub fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
        [name],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(db_error)
}

pub fn row_count(conn: &Connection, table_ref: &str) -> Result<u64> {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table_ref}"), [], |r| r.get::<_, i64>(0))
        .map(|n| n.max(0) as u64)
        .map_err(db_error)
}

/// Four optional doubles read as an envelope; any null yields `None`
pub fn envelope_from_row(row: &Row<'_>, first: usize) -> rusqlite::Result<Option<Envelope>> {
    let values: [Option<f64>; 4] =
        [row.get(first)?, row.get(first + 1)?, row.get(first + 2)?, row.get(first + 3)?];
    Ok(match values {
        [Some(x1), Some(y1), Some(x2), Some(y2)] => Some(Envelope::new(x1, y1, x2, y2)),
        _ => None,
    })
}

/// R-Tree virtual table probed by envelope
#[derive(Debug, Clone)]
pub struct RtreeProbe {
    pub table: String,
    /// Column matching the feature key
    pub id: &'static str,
    /// Names of the min x, max x, min y, max y columns
    pub bounds: [&'static str; 4],
}

/// Envelope-overlap predicate for a SQLite-hosted table: an R-Tree probe when
/// one exists, else the registered bounding functions (`[min_x, min_y, max_x, max_y]`).
/// Always a superset; the exact relationship is re-tested in-process.
pub fn envelope_predicate(
    dialect: &dyn SqlDialect,
    table: &SpatialTable<'_>,
    column: &str,
    filter: &SpatialFilter,
    params: &mut Vec<Value>,
    probe: Option<RtreeProbe>,
    functions: [&str; 4],
) -> Result<Option<SpatialClause>> {
    let Some(envelope) = filter.search_envelope(table.schema.is_geographic()) else {
        return Ok(None);
    };
    let mut bind = |v: f64| dialect.bind(params, Value::Float(v));
    let sql = match probe.filter(|_| table.has_spatial_index) {
        Some(probe) => {
            let [min_x, max_x, min_y, max_y] = probe.bounds;
            let key = table.key.clone().unwrap_or_else(|| "rowid".to_string());
            format!(
                "{key} IN (SELECT {} FROM {} WHERE {min_x} <= {} AND {max_x} >= {} AND {min_y} <= {} AND {max_y} >= {})",
                probe.id,
                dialect.quote_ident(&probe.table),
                bind(envelope.max_x),
                bind(envelope.min_x),
                bind(envelope.max_y),
                bind(envelope.min_y),
            )
        }
        None => {
            let column = dialect.quote_ident(column);
            let [min_x, min_y, max_x, max_y] = functions;
            format!(
                "{max_x}({column}) >= {} AND {min_x}({column}) <= {} AND {max_y}({column}) >= {} AND {min_y}({column}) <= {}",
                bind(envelope.min_x),
                bind(envelope.max_x),
                bind(envelope.min_y),
                bind(envelope.max_y),
            )
        }
    };
    Ok(Some(SpatialClause { sql, exact: false }))
}

/// Decode one result row; a malformed geometry skips the row
fn decode_row<F: SqliteFlavor>(row: &Row<'_>, select: &SelectQuery, ordinal: i64) -> Result<Option<Feature>> {
    let id = if select.has_key {
        let key = from_sql_value(row.get_ref(0).map_err(db_error)?, FieldType::Integer);
        FeatureId::from_value(&key).unwrap_or(FeatureId::Integer(ordinal))
    } else {
        FeatureId::Integer(ordinal)
    };
    let mut feature = Feature::new(id, None);
    let offset = select.attribute_offset();
    for (i, column) in select.columns.iter().enumerate() {
        let value = from_sql_value(row.get_ref(offset + i).map_err(db_error)?, column.field_type);
        feature.attributes.set(column.name.clone(), value);
    }
    if let Some(index) = select.geometry_index() {
        if let ValueRef::Blob(blob) = row.get_ref(index).map_err(db_error)? {
            match F::decode_geometry(blob) {
                Ok(geometry) => feature.geometry = Some(geometry),
                Err(e) => {
                    tracing::warn!(backend = F::BACKEND, id = %feature.id, error = %e, "skipping undecodable geometry");
                    return Ok(None);
                }
            }
        }
    }
    Ok(Some(feature))
}

fn params(query: &SqlQuery) -> Vec<SqlValue> {
    query.params.iter().map(to_sql_value).collect()
}

fn native_type(column: &ColumnInfo) -> Result<&'static str> {
    Ok(match column.field_type {
        FieldType::Integer => "INTEGER",
        FieldType::Float => "DOUBLE",
        FieldType::Text => "TEXT",
        FieldType::Boolean => "BOOLEAN",
        FieldType::DateTime => "DATETIME",
        FieldType::Bytes => "BLOB",
        FieldType::Geometry => {
            return Err(GeosourceError::unsupported("add a geometry column", "sqlite"));
        }
    })
}

/// Data source over one SQLite-hosted file
#[derive(Debug)]
pub struct SqliteSource<F: SqliteFlavor> {
    core: SourceCore,
    path: PathBuf,
    buffer: usize,
    indexed: RwLock<HashMap<String, bool>>,
    flavor: F,
}

impl<F: SqliteFlavor> SqliteSource<F> {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            core: SourceCore::new(name, F::BACKEND, read_only),
            path: path.into(),
            buffer: DEFAULT_BUFFER,
            indexed: RwLock::new(HashMap::new()),
            flavor: F::default(),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &geosource_core::config::FileSourceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(name, config.path.clone(), config.read_only))
    }

    pub fn stream_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `work` against a fresh connection on the blocking pool
    async fn with_connection<T, W>(&self, work: W) -> Result<T>
    where
        T: Send + 'static,
        W: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        let read_only = self.core.is_read_only();
        run_blocking(move || work(&connect::<F>(&path, read_only)?))
            .await
            .map_err(|e| self.core.record_error(e))
    }

    async fn table(&self, table: &str) -> Result<(TableSchema, bool)> {
        let schema = self.schema(table).await?;
        let indexed = self.indexed.read().get(&table.to_lowercase()).copied().unwrap_or(false);
        Ok((schema, indexed))
    }

    fn spatial_table<'a>(&self, schema: &'a TableSchema, indexed: bool) -> Result<SpatialTable<'a>> {
        let table = SpatialTable::new(&self.flavor, schema)?.with_spatial_index(indexed);
        if table.key.is_some() {
            Ok(table)
        } else {
            Ok(table.with_key(Some("rowid".to_string())))
        }
    }

    fn scan(&self, select: SelectQuery) -> FeatureStream {
        let path = self.path.clone();
        let read_only = self.core.is_read_only();
        let residual = select.residual.clone();
        let rows = spawn_blocking_scan(self.buffer, self.core.error_slot(), move |sink| {
            let conn = connect::<F>(&path, read_only)?;
            let mut stmt = conn.prepare(&select.query.sql).map_err(db_error)?;
            let mut rows = stmt.query(params_from_iter(params(&select.query))).map_err(db_error)?;
            let mut ordinal = 0;
            while let Some(row) = rows.next().map_err(db_error)? {
                ordinal += 1;
                if let Some(feature) = decode_row::<F>(row, &select, ordinal)? {
                    if !sink.send(feature) {
                        break;
                    }
                }
            }
            Ok(())
        });
        residual.apply(rows)
    }

    fn ensure_writes(&self, table: &str) -> Result<()> {
        self.core.ensure_writable(table)?;
        if F::WRITABLE {
            Ok(())
        } else {
            Err(self.write_refusal("write features"))
        }
    }

    async fn execute(&self, query: SqlQuery) -> Result<(usize, i64)> {
        self.with_connection(move |conn| {
            let changed = conn.execute(&query.sql, params_from_iter(params(&query))).map_err(db_error)?;
            Ok((changed, conn.last_insert_rowid()))
        })
        .await
    }
}

#[async_trait]
impl<F: SqliteFlavor> DataSource for SqliteSource<F> {
    fn backend(&self) -> &'static str {
        F::BACKEND
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
        let path = self.path.clone();
        let read_only = self.core.is_read_only();
        self.core
            .open_with(|| run_blocking(move || F::verify(&connect::<F>(&path, read_only)?)))
            .await
    }

    async fn close(&self) {
        self.indexed.write().clear();
        self.core.close();
    }

    async fn table_names(&self) -> Result<Vec<String>> {
        self.core.ensure_open()?;
        self.with_connection(|conn| F::table_names(conn)).await
    }

    async fn schema(&self, table: &str) -> Result<TableSchema> {
        let name = table.to_string();
        self.core
            .schema_or_load(table, || async move {
                let described = self.with_connection(move |conn| F::describe(conn, &name)).await?;
                self.indexed.write().insert(table.to_lowercase(), described.has_spatial_index);
                Ok(described.schema)
            })
            .await
    }

    async fn feature_count(&self, table: &str, filter: Option<&QueryFilter>) -> Result<u64> {
        let (schema, indexed) = self.table(table).await?;
        let plan = sql::build_count(&self.flavor, &self.spatial_table(&schema, indexed)?, filter)?;
        match plan {
            CountPlan::Native(query) => {
                self.with_connection(move |conn| {
                    conn.query_row(&query.sql, params_from_iter(params(&query)), |r| r.get::<_, i64>(0))
                        .map(|n| n.max(0) as u64)
                        .map_err(db_error)
                })
                .await
            }
            CountPlan::Scan(select) => Ok(stream::count(self.scan(select)).await),
        }
    }

    async fn extent(&self, table: &str) -> Result<Envelope> {
        Ok(self.schema(table).await?.extent)
    }

    async fn query_features(&self, table: &str, filter: Option<&QueryFilter>) -> Result<FeatureStream> {
        let (schema, indexed) = self.table(table).await?;
        let filter = filter.cloned().unwrap_or_default();
        let select = sql::build_select(&self.flavor, &self.spatial_table(&schema, indexed)?, &filter)?;
        Ok(self.scan(select))
    }

    async fn get_feature(&self, table: &str, id: &FeatureId) -> Result<Option<Feature>> {
        let (schema, indexed) = self.table(table).await?;
        let select = sql::build_get(&self.flavor, &self.spatial_table(&schema, indexed)?, id)?;
        let mut rows = self.scan(select);
        Ok(rows.next().await)
    }

    async fn insert_feature(&self, table: &str, feature: &Feature) -> Result<FeatureId> {
        self.ensure_writes(table)?;
        let (schema, indexed) = self.table(table).await?;
        let query = sql::build_insert(&self.flavor, &self.spatial_table(&schema, indexed)?, feature)?;
        let (_, rowid) = self.execute(query).await?;
        self.core.invalidate_schema(table);
        Ok(FeatureId::Integer(rowid))
    }

    async fn update_feature(&self, table: &str, feature: &Feature) -> Result<()> {
        self.ensure_writes(table)?;
        let (schema, indexed) = self.table(table).await?;
        let query = sql::build_update(&self.flavor, &self.spatial_table(&schema, indexed)?, feature)?;
        let (changed, _) = self.execute(query).await?;
        self.core.invalidate_schema(table);
        if changed == 0 {
            return Err(GeosourceError::NotFound { what: format!("feature {}", feature.id) });
        }
        Ok(())
    }

    async fn delete_feature(&self, table: &str, id: &FeatureId) -> Result<bool> {
        self.ensure_writes(table)?;
        let (schema, indexed) = self.table(table).await?;
        let query = sql::build_delete(&self.flavor, &self.spatial_table(&schema, indexed)?, id)?;
        let (changed, _) = self.execute(query).await?;
        self.core.invalidate_schema(table);
        Ok(changed > 0)
    }

    async fn add_field(&self, table: &str, column: &ColumnInfo) -> Result<()> {
        self.ensure_writes(table)?;
        let (schema, indexed) = self.table(table).await?;
        if schema.has_column(&column.name) {
            return Err(GeosourceError::InvalidIdentifier {
                identifier: column.name.clone(),
                reason: "column already exists".to_string(),
            });
        }
        let definition = sql::column_definition(&self.flavor, column, native_type(column)?);
        let table_ref = self.spatial_table(&schema, indexed)?.table_ref;
        let sql = format!("ALTER TABLE {table_ref} ADD COLUMN {definition}");
        self.execute(SqlQuery { sql, params: Vec::new() }).await?;
        self.core.invalidate_schema(table);
        Ok(())
    }

    async fn remove_field(&self, table: &str, name: &str) -> Result<()> {
        self.ensure_writes(table)?;
        let (schema, indexed) = self.table(table).await?;
        let column = schema.column(name).ok_or_else(|| GeosourceError::ColumnNotFound {
            table: table.to_string(),
            column: name.to_string(),
        })?;
        let sql = format!(
            "ALTER TABLE {} DROP COLUMN {}",
            self.spatial_table(&schema, indexed)?.table_ref,
            self.flavor.quote_ident(&column.name)
        );
        self.execute(SqlQuery { sql, params: Vec::new() }).await?;
        self.core.invalidate_schema(table);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_value_mapping() {
        assert_eq!(from_sql_value(ValueRef::Integer(1), FieldType::Boolean), Value::Boolean(true));
        assert_eq!(from_sql_value(ValueRef::Integer(3), FieldType::Float), Value::Float(3.0));
        assert_eq!(from_sql_value(ValueRef::Text(b"abc"), FieldType::Text), Value::from("abc"));

        let stamp = NaiveDate::from_ymd_opt(2021, 3, 4).unwrap().and_hms_opt(5, 6, 7).unwrap();
        let stored = to_sql_value(&Value::DateTime(stamp));
        let SqlValue::Text(text) = &stored else { panic!("expected text") };
        assert_eq!(from_sql_value(ValueRef::Text(text.as_bytes()), FieldType::DateTime), Value::DateTime(stamp));
        assert_eq!(to_sql_value(&Value::Boolean(false)), SqlValue::Integer(0));
    }

    #[test]
    fn test_table_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE t (fid INTEGER PRIMARY KEY, name TEXT NOT NULL, at DATETIME)", [])
            .unwrap();
        let (columns, pk) = table_columns(&conn, "t").unwrap();
        assert_eq!(pk.as_deref(), Some("fid"));
        assert_eq!(columns.len(), 3);
        assert!(!columns[1].nullable);
        assert_eq!(columns[2].field_type, FieldType::DateTime);
        assert!(table_columns(&conn, "missing").unwrap_err().is_not_found());
        assert!(table_exists(&conn, "t").unwrap());
    }
}
