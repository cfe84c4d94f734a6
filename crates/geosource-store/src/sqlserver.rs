//! SQL Server Spatial adapter over tiberius.
//!
//! Each operation opens its own TDS connection. Geometry crosses the wire as
//! WKT through the native `STAsText` / `STGeomFromText` methods, and spatial
//! relationships are decided by the `ST*` methods of the column type.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use geosource_core::codec::wkt;
use geosource_core::config::SqlServerConfig;
use geosource_core::error::{GeosourceError, Result};
use geosource_core::models::{
    ColumnInfo, Envelope, Feature, FeatureId, FieldType, Geometry, GeometryType, QueryFilter,
    SpatialFilter, SpatialRelationship, TableSchema, Value,
};
use parking_lot::RwLock;
use std::borrow::Cow;
use std::collections::HashMap;
use tiberius::{Client, ColumnData, Config, FromSql, Row, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::sql::{self, CountPlan, SelectQuery, SpatialClause, SpatialTable, SqlDialect, SqlQuery};
use crate::source::{DataSource, FeatureStream, SourceCore, SourceState};
use crate::stream::{self, spawn_scan, DEFAULT_BUFFER};

const BACKEND: &str = "sqlserver";

type MsClient = Client<Compat<TcpStream>>;

fn ms_error(error: tiberius::error::Error) -> GeosourceError {
    GeosourceError::Database(error.to_string())
}

/// T-SQL syntax with the spatial type methods
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServer;

impl SqlServer {
    fn type_name(table: &SpatialTable<'_>) -> &'static str {
        if table.geography {
            "geography"
        } else {
            "geometry"
        }
    }
}

impl SqlDialect for SqlServer {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("[{}]", ident.replace(']', "]]"))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("@P{index}")
    }

    fn select_geometry(&self, _table: &SpatialTable<'_>, column: &str, _target_srid: Option<i32>) -> String {
        format!("{}.STAsText()", self.quote_ident(column))
    }

    fn spatial_predicate(
        &self,
        table: &SpatialTable<'_>,
        column: &str,
        filter: &SpatialFilter,
        params: &mut Vec<Value>,
    ) -> Result<Option<SpatialClause>> {
        let method = match (filter.relationship, table.geography) {
            // Geography distances are metres on the ellipsoid; leave them to the in-process test
            (SpatialRelationship::Distance, true) | (SpatialRelationship::Touches, true) => return Ok(None),
            (SpatialRelationship::Distance, false) => "STDistance",
            (SpatialRelationship::Intersects, _) => "STIntersects",
            (SpatialRelationship::Contains, _) => "STContains",
            (SpatialRelationship::Within, _) => "STWithin",
            (SpatialRelationship::Overlaps, _) => "STOverlaps",
            (SpatialRelationship::Touches, false) => "STTouches",
            (SpatialRelationship::Disjoint, _) => "STDisjoint",
            (SpatialRelationship::Equals, _) => "STEquals",
        };
        let column = self.quote_ident(column);
        let placeholder = self.bind(params, self.encode_geometry(&filter.geometry, table.schema.srid));
        let other = format!("{}::STGeomFromText({placeholder}, {})", Self::type_name(table), table.schema.srid);
        let sql = if filter.relationship == SpatialRelationship::Distance {
            let distance = self.bind(params, Value::Float(filter.distance_in_crs_units(table.schema.is_geographic())));
            format!("{column}.{method}({other}) <= {distance}")
        } else {
            format!("{column}.{method}({other}) = 1")
        };
        Ok(Some(SpatialClause { sql, exact: true }))
    }

    fn encode_geometry(&self, geometry: &Geometry, _srid: i32) -> Value {
        Value::Text(wkt::write(geometry))
    }

    fn geometry_value(&self, table: &SpatialTable<'_>, placeholder: &str) -> String {
        format!("{}::STGeomFromText({placeholder}, {})", Self::type_name(table), table.schema.srid)
    }

    fn limit_offset(&self, limit: Option<usize>, offset: usize, has_order: bool) -> String {
        // OFFSET needs an ORDER BY
        let order = if has_order { "" } else { " ORDER BY (SELECT NULL)" };
        match (limit, offset) {
            (None, 0) => String::new(),
            (Some(limit), offset) => format!("{order} OFFSET {offset} ROWS FETCH NEXT {limit} ROWS ONLY"),
            (None, offset) => format!("{order} OFFSET {offset} ROWS"),
        }
    }

    fn insert_statement(&self, table_ref: &str, columns: &[String], values: &[String], key: Option<&str>) -> String {
        let output = key.map(|k| format!(" OUTPUT INSERTED.{k}")).unwrap_or_default();
        if columns.is_empty() {
            format!("INSERT INTO {table_ref}{output} DEFAULT VALUES")
        } else {
            format!("INSERT INTO {table_ref} ({}){output} VALUES ({})", columns.join(", "), values.join(", "))
        }
    }
}

/// Statement parameter borrowed from a canonical value
struct Param<'a>(&'a Value);

impl ToSql for Param<'_> {
    fn to_sql(&self) -> ColumnData<'_> {
        match self.0 {
            Value::Null => ColumnData::String(None),
            Value::Boolean(b) => ColumnData::Bit(Some(*b)),
            Value::Integer(i) => ColumnData::I64(Some(*i)),
            Value::Float(f) => ColumnData::F64(Some(*f)),
            Value::Text(s) => ColumnData::String(Some(Cow::Borrowed(s.as_str()))),
            Value::DateTime(dt) => dt.to_sql(),
            Value::Bytes(b) => ColumnData::Binary(Some(Cow::Borrowed(b.as_slice()))),
        }
    }
}

/// Canonical value of one result cell
fn value_from_column(data: &ColumnData<'static>) -> Value {
    let value = match data {
        ColumnData::U8(v) => v.map(|n| Value::Integer(i64::from(n))),
        ColumnData::I16(v) => v.map(|n| Value::Integer(i64::from(n))),
        ColumnData::I32(v) => v.map(|n| Value::Integer(i64::from(n))),
        ColumnData::I64(v) => v.map(Value::Integer),
        ColumnData::F32(v) => v.map(|n| Value::Float(f64::from(n))),
        ColumnData::F64(v) => v.map(Value::Float),
        ColumnData::Bit(v) => v.map(Value::Boolean),
        ColumnData::String(v) => v.as_ref().map(|s| Value::Text(s.to_string())),
        ColumnData::Guid(v) => v.as_ref().map(|g| Value::Text(g.to_string())),
        ColumnData::Binary(v) => v.as_ref().map(|b| Value::Bytes(b.to_vec())),
        ColumnData::Numeric(v) => v
            .as_ref()
            .map(|n| Value::Float(n.value() as f64 / 10f64.powi(i32::from(n.scale())))),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            chrono::NaiveDateTime::from_sql(data).ok().flatten().map(Value::DateTime)
        }
        ColumnData::Date(_) => chrono::NaiveDate::from_sql(data)
            .ok()
            .flatten()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(Value::DateTime),
        ColumnData::DateTimeOffset(_) => chrono::DateTime::<chrono::Utc>::from_sql(data)
            .ok()
            .flatten()
            .map(|dt| Value::DateTime(dt.naive_utc())),
        ColumnData::Time(_) => chrono::NaiveTime::from_sql(data).ok().flatten().map(|t| Value::Text(t.to_string())),
        _ => None,
    };
    value.unwrap_or(Value::Null)
}

fn row_values(row: Row) -> Vec<Value> {
    row.into_iter().map(|data| value_from_column(&data)).collect()
}

/// Decode one row; malformed WKT skips the row
fn decode_row(values: Vec<Value>, select: &SelectQuery, ordinal: i64) -> Option<Feature> {
    let id = select
        .has_key
        .then(|| values.first().and_then(FeatureId::from_value))
        .flatten()
        .unwrap_or(FeatureId::Integer(ordinal));
    let mut feature = Feature::new(id, None);
    let offset = select.attribute_offset();
    for (i, column) in select.columns.iter().enumerate() {
        let value = values.get(offset + i).cloned().unwrap_or(Value::Null);
        feature.attributes.set(column.name.clone(), coerce(value, column.field_type));
    }
    if let Some(Value::Text(text)) = select.geometry_index().and_then(|i| values.get(i)) {
        match wkt::parse(text) {
            Ok(geometry) => feature.geometry = Some(geometry),
            Err(e) => {
                tracing::warn!(backend = BACKEND, id = %feature.id, error = %e, "skipping undecodable geometry");
                return None;
            }
        }
    }
    Some(feature)
}

/// Bring a driver value to its column's canonical type
fn coerce(value: Value, field_type: FieldType) -> Value {
    match (value, field_type) {
        (Value::Integer(i), FieldType::Boolean) => Value::Boolean(i != 0),
        (Value::Integer(i), FieldType::Float) => Value::Float(i as f64),
        (value, _) => value,
    }
}

fn native_type(column: &ColumnInfo) -> Result<String> {
    Ok(match column.field_type {
        FieldType::Integer => "BIGINT".to_string(),
        FieldType::Float => "FLOAT".to_string(),
        FieldType::Text => match column.max_length.filter(|&n| n <= 4000) {
            Some(length) => format!("NVARCHAR({length})"),
            None => "NVARCHAR(MAX)".to_string(),
        },
        FieldType::Boolean => "BIT".to_string(),
        FieldType::DateTime => "DATETIME2".to_string(),
        FieldType::Bytes => "VARBINARY(MAX)".to_string(),
        FieldType::Geometry => return Err(GeosourceError::unsupported("add a geometry column", BACKEND)),
    })
}

async fn connect(config: &Config) -> Result<MsClient> {
    let tcp = TcpStream::connect(config.get_addr())
        .await
        .map_err(|e| GeosourceError::Connection { message: format!("{}: {e}", config.get_addr()) })?;
    tcp.set_nodelay(true)?;
    Client::connect(config.clone(), tcp.compat_write())
        .await
        .map_err(|e| GeosourceError::Connection { message: format!("Failed to connect to database: {e}") })
}

/// Run a statement and collect the rows of its first result set
async fn fetch_rows(client: &mut MsClient, sql: &str, params: &[Value]) -> Result<Vec<Vec<Value>>> {
    let params: Vec<Param<'_>> = params.iter().map(Param).collect();
    let refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
    let rows = client
        .query(sql, &refs)
        .await
        .map_err(ms_error)?
        .into_first_result()
        .await
        .map_err(ms_error)?;
    Ok(rows.into_iter().map(row_values).collect())
}

fn first_value(rows: &[Vec<Value>]) -> Option<&Value> {
    rows.first().and_then(|row| row.first())
}

#[derive(Debug, Clone, Copy, Default)]
struct MsTable {
    geography: bool,
    indexed: bool,
}

/// Data source over one SQL Server schema
#[derive(Debug)]
pub struct SqlServerSource {
    core: SourceCore,
    settings: SqlServerConfig,
    config: Config,
    tables: RwLock<HashMap<String, MsTable>>,
    buffer: usize,
    dialect: SqlServer,
}

impl SqlServerSource {
    pub fn new(name: impl Into<String>, settings: SqlServerConfig) -> Result<Self> {
        settings.validate()?;
        let mut config = Config::from_ado_string(&settings.connection_string).map_err(|e| {
            GeosourceError::ConfigInvalid { key: "connection_string".to_string(), reason: e.to_string() }
        })?;
        if settings.trust_cert {
            config.trust_cert();
        }
        Ok(Self {
            core: SourceCore::new(name, BACKEND, settings.read_only),
            settings,
            config,
            tables: RwLock::new(HashMap::new()),
            buffer: DEFAULT_BUFFER,
            dialect: SqlServer,
        })
    }

    pub fn stream_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }

    async fn client(&self) -> Result<MsClient> {
        self.core.ensure_open()?;
        connect(&self.config).await.map_err(|e| self.core.record_error(e))
    }

    fn table_ref(&self, table: &str) -> String {
        format!("{}.{}", self.dialect.quote_ident(&self.settings.schema), self.dialect.quote_ident(table))
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Vec<Value>>> {
        let mut client = self.client().await?;
        fetch_rows(&mut client, sql, params).await.map_err(|e| self.core.record_error(e))
    }

    async fn describe(&self, table: &str) -> Result<(TableSchema, MsTable)> {
        let mut client = self.client().await?;
        let schema_name = Value::from(self.settings.schema.as_str());

        let found = fetch_rows(
            &mut client,
            "SELECT TOP 1 TABLE_NAME FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2",
            &[schema_name.clone(), Value::from(table)],
        )
        .await?;
        let name = first_value(&found)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GeosourceError::TableNotFound { table: table.to_string() })?;
        let key = [schema_name, Value::from(name.as_str())];
        let table_ref = self.table_ref(&name);

        let mut schema = TableSchema::new(&name);
        let mut info = MsTable::default();
        let mut geometry_column = None;
        let rows = fetch_rows(
            &mut client,
            "SELECT COLUMN_NAME, DATA_TYPE, IS_NULLABLE, CHARACTER_MAXIMUM_LENGTH FROM INFORMATION_SCHEMA.COLUMNS \
             WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2 ORDER BY ORDINAL_POSITION",
            &key,
        )
        .await?;
        for row in &rows {
            let (Some(column_name), Some(data_type)) =
                (row.first().and_then(Value::as_str), row.get(1).and_then(Value::as_str))
            else {
                continue;
            };
            let field_type = FieldType::from_sql_type(data_type);
            if field_type == FieldType::Geometry && geometry_column.is_none() {
                info.geography = data_type.eq_ignore_ascii_case("geography");
                geometry_column = Some(column_name.to_string());
            }
            let mut column = ColumnInfo::new(column_name, field_type);
            if row.get(2).and_then(Value::as_str) == Some("NO") {
                column = column.not_null();
            }
            if let Some(length) = row.get(3).and_then(Value::as_i64).and_then(|n| usize::try_from(n).ok()) {
                column = column.max_length(length);
            }
            schema.columns.push(column);
        }

        let pk = fetch_rows(
            &mut client,
            "SELECT TOP 1 kcu.COLUMN_NAME FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc \
             JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu \
             ON tc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME AND tc.TABLE_SCHEMA = kcu.TABLE_SCHEMA \
             WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY' AND tc.TABLE_SCHEMA = @P1 AND tc.TABLE_NAME = @P2 \
             ORDER BY kcu.ORDINAL_POSITION",
            &key,
        )
        .await?;
        schema.primary_key = first_value(&pk).and_then(Value::as_str).map(str::to_string);

        if let Some(column) = &geometry_column {
            let quoted = self.dialect.quote_ident(column);
            let sample = fetch_rows(
                &mut client,
                &format!("SELECT TOP 1 {quoted}.STSrid, {quoted}.STGeometryType() FROM {table_ref} WHERE {quoted} IS NOT NULL"),
                &[],
            )
            .await?;
            if let Some(row) = sample.first() {
                schema.srid = row.first().and_then(Value::as_i64).unwrap_or(0) as i32;
                schema.geometry_type = row.get(1).and_then(Value::as_str).and_then(GeometryType::from_ogc_name);
            }

            let planar = if info.geography {
                format!("geometry::STGeomFromWKB({quoted}.STAsBinary(), {quoted}.STSrid)")
            } else {
                quoted.clone()
            };
            let extent = fetch_rows(
                &mut client,
                &format!("SELECT geometry::EnvelopeAggregate({planar}).STAsText() FROM {table_ref}"),
                &[],
            )
            .await?;
            schema.extent = match first_value(&extent).and_then(Value::as_str) {
                Some(text) => wkt::parse(text)?.envelope(),
                None => Envelope::default(),
            };

            let indexes = fetch_rows(
                &mut client,
                "SELECT COUNT(*) FROM sys.spatial_indexes WHERE object_id = OBJECT_ID(@P1)",
                &[Value::from(table_ref.as_str())],
            )
            .await?;
            info.indexed = first_value(&indexes).and_then(Value::as_i64).unwrap_or(0) > 0;
        }
        schema.geometry_column = geometry_column;

        let count = fetch_rows(&mut client, &format!("SELECT COUNT_BIG(*) FROM {table_ref}"), &[]).await?;
        schema.feature_count = first_value(&count).and_then(Value::as_i64).unwrap_or(0).max(0) as u64;

        tracing::debug!(table = %name, srid = schema.srid, geography = info.geography, "described SQL Server table");
        Ok((schema, info))
    }

    async fn table(&self, table: &str) -> Result<(TableSchema, MsTable)> {
        let schema = self.schema(table).await?;
        let info = self.tables.read().get(&table.to_lowercase()).copied().unwrap_or_default();
        Ok((schema, info))
    }

    fn spatial_table<'a>(&self, schema: &'a TableSchema, info: MsTable) -> Result<SpatialTable<'a>> {
        Ok(SpatialTable::new(&self.dialect, schema)?
            .with_table_ref(self.table_ref(&schema.table_name))
            .with_spatial_index(info.indexed)
            .with_geography(info.geography))
    }

    fn scan(&self, select: SelectQuery) -> FeatureStream {
        let config = self.config.clone();
        let residual = select.residual.clone();
        let rows = spawn_scan(self.buffer, self.core.error_slot(), move |tx| async move {
            let mut client = connect(&config).await?;
            let params: Vec<Param<'_>> = select.query.params.iter().map(Param).collect();
            let refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
            let mut rows = client
                .query(select.query.sql.as_str(), &refs)
                .await
                .map_err(ms_error)?
                .into_row_stream();
            let mut ordinal = 0;
            while let Some(row) = rows.try_next().await.map_err(ms_error)? {
                ordinal += 1;
                if let Some(feature) = decode_row(row_values(row), &select, ordinal) {
                    if tx.send(feature).await.is_err() {
                        break;
                    }
                }
            }
            Ok(())
        });
        residual.apply(rows)
    }

    async fn execute(&self, query: SqlQuery) -> Result<u64> {
        let mut client = self.client().await?;
        let params: Vec<Param<'_>> = query.params.iter().map(Param).collect();
        let refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
        let done = client
            .execute(query.sql.as_str(), &refs)
            .await
            .map_err(|e| self.core.record_error(ms_error(e)))?;
        Ok(done.rows_affected().iter().sum())
    }
}

#[async_trait]
impl DataSource for SqlServerSource {
    fn backend(&self) -> &'static str {
        BACKEND
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
        self.core
            .open_with(|| async {
                let mut client = connect(&self.config).await?;
                fetch_rows(&mut client, "SELECT 1", &[]).await?;
                Ok(())
            })
            .await
    }

    async fn close(&self) {
        self.tables.write().clear();
        self.core.close();
    }

    async fn table_names(&self) -> Result<Vec<String>> {
        let rows = self
            .query(
                "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_SCHEMA = @P1 ORDER BY TABLE_NAME",
                &[Value::from(self.settings.schema.as_str())],
            )
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().and_then(|v| v.as_str().map(str::to_string)))
            .collect())
    }

    async fn schema(&self, table: &str) -> Result<TableSchema> {
        self.core
            .schema_or_load(table, || async {
                let (schema, info) = self.describe(table).await?;
                self.tables.write().insert(table.to_lowercase(), info);
                Ok(schema)
            })
            .await
    }

    async fn feature_count(&self, table: &str, filter: Option<&QueryFilter>) -> Result<u64> {
        let (schema, info) = self.table(table).await?;
        match sql::build_count(&self.dialect, &self.spatial_table(&schema, info)?, filter)? {
            CountPlan::Native(query) => {
                let rows = self.query(&query.sql, &query.params).await?;
                Ok(first_value(&rows).and_then(Value::as_i64).unwrap_or(0).max(0) as u64)
            }
            CountPlan::Scan(select) => Ok(stream::count(self.scan(select)).await),
        }
    }

    async fn extent(&self, table: &str) -> Result<Envelope> {
        Ok(self.schema(table).await?.extent)
    }

    async fn query_features(&self, table: &str, filter: Option<&QueryFilter>) -> Result<FeatureStream> {
        let (schema, info) = self.table(table).await?;
        let filter = filter.cloned().unwrap_or_default();
        let select = sql::build_select(&self.dialect, &self.spatial_table(&schema, info)?, &filter)?;
        Ok(self.scan(select))
    }

    async fn get_feature(&self, table: &str, id: &FeatureId) -> Result<Option<Feature>> {
        let (schema, info) = self.table(table).await?;
        let select = sql::build_get(&self.dialect, &self.spatial_table(&schema, info)?, id)?;
        let mut rows = self.scan(select);
        Ok(rows.next().await)
    }

    async fn insert_feature(&self, table: &str, feature: &Feature) -> Result<FeatureId> {
        self.core.ensure_writable(table)?;
        let (schema, info) = self.table(table).await?;
        let spatial = self.spatial_table(&schema, info)?;
        if spatial.key.is_none() {
            return Err(GeosourceError::MissingPrimaryKey { table: schema.table_name.clone() });
        }
        let query = sql::build_insert(&self.dialect, &spatial, feature)?;
        let rows = self.query(&query.sql, &query.params).await?;
        self.core.invalidate_schema(table);
        first_value(&rows)
            .and_then(FeatureId::from_value)
            .ok_or_else(|| GeosourceError::Database("insert returned no key".to_string()))
    }

    async fn update_feature(&self, table: &str, feature: &Feature) -> Result<()> {
        self.core.ensure_writable(table)?;
        let (schema, info) = self.table(table).await?;
        let query = sql::build_update(&self.dialect, &self.spatial_table(&schema, info)?, feature)?;
        let changed = self.execute(query).await?;
        self.core.invalidate_schema(table);
        if changed == 0 {
            return Err(GeosourceError::NotFound { what: format!("feature {}", feature.id) });
        }
        Ok(())
    }

    async fn delete_feature(&self, table: &str, id: &FeatureId) -> Result<bool> {
        self.core.ensure_writable(table)?;
        let (schema, info) = self.table(table).await?;
        let query = sql::build_delete(&self.dialect, &self.spatial_table(&schema, info)?, id)?;
        let changed = self.execute(query).await?;
        self.core.invalidate_schema(table);
        Ok(changed > 0)
    }

    async fn add_field(&self, table: &str, column: &ColumnInfo) -> Result<()> {
        self.core.ensure_writable(table)?;
        let schema = self.schema(table).await?;
        if schema.has_column(&column.name) {
            return Err(GeosourceError::InvalidIdentifier {
                identifier: column.name.clone(),
                reason: "column already exists".to_string(),
            });
        }
        let definition = sql::column_definition(&self.dialect, column, &native_type(column)?);
        let sql = format!("ALTER TABLE {} ADD {definition}", self.table_ref(&schema.table_name));
        self.execute(SqlQuery { sql, params: Vec::new() }).await?;
        self.core.invalidate_schema(table);
        Ok(())
    }

    async fn remove_field(&self, table: &str, name: &str) -> Result<()> {
        self.core.ensure_writable(table)?;
        let schema = self.schema(table).await?;
        let column = schema.column(name).ok_or_else(|| GeosourceError::ColumnNotFound {
            table: table.to_string(),
            column: name.to_string(),
        })?;
        let sql = format!(
            "ALTER TABLE {} DROP COLUMN {}",
            self.table_ref(&schema.table_name),
            self.dialect.quote_ident(&column.name)
        );
        self.execute(SqlQuery { sql, params: Vec::new() }).await?;
        self.core.invalidate_schema(table);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geosource_core::models::{DistanceUnit, SortField};
    use tiberius::numeric::Numeric;

    fn roads() -> TableSchema {
        let mut schema = TableSchema::new("roads");
        schema.geometry_column = Some("shape".into());
        schema.primary_key = Some("id".into());
        schema.srid = 2056;
        schema.columns = vec![
            ColumnInfo::new("id", FieldType::Integer),
            ColumnInfo::new("name", FieldType::Text),
            ColumnInfo::new("shape", FieldType::Geometry),
        ];
        schema
    }

    fn table(schema: &TableSchema) -> SpatialTable<'_> {
        SpatialTable::new(&SqlServer, schema).unwrap().with_table_ref("[dbo].[roads]".to_string())
    }

    #[test]
    fn test_select_with_paging_and_spatial_method() {
        let schema = roads();
        let filter = QueryFilter::new()
            .bbox(&Envelope::new(0.0, 0.0, 5.0, 5.0))
            .sort_by(SortField::descending("name"))
            .limit(10)
            .offset(20);
        let select = sql::build_select(&SqlServer, &table(&schema), &filter).unwrap();
        assert_eq!(
            select.query.sql,
            "SELECT [id], [name], [shape].STAsText() FROM [dbo].[roads] \
             WHERE [shape].STIntersects(geometry::STGeomFromText(@P1, 2056)) = 1 \
             ORDER BY [name] DESC, [id] OFFSET 20 ROWS FETCH NEXT 10 ROWS ONLY"
        );
        assert!(matches!(&select.query.params[0], Value::Text(w) if w.starts_with("POLYGON")));
    }

    #[test]
    fn test_offset_without_order_or_key() {
        let mut schema = roads();
        schema.primary_key = None;
        let filter = QueryFilter::new().offset(5).without_geometry();
        let select = sql::build_select(&SqlServer, &table(&schema), &filter).unwrap();
        assert!(select.query.sql.ends_with(" ORDER BY (SELECT NULL) OFFSET 5 ROWS"));
    }

    #[test]
    fn test_distance_and_geography() {
        let schema = roads();
        let near = QueryFilter::new().spatial(SpatialFilter::within_distance(
            Geometry::point(1.0, 1.0),
            250.0,
            DistanceUnit::Meters,
        ));
        let select = sql::build_select(&SqlServer, &table(&schema), &near).unwrap();
        assert!(select
            .query
            .sql
            .contains("[shape].STDistance(geometry::STGeomFromText(@P1, 2056)) <= @P2"));
        assert_eq!(select.query.params[1], Value::Float(250.0));

        let geography = table(&schema).with_geography(true);
        let select = sql::build_select(&SqlServer, &geography, &near).unwrap();
        assert!(!select.query.sql.contains("WHERE"));
        assert!(select.has_geometry);
    }

    #[test]
    fn test_insert_outputs_key() {
        let schema = roads();
        let feature = Feature::new(0i64, Some(Geometry::point(3.0, 4.0))).with_attribute("name", "Main");
        let insert = sql::build_insert(&SqlServer, &table(&schema), &feature).unwrap();
        assert_eq!(
            insert.sql,
            "INSERT INTO [dbo].[roads] ([name], [shape]) OUTPUT INSERTED.[id] VALUES (@P1, geometry::STGeomFromText(@P2, 2056))"
        );
        assert_eq!(insert.params[1], Value::from("POINT (3 4)"));
    }

    #[test]
    fn test_quote_ident_escapes_brackets() {
        assert_eq!(SqlServer.quote_ident("odd]name"), "[odd]]name]");
    }

    #[test]
    fn test_column_values() {
        assert_eq!(value_from_column(&ColumnData::I32(Some(7))), Value::Integer(7));
        assert_eq!(value_from_column(&ColumnData::Bit(Some(true))), Value::Boolean(true));
        assert_eq!(value_from_column(&ColumnData::String(None)), Value::Null);
        assert_eq!(
            value_from_column(&ColumnData::String(Some(Cow::Owned("abc".to_string())))),
            Value::from("abc")
        );
        assert_eq!(
            value_from_column(&ColumnData::Numeric(Some(Numeric::new_with_scale(12345, 2)))),
            Value::Float(123.45)
        );
        assert_eq!(coerce(Value::Integer(0), FieldType::Boolean), Value::Boolean(false));
    }

    #[test]
    fn test_row_decoding() {
        let schema = roads();
        let select = sql::build_select(&SqlServer, &table(&schema), &QueryFilter::new()).unwrap();
        let feature = decode_row(
            vec![Value::Integer(4), Value::from("Main"), Value::from("POINT (1 2)")],
            &select,
            1,
        )
        .unwrap();
        assert_eq!(feature.id, FeatureId::Integer(4));
        assert_eq!(feature.geometry, Some(Geometry::point(1.0, 2.0)));

        let broken = decode_row(vec![Value::Integer(5), Value::Null, Value::from("POINT (")], &select, 2);
        assert!(broken.is_none());
    }

    #[test]
    fn test_connection_string_is_parsed() {
        let settings = SqlServerConfig::new("server=tcp:localhost,1433;user=sa;password=x;TrustServerCertificate=true");
        assert!(SqlServerSource::new("mssql", settings).is_ok());
        assert!(SqlServerSource::new("mssql", SqlServerConfig::new(" ")).is_err());
    }
}
