//! PostGIS adapter over a sqlx connection pool.
//!
//! Spatial filters run natively: `&&` against the GiST index when one covers
//! the geometry column, followed by the exact `ST_*` relationship. Geometry
//! leaves the server as WKB (`ST_AsBinary`), reprojected with `ST_Transform`
//! when the filter asks for another SRID.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use geosource_core::codec::wkb;
use geosource_core::config::PostGisConfig;
use geosource_core::error::{GeosourceError, Result};
use geosource_core::models::{
    ColumnInfo, Envelope, Feature, FeatureId, FieldType, Geometry, GeometryType, QueryFilter,
    SpatialFilter, SpatialRelationship, TableSchema, Value,
};
use parking_lot::RwLock;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use std::collections::HashMap;

use crate::sql::{self, CountPlan, SelectQuery, SpatialClause, SpatialTable, SqlDialect, SqlQuery};
use crate::source::{DataSource, FeatureStream, SourceCore, SourceState};
use crate::stream::{self, spawn_scan, DEFAULT_BUFFER};

const BACKEND: &str = "postgis";

fn pg_error(error: sqlx::Error) -> GeosourceError {
    GeosourceError::Database(error.to_string())
}

/// SQL syntax of PostgreSQL with PostGIS
#[derive(Debug, Clone, Copy, Default)]
pub struct PostGis;

impl PostGis {
    /// Column expression usable with geometry functions
    fn geometry_expr(&self, table: &SpatialTable<'_>, column: &str) -> String {
        let quoted = self.quote_ident(column);
        if table.geography {
            format!("{quoted}::geometry")
        } else {
            quoted
        }
    }

    fn function(relationship: SpatialRelationship) -> &'static str {
        match relationship {
            SpatialRelationship::Intersects => "ST_Intersects",
            SpatialRelationship::Contains => "ST_Contains",
            SpatialRelationship::Within => "ST_Within",
            SpatialRelationship::Overlaps => "ST_Overlaps",
            SpatialRelationship::Touches => "ST_Touches",
            SpatialRelationship::Disjoint => "ST_Disjoint",
            SpatialRelationship::Distance => "ST_DWithin",
            SpatialRelationship::Equals => "ST_Equals",
        }
    }
}

impl SqlDialect for PostGis {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    /// NULL is written inline: an untyped parameter would be sent as text
    fn bind(&self, params: &mut Vec<Value>, value: Value) -> String {
        if value.is_null() {
            return "NULL".to_string();
        }
        params.push(value);
        self.placeholder(params.len())
    }

    fn select_column(&self, column: &ColumnInfo) -> String {
        let quoted = self.quote_ident(&column.name);
        match column.field_type {
            FieldType::Integer => format!("{quoted}::int8"),
            FieldType::Float => format!("{quoted}::float8"),
            FieldType::Boolean => format!("{quoted}::bool"),
            FieldType::DateTime => format!("{quoted}::timestamp"),
            FieldType::Bytes => quoted,
            FieldType::Text | FieldType::Geometry => format!("{quoted}::text"),
        }
    }

    fn select_geometry(&self, table: &SpatialTable<'_>, column: &str, target_srid: Option<i32>) -> String {
        let expr = self.geometry_expr(table, column);
        match target_srid {
            Some(srid) => format!("ST_AsBinary(ST_Transform({expr}, {srid}))"),
            None => format!("ST_AsBinary({expr})"),
        }
    }

    fn supports_reprojection(&self) -> bool {
        true
    }

    fn spatial_predicate(
        &self,
        table: &SpatialTable<'_>,
        column: &str,
        filter: &SpatialFilter,
        params: &mut Vec<Value>,
    ) -> Result<Option<SpatialClause>> {
        let srid = table.schema.srid;
        let column = self.geometry_expr(table, column);
        let placeholder = self.bind(params, self.encode_geometry(&filter.geometry, srid));
        let other = format!("ST_GeomFromWKB({placeholder}, {srid})");
        let function = Self::function(filter.relationship);

        let exact = match filter.relationship {
            SpatialRelationship::Distance => {
                let distance = self.bind(
                    params,
                    Value::Float(filter.distance_in_crs_units(table.schema.is_geographic())),
                );
                format!("{function}({column}, {other}, {distance})")
            }
            _ => format!("{function}({column}, {other})"),
        };
        // Bounding-box operator only where the GiST index can serve it
        let sql = if table.has_spatial_index
            && !table.geography
            && !matches!(filter.relationship, SpatialRelationship::Disjoint | SpatialRelationship::Distance)
        {
            format!("{column} && {other} AND {exact}")
        } else {
            exact
        };
        Ok(Some(SpatialClause { sql, exact: true }))
    }

    fn encode_geometry(&self, geometry: &Geometry, _srid: i32) -> Value {
        Value::Bytes(wkb::encode(geometry))
    }

    fn geometry_value(&self, table: &SpatialTable<'_>, placeholder: &str) -> String {
        let value = format!("ST_GeomFromWKB({placeholder}, {})", table.schema.srid);
        if table.geography {
            format!("{value}::geography")
        } else {
            value
        }
    }

    fn limit_offset(&self, limit: Option<usize>, offset: usize, _has_order: bool) -> String {
        match (limit, offset) {
            (None, 0) => String::new(),
            (Some(limit), 0) => format!(" LIMIT {limit}"),
            (Some(limit), offset) => format!(" LIMIT {limit} OFFSET {offset}"),
            (None, offset) => format!(" LIMIT ALL OFFSET {offset}"),
        }
    }

    fn insert_statement(&self, table_ref: &str, columns: &[String], values: &[String], key: Option<&str>) -> String {
        let mut sql = if columns.is_empty() {
            format!("INSERT INTO {table_ref} DEFAULT VALUES")
        } else {
            format!("INSERT INTO {table_ref} ({}) VALUES ({})", columns.join(", "), values.join(", "))
        };
        if let Some(key) = key {
            sql.push_str(&format!(" RETURNING {key}"));
        }
        sql
    }
}

fn bind_params<'q>(sql: &'q str, params: &'q [Value]) -> Query<'q, Postgres, PgArguments> {
    params.iter().fold(sqlx::query(sql), |query, value| match value {
        Value::Null => query.bind(None::<String>),
        Value::Boolean(b) => query.bind(*b),
        Value::Integer(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Text(s) => query.bind(s.as_str()),
        Value::DateTime(dt) => query.bind(*dt),
        Value::Bytes(b) => query.bind(b.as_slice()),
    })
}

fn decode_value(row: &PgRow, index: usize, field_type: FieldType) -> Value {
    let decoded = match field_type {
        FieldType::Integer => row.try_get::<Option<i64>, _>(index).map(|v| v.map(Value::Integer)),
        FieldType::Float => row.try_get::<Option<f64>, _>(index).map(|v| v.map(Value::Float)),
        FieldType::Boolean => row.try_get::<Option<bool>, _>(index).map(|v| v.map(Value::Boolean)),
        FieldType::DateTime => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)
            .map(|v| v.map(Value::DateTime)),
        FieldType::Bytes => row.try_get::<Option<Vec<u8>>, _>(index).map(|v| v.map(Value::Bytes)),
        FieldType::Text | FieldType::Geometry => {
            row.try_get::<Option<String>, _>(index).map(|v| v.map(Value::Text))
        }
    };
    match decoded {
        Ok(value) => value.unwrap_or(Value::Null),
        Err(e) => {
            tracing::warn!(index, error = %e, "undecodable column value");
            Value::Null
        }
    }
}

/// Key column of whatever integer or text type the table uses
fn decode_key(row: &PgRow, index: usize) -> Option<FeatureId> {
    if let Ok(Some(id)) = row.try_get::<Option<i64>, _>(index) {
        return Some(FeatureId::Integer(id));
    }
    if let Ok(Some(id)) = row.try_get::<Option<i32>, _>(index) {
        return Some(FeatureId::Integer(i64::from(id)));
    }
    if let Ok(Some(id)) = row.try_get::<Option<i16>, _>(index) {
        return Some(FeatureId::Integer(i64::from(id)));
    }
    row.try_get::<Option<String>, _>(index).ok().flatten().map(FeatureId::Text)
}

/// Decode one row; a malformed geometry skips the row
fn decode_row(row: &PgRow, select: &SelectQuery, ordinal: i64) -> Option<Feature> {
    let id = if select.has_key { decode_key(row, 0) } else { None };
    let mut feature = Feature::new(id.unwrap_or(FeatureId::Integer(ordinal)), None);
    let offset = select.attribute_offset();
    for (i, column) in select.columns.iter().enumerate() {
        feature.attributes.set(column.name.clone(), decode_value(row, offset + i, column.field_type));
    }
    if let Some(index) = select.geometry_index() {
        if let Ok(Some(blob)) = row.try_get::<Option<Vec<u8>>, _>(index) {
            match wkb::decode(&blob) {
                Ok(geometry) => feature.geometry = Some(geometry),
                Err(e) => {
                    tracing::warn!(backend = BACKEND, id = %feature.id, error = %e, "skipping undecodable geometry");
                    return None;
                }
            }
        }
    }
    Some(feature)
}

fn native_type(column: &ColumnInfo) -> Result<String> {
    Ok(match column.field_type {
        FieldType::Integer => "bigint".to_string(),
        FieldType::Float => "double precision".to_string(),
        FieldType::Text => match column.max_length {
            Some(length) => format!("varchar({length})"),
            None => "text".to_string(),
        },
        FieldType::Boolean => "boolean".to_string(),
        FieldType::DateTime => "timestamp".to_string(),
        FieldType::Bytes => "bytea".to_string(),
        FieldType::Geometry => return Err(GeosourceError::unsupported("add a geometry column", BACKEND)),
    })
}

/// Canonical type of an `information_schema.columns` row
fn column_type(data_type: &str, udt_name: &str) -> FieldType {
    match udt_name {
        "geometry" | "geography" => FieldType::Geometry,
        "interval" | "uuid" | "json" | "jsonb" => FieldType::Text,
        _ => FieldType::from_sql_type(data_type),
    }
}

/// Per-table facts kept beside the cached schema
#[derive(Debug, Clone, Copy, Default)]
struct PgTable {
    geography: bool,
    indexed: bool,
}

struct Described {
    schema: TableSchema,
    table: PgTable,
}

/// Data source over one PostgreSQL schema
#[derive(Debug)]
pub struct PostGisSource {
    core: SourceCore,
    config: PostGisConfig,
    pool: RwLock<Option<PgPool>>,
    tables: RwLock<HashMap<String, PgTable>>,
    buffer: usize,
    dialect: PostGis,
}

impl PostGisSource {
    pub fn new(name: impl Into<String>, config: PostGisConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            core: SourceCore::new(name, BACKEND, config.read_only),
            config,
            pool: RwLock::new(None),
            tables: RwLock::new(HashMap::new()),
            buffer: DEFAULT_BUFFER,
            dialect: PostGis,
        })
    }

    pub fn stream_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn config(&self) -> &PostGisConfig {
        &self.config
    }

    fn pool(&self) -> Result<PgPool> {
        self.core.ensure_open()?;
        self.pool.read().clone().ok_or(GeosourceError::NotOpen)
    }

    async fn connect(config: &PostGisConfig) -> Result<PgPool> {
        let pool = PgPoolOptions::new()
            .min_connections(config.pool.min_connections)
            .max_connections(config.pool.max_connections)
            .acquire_timeout(config.pool.acquire_timeout())
            .idle_timeout(config.pool.idle_timeout())
            .max_lifetime(config.pool.max_lifetime())
            .connect(&config.database_url)
            .await
            .map_err(|e| GeosourceError::Connection { message: format!("Failed to connect to database: {e}") })?;

        sqlx::query("SELECT PostGIS_Version()")
            .fetch_one(&pool)
            .await
            .map_err(|e| GeosourceError::Connection { message: format!("PostGIS check failed: {e}") })?;
        Ok(pool)
    }

    fn table_ref(&self, table: &str) -> String {
        format!("{}.{}", self.dialect.quote_ident(&self.config.schema), self.dialect.quote_ident(table))
    }

    async fn describe(&self, table: &str) -> Result<Described> {
        let pool = self.pool()?;
        let schema_name = self.config.schema.as_str();

        // Exact spelling wins over a case-insensitive match
        let name: Option<String> = sqlx::query_scalar(
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = $1 AND lower(table_name) = lower($2) \
             ORDER BY (table_name = $2) DESC LIMIT 1",
        )
        .bind(schema_name)
        .bind(table)
        .fetch_optional(&pool)
        .await
        .map_err(pg_error)?;
        let name = name.ok_or_else(|| GeosourceError::TableNotFound { table: table.to_string() })?;
        let table_ref = self.table_ref(&name);

        let rows = sqlx::query(
            "SELECT column_name::text, data_type::text, udt_name::text, is_nullable = 'YES', \
             character_maximum_length::int4 FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
        )
        .bind(schema_name)
        .bind(&name)
        .fetch_all(&pool)
        .await
        .map_err(pg_error)?;
        let mut schema = TableSchema::new(&name);
        for row in &rows {
            let column_name: String = row.try_get(0).map_err(pg_error)?;
            let data_type: String = row.try_get(1).map_err(pg_error)?;
            let udt_name: String = row.try_get(2).map_err(pg_error)?;
            let nullable: bool = row.try_get(3).map_err(pg_error)?;
            let length: Option<i32> = row.try_get(4).map_err(pg_error)?;
            let mut column = ColumnInfo::new(column_name, column_type(&data_type, &udt_name));
            if !nullable {
                column = column.not_null();
            }
            if let Some(length) = length.and_then(|l| usize::try_from(l).ok()) {
                column = column.max_length(length);
            }
            schema.columns.push(column);
        }

        schema.primary_key = sqlx::query_scalar(
            "SELECT a.attname::text FROM pg_index i \
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
             WHERE i.indrelid = $1::regclass AND i.indisprimary LIMIT 1",
        )
        .bind(&table_ref)
        .fetch_optional(&pool)
        .await
        .map_err(pg_error)?;

        let geometry = sqlx::query(
            "SELECT f_geometry_column::text, srid, type::text, false FROM geometry_columns \
             WHERE f_table_schema = $1 AND f_table_name = $2 \
             UNION ALL \
             SELECT f_geography_column::text, srid, type::text, true FROM geography_columns \
             WHERE f_table_schema = $1 AND f_table_name = $2 LIMIT 1",
        )
        .bind(schema_name)
        .bind(&name)
        .fetch_optional(&pool)
        .await
        .map_err(pg_error)?;

        let mut info = PgTable::default();
        if let Some(row) = geometry {
            let column: String = row.try_get(0).map_err(pg_error)?;
            schema.srid = row.try_get::<Option<i32>, _>(1).map_err(pg_error)?.unwrap_or(0);
            schema.geometry_type = row
                .try_get::<Option<String>, _>(2)
                .map_err(pg_error)?
                .as_deref()
                .and_then(GeometryType::from_ogc_name);
            info.geography = row.try_get(3).map_err(pg_error)?;
            info.indexed = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM pg_index i \
                 JOIN pg_class c ON c.oid = i.indexrelid \
                 JOIN pg_am am ON am.oid = c.relam \
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
                 WHERE i.indrelid = $1::regclass AND am.amname = 'gist' AND a.attname = $2)",
            )
            .bind(&table_ref)
            .bind(&column)
            .fetch_one(&pool)
            .await
            .map_err(pg_error)?;
            schema.extent = self.table_extent(&pool, &name, &column).await?;
            schema.geometry_column = Some(column);
        }

        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table_ref}"))
            .fetch_one(&pool)
            .await
            .map_err(pg_error)?;
        schema.feature_count = count.max(0) as u64;

        tracing::debug!(
            table = %name,
            srid = schema.srid,
            geography = info.geography,
            indexed = info.indexed,
            "described PostGIS table"
        );
        Ok(Described { schema, table: info })
    }

    /// Planner estimate when statistics exist, else a full `ST_Extent`
    async fn table_extent(&self, pool: &PgPool, table: &str, column: &str) -> Result<Envelope> {
        type Bounds = (Option<f64>, Option<f64>, Option<f64>, Option<f64>);
        let to_envelope = |bounds: Bounds| match bounds {
            (Some(x1), Some(y1), Some(x2), Some(y2)) => Some(Envelope::new(x1, y1, x2, y2)),
            _ => None,
        };

        let estimated: Option<Bounds> = sqlx::query_as(
            "SELECT ST_XMin(e), ST_YMin(e), ST_XMax(e), ST_YMax(e) \
             FROM (SELECT ST_EstimatedExtent($1, $2, $3) AS e) s",
        )
        .bind(&self.config.schema)
        .bind(table)
        .bind(column)
        .fetch_one(pool)
        .await
        .inspect_err(|e| tracing::debug!(table, error = %e, "no extent estimate"))
        .ok();
        if let Some(extent) = estimated.and_then(to_envelope) {
            return Ok(extent);
        }

        let column = self.dialect.quote_ident(column);
        let bounds: Bounds = sqlx::query_as(&format!(
            "SELECT ST_XMin(e), ST_YMin(e), ST_XMax(e), ST_YMax(e) \
             FROM (SELECT ST_Extent({column}::geometry) AS e FROM {}) s",
            self.table_ref(table)
        ))
        .fetch_one(pool)
        .await
        .map_err(pg_error)?;
        Ok(to_envelope(bounds).unwrap_or_default())
    }

    async fn table(&self, table: &str) -> Result<(TableSchema, PgTable)> {
        let schema = self.schema(table).await?;
        let info = self.tables.read().get(&table.to_lowercase()).copied().unwrap_or_default();
        Ok((schema, info))
    }

    fn spatial_table<'a>(&self, schema: &'a TableSchema, info: PgTable) -> Result<SpatialTable<'a>> {
        Ok(SpatialTable::new(&self.dialect, schema)?
            .with_table_ref(self.table_ref(&schema.table_name))
            .with_spatial_index(info.indexed)
            .with_geography(info.geography))
    }

    fn scan(&self, pool: PgPool, select: SelectQuery) -> FeatureStream {
        let residual = select.residual.clone();
        let rows = spawn_scan(self.buffer, self.core.error_slot(), move |tx| async move {
            let mut rows = bind_params(&select.query.sql, &select.query.params).fetch(&pool);
            let mut ordinal = 0;
            while let Some(row) = rows.try_next().await.map_err(pg_error)? {
                ordinal += 1;
                if let Some(feature) = decode_row(&row, &select, ordinal) {
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
        let pool = self.pool()?;
        let done = bind_params(&query.sql, &query.params)
            .execute(&pool)
            .await
            .map_err(|e| self.core.record_error(pg_error(e)))?;
        Ok(done.rows_affected())
    }
}

#[async_trait]
impl DataSource for PostGisSource {
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
                let pool = Self::connect(&self.config).await?;
                *self.pool.write() = Some(pool);
                Ok(())
            })
            .await
    }

    async fn close(&self) {
        let pool = self.pool.write().take();
        if let Some(pool) = pool {
            pool.close().await;
        }
        self.tables.write().clear();
        self.core.close();
    }

    async fn table_names(&self) -> Result<Vec<String>> {
        let pool = self.pool()?;
        sqlx::query_scalar(
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = $1 AND table_type IN ('BASE TABLE', 'VIEW') \
             AND table_name NOT IN ('spatial_ref_sys', 'geometry_columns', 'geography_columns') \
             ORDER BY table_name",
        )
        .bind(&self.config.schema)
        .fetch_all(&pool)
        .await
        .map_err(|e| self.core.record_error(pg_error(e)))
    }

    async fn schema(&self, table: &str) -> Result<TableSchema> {
        self.core
            .schema_or_load(table, || async {
                let described = self.describe(table).await?;
                self.tables.write().insert(table.to_lowercase(), described.table);
                Ok(described.schema)
            })
            .await
    }

    async fn feature_count(&self, table: &str, filter: Option<&QueryFilter>) -> Result<u64> {
        let (schema, info) = self.table(table).await?;
        let pool = self.pool()?;
        match sql::build_count(&self.dialect, &self.spatial_table(&schema, info)?, filter)? {
            CountPlan::Native(query) => {
                let count: i64 = bind_params(&query.sql, &query.params)
                    .fetch_one(&pool)
                    .await
                    .and_then(|row| row.try_get(0))
                    .map_err(|e| self.core.record_error(pg_error(e)))?;
                Ok(count.max(0) as u64)
            }
            CountPlan::Scan(select) => Ok(stream::count(self.scan(pool, select)).await),
        }
    }

    async fn extent(&self, table: &str) -> Result<Envelope> {
        Ok(self.schema(table).await?.extent)
    }

    async fn query_features(&self, table: &str, filter: Option<&QueryFilter>) -> Result<FeatureStream> {
        let (schema, info) = self.table(table).await?;
        let filter = filter.cloned().unwrap_or_default();
        let select = sql::build_select(&self.dialect, &self.spatial_table(&schema, info)?, &filter)?;
        Ok(self.scan(self.pool()?, select))
    }

    async fn get_feature(&self, table: &str, id: &FeatureId) -> Result<Option<Feature>> {
        let (schema, info) = self.table(table).await?;
        let select = sql::build_get(&self.dialect, &self.spatial_table(&schema, info)?, id)?;
        let mut rows = self.scan(self.pool()?, select);
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
        let pool = self.pool()?;
        let row = bind_params(&query.sql, &query.params)
            .fetch_one(&pool)
            .await
            .map_err(|e| self.core.record_error(pg_error(e)))?;
        self.core.invalidate_schema(table);
        decode_key(&row, 0).ok_or_else(|| GeosourceError::Database("insert returned no key".to_string()))
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
        let sql = format!("ALTER TABLE {} ADD COLUMN {definition}", self.table_ref(&schema.table_name));
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
