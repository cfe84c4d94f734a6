//! Query filter translation for SQL backends.
//!
//! Each backend supplies a [`SqlDialect`]; the builders here assemble SELECT,
//! COUNT and write statements from a [`QueryFilter`] and report which parts of
//! the filter still have to run in-process.

use geosource_core::error::{GeosourceError, Result};
use geosource_core::models::{
    AttributeFilter, ColumnInfo, Feature, FeatureId, Geometry, QueryFilter, SortDirection,
    SpatialFilter, TableSchema, Value,
};

use crate::residual::{check_columns, Pushdown, Residual};
use crate::source::validate_table_name;

/// Native spatial predicate and whether it decides the relationship exactly
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialClause {
    pub sql: String,
    pub exact: bool,
}

/// Statement text and its positional parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Table description handed to the builders
#[derive(Debug, Clone)]
pub struct SpatialTable<'a> {
    pub schema: &'a TableSchema,
    /// Qualified, quoted table reference
    pub table_ref: String,
    /// Key expression used as feature id, e.g. a quoted primary key or `ROWID`
    pub key: Option<String>,
    /// A native spatial index covers the geometry column
    pub has_spatial_index: bool,
    /// The geometry column holds geodetic (geography) values
    pub geography: bool,
}

impl<'a> SpatialTable<'a> {
    /// Describe `schema`, keyed by its primary key column
    pub fn new(dialect: &dyn SqlDialect, schema: &'a TableSchema) -> Result<Self> {
        validate_table_name(&schema.table_name)?;
        Ok(Self {
            schema,
            table_ref: dialect.quote_ident(&schema.table_name),
            key: schema.primary_key.as_deref().map(|pk| dialect.quote_ident(pk)),
            has_spatial_index: false,
            geography: false,
        })
    }

    pub fn with_table_ref(mut self, table_ref: String) -> Self {
        self.table_ref = table_ref;
        self
    }

    pub fn with_key(mut self, key: Option<String>) -> Self {
        self.key = key;
        self
    }

    pub fn with_spatial_index(mut self, has_spatial_index: bool) -> Self {
        self.has_spatial_index = has_spatial_index;
        self
    }

    pub fn with_geography(mut self, geography: bool) -> Self {
        self.geography = geography;
        self
    }

    pub fn geometry_column(&self) -> Option<&str> {
        self.schema.geometry_column.as_deref()
    }

    fn is_key_column(&self, column: &str) -> bool {
        self.schema.primary_key.as_deref().is_some_and(|pk| pk.eq_ignore_ascii_case(column))
    }

    /// Attribute columns returned by default: everything but the key and geometry
    pub fn attribute_columns(&self) -> Vec<ColumnInfo> {
        self.schema
            .attribute_columns()
            .filter(|c| !self.is_key_column(&c.name))
            .cloned()
            .collect()
    }

    fn require_key(&self) -> Result<&str> {
        self.key.as_deref().ok_or_else(|| GeosourceError::MissingPrimaryKey {
            table: self.schema.table_name.clone(),
        })
    }
}

/// Backend-specific SQL syntax
pub trait SqlDialect: Send + Sync {
    fn name(&self) -> &'static str;

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Positional placeholder, 1-based
    fn placeholder(&self, index: usize) -> String;

    /// Append a parameter and return its placeholder
    fn bind(&self, params: &mut Vec<Value>, value: Value) -> String {
        params.push(value);
        self.placeholder(params.len())
    }

    /// Select expression for an attribute column
    fn select_column(&self, column: &ColumnInfo) -> String {
        self.quote_ident(&column.name)
    }

    /// Select expression yielding the geometry in the form the adapter decodes
    fn select_geometry(&self, table: &SpatialTable<'_>, column: &str, target_srid: Option<i32>) -> String {
        let _ = (table, target_srid);
        self.quote_ident(column)
    }

    /// Whether `select_geometry` can reproject natively
    fn supports_reprojection(&self) -> bool {
        false
    }

    /// Spatial predicate for `filter`; `None` leaves the test to the in-process pass
    fn spatial_predicate(
        &self,
        table: &SpatialTable<'_>,
        column: &str,
        filter: &SpatialFilter,
        params: &mut Vec<Value>,
    ) -> Result<Option<SpatialClause>>;

    /// Parameter value carrying a geometry into a write statement
    fn encode_geometry(&self, geometry: &Geometry, srid: i32) -> Value;

    /// Expression turning a geometry parameter into a native value
    fn geometry_value(&self, table: &SpatialTable<'_>, placeholder: &str) -> String {
        let _ = table;
        placeholder.to_string()
    }

    /// Paging clause appended after ORDER BY
    fn limit_offset(&self, limit: Option<usize>, offset: usize, has_order: bool) -> String {
        let _ = has_order;
        match (limit, offset) {
            (None, 0) => String::new(),
            (Some(limit), 0) => format!(" LIMIT {limit}"),
            (Some(limit), offset) => format!(" LIMIT {limit} OFFSET {offset}"),
            (None, offset) => format!(" LIMIT -1 OFFSET {offset}"),
        }
    }

    /// INSERT statement; backends that can return the new key do so here
    fn insert_statement(&self, table_ref: &str, columns: &[String], values: &[String], key: Option<&str>) -> String {
        let _ = key;
        if columns.is_empty() {
            format!("INSERT INTO {table_ref} DEFAULT VALUES")
        } else {
            format!("INSERT INTO {table_ref} ({}) VALUES ({})", columns.join(", "), values.join(", "))
        }
    }
}

/// Rewrite `:name` / `@name` placeholders of an opaque fragment into the
/// dialect's positional form. Quoted literals and identifiers are left alone.
pub fn rebind_parameters(
    dialect: &dyn SqlDialect,
    attribute: &AttributeFilter,
    params: &mut Vec<Value>,
) -> Result<String> {
    let chars: Vec<char> = attribute.predicate.chars().collect();
    let mut out = String::with_capacity(attribute.predicate.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' | '[' | '`' => {
                let close = if c == '[' { ']' } else { c };
                out.push(c);
                i += 1;
                while i < chars.len() {
                    out.push(chars[i]);
                    if chars[i] == close {
                        if chars.get(i + 1) == Some(&close) && close != ']' {
                            out.push(close);
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            ':' | '@'
                if chars.get(i + 1).is_some_and(|n| n.is_alphabetic() || *n == '_')
                    && (i == 0 || chars[i - 1] != c) =>
            {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                let value = attribute.parameter(&name).cloned().ok_or_else(|| {
                    GeosourceError::InvalidFilter { reason: format!("parameter {c}{name} is not bound") }
                })?;
                out.push_str(&dialect.bind(params, value));
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(out)
}

/// SELECT statement with its row layout and in-process remainder.
///
/// Row layout: key (when `has_key`), then `columns`, then geometry (when `has_geometry`).
#[derive(Debug, Clone)]
pub struct SelectQuery {
    pub query: SqlQuery,
    pub has_key: bool,
    pub columns: Vec<ColumnInfo>,
    pub has_geometry: bool,
    pub residual: Residual,
}

impl SelectQuery {
    /// Column index of the geometry value
    pub fn geometry_index(&self) -> Option<usize> {
        self.has_geometry.then(|| usize::from(self.has_key) + self.columns.len())
    }

    /// Column index of the first attribute
    pub fn attribute_offset(&self) -> usize {
        usize::from(self.has_key)
    }
}

fn projected_columns(table: &SpatialTable<'_>, filter: &QueryFilter) -> Result<Vec<ColumnInfo>> {
    if filter.columns.is_empty() {
        return Ok(table.attribute_columns());
    }
    filter
        .columns
        .iter()
        .map(|name| {
            table.schema.column(name).cloned().ok_or_else(|| GeosourceError::ColumnNotFound {
                table: table.schema.table_name.clone(),
                column: name.clone(),
            })
        })
        .collect()
}

struct WhereClause {
    conditions: Vec<String>,
    spatial_exact: bool,
}

impl WhereClause {
    fn render(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.conditions.join(" AND "))
        }
    }
}

fn where_clause(
    dialect: &dyn SqlDialect,
    table: &SpatialTable<'_>,
    filter: &QueryFilter,
    params: &mut Vec<Value>,
) -> Result<WhereClause> {
    let mut conditions = Vec::new();
    let mut spatial_exact = true;
    if let Some(spatial) = &filter.spatial {
        match table.geometry_column() {
            Some(column) => match dialect.spatial_predicate(table, column, spatial, params)? {
                Some(clause) => {
                    conditions.push(clause.sql);
                    spatial_exact = clause.exact;
                }
                None => spatial_exact = false,
            },
            None => {
                return Err(GeosourceError::InvalidFilter {
                    reason: format!("table {} has no geometry column", table.schema.table_name),
                })
            }
        }
    }
    if let Some(attribute) = &filter.attribute {
        conditions.push(format!("({})", rebind_parameters(dialect, attribute, params)?));
    }
    Ok(WhereClause { conditions, spatial_exact })
}

fn select_list(
    dialect: &dyn SqlDialect,
    table: &SpatialTable<'_>,
    columns: &[ColumnInfo],
    geometry: Option<Option<i32>>,
) -> String {
    let mut items = Vec::with_capacity(columns.len() + 2);
    if let Some(key) = &table.key {
        items.push(key.clone());
    }
    items.extend(columns.iter().map(|c| dialect.select_column(c)));
    if let (Some(target), Some(column)) = (geometry, table.geometry_column()) {
        items.push(dialect.select_geometry(table, column, target));
    }
    if items.is_empty() {
        items.push("1".to_string());
    }
    items.join(", ")
}

/// Build the SELECT for `filter`
pub fn build_select(
    dialect: &dyn SqlDialect,
    table: &SpatialTable<'_>,
    filter: &QueryFilter,
) -> Result<SelectQuery> {
    filter.validate()?;
    check_columns(filter, table.schema)?;

    let mut params = Vec::new();
    let clause = where_clause(dialect, table, filter, &mut params)?;
    let columns = projected_columns(table, filter)?;

    let spatial_residual = filter.spatial.is_some() && !clause.spatial_exact;
    let reprojection = filter.target_srid > 0
        && filter.target_srid != table.schema.srid
        && dialect.supports_reprojection();
    let has_geometry =
        table.geometry_column().is_some() && (filter.include_geometry || spatial_residual);
    let geometry = has_geometry.then(|| reprojection.then_some(filter.target_srid));

    let paging = !spatial_residual && !filter.distinct;
    let pushdown = Pushdown {
        spatial_exact: !spatial_residual,
        attribute: true,
        sort: true,
        paging,
        projection: true,
        reprojection,
    };
    let residual = Residual::plan(filter, table.schema, pushdown)?;

    let mut sql = format!(
        "SELECT {} FROM {}{}",
        select_list(dialect, table, &columns, geometry),
        table.table_ref,
        clause.render()
    );

    let mut order: Vec<String> = filter
        .sort
        .iter()
        .map(|s| {
            let name = table.schema.column(&s.field).map(|c| c.name.as_str()).unwrap_or(s.field.as_str());
            let direction = match s.direction {
                SortDirection::Ascending => "ASC",
                SortDirection::Descending => "DESC",
            };
            format!("{} {direction}", dialect.quote_ident(name))
        })
        .collect();
    // Key tie-breaker keeps pages stable
    if filter.is_paged() || !order.is_empty() {
        if let Some(key) = &table.key {
            order.push(key.clone());
        }
    }
    if !order.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));
    }
    if paging && filter.is_paged() {
        let limit = (filter.max_features > 0).then_some(filter.max_features);
        sql.push_str(&dialect.limit_offset(limit, filter.offset, !order.is_empty()));
    }

    tracing::debug!(dialect = dialect.name(), sql = %sql, params = params.len(), "built select");
    Ok(SelectQuery {
        query: SqlQuery { sql, params },
        has_key: table.key.is_some(),
        columns,
        has_geometry,
        residual,
    })
}

/// SELECT of one feature by key
pub fn build_get(dialect: &dyn SqlDialect, table: &SpatialTable<'_>, id: &FeatureId) -> Result<SelectQuery> {
    let key = table.require_key()?.to_string();
    let mut params = Vec::new();
    let placeholder = dialect.bind(&mut params, id.to_value());
    let columns = table.attribute_columns();
    let has_geometry = table.geometry_column().is_some();
    let sql = format!(
        "SELECT {} FROM {} WHERE {key} = {placeholder}",
        select_list(dialect, table, &columns, has_geometry.then_some(None)),
        table.table_ref
    );
    Ok(SelectQuery {
        query: SqlQuery { sql, params },
        has_key: true,
        columns,
        has_geometry,
        residual: Residual::in_process(&QueryFilter::new(), table.schema)?,
    })
}

/// How to count the features matching a filter
#[derive(Debug, Clone)]
pub enum CountPlan {
    /// A single COUNT(*) statement
    Native(SqlQuery),
    /// The native predicate is inexact: scan and count after the exact re-test
    Scan(SelectQuery),
}

pub fn build_count(
    dialect: &dyn SqlDialect,
    table: &SpatialTable<'_>,
    filter: Option<&QueryFilter>,
) -> Result<CountPlan> {
    let filter = filter.map(crate::residual::without_paging).unwrap_or_default();
    filter.validate()?;
    let mut params = Vec::new();
    let clause = where_clause(dialect, table, &filter, &mut params)?;
    if (filter.spatial.is_some() && !clause.spatial_exact) || filter.distinct {
        let mut scan = filter.clone();
        scan.include_geometry = false;
        scan.target_srid = 0;
        return Ok(CountPlan::Scan(build_select(dialect, table, &scan)?));
    }
    let sql = format!("SELECT COUNT(*) FROM {}{}", table.table_ref, clause.render());
    Ok(CountPlan::Native(SqlQuery { sql, params }))
}

fn check_writable_column(table: &SpatialTable<'_>, name: &str) -> Result<String> {
    let column = table.schema.column(name).ok_or_else(|| GeosourceError::ColumnNotFound {
        table: table.schema.table_name.clone(),
        column: name.to_string(),
    })?;
    Ok(column.name.clone())
}

fn assignments(
    dialect: &dyn SqlDialect,
    table: &SpatialTable<'_>,
    feature: &Feature,
    params: &mut Vec<Value>,
    include_key: bool,
) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for (name, value) in feature.attributes.iter() {
        let column = check_writable_column(table, name)?;
        if !include_key && table.is_key_column(&column) {
            continue;
        }
        if table.geometry_column().is_some_and(|g| g.eq_ignore_ascii_case(&column)) {
            continue;
        }
        out.push((dialect.quote_ident(&column), dialect.bind(params, value.clone())));
    }
    if let Some(column) = table.geometry_column() {
        let value = match &feature.geometry {
            Some(geometry) => dialect.encode_geometry(geometry, table.schema.srid),
            None => Value::Null,
        };
        let placeholder = dialect.bind(params, value);
        out.push((dialect.quote_ident(column), dialect.geometry_value(table, &placeholder)));
    }
    Ok(out)
}

pub fn build_insert(dialect: &dyn SqlDialect, table: &SpatialTable<'_>, feature: &Feature) -> Result<SqlQuery> {
    let mut params = Vec::new();
    let pairs = assignments(dialect, table, feature, &mut params, true)?;
    let (columns, values): (Vec<String>, Vec<String>) = pairs.into_iter().unzip();
    let sql = dialect.insert_statement(&table.table_ref, &columns, &values, table.key.as_deref());
    Ok(SqlQuery { sql, params })
}

pub fn build_update(dialect: &dyn SqlDialect, table: &SpatialTable<'_>, feature: &Feature) -> Result<SqlQuery> {
    let key = table.require_key()?.to_string();
    let mut params = Vec::new();
    let pairs = assignments(dialect, table, feature, &mut params, false)?;
    if pairs.is_empty() {
        return Err(GeosourceError::InvalidFilter { reason: "update sets no columns".to_string() });
    }
    let set = pairs.iter().map(|(c, v)| format!("{c} = {v}")).collect::<Vec<_>>().join(", ");
    let placeholder = dialect.bind(&mut params, feature.id.to_value());
    let sql = format!("UPDATE {} SET {set} WHERE {key} = {placeholder}", table.table_ref);
    Ok(SqlQuery { sql, params })
}

pub fn build_delete(dialect: &dyn SqlDialect, table: &SpatialTable<'_>, id: &FeatureId) -> Result<SqlQuery> {
    let key = table.require_key()?.to_string();
    let mut params = Vec::new();
    let placeholder = dialect.bind(&mut params, id.to_value());
    let sql = format!("DELETE FROM {} WHERE {key} = {placeholder}", table.table_ref);
    Ok(SqlQuery { sql, params })
}

/// Column definition for ALTER TABLE ... ADD
pub fn column_definition(dialect: &dyn SqlDialect, column: &ColumnInfo, native_type: &str) -> String {
    let mut definition = format!("{} {native_type}", dialect.quote_ident(&column.name));
    if !column.nullable {
        definition.push_str(" NOT NULL");
    }
    definition
}
