//! SpatiaLite adapter.
//!
//! Reads work on a plain SQLite connection: the envelope functions the
//! queries rely on are registered in-process. Writes would fire SpatiaLite
//! triggers that need the loadable extension, so they are not offered.

use geosource_core::codec::spatialite;
use geosource_core::error::{GeosourceError, Result};
use geosource_core::models::{Envelope, Geometry, GeometryType, SpatialFilter, TableSchema, Value};
use rusqlite::{Connection, OptionalExtension};

use crate::sql::{SpatialClause, SpatialTable, SqlDialect};
use crate::sqlite::{
    db_error, envelope_from_row, envelope_predicate, register_envelope_functions, row_count,
    table_columns, table_exists, RtreeProbe, SqliteFlavor, SqliteSource, SqliteTable,
};

const BOUNDS: [&str; 4] = ["MbrMinX", "MbrMinY", "MbrMaxX", "MbrMaxY"];

/// SpatiaLite database source
pub type SpatiaLiteSource = SqliteSource<SpatiaLite>;

#[derive(Debug, Clone, Copy, Default)]
pub struct SpatiaLite;

fn index_name(table: &str, column: &str) -> String {
    format!("idx_{table}_{column}")
}

fn quoted(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Geometry column row from `geometry_columns`, in either metadata layout
struct GeometryColumn {
    column: String,
    geometry_type: Option<GeometryType>,
    srid: i32,
    indexed: bool,
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    Ok(table_columns(conn, table)?.0.iter().any(|c| c.name.eq_ignore_ascii_case(column)))
}

fn geometry_column(conn: &Connection, table: &str) -> Result<Option<GeometryColumn>> {
    // Version 4 stores an integer type code; older layouts a type name
    let numeric_type = has_column(conn, "geometry_columns", "geometry_type")?;
    let type_column = if numeric_type { "geometry_type" } else { "type" };
    conn.query_row(
        &format!(
            "SELECT f_geometry_column, {type_column}, srid, spatial_index_enabled FROM geometry_columns \
             WHERE lower(f_table_name) = lower(?1)"
        ),
        [table],
        |r| {
            let geometry_type = if numeric_type {
                r.get::<_, Option<i64>>(1)?
                    .and_then(|code| u32::try_from(code.rem_euclid(1000)).ok())
                    .and_then(GeometryType::from_code)
            } else {
                r.get::<_, Option<String>>(1)?.as_deref().and_then(GeometryType::from_ogc_name)
            };
            Ok(GeometryColumn {
                column: r.get(0)?,
                geometry_type,
                srid: r.get::<_, Option<i64>>(2)?.unwrap_or(0) as i32,
                indexed: r.get::<_, Option<i64>>(3)?.unwrap_or(0) == 1,
            })
        },
    )
    .optional()
    .map_err(db_error)
}

/// Extent kept by SpatiaLite's statistics tables, when present and populated
fn stored_extent(conn: &Connection, table: &str, column: &str) -> Result<Option<Envelope>> {
    let candidates = [
        (
            "geometry_columns_statistics",
            "SELECT extent_min_x, extent_min_y, extent_max_x, extent_max_y FROM geometry_columns_statistics \
             WHERE lower(f_table_name) = lower(?1) AND lower(f_geometry_column) = lower(?2)",
        ),
        (
            "layer_statistics",
            "SELECT extent_min_x, extent_min_y, extent_max_x, extent_max_y FROM layer_statistics \
             WHERE lower(table_name) = lower(?1) AND lower(geometry_column) = lower(?2)",
        ),
    ];
    for (stats_table, sql) in candidates {
        if !table_exists(conn, stats_table)? {
            continue;
        }
        let extent = conn
            .query_row(sql, [table, column], |r| envelope_from_row(r, 0))
            .optional()
            .map_err(db_error)?
            .flatten();
        if extent.is_some() {
            return Ok(extent);
        }
    }
    Ok(None)
}

impl SqlDialect for SpatiaLite {
    fn name(&self) -> &'static str {
        "spatialite"
    }

    fn placeholder(&self, index: usize) -> String {
        format!("?{index}")
    }

    fn spatial_predicate(
        &self,
        table: &SpatialTable<'_>,
        column: &str,
        filter: &SpatialFilter,
        params: &mut Vec<Value>,
    ) -> Result<Option<SpatialClause>> {
        let probe = RtreeProbe {
            table: index_name(&table.schema.table_name, column),
            id: "pkid",
            bounds: ["xmin", "xmax", "ymin", "ymax"],
        };
        envelope_predicate(self, table, column, filter, params, Some(probe), BOUNDS)
    }

    fn encode_geometry(&self, geometry: &Geometry, srid: i32) -> Value {
        Value::Bytes(spatialite::encode(geometry, srid))
    }
}

impl SqliteFlavor for SpatiaLite {
    const BACKEND: &'static str = "spatialite";
    const WRITABLE: bool = false;

    fn register_functions(conn: &Connection) -> Result<()> {
        register_envelope_functions(conn, BOUNDS, "IsEmpty", spatialite::blob_envelope)
    }

    fn verify(conn: &Connection) -> Result<()> {
        if !table_exists(conn, "geometry_columns")? {
            return Err(GeosourceError::format("SpatiaLite", "geometry_columns table is missing"));
        }
        Ok(())
    }

    fn table_names(conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn
            .prepare("SELECT DISTINCT f_table_name FROM geometry_columns ORDER BY f_table_name")
            .map_err(db_error)?;
        let names = stmt
            .query_map([], |r| r.get::<_, String>(0))
            .map_err(db_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_error)?;
        Ok(names)
    }

    fn describe(conn: &Connection, table: &str) -> Result<SqliteTable> {
        let Some(geometry) = geometry_column(conn, table)? else {
            return Err(GeosourceError::TableNotFound { table: table.to_string() });
        };
        // Canonical spelling of the table name
        let name: String = conn
            .query_row(
                "SELECT f_table_name FROM geometry_columns WHERE lower(f_table_name) = lower(?1)",
                [table],
                |r| r.get(0),
            )
            .map_err(db_error)?;

        let (columns, primary_key) = table_columns(conn, &name)?;
        let mut schema = TableSchema::new(&name);
        schema.columns = columns;
        schema.primary_key = primary_key;
        schema.geometry_type = geometry.geometry_type;
        schema.srid = geometry.srid;
        schema.feature_count = row_count(conn, &quoted(&name))?;

        let has_spatial_index =
            geometry.indexed && table_exists(conn, &index_name(&name, &geometry.column))?;
        schema.extent = match stored_extent(conn, &name, &geometry.column)? {
            Some(extent) => extent,
            None => {
                let column = quoted(&geometry.column);
                conn.query_row(
                    &format!(
                        "SELECT MIN(MbrMinX({column})), MIN(MbrMinY({column})), \
                         MAX(MbrMaxX({column})), MAX(MbrMaxY({column})) FROM {}",
                        quoted(&name)
                    ),
                    [],
                    |r| envelope_from_row(r, 0),
                )
                .map_err(db_error)?
                .unwrap_or_default()
            }
        };
        schema.geometry_column = Some(geometry.column);
        tracing::debug!(table = %name, srid = schema.srid, has_spatial_index, "described SpatiaLite table");
        Ok(SqliteTable { schema, has_spatial_index })
    }

    fn decode_geometry(blob: &[u8]) -> Result<Geometry> {
        spatialite::decode_geometry(blob)
    }
}
