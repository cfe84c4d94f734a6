//! OGC GeoPackage adapter

use geosource_core::codec::gpkg;
use geosource_core::error::{GeosourceError, Result};
use geosource_core::models::{Geometry, GeometryType, SpatialFilter, TableSchema, Value};
use rusqlite::{Connection, OptionalExtension};

use crate::sql::{SpatialClause, SpatialTable, SqlDialect};
use crate::sqlite::{
    db_error, envelope_from_row, envelope_predicate, register_envelope_functions, row_count,
    table_columns, table_exists, RtreeProbe, SqliteFlavor, SqliteSource, SqliteTable,
};

/// `application_id` of a GeoPackage: ASCII "GPKG"
pub const APPLICATION_ID: i64 = 0x4750_4B47;

const BOUNDS: [&str; 4] = ["ST_MinX", "ST_MinY", "ST_MaxX", "ST_MaxY"];

/// GeoPackage file source
pub type GeoPackageSource = SqliteSource<GeoPackage>;

#[derive(Debug, Clone, Copy, Default)]
pub struct GeoPackage;

fn rtree_name(table: &str, column: &str) -> String {
    format!("rtree_{table}_{column}")
}

impl SqlDialect for GeoPackage {
    fn name(&self) -> &'static str {
        "geopackage"
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
            table: rtree_name(&table.schema.table_name, column),
            id: "id",
            bounds: ["minx", "maxx", "miny", "maxy"],
        };
        envelope_predicate(self, table, column, filter, params, Some(probe), BOUNDS)
    }

    fn encode_geometry(&self, geometry: &Geometry, srid: i32) -> Value {
        Value::Bytes(gpkg::encode(geometry, srid))
    }
}

impl SqliteFlavor for GeoPackage {
    const BACKEND: &'static str = "geopackage";
    const WRITABLE: bool = true;

    fn register_functions(conn: &Connection) -> Result<()> {
        register_envelope_functions(conn, BOUNDS, "ST_IsEmpty", gpkg::blob_envelope)
    }

    fn verify(conn: &Connection) -> Result<()> {
        let id: i64 = conn.query_row("PRAGMA application_id", [], |r| r.get(0)).map_err(db_error)?;
        if id != APPLICATION_ID {
            return Err(GeosourceError::format(
                "GeoPackage",
                format!("application_id is {id:#010x}, expected 0x47504b47 (\"GPKG\")"),
            ));
        }
        if !table_exists(conn, "gpkg_contents")? {
            return Err(GeosourceError::format("GeoPackage", "gpkg_contents table is missing"));
        }
        Ok(())
    }

    fn table_names(conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn
            .prepare(
                "SELECT table_name FROM gpkg_contents \
                 WHERE data_type IN ('features', 'attributes') ORDER BY table_name",
            )
            .map_err(db_error)?;
        let names = stmt
            .query_map([], |r| r.get::<_, String>(0))
            .map_err(db_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_error)?;
        Ok(names)
    }

    fn describe(conn: &Connection, table: &str) -> Result<SqliteTable> {
        let contents = conn
            .query_row(
                "SELECT table_name, srs_id, min_x, min_y, max_x, max_y FROM gpkg_contents \
                 WHERE lower(table_name) = lower(?1)",
                [table],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, Option<i64>>(1)?, envelope_from_row(r, 2)?)),
            )
            .optional()
            .map_err(db_error)?;
        let Some((name, contents_srid, stored_extent)) = contents else {
            return Err(GeosourceError::TableNotFound { table: table.to_string() });
        };

        let geometry = conn
            .query_row(
                "SELECT column_name, geometry_type_name, srs_id FROM gpkg_geometry_columns \
                 WHERE lower(table_name) = lower(?1)",
                [&name],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, i64>(2)?)),
            )
            .optional()
            .map_err(db_error)?;

        let (columns, primary_key) = table_columns(conn, &name)?;
        let mut schema = TableSchema::new(&name);
        schema.columns = columns;
        schema.primary_key = primary_key;
        schema.srid = contents_srid.unwrap_or(0) as i32;

        let table_ref = format!("\"{}\"", name.replace('"', "\"\""));
        schema.feature_count = row_count(conn, &table_ref)?;

        let mut has_spatial_index = false;
        if let Some((column, type_name, srid)) = geometry {
            has_spatial_index = table_exists(conn, &rtree_name(&name, &column))?;
            schema.geometry_type = GeometryType::from_ogc_name(&type_name);
            schema.srid = srid as i32;
            schema.extent = match stored_extent {
                Some(extent) => extent,
                None => {
                    let quoted = format!("\"{}\"", column.replace('"', "\"\""));
                    conn.query_row(
                        &format!(
                            "SELECT MIN(ST_MinX({quoted})), MIN(ST_MinY({quoted})), \
                             MAX(ST_MaxX({quoted})), MAX(ST_MaxY({quoted})) FROM {table_ref}"
                        ),
                        [],
                        |r| envelope_from_row(r, 0),
                    )
                    .map_err(db_error)?
                    .unwrap_or_default()
                }
            };
            schema.geometry_column = Some(column);
        }
        tracing::debug!(table = %name, srid = schema.srid, has_spatial_index, "described GeoPackage table");
        Ok(SqliteTable { schema, has_spatial_index })
    }

    fn decode_geometry(blob: &[u8]) -> Result<Geometry> {
        gpkg::decode_geometry(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::DataSource;
    use futures::StreamExt;
    use geosource_core::models::{AttributeFilter, Envelope, Feature, FeatureId, QueryFilter, SortField};
    use std::path::{Path, PathBuf};

    fn create(dir: &Path, with_rtree: bool) -> PathBuf {
        let path = dir.join("parcels.gpkg");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "PRAGMA application_id = 1196444487;
             CREATE TABLE gpkg_contents (table_name TEXT PRIMARY KEY, data_type TEXT NOT NULL,
                 identifier TEXT, min_x DOUBLE, min_y DOUBLE, max_x DOUBLE, max_y DOUBLE, srs_id INTEGER);
             CREATE TABLE gpkg_geometry_columns (table_name TEXT, column_name TEXT,
                 geometry_type_name TEXT, srs_id INTEGER, z TINYINT, m TINYINT);
             CREATE TABLE parcels (fid INTEGER PRIMARY KEY AUTOINCREMENT, geom POINT, name TEXT, area DOUBLE);
             INSERT INTO gpkg_contents VALUES ('parcels', 'features', 'parcels', NULL, NULL, NULL, NULL, 4326);
             INSERT INTO gpkg_geometry_columns VALUES ('parcels', 'geom', 'POINT', 4326, 0, 0);",
        )
        .unwrap();
        for i in 1..=6 {
            let blob = gpkg::encode(&Geometry::point(f64::from(i), f64::from(i)), 4326);
            conn.execute(
                "INSERT INTO parcels (geom, name, area) VALUES (?1, ?2, ?3)",
                rusqlite::params![blob, format!("p{i}"), f64::from(i) * 10.0],
            )
            .unwrap();
        }
        if with_rtree {
            conn.execute_batch(
                "CREATE VIRTUAL TABLE rtree_parcels_geom USING rtree(id, minx, maxx, miny, maxy);
                 INSERT INTO rtree_parcels_geom SELECT fid, fid, fid, fid, fid FROM parcels;",
            )
            .unwrap();
        }
        path
    }

    async fn opened(path: &Path, read_only: bool) -> GeoPackageSource {
        let source = GeoPackageSource::new("gpkg", path, read_only);
        assert!(source.open().await, "{:?}", source.last_error());
        source
    }

    #[tokio::test]
    async fn test_schema_and_computed_extent() {
        let dir = tempfile::tempdir().unwrap();
        let source = opened(&create(dir.path(), false), false).await;

        assert_eq!(source.table_names().await.unwrap(), vec!["parcels".to_string()]);
        let schema = source.schema("parcels").await.unwrap();
        assert_eq!(schema.geometry_column.as_deref(), Some("geom"));
        assert_eq!(schema.primary_key.as_deref(), Some("fid"));
        assert_eq!(schema.geometry_type, Some(GeometryType::Point));
        assert_eq!(schema.srid, 4326);
        assert_eq!(schema.feature_count, 6);
        assert_eq!(schema.extent, Envelope::new(1.0, 1.0, 6.0, 6.0));
    }

    #[tokio::test]
    async fn test_bbox_query_with_and_without_rtree() {
        for with_rtree in [false, true] {
            let dir = tempfile::tempdir().unwrap();
            let source = opened(&create(dir.path(), with_rtree), false).await;
            let filter = QueryFilter::new()
                .bbox(&Envelope::new(1.5, 1.5, 4.5, 4.5))
                .attribute(AttributeFilter::new("area > :min").param("min", 25.0))
                .sort_by(SortField::descending("area"));
            let features: Vec<_> = source.query_features("parcels", Some(&filter)).await.unwrap().collect().await;
            let ids: Vec<_> = features.iter().map(|f| f.id.clone()).collect();
            assert_eq!(ids, vec![FeatureId::Integer(4), FeatureId::Integer(3)], "rtree = {with_rtree}");
            assert_eq!(source.feature_count("parcels", Some(&filter)).await.unwrap(), 2);
        }
    }

    #[tokio::test]
    async fn test_paging_after_exact_retest() {
        let dir = tempfile::tempdir().unwrap();
        let source = opened(&create(dir.path(), true), false).await;
        let filter = QueryFilter::new().bbox(&Envelope::new(0.0, 0.0, 10.0, 10.0)).offset(2).limit(3);
        let features: Vec<_> = source.query_features("parcels", Some(&filter)).await.unwrap().collect().await;
        let ids: Vec<_> = features.iter().map(|f| f.id.clone()).collect();
        assert_eq!(ids, vec![FeatureId::Integer(3), FeatureId::Integer(4), FeatureId::Integer(5)]);
    }

    #[tokio::test]
    async fn test_crud() {
        let dir = tempfile::tempdir().unwrap();
        let source = opened(&create(dir.path(), false), false).await;

        let feature = Feature::new(0i64, Some(Geometry::point(9.0, 9.0))).with_attribute("name", "new");
        let id = source.insert_feature("parcels", &feature).await.unwrap();
        assert_eq!(id, FeatureId::Integer(7));
        let stored = source.get_feature("parcels", &id).await.unwrap().unwrap();
        assert_eq!(stored.geometry, Some(Geometry::point(9.0, 9.0)));

        let update = Feature::new(7i64, Some(Geometry::point(8.0, 8.0))).with_attribute("name", "renamed");
        source.update_feature("parcels", &update).await.unwrap();
        let stored = source.get_feature("parcels", &id).await.unwrap().unwrap();
        assert_eq!(stored.attribute("name"), Some(&Value::from("renamed")));

        assert!(source.delete_feature("parcels", &id).await.unwrap());
        assert!(!source.delete_feature("parcels", &id).await.unwrap());
        assert_eq!(source.feature_count("parcels", None).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_read_only_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = create(dir.path(), false);
        let before = std::fs::read(&path).unwrap();
        let source = opened(&path, true).await;
        let result = source.delete_feature("parcels", &FeatureId::Integer(1)).await;
        assert!(matches!(result, Err(GeosourceError::ReadOnly { .. })));
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn test_not_a_geopackage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.sqlite");
        Connection::open(&path).unwrap().execute_batch("CREATE TABLE t (x INTEGER);").unwrap();
        let source = GeoPackageSource::new("plain", &path, true);
        assert!(!source.open().await);
        assert!(source.last_error().unwrap().contains("application_id"));
    }
}
