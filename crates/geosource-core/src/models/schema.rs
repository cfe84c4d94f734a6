use serde::{Deserialize, Serialize};

use super::envelope::Envelope;
use super::geometry::GeometryType;
use super::value::FieldType;

/// Column description produced by backend introspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
    pub max_length: Option<usize>,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self { name: name.into(), field_type, nullable: true, max_length: None }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn max_length(mut self, len: usize) -> Self {
        self.max_length = Some(len);
        self
    }
}

/// Structure of one table or layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TableSchema {
    pub table_name: String,
    pub geometry_column: Option<String>,
    pub geometry_type: Option<GeometryType>,
    pub srid: i32,
    pub primary_key: Option<String>,
    pub columns: Vec<ColumnInfo>,
    pub feature_count: u64,
    pub extent: Envelope,
}

impl TableSchema {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self { table_name: table_name.into(), ..Default::default() }
    }

    /// Case-insensitive column lookup
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Attribute columns: everything except the geometry column
    pub fn attribute_columns(&self) -> impl Iterator<Item = &ColumnInfo> {
        let geometry = self.geometry_column.clone();
        self.columns.iter().filter(move |c| {
            c.field_type != FieldType::Geometry
                && geometry.as_deref().map(|g| !g.eq_ignore_ascii_case(&c.name)).unwrap_or(true)
        })
    }

    /// Whether the SRID names a geographic (degree-based) reference system
    pub fn is_geographic(&self) -> bool {
        is_geographic_srid(self.srid)
    }
}

/// Common geographic SRIDs whose units are degrees
pub fn is_geographic_srid(srid: i32) -> bool {
    matches!(srid, 4326 | 4258 | 4269 | 4267 | 4283 | 4230 | 4314 | 4490 | 4612 | 4674 | 4019)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_columns_skip_geometry() {
        let mut schema = TableSchema::new("roads");
        schema.geometry_column = Some("geom".to_string());
        schema.columns = vec![
            ColumnInfo::new("fid", FieldType::Integer).not_null(),
            ColumnInfo::new("GEOM", FieldType::Bytes),
            ColumnInfo::new("name", FieldType::Text).max_length(80),
        ];
        let names: Vec<&str> = schema.attribute_columns().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["fid", "name"]);
        assert!(schema.has_column("NAME"));
    }
}
