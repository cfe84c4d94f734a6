use geosource_core::models::{FieldType, GeometryType, TableSchema};
use geosource_core::report::ValidationReport;
use serde::Serialize;

/// Output for tables command
#[derive(Debug, Serialize)]
pub struct TablesOutput {
    pub source: String,
    pub backend: String,
    pub tables: Vec<TableSummary>,
}

#[derive(Debug, Serialize)]
pub struct TableSummary {
    pub name: String,
    pub geometry_type: Option<GeometryType>,
    pub srid: i32,
    pub feature_count: u64,
    pub extent: Option<[f64; 4]>,
}

impl From<&TableSchema> for TableSummary {
    fn from(schema: &TableSchema) -> Self {
        Self {
            name: schema.table_name.clone(),
            geometry_type: schema.geometry_type,
            srid: schema.srid,
            feature_count: schema.feature_count,
            extent: schema.extent.to_array(),
        }
    }
}

/// Output for schema command
#[derive(Debug, Serialize)]
pub struct SchemaOutput {
    pub source: String,
    pub tables: Vec<TableSchema>,
}

/// Output for validate command
#[derive(Debug, Serialize)]
pub struct ValidateOutput {
    pub source: String,
    pub backend: Option<String>,
    pub valid: bool,
    pub report: ValidationReport,
}

/// One row of the config command
#[derive(Debug, Serialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
    pub source: String,
}

/// Column listing row for the schema command
#[derive(Debug, Serialize, tabled::Tabled)]
pub struct ColumnRow {
    #[tabled(rename = "Column")]
    pub name: String,
    #[tabled(rename = "Type")]
    pub field_type: FieldType,
    #[tabled(rename = "Nullable")]
    pub nullable: bool,
    #[tabled(rename = "Max length", display_with = "display_length")]
    pub max_length: Option<usize>,
}

fn display_length(length: &Option<usize>) -> String {
    length.map(|l| l.to_string()).unwrap_or_default()
}
