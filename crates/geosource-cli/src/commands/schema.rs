//! Schema command implementation

use crate::cli::SchemaArgs;
use crate::output::OutputWriter;
use crate::output_types::{ColumnRow, SchemaOutput};
use crate::sources;
use anyhow::Result;
use geosource_core::config::{LayeredConfig, SourceCatalog};

pub async fn execute(
    args: SchemaArgs,
    catalog: Option<&SourceCatalog>,
    defaults: &LayeredConfig,
    output: &OutputWriter,
) -> Result<()> {
    let source = sources::open(&args.source, catalog, defaults).await?;
    let names = match args.table {
        Some(table) => vec![table],
        None => source.table_names().await?,
    };

    let mut tables = Vec::with_capacity(names.len());
    for name in &names {
        tables.push(source.schema(name).await?);
    }
    source.close().await;

    if output.is_json() {
        return output.result(SchemaOutput { source: source.name().to_string(), tables });
    }

    for schema in tables {
        output.section(&schema.table_name);
        output.kv(
            "Geometry",
            match (&schema.geometry_column, schema.geometry_type) {
                (Some(column), Some(kind)) => format!("{column} ({kind:?})"),
                (Some(column), None) => column.clone(),
                (None, _) => "none".to_string(),
            },
        );
        output.kv("SRID", schema.srid);
        output.kv("Primary key", schema.primary_key.as_deref().unwrap_or("-"));
        output.kv("Features", schema.feature_count);
        if let Some([min_x, min_y, max_x, max_y]) = schema.extent.to_array() {
            output.kv("Extent", format!("{min_x}, {min_y}, {max_x}, {max_y}"));
        }
        let rows: Vec<ColumnRow> = schema
            .attribute_columns()
            .map(|c| ColumnRow {
                name: c.name.clone(),
                field_type: c.field_type,
                nullable: c.nullable,
                max_length: c.max_length,
            })
            .collect();
        output.table(rows);
    }
    Ok(())
}
