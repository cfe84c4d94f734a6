//! Tables command implementation

use crate::cli::SourceArgs;
use crate::output::OutputWriter;
use crate::output_types::{TableSummary, TablesOutput};
use crate::sources;
use anyhow::Result;
use geosource_core::config::{LayeredConfig, SourceCatalog};
use tabled::Tabled;

pub async fn execute(
    args: SourceArgs,
    catalog: Option<&SourceCatalog>,
    defaults: &LayeredConfig,
    output: &OutputWriter,
) -> Result<()> {
    let source = sources::open(&args.source, catalog, defaults).await?;

    let mut tables = Vec::new();
    for name in source.table_names().await? {
        match source.schema(&name).await {
            Ok(schema) => tables.push(TableSummary::from(&schema)),
            Err(e) => output.warning(format!("Skipping table {name}: {e}")),
        }
    }
    source.close().await;

    if output.is_json() {
        return output.result(TablesOutput {
            source: source.name().to_string(),
            backend: source.backend().to_string(),
            tables,
        });
    }

    #[derive(Tabled)]
    struct TableRow {
        #[tabled(rename = "Table")]
        name: String,
        #[tabled(rename = "Geometry")]
        geometry_type: String,
        #[tabled(rename = "SRID")]
        srid: i32,
        #[tabled(rename = "Features")]
        feature_count: u64,
        #[tabled(rename = "Extent")]
        extent: String,
    }

    output.section(format!("Tables in {} ({})", source.name(), source.backend()));
    let rows: Vec<TableRow> = tables
        .into_iter()
        .map(|t| TableRow {
            name: t.name,
            geometry_type: t.geometry_type.map(|g| format!("{g:?}")).unwrap_or_else(|| "-".to_string()),
            srid: t.srid,
            feature_count: t.feature_count,
            extent: t
                .extent
                .map(|[a, b, c, d]| format!("{a:.4}, {b:.4}, {c:.4}, {d:.4}"))
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();
    output.table(rows);
    Ok(())
}
