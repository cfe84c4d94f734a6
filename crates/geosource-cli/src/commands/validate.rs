//! Validate command implementation

use crate::cli::SourceArgs;
use crate::output::OutputWriter;
use crate::output_types::ValidateOutput;
use crate::sources;
use anyhow::{bail, Result};
use geosource_core::config::{LayeredConfig, SourceCatalog};
use geosource_core::report::ValidationReport;

pub async fn execute(
    args: SourceArgs,
    catalog: Option<&SourceCatalog>,
    defaults: &LayeredConfig,
    output: &OutputWriter,
) -> Result<()> {
    let built = sources::resolve(&args.source, catalog)
        .and_then(|definition| sources::build(&definition, defaults));

    let (backend, report) = match built {
        Ok(source) => {
            let report = source.validate().await;
            source.close().await;
            (Some(source.backend().to_string()), report)
        }
        Err(e) => {
            let mut report = ValidationReport::new();
            report.error(e.to_string());
            (None, report)
        }
    };
    let valid = report.is_valid();
    let error_count = report.errors.len();

    if output.is_json() {
        output.result(ValidateOutput { source: args.source.clone(), backend, valid, report })?;
    } else {
        output.section(format!("Validating {}", args.source));
        if let Some(backend) = &backend {
            output.kv("Backend", backend);
        }
        for error in &report.errors {
            output.error(error);
        }
        for warning in &report.warnings {
            output.warning(warning);
        }
        if valid {
            if report.has_warnings() {
                output.success(format!("Source is usable ({} warning(s))", report.warnings.len()));
            } else {
                output.success("Source is valid");
            }
        }
    }

    if !valid {
        bail!("{} failed validation with {} error(s)", args.source, error_count);
    }
    Ok(())
}
