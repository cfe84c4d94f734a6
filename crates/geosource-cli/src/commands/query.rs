//! Query command implementation

use crate::cli::QueryArgs;
use crate::output::OutputWriter;
use crate::sources;
use anyhow::{bail, Context, Result};
use futures::StreamExt;
use geosource_core::codec::{geojson, wkt};
use geosource_core::config::{LayeredConfig, SourceCatalog};
use geosource_core::models::{AttributeFilter, Envelope, Feature, Geometry, QueryFilter, SortField, Value};

/// Longest WKT shown in a table cell
const MAX_WKT_WIDTH: usize = 60;

pub async fn execute(
    args: QueryArgs,
    catalog: Option<&SourceCatalog>,
    defaults: &LayeredConfig,
    output: &OutputWriter,
) -> Result<()> {
    let filter = build_filter(&args)?;
    let source = sources::open(&args.source, catalog, defaults).await?;

    let stream = source.query_features(&args.table, Some(&filter)).await;
    let features: Vec<Feature> = match stream {
        Ok(stream) => stream.collect().await,
        Err(e) => {
            source.close().await;
            return Err(e.into());
        }
    };
    if let Some(reason) = source.last_error() {
        output.warning(format!("{} reported: {reason}", source.name()));
    }
    source.close().await;

    print_features(&features, output)
}

/// Features as a GeoJSON collection, or a grid with one column per attribute
pub(super) fn print_features(features: &[Feature], output: &OutputWriter) -> Result<()> {
    if output.is_json() {
        return output.result(geojson::feature_collection(features));
    }

    let mut names: Vec<String> = Vec::new();
    for feature in features {
        for name in feature.attributes.names() {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                names.push(name.to_string());
            }
        }
    }

    let mut header = vec!["id".to_string(), "geometry".to_string()];
    header.extend(names.iter().cloned());

    let rows = features
        .iter()
        .map(|feature| {
            let mut row = Vec::with_capacity(header.len());
            row.push(feature.id.to_string());
            row.push(feature.geometry.as_ref().map(summarize_geometry).unwrap_or_default());
            for name in &names {
                row.push(feature.attribute(name).map(Value::to_string).unwrap_or_default());
            }
            row
        })
        .collect();

    output.grid(header, rows);
    output.info(format!("{} feature(s)", features.len()));
    Ok(())
}

fn summarize_geometry(geometry: &Geometry) -> String {
    let text = wkt::write(geometry);
    if text.chars().count() <= MAX_WKT_WIDTH {
        return text;
    }
    let cut: String = text.chars().take(MAX_WKT_WIDTH - 3).collect();
    format!("{cut}...")
}

/// Translate command-line options into a query filter
pub(super) fn build_filter(args: &QueryArgs) -> Result<QueryFilter> {
    let mut filter = QueryFilter::new().limit(args.limit).offset(args.offset);

    if let Some(bbox) = &args.bbox {
        filter = filter.bbox(&parse_bbox(bbox)?);
    }

    match &args.predicate {
        Some(predicate) => {
            let mut attribute = AttributeFilter::new(predicate.as_str());
            for param in &args.params {
                let (name, value) = parse_param(param)?;
                attribute = attribute.param(name, value);
            }
            filter = filter.attribute(attribute);
        }
        None if !args.params.is_empty() => bail!("--param needs a --where predicate"),
        None => {}
    }

    for key in &args.sort {
        filter = filter.sort_by(parse_sort(key)?);
    }

    let columns: Vec<&str> =
        args.columns.iter().map(|c| c.trim()).filter(|c| !c.is_empty()).collect();
    if !columns.is_empty() {
        filter = filter.columns(columns);
    }
    if args.no_geometry {
        filter = filter.without_geometry();
    }
    if let Some(srid) = args.srid {
        filter = filter.reproject_to(srid);
    }

    filter.validate()?;
    Ok(filter)
}

/// `minx,miny,maxx,maxy`
pub(super) fn parse_bbox(text: &str) -> Result<Envelope> {
    let values = text
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f64>()
                .with_context(|| format!("invalid bounding box value '{}'", part.trim()))
        })
        .collect::<Result<Vec<f64>>>()?;
    match values.as_slice() {
        [min_x, min_y, max_x, max_y] => Ok(Envelope::new(*min_x, *min_y, *max_x, *max_y)),
        _ => bail!("bounding box needs four values (minx,miny,maxx,maxy), got {}", values.len()),
    }
}

/// `name=value`; the value is read as an integer, a float, a boolean, then text
fn parse_param(text: &str) -> Result<(String, Value)> {
    let (name, raw) = text
        .split_once('=')
        .with_context(|| format!("parameter '{text}' is not of the form name=value"))?;
    let name = name.trim();
    if name.is_empty() {
        bail!("parameter '{text}' has no name");
    }
    let value = if let Ok(i) = raw.parse::<i64>() {
        Value::Integer(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        Value::Float(f)
    } else if let Ok(b) = raw.parse::<bool>() {
        Value::Boolean(b)
    } else {
        Value::Text(raw.to_string())
    };
    Ok((name.to_string(), value))
}

fn parse_sort(key: &str) -> Result<SortField> {
    let key = key.trim();
    let (field, descending) = match key.strip_prefix('-') {
        Some(field) => (field, true),
        None => (key.strip_prefix('+').unwrap_or(key), false),
    };
    if field.is_empty() {
        bail!("empty sort key");
    }
    Ok(if descending { SortField::descending(field) } else { SortField::ascending(field) })
}
