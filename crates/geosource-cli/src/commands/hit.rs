//! Hit command implementation

use super::query::print_features;
use crate::cli::HitArgs;
use crate::output::OutputWriter;
use crate::sources;
use anyhow::{bail, Result};
use futures::StreamExt;
use geosource_core::config::{LayeredConfig, SourceCatalog};
use geosource_core::models::{
    DistanceUnit, Feature, Geometry, QueryFilter, SpatialFilter, SpatialRelationship,
};

/// Candidate filter around the point; the backend may answer it approximately
fn candidate_filter(x: f64, y: f64, tolerance: f64, unit: DistanceUnit) -> QueryFilter {
    let point = Geometry::point(x, y);
    let spatial = if tolerance > 0.0 {
        SpatialFilter::within_distance(point, tolerance, unit)
    } else {
        SpatialFilter::new(point, SpatialRelationship::Intersects)
    };
    QueryFilter::new().spatial(spatial)
}

pub async fn execute(
    args: HitArgs,
    catalog: Option<&SourceCatalog>,
    defaults: &LayeredConfig,
    output: &OutputWriter,
) -> Result<()> {
    if !(args.tolerance >= 0.0) {
        bail!("tolerance must be zero or positive, got {}", args.tolerance);
    }
    let unit = defaults.distance_unit.value;
    let filter = candidate_filter(args.x, args.y, args.tolerance, unit);
    let source = sources::open(&args.source, catalog, defaults).await?;

    let scanned = async {
        let schema = source.schema(&args.table).await?;
        let stream = source.query_features(&args.table, Some(&filter)).await?;
        let candidates: Vec<Feature> = stream.collect().await;
        Ok::<_, geosource_core::GeosourceError>((schema, candidates))
    }
    .await;
    source.close().await;
    let (schema, candidates) = scanned?;

    let tolerance = unit.to_crs_units(args.tolerance, schema.is_geographic());

    let hits: Vec<Feature> = candidates
        .into_iter()
        .filter(|feature| {
            feature
                .geometry
                .as_ref()
                .is_some_and(|g| geosource_geo::hit_test(g, args.x, args.y, tolerance))
        })
        .collect();
    tracing::debug!(table = %args.table, hits = hits.len(), "hit test finished");

    print_features(&hits, output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_filter() {
        let filter = candidate_filter(1.0, 2.0, 0.0, DistanceUnit::Meters);
        let spatial = filter.spatial.unwrap();
        assert_eq!(spatial.relationship, SpatialRelationship::Intersects);
        assert_eq!(spatial.geometry, Geometry::point(1.0, 2.0));

        let filter = candidate_filter(1.0, 2.0, 0.5, DistanceUnit::CrsUnits);
        let spatial = filter.spatial.unwrap();
        assert_eq!(spatial.relationship, SpatialRelationship::Distance);
        assert_eq!(spatial.distance, 0.5);
        assert_eq!(spatial.distance_unit, DistanceUnit::CrsUnits);
        assert!(QueryFilter::new().spatial(spatial).validate().is_ok());
    }
}
