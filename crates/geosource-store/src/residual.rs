//! In-process evaluation of whatever part of a query filter a backend could
//! not apply natively: the exact spatial re-test, attribute predicates, sort,
//! projection, distinct, reprojection and paging.

use futures::future::ready;
use futures::{stream, StreamExt};
use geosource_core::error::{GeosourceError, Result};
use geosource_core::models::{
    Feature, QueryFilter, SortDirection, SortField, SpatialFilter, TableSchema, Value,
};
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::predicate::Predicate;
use crate::source::FeatureStream;

/// Parts of a filter the backend already evaluated natively
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pushdown {
    /// The native spatial predicate is exact, not an envelope superset
    pub spatial_exact: bool,
    pub attribute: bool,
    pub sort: bool,
    pub paging: bool,
    pub projection: bool,
    pub reprojection: bool,
}

impl Pushdown {
    /// Nothing pushed: everything runs in-process
    pub fn none() -> Self {
        Self::default()
    }
}

/// Remaining work for one query
#[derive(Debug, Clone)]
pub struct Residual {
    spatial: Option<SpatialFilter>,
    geographic: bool,
    predicate: Option<Predicate>,
    sort: Vec<SortField>,
    offset: usize,
    limit: Option<usize>,
    columns: Option<Vec<String>>,
    include_geometry: bool,
    distinct: bool,
    reproject: Option<(i32, i32)>,
}

/// Check that projected and sorted columns exist, when the schema knows its columns
pub fn check_columns(filter: &QueryFilter, schema: &TableSchema) -> Result<()> {
    if schema.columns.is_empty() {
        return Ok(());
    }
    let referenced = filter.columns.iter().chain(filter.sort.iter().map(|s| &s.field));
    for column in referenced {
        if !schema.has_column(column) {
            return Err(GeosourceError::ColumnNotFound {
                table: schema.table_name.clone(),
                column: column.clone(),
            });
        }
    }
    Ok(())
}

/// Check that a requested reprojection can run in-process
pub fn check_reprojection(filter: &QueryFilter, schema: &TableSchema) -> Result<Option<(i32, i32)>> {
    let target = filter.target_srid;
    if target == 0 || target == schema.srid {
        return Ok(None);
    }
    if schema.srid <= 0 || !geosource_geo::can_reproject(schema.srid, target) {
        return Err(GeosourceError::unsupported(
            format!("reproject EPSG:{} to EPSG:{target}", schema.srid),
            "in-process",
        ));
    }
    Ok(Some((schema.srid, target)))
}

impl Residual {
    /// Plan the in-process remainder of `filter` given what the backend pushed down
    pub fn plan(filter: &QueryFilter, schema: &TableSchema, pushdown: Pushdown) -> Result<Self> {
        filter.validate()?;
        check_columns(filter, schema)?;

        let predicate = match &filter.attribute {
            Some(attribute) if !pushdown.attribute => Some(Predicate::parse(attribute)?),
            _ => None,
        };
        let reproject = if pushdown.reprojection { None } else { check_reprojection(filter, schema)? };
        let spatial = filter.spatial.clone().filter(|_| !pushdown.spatial_exact);
        let (offset, limit) = if pushdown.paging {
            (0, None)
        } else {
            (filter.offset, (filter.max_features > 0).then_some(filter.max_features))
        };
        let columns = (!pushdown.projection && !filter.columns.is_empty()).then(|| filter.columns.clone());

        Ok(Self {
            spatial,
            geographic: schema.is_geographic(),
            predicate,
            sort: if pushdown.sort { Vec::new() } else { filter.sort.clone() },
            offset,
            limit,
            columns,
            include_geometry: filter.include_geometry,
            distinct: filter.distinct,
            reproject,
        })
    }

    /// Plan for a backend that evaluates nothing natively
    pub fn in_process(filter: &QueryFilter, schema: &TableSchema) -> Result<Self> {
        Self::plan(filter, schema, Pushdown::none())
    }

    /// Whether rows must be materialised before the first one can be emitted
    pub fn needs_sort(&self) -> bool {
        !self.sort.is_empty()
    }

    /// Spatial and attribute test for one feature
    pub fn keep(&self, feature: &Feature) -> bool {
        if let Some(spatial) = &self.spatial {
            let hit = feature
                .geometry
                .as_ref()
                .is_some_and(|g| geosource_geo::matches_filter(g, spatial, self.geographic));
            if !hit {
                return false;
            }
        }
        self.predicate.as_ref().map_or(true, |p| p.matches(&feature.attributes))
    }

    fn finish(&self, mut feature: Feature) -> Feature {
        if let Some(columns) = &self.columns {
            feature.attributes = feature.attributes.project(columns);
        }
        if !self.include_geometry {
            feature.geometry = None;
        } else if let (Some((from, to)), Some(geometry)) = (self.reproject, feature.geometry.as_mut()) {
            if let Err(e) = geosource_geo::reproject(geometry, from, to) {
                tracing::warn!(id = %feature.id, error = %e, "reprojection failed");
            }
        }
        feature
    }

    /// Wrap a native stream with the remaining steps
    pub fn apply(self, input: FeatureStream) -> FeatureStream {
        let Residual { sort, offset, limit, distinct, .. } = self.clone();
        let filter_step = self.clone();
        let filtered = input.filter(move |f| ready(filter_step.keep(f)));

        let ordered: FeatureStream = if sort.is_empty() {
            filtered.boxed()
        } else {
            stream::once(async move {
                let mut all: Vec<Feature> = filtered.collect().await;
                sort_features(&mut all, &sort);
                stream::iter(all)
            })
            .flatten()
            .boxed()
        };

        let finished = ordered.map(move |f| self.finish(f));

        let unique: FeatureStream = if distinct {
            let mut seen = HashSet::new();
            finished
                .filter(move |f| ready(seen.insert(distinct_key(f))))
                .boxed()
        } else {
            finished.boxed()
        };

        let skipped = unique.skip(offset);
        match limit {
            Some(limit) => skipped.take(limit).boxed(),
            None => skipped.boxed(),
        }
    }
}

fn distinct_key(feature: &Feature) -> String {
    serde_json::to_string(&(feature.attributes.to_json(), &feature.geometry)).unwrap_or_default()
}

/// Stable multi-key sort; missing fields sort as null
pub fn sort_features(features: &mut [Feature], sort: &[SortField]) {
    features.sort_by(|a, b| {
        for key in sort {
            let left = a.attribute(&key.field).unwrap_or(&Value::Null);
            let right = b.attribute(&key.field).unwrap_or(&Value::Null);
            let ord = match key.direction {
                SortDirection::Ascending => left.sort_cmp(right),
                SortDirection::Descending => right.sort_cmp(left),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

/// Copy of a filter with paging removed, for counting matches
pub fn without_paging(filter: &QueryFilter) -> QueryFilter {
    let mut filter = filter.clone();
    filter.max_features = 0;
    filter.offset = 0;
    filter.sort.clear();
    filter
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::from_vec;
    use geosource_core::models::{AttributeFilter, ColumnInfo, Envelope, FeatureId, FieldType, Geometry};

    fn schema() -> TableSchema {
        let mut schema = TableSchema::new("places");
        schema.srid = 4326;
        schema.geometry_column = Some("geom".into());
        schema.columns = vec![
            ColumnInfo::new("name", FieldType::Text),
            ColumnInfo::new("rank", FieldType::Integer),
        ];
        schema
    }

    fn features(n: i64) -> Vec<Feature> {
        (1..=n)
            .map(|i| {
                Feature::new(i, Some(Geometry::point(i as f64, i as f64)))
                    .with_attribute("name", format!("p{}", i % 3))
                    .with_attribute("rank", n - i)
            })
            .collect()
    }

    async fn run(filter: QueryFilter, input: Vec<Feature>) -> Vec<Feature> {
        let residual = Residual::in_process(&filter, &schema()).unwrap();
        residual.apply(from_vec(input)).collect().await
    }

    #[tokio::test]
    async fn test_spatial_and_attribute() {
        let filter = QueryFilter::new()
            .bbox(&Envelope::new(0.0, 0.0, 5.5, 5.5))
            .attribute(AttributeFilter::new("rank >= 6"));
        let out = run(filter, features(10)).await;
        let ids: Vec<_> = out.iter().map(|f| f.id.clone()).collect();
        assert_eq!(ids, [1i64, 2, 3, 4].map(FeatureId::Integer).to_vec());
    }

    #[tokio::test]
    async fn test_sort_then_page() {
        let filter = QueryFilter::new().sort_by(SortField::ascending("rank")).offset(2).limit(3);
        let out = run(filter, features(10)).await;
        let ranks: Vec<_> = out.iter().map(|f| f.attribute("rank").cloned().unwrap()).collect();
        assert_eq!(ranks, vec![Value::Integer(2), Value::Integer(3), Value::Integer(4)]);
    }

    #[tokio::test]
    async fn test_projection_and_distinct() {
        let filter = QueryFilter::new().columns(["name"]).without_geometry().distinct();
        let out = run(filter, features(9)).await;
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|f| f.geometry.is_none() && f.attributes.len() == 1));
    }

    #[tokio::test]
    async fn test_reprojection() {
        let filter = QueryFilter::new().reproject_to(3857);
        let out = run(filter, features(1)).await;
        let Some(Geometry::Point(c)) = &out[0].geometry else { panic!("expected point") };
        assert!((c.x - 111_319.490_793_273_6).abs() < 1e-3);
    }

    #[test]
    fn test_plan_rejects_unknown_columns_and_pairs() {
        let filter = QueryFilter::new().columns(["nope"]);
        assert!(Residual::in_process(&filter, &schema()).unwrap_err().is_not_found());

        let filter = QueryFilter::new().reproject_to(32748);
        assert!(Residual::in_process(&filter, &schema()).unwrap_err().is_unsupported());
    }

    #[tokio::test]
    async fn test_pushed_paging_is_not_reapplied() {
        let filter = QueryFilter::new().offset(5).limit(2);
        let pushdown = Pushdown { paging: true, ..Pushdown::none() };
        let residual = Residual::plan(&filter, &schema(), pushdown).unwrap();
        let out: Vec<_> = residual.apply(from_vec(features(2))).collect().await;
        assert_eq!(out.len(), 2);
    }

    mod paging_law {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(48))]

            #[test]
            fn pages_are_contiguous(n in 0i64..40, k in 1usize..10, m in 0usize..45) {
                let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
                let all = runtime.block_on(run(
                    QueryFilter::new().sort_by(SortField::ascending("name")),
                    features(n),
                ));
                let page = runtime.block_on(run(
                    QueryFilter::new().sort_by(SortField::ascending("name")).offset(m).limit(k),
                    features(n),
                ));
                let expected = k.min((n as usize).saturating_sub(m));
                prop_assert_eq!(page.len(), expected);
                let window: Vec<_> = all.iter().skip(m).take(k).map(|f| f.id.clone()).collect();
                let ids: Vec<_> = page.iter().map(|f| f.id.clone()).collect();
                prop_assert_eq!(ids, window);
            }
        }
    }
}
