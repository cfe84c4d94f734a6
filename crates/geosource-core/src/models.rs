pub mod envelope;
pub mod feature;
pub mod filter;
pub mod geometry;
pub mod schema;
pub mod value;

pub use envelope::Envelope;
pub use feature::{AttributeTable, Feature, FeatureId};
pub use filter::{
    AttributeFilter, DistanceUnit, QueryFilter, SortDirection, SortField, SpatialFilter,
    SpatialRelationship,
};
pub use geometry::{close_ring, ring_signed_area, Coord, Dimension, Geometry, GeometryType};
pub use schema::{is_geographic_srid, ColumnInfo, TableSchema};
pub use value::{FieldType, Value};
