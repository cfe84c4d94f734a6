//! Geometry algorithms for geosource
//!
//! Exact spatial relationship tests, distance, reprojection between
//! geographic and Web Mercator coordinates, and the R-Tree spatial index
//! used by the in-memory backend and by hit-testing.

pub mod convert;
pub mod index;
pub mod relate;
pub mod transform;

pub use convert::{from_geo, to_geo};
pub use index::{IndexEntry, IndexStats, SpatialIndex};
pub use relate::{distance, hit_test, matches_filter, relationship_holds};
pub use transform::{can_reproject, is_web_mercator, reproject, reproject_envelope};
