//! Geosource Store - the data source contract and its adapters
//!
//! [`DataSource`] is the one contract every backend implements. This crate
//! carries the local and database adapters (memory, Shapefile, GeoPackage,
//! SpatiaLite, PostGIS, SQL Server) together with the pieces they share:
//! filter translation to SQL, in-process evaluation of whatever a backend
//! cannot push down, and the producer tasks behind lazy feature streams.

pub mod geopackage;
pub mod memory;
pub mod postgis;
pub mod predicate;
pub mod residual;
pub mod shapefile;
pub mod source;
pub mod spatialite;
pub mod sql;
pub mod sqlite;
pub mod sqlserver;
pub mod stream;

pub use geopackage::GeoPackageSource;
pub use memory::MemorySource;
pub use postgis::PostGisSource;
pub use residual::Residual;
pub use shapefile::ShapefileSource;
pub use source::{BatchResult, DataSource, FeatureStream, SourceCore, SourceState};
pub use spatialite::SpatiaLiteSource;
pub use sqlserver::SqlServerSource;
