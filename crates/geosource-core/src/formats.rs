//! File formats read without an external database engine

pub mod shapefile;
