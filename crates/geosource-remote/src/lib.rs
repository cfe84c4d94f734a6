//! Geosource Remote - HTTP-backed data sources
//!
//! Adapters for feature services reached over HTTP: configurable REST/JSON
//! endpoints, OGC WMS servers and Mapbox vector tile sets. They share one
//! [`HttpClient`] that applies authentication, timeouts, gzip handling and
//! a cap on concurrent requests.

pub mod http;
pub mod mvt;
pub mod rest;
pub mod tile;
pub mod vector_tile;
pub mod wms;

pub use http::HttpClient;
pub use rest::RestSource;
pub use tile::TileId;
pub use vector_tile::VectorTileSource;
pub use wms::{WmsCapabilities, WmsSource};
