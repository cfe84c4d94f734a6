//! geosource core - Geometry model, codecs, file formats and configuration
//!
//! This crate holds everything that is independent of a particular storage
//! backend: the canonical geometry and feature types, the binary and text
//! geometry codecs, the Shapefile family reader and the layered configuration.

pub mod codec;
pub mod config;
pub mod error;
pub mod formats;
pub mod models;
pub mod report;

pub use error::{GeosourceError, Result};
pub use models::*;
pub use report::{ValidationReport, ValidationWarning};
