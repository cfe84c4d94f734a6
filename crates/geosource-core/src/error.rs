//! Error types for geosource

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GeosourceError {
    // Format errors
    #[error("{format} format error: {message}")]
    Format { format: String, message: String },

    #[error("Invalid geometry: {reason}")]
    InvalidGeometry { reason: String },

    // Lookup errors
    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Missing companion file: {path}")]
    MissingFile { path: PathBuf },

    #[error("Table not found: {table}")]
    TableNotFound { table: String },

    #[error("Column {column} not found in table {table}")]
    ColumnNotFound { table: String, column: String },

    #[error("Table {table} has no primary key")]
    MissingPrimaryKey { table: String },

    // Connection errors
    #[error("Connection failed: {message}")]
    Connection { message: String },

    #[error("Data source is not open")]
    NotOpen,

    // Capability errors
    #[error("Data source {source_name} is read-only")]
    ReadOnly { source_name: String },

    #[error("Operation {operation} is not supported by the {backend} backend")]
    Unsupported { operation: String, backend: String },

    // Query errors
    #[error("Invalid identifier '{identifier}': {reason}")]
    InvalidIdentifier { identifier: String, reason: String },

    #[error("Invalid filter: {reason}")]
    InvalidFilter { reason: String },

    // Configuration errors
    #[error("Missing required configuration: {key}")]
    ConfigMissing { key: String },

    #[error("Invalid configuration value for {key}: {reason}")]
    ConfigInvalid { key: String, reason: String },

    // Transport errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("HTTP error: {0}")]
    Http(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl GeosourceError {
    /// Shorthand for a format error
    pub fn format(format: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Format { format: format.into(), message: message.into() }
    }

    /// Shorthand for an unsupported-operation error
    pub fn unsupported(operation: impl Into<String>, backend: impl Into<String>) -> Self {
        Self::Unsupported { operation: operation.into(), backend: backend.into() }
    }

    /// Whether this error belongs to the format (decode) family
    pub fn is_format_error(&self) -> bool {
        matches!(self, Self::Format { .. } | Self::InvalidGeometry { .. })
    }

    /// Whether this error belongs to the not-found family
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::MissingFile { .. }
                | Self::TableNotFound { .. }
                | Self::ColumnNotFound { .. }
                | Self::MissingPrimaryKey { .. }
        )
    }

    /// Whether this error signals an operation the source refuses to perform
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::ReadOnly { .. } | Self::Unsupported { .. })
    }
}

pub type Result<T> = std::result::Result<T, GeosourceError>;
