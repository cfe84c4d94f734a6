//! Non-fatal validation findings

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// A non-fatal problem found while validating a source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationWarning {
    MissingGeometryColumn { table: String },
    InvalidSrid { table: String, srid: i32 },
    EmptyTable { table: String },
    MissingOptionalFile { path: PathBuf },
    Other { message: String },
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingGeometryColumn { table } => {
                write!(f, "Table {table} has no geometry column")
            }
            Self::InvalidSrid { table, srid } => {
                write!(f, "Table {table} has non-positive SRID {srid}")
            }
            Self::EmptyTable { table } => write!(f, "Table {table} contains no features"),
            Self::MissingOptionalFile { path } => write!(
                f,
                "Optional file not found: {} (may affect functionality)",
                path.display()
            ),
            Self::Other { message } => f.write_str(message),
        }
    }
}

/// Result of validating a source: errors prevent use, warnings do not
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if validation passed (no errors)
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Check if there are any warnings
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn warn(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// Fold another report into this one
    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Check that every required companion file exists next to `base_path`,
    /// and report missing optional ones as warnings
    pub fn component_files(
        base_path: &Path,
        required_extensions: &[&str],
        optional_extensions: &[&str],
    ) -> Self {
        let mut report = Self::default();

        for ext in required_extensions {
            let component_path = base_path.with_extension(ext);
            if !component_path.exists() {
                report.error(format!("Missing required file: {}", component_path.display()));
            }
        }

        for ext in optional_extensions {
            let component_path = base_path.with_extension(ext);
            if !component_path.exists() {
                report.warn(ValidationWarning::MissingOptionalFile { path: component_path });
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("roads");
        std::fs::write(base.with_extension("shp"), b"").unwrap();

        let report = ValidationReport::component_files(&base, &["shp", "shx"], &["prj"]);
        assert!(!report.is_valid());
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("roads.shx"));
        assert!(report.has_warnings());
    }

    #[test]
    fn test_merge() {
        let mut a = ValidationReport::new();
        a.warn(ValidationWarning::EmptyTable { table: "t".into() });
        let mut b = ValidationReport::new();
        b.error("broken");
        a.merge(b);
        assert_eq!(a.errors, vec!["broken".to_string()]);
        assert_eq!(a.warnings.len(), 1);
        assert_eq!(a.warnings[0].to_string(), "Table t contains no features");
    }
}
